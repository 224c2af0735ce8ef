//! 宿主配置与扫描统计信息（模块）
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, ScanHookError};

/// 递归深度硬上限：无论配置多大，同步递归都不会超过该层数（防止栈耗尽）
pub const HARD_MAX_DEPTH: usize = 32;

/// 证据保真度
/// - Offsets：Finding 携带字节偏移与字段弱引用（默认）
/// - Plain：只保留匹配内容，并逐条输出带分数的日志行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceMode {
    #[default]
    Offsets,
    Plain,
}

impl std::str::FromStr for EvidenceMode {
    type Err = ScanHookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "offsets" => Ok(Self::Offsets),
            "plain" => Ok(Self::Plain),
            other => Err(ScanHookError::Config(format!("unknown evidence mode: {other}"))),
        }
    }
}

/// 分数告警阈值（notice ≤ warning ≤ alert）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub notice: i64,
    pub warning: i64,
    pub alert: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { notice: 40, warning: 60, alert: 80 }
    }
}

/// 由宿主传给插件的配置；钩子在处理内嵌内容前必须遵守这些限制
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// 单个文件（含解包出的文件）最大字节数
    pub max_file_size: u64,
    /// 解包链最大深度
    pub max_depth: usize,
    /// 同一解包链累计解包字节数上限（防解压炸弹）
    pub max_total_extracted: u64,
    /// ScanString 的最大字节数
    pub max_string_length: usize,
    pub thresholds: Thresholds,
    pub evidence: EvidenceMode,
    /// 工作线程数：None 表示自动（等于 CPU 核数）
    pub threads: Option<usize>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_file_size: 30 * 1024 * 1024,
            max_depth: 8,
            max_total_extracted: 256 * 1024 * 1024,
            max_string_length: 64 * 1024,
            thresholds: Thresholds::default(),
            evidence: EvidenceMode::Offsets,
            threads: None,
        }
    }
}

impl Configuration {
    pub fn from_toml_str(txt: &str) -> Result<Self> {
        let config: Configuration =
            toml::from_str(txt).map_err(|e| ScanHookError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let txt = std::fs::read_to_string(path)?;
        Self::from_toml_str(&txt)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if !(t.notice <= t.warning && t.warning <= t.alert) {
            return Err(ScanHookError::Config(format!(
                "thresholds must be ordered: notice={} warning={} alert={}",
                t.notice, t.warning, t.alert
            )));
        }
        if self.max_depth == 0 {
            return Err(ScanHookError::Config("max_depth must be at least 1".into()));
        }
        if self.max_file_size == 0 {
            return Err(ScanHookError::Config("max_file_size must be positive".into()));
        }
        Ok(())
    }

    /// 实际生效的递归深度（受硬上限约束）
    pub fn effective_max_depth(&self) -> usize {
        self.max_depth.min(HARD_MAX_DEPTH)
    }
}

/// 驱动层扫描选项
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 只输出总分不低于该值的对象
    pub min_score: i64,
    /// 线程数：None 表示自动（等于 CPU 核数）；Some(1) 走串行
    pub threads: Option<usize>,
    /// 目录遍历最大深度：None 表示不限
    pub max_walk_depth: Option<usize>,
}

/// 扫描统计信息（便于 CLI 打印）
#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanStats {
    pub objects_scanned: usize,
    pub objects_extracted: usize,
    pub findings_total: usize,
    pub diagnostics: usize,
    pub hook_faults: usize,
    pub outputs_written: usize,
}

impl ScanStats {
    pub fn merge(&mut self, other: &ScanStats) {
        self.objects_scanned += other.objects_scanned;
        self.objects_extracted += other.objects_extracted;
        self.findings_total += other.findings_total;
        self.diagnostics += other.diagnostics;
        self.hook_faults += other.hook_faults;
        self.outputs_written += other.outputs_written;
    }
}
