//! 规则类型与规则源码加载（TOML）
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, ScanHookError};
use crate::findings::SignatureClass;
use crate::object::{ExternalVars, ObjectKind};

/// Meta 规则只能看到内容的前 2048 字节
pub const META_PREFIX_LEN: u64 = 2048;

/// 规则类型：决定规则作用于哪类对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleType {
    /// 作用于所有文件，只能访问前 2048 字节与外部变量
    Meta,
    /// 作用于文件以外的所有元素
    Keyword,
    /// 作用于深度扫描的文件
    Default,
    Registry,
    Log,
    Process,
}

impl RuleType {
    pub const ALL: [RuleType; 6] = [
        RuleType::Meta,
        RuleType::Keyword,
        RuleType::Default,
        RuleType::Registry,
        RuleType::Log,
        RuleType::Process,
    ];

    /// 规则可见的内容长度上限
    pub fn content_limit(self) -> Option<u64> {
        match self {
            RuleType::Meta => Some(META_PREFIX_LEN),
            _ => None,
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleType::Meta => "meta",
            RuleType::Keyword => "keyword",
            RuleType::Default => "default",
            RuleType::Registry => "registry",
            RuleType::Log => "log",
            RuleType::Process => "process",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RuleType {
    type Err = ScanHookError;

    fn from_str(s: &str) -> Result<Self> {
        RuleType::ALL
            .into_iter()
            .find(|t| t.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| ScanHookError::Config(format!("unknown rule type: {s}")))
    }
}

/// 对象种类 → 适用的规则类型（顺序即评估顺序）
pub fn applicable_rule_types(kind: ObjectKind) -> &'static [RuleType] {
    match kind {
        ObjectKind::File => &[RuleType::Meta, RuleType::Default],
        ObjectKind::RegistryValue => &[RuleType::Registry, RuleType::Keyword],
        ObjectKind::LogEntry => &[RuleType::Log, RuleType::Keyword],
        ObjectKind::Process => &[RuleType::Process, RuleType::Keyword],
        ObjectKind::Generic => &[RuleType::Keyword],
    }
}

/// 核心只关心的规则元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMeta {
    pub class: SignatureClass,
    pub score: i64,
}

/// 字符串条件组合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Condition {
    #[default]
    Any,
    All,
}

/// 单条规则的配置
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RuleEntry {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub class: SignatureClass,
    #[serde(default)]
    pub description: Option<String>,
    /// bytes 正则
    #[serde(default)]
    pub strings: Vec<String>,
    /// 字面量关键字（Aho-Corasick）
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub nocase: bool,
    #[serde(default)]
    pub condition: Condition,
    /// 外部变量等值约束
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl RuleEntry {
    /// 与正则无关的结构性检查
    pub(crate) fn check(&self) -> Result<()> {
        let fail = |message: String| ScanHookError::CompileError { rule: self.id.clone(), message };
        if self.id.trim().is_empty() {
            return Err(fail("empty rule id".into()));
        }
        if self.strings.is_empty() && self.keywords.is_empty() && self.meta.is_empty() {
            return Err(fail("rule has no condition".into()));
        }
        if let Some(var) = self.meta.keys().find(|k| !ExternalVars::is_known(k)) {
            return Err(fail(format!("unknown external variable: {var}")));
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(fail("empty tag".into()));
        }
        Ok(())
    }
}

/// 顶层规则源码结构
#[derive(Debug, Clone, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

/// 解析规则源码；TOML 本身无效时整段源码失败
pub(crate) fn parse_rule_source(source: &str) -> Result<Vec<RuleEntry>> {
    let parsed: RuleFile = toml::from_str(source).map_err(|e| ScanHookError::CompileError {
        rule: "<source>".into(),
        message: e.to_string(),
    })?;
    Ok(parsed.rules)
}
