//! 公共类型（对外暴露）
use serde::Serialize;

use crate::findings::Finding;
use crate::guard::Lineage;
use crate::logging::Severity;
use crate::object::{Object, ObjectId, ObjectKind};
use crate::options::ScanStats;

/// 单个对象扫描完成后的报告
#[derive(Debug, Clone, Serialize)]
pub struct ObjectReport {
    pub id: ObjectId,
    pub object: Object,
    pub lineage: Lineage,
    pub findings: Vec<Finding>,
    /// 各 Finding 分数之和（诊断不计分）
    pub score: i64,
    pub severity: Option<Severity>,
}

impl ObjectReport {
    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn output_item(&self) -> OutputItem<'_> {
        OutputItem {
            object: self.object.display_name(),
            kind: self.object.kind(),
            sha256: self.object.sha256(),
            unpack_chain: self.lineage.entries().iter().map(|e| e.name.as_str()).collect(),
            score: self.score,
            severity: self.severity,
            findings: &self.findings,
        }
    }
}

/// 一个根对象（含其全部解包子对象）的扫描结果
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// 子对象先于父对象完成，按完成顺序排列
    pub reports: Vec<ObjectReport>,
    pub stats: ScanStats,
}

impl ScanOutcome {
    /// 根对象报告（最后完成的那个）
    pub fn root(&self) -> Option<&ObjectReport> {
        self.reports.last()
    }
}

/// 输出项结构（对应 result.json 的单个元素）
#[derive(Debug, Clone, Serialize)]
pub struct OutputItem<'a> {
    pub object: String,
    pub kind: ObjectKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<&'a str>,
    pub unpack_chain: Vec<&'a str>,
    pub score: i64,
    pub severity: Option<Severity>,
    pub findings: &'a [Finding],
}
