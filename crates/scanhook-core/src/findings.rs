//! 命中项（Reason）与排序
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{DiagnosticKind, ScanHookError};
use crate::object::FieldRef;

/// 签名分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureClass {
    Malware,
    Hacktool,
    #[default]
    Suspicious,
    Anomaly,
    InternalHeuristic,
    InternalDiagnostic,
}

/// 签名来源：规则命中、钩子自定义、内部诊断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    Rule,
    Custom,
    Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    #[serde(rename = "type")]
    pub kind: SignatureType,
    pub class: SignatureClass,
    pub score: i64,
    /// 规则名（仅规则命中时存在）
    pub rule: Option<String>,
}

impl Signature {
    pub fn custom(class: SignatureClass, score: i64) -> Self {
        Self { kind: SignatureType::Custom, class, score, rule: None }
    }

    pub fn rule(name: impl Into<String>, class: SignatureClass, score: i64) -> Self {
        Self { kind: SignatureType::Rule, class, score, rule: Some(name.into()) }
    }
}

/// 单条匹配证据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchString {
    #[serde(rename = "match", serialize_with = "lossy_bytes")]
    pub data: Vec<u8>,
    /// 在所引用字段中的字节偏移
    pub offset: Option<u64>,
    /// 字段弱引用；不持有对象
    pub field: Option<FieldRef>,
}

impl MatchString {
    pub fn plain(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into(), offset: None, field: None }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn lossy_bytes<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub description: String,
    pub signature: Signature,
    pub match_strings: Vec<MatchString>,
    /// 产生该 Finding 的规则标签（钩子 / 诊断时存在）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<DiagnosticKind>,
}

impl Finding {
    pub fn new(description: impl Into<String>, signature: Signature, match_strings: Vec<MatchString>) -> Self {
        Self { description: description.into(), signature, match_strings, tag: None, diagnostic: None }
    }

    /// 内部诊断：不计分，归属到触发它的标签
    pub fn diagnostic(tag: Option<&str>, err: &ScanHookError) -> Self {
        Self {
            description: err.to_string(),
            signature: Signature {
                kind: SignatureType::Diagnostic,
                class: SignatureClass::InternalDiagnostic,
                score: 0,
                rule: None,
            },
            match_strings: Vec::new(),
            tag: tag.map(str::to_string),
            diagnostic: Some(err.diagnostic_kind()),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn is_diagnostic(&self) -> bool {
        self.diagnostic.is_some()
    }

    pub fn score(&self) -> i64 {
        if self.is_diagnostic() { 0 } else { self.signature.score }
    }

    /// 去掉偏移与字段引用，只保留匹配内容
    pub(crate) fn strip_offsets(&mut self) {
        for m in &mut self.match_strings {
            m.offset = None;
            m.field = None;
        }
    }
}

/// 各 Finding 独立累加
pub fn total_score(findings: &[Finding]) -> i64 {
    findings.iter().map(Finding::score).sum()
}

/// 对匹配证据进行稳定排序：偏移升序 → 长度降序 → 内容字典序升序；无偏移的排在最后
pub(crate) fn sort_match_strings_stable(matches: &mut [MatchString]) {
    matches.sort_by(|a, b| {
        use std::cmp::Ordering;
        let by_offset = match (a.offset, b.offset) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        match by_offset {
            Ordering::Equal => match b.data.len().cmp(&a.data.len()) {
                Ordering::Equal => a.data.cmp(&b.data),
                o => o,
            },
            o => o,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(offset: u64, data: &str) -> MatchString {
        MatchString { data: data.as_bytes().to_vec(), offset: Some(offset), field: None }
    }

    #[test]
    fn match_strings_sort_by_offset_then_length() {
        let mut v = vec![at(5, "b"), MatchString::plain("zz"), at(1, "a"), at(1, "abc")];
        sort_match_strings_stable(&mut v);
        let order: Vec<_> = v.iter().map(|m| String::from_utf8_lossy(&m.data).to_string()).collect();
        assert_eq!(order, ["abc", "a", "b", "zz"]);
    }

    #[test]
    fn diagnostics_do_not_score() {
        let err = ScanHookError::HookFault { tag: "ZIPFILE".into(), message: "boom".into() };
        let findings = vec![
            Finding::diagnostic(Some("ZIPFILE"), &err),
            Finding::new("x", Signature::custom(SignatureClass::Malware, 70), vec![]),
            Finding::new("y", Signature::custom(SignatureClass::Anomaly, 20), vec![]),
        ];
        assert_eq!(total_score(&findings), 90);
        assert_eq!(findings[0].diagnostic, Some(DiagnosticKind::HookFault));
        assert_eq!(findings[0].tag.as_deref(), Some("ZIPFILE"));
    }

    #[test]
    fn match_data_serializes_as_text() {
        let json = serde_json::to_value(at(3, "root")).unwrap();
        assert_eq!(json["match"], "root");
        assert_eq!(json["offset"], 3);
    }
}
