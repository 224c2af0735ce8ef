//! 插件日志门面
//!
//! 插件通过 `Logger` 输出 `info/debug/error` 结构化键值日志，
//! 以及受 notice/warning/alert 阈值控制的带分数日志；底层统一走 `tracing`，
//! 由宿主决定 subscriber。
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use crate::options::Thresholds;

/// 键值对列表：`&[("path", &path), ("size", &size)]`
pub type Fields<'a> = &'a [(&'a str, &'a dyn fmt::Display)];

/// 告警级别（由分数与阈值比较得出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Notice,
    Warning,
    Alert,
}

impl Thresholds {
    /// 低于 notice 阈值时返回 None
    pub fn classify(&self, score: i64) -> Option<Severity> {
        if score >= self.alert {
            Some(Severity::Alert)
        } else if score >= self.warning {
            Some(Severity::Warning)
        } else if score >= self.notice {
            Some(Severity::Notice)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Logger {
    plugin: Arc<str>,
    thresholds: Thresholds,
}

impl Logger {
    pub fn new(plugin: &str, thresholds: Thresholds) -> Self {
        Self { plugin: Arc::from(plugin), thresholds }
    }

    /// 同一阈值、不同插件名
    pub fn for_plugin(&self, plugin: &str) -> Self {
        Self { plugin: Arc::from(plugin), thresholds: self.thresholds }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn info(&self, text: &str, kv: Fields<'_>) {
        tracing::info!(plugin = %self.plugin, fields = %render_fields(kv), "{}", text);
    }

    pub fn debug(&self, text: &str, kv: Fields<'_>) {
        tracing::debug!(plugin = %self.plugin, fields = %render_fields(kv), "{}", text);
    }

    pub fn error(&self, text: &str, kv: Fields<'_>) {
        tracing::error!(plugin = %self.plugin, fields = %render_fields(kv), "{}", text);
    }

    /// 带分数的日志：按阈值映射到 info / warn / error，低于 notice 只记 debug
    pub fn scored(&self, score: i64, text: &str, kv: Fields<'_>) -> Option<Severity> {
        let severity = self.thresholds.classify(score);
        let fields = render_fields(kv);
        match severity {
            Some(Severity::Alert) => {
                tracing::error!(plugin = %self.plugin, score, level = "alert", fields = %fields, "{}", text)
            }
            Some(Severity::Warning) => {
                tracing::warn!(plugin = %self.plugin, score, level = "warning", fields = %fields, "{}", text)
            }
            Some(Severity::Notice) => {
                tracing::info!(plugin = %self.plugin, score, level = "notice", fields = %fields, "{}", text)
            }
            None => tracing::debug!(plugin = %self.plugin, score, fields = %fields, "{}", text),
        }
        severity
    }
}

/// `k1=v1 k2="v 2"`：含空白或引号的值加引号
pub(crate) fn render_fields(kv: Fields<'_>) -> String {
    let mut out = String::new();
    for (i, (key, value)) in kv.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let value = value.to_string();
        if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '"') {
            let _ = write!(out, "{key}={value:?}");
        } else {
            let _ = write!(out, "{key}={value}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_uses_inclusive_thresholds() {
        let t = Thresholds::default();
        assert_eq!(t.classify(39), None);
        assert_eq!(t.classify(40), Some(Severity::Notice));
        assert_eq!(t.classify(60), Some(Severity::Warning));
        assert_eq!(t.classify(200), Some(Severity::Alert));
    }

    #[test]
    fn render_fields_quotes_when_needed() {
        let path = "/tmp/a b";
        let size = 12u64;
        let rendered = render_fields(&[("path", &path), ("size", &size)]);
        assert_eq!(rendered, r#"path="/tmp/a b" size=12"#);
    }

    #[test]
    fn scored_returns_severity() {
        let logger = Logger::new("test", Thresholds::default());
        assert_eq!(logger.scored(75, "hit", &[]), Some(Severity::Warning));
        assert_eq!(logger.for_plugin("other").plugin(), "other");
    }
}
