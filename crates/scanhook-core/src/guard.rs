//! 解包递归守卫
//!
//! 在 `scan_file` 重新进入调度器之前检查：
//! - 解包深度低于上限（同时约束同步递归的调用栈深度）；
//! - 单个文件大小、整条解包链累计大小低于上限（防解压炸弹）；
//! - 新内容的哈希不在祖先链中（防自引用容器）。
use serde::Serialize;

use crate::error::{Result, ScanHookError};
use crate::options::Configuration;

/// 解包链中的一环
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineageEntry {
    pub name: String,
    /// 根对象为 None
    pub unpack_method: Option<String>,
    pub sha256: String,
    pub size: u64,
}

/// 从根对象到当前对象的解包链
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Lineage {
    entries: Vec<LineageEntry>,
}

impl Lineage {
    pub fn root(entry: LineageEntry) -> Self {
        Self { entries: vec![entry] }
    }

    /// 追加一环，返回新链（父链保持不变）
    pub fn child(&self, entry: LineageEntry) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend_from_slice(&self.entries);
        entries.push(entry);
        Self { entries }
    }

    /// 已发生的解包次数（根对象为 0）
    pub fn depth(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    /// 根以外各环的累计大小
    pub fn extracted_total(&self) -> u64 {
        self.entries.iter().skip(1).map(|e| e.size).sum()
    }

    pub fn contains_hash(&self, sha256: &str) -> bool {
        self.entries.iter().any(|e| e.sha256 == sha256)
    }

    pub fn entries(&self) -> &[LineageEntry] {
        &self.entries
    }

    /// 每一环的解包方式（根对象除外）
    pub fn unpack_methods(&self) -> Vec<&str> {
        self.entries.iter().filter_map(|e| e.unpack_method.as_deref()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecursionGuard {
    max_depth: usize,
    max_file_size: u64,
    max_total: u64,
}

impl RecursionGuard {
    pub fn new(max_depth: usize, max_file_size: u64, max_total: u64) -> Self {
        Self { max_depth, max_file_size, max_total }
    }

    pub fn from_config(config: &Configuration) -> Self {
        Self::new(config.effective_max_depth(), config.max_file_size, config.max_total_extracted)
    }

    /// 只检查深度（ScanString / ScanStructuredData 使用）
    pub fn check_depth(&self, lineage: &Lineage, name: &str) -> Result<()> {
        let depth = lineage.depth() + 1;
        if depth > self.max_depth {
            return Err(ScanHookError::RecursionLimitExceeded {
                name: name.to_string(),
                depth,
                max: self.max_depth,
            });
        }
        Ok(())
    }

    /// 按声明大小预检（解压前调用）
    pub fn check_declared(&self, lineage: &Lineage, name: &str, size: u64) -> Result<()> {
        self.check_depth(lineage, name)?;
        if size > self.max_file_size {
            return Err(ScanHookError::SizeLimitExceeded {
                name: name.to_string(),
                size,
                limit: self.max_file_size,
            });
        }
        let total = lineage.extracted_total().saturating_add(size);
        if total > self.max_total {
            return Err(ScanHookError::SizeLimitExceeded {
                name: name.to_string(),
                size: total,
                limit: self.max_total,
            });
        }
        Ok(())
    }

    /// 对实际内容做完整检查
    pub fn approve(&self, lineage: &Lineage, name: &str, size: u64, sha256: &str) -> Result<()> {
        self.check_declared(lineage, name, size)?;
        if lineage.contains_hash(sha256) {
            return Err(ScanHookError::CyclicExtractionDetected {
                name: name.to_string(),
                sha256: sha256.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, method: Option<&str>, sha: &str, size: u64) -> LineageEntry {
        LineageEntry {
            name: name.into(),
            unpack_method: method.map(str::to_string),
            sha256: sha.into(),
            size,
        }
    }

    #[test]
    fn lineage_tracks_depth_and_total() {
        let root = Lineage::root(entry("outer.zip", None, "aa", 1000));
        let child = root.child(entry("nested.zip", Some("ZIP"), "bb", 300));
        let leaf = child.child(entry("payload.exe", Some("ZIP"), "cc", 200));
        assert_eq!(root.depth(), 0);
        assert_eq!(leaf.depth(), 2);
        assert_eq!(leaf.extracted_total(), 500);
        assert_eq!(leaf.unpack_methods(), ["ZIP", "ZIP"]);
        assert_eq!(child.entries().len(), 2);
    }

    #[test]
    fn depth_limit() {
        let guard = RecursionGuard::new(1, 100, 1000);
        let root = Lineage::root(entry("r", None, "00", 10));
        guard.approve(&root, "a", 10, "01").unwrap();
        let child = root.child(entry("a", Some("ZIP"), "01", 10));
        let err = guard.approve(&child, "b", 10, "02").unwrap_err();
        assert!(matches!(err, ScanHookError::RecursionLimitExceeded { depth: 2, max: 1, .. }));
    }

    #[test]
    fn per_file_and_cumulative_size_limits() {
        let guard = RecursionGuard::new(8, 100, 150);
        let root = Lineage::root(entry("r", None, "00", 10_000));
        assert!(matches!(
            guard.check_declared(&root, "big", 101),
            Err(ScanHookError::SizeLimitExceeded { size: 101, limit: 100, .. })
        ));
        let child = root.child(entry("a", Some("ZIP"), "01", 100));
        assert!(matches!(
            guard.approve(&child, "b", 60, "02"),
            Err(ScanHookError::SizeLimitExceeded { size: 160, limit: 150, .. })
        ));
    }

    #[test]
    fn ancestor_hash_is_a_cycle() {
        let guard = RecursionGuard::new(8, 100, 1000);
        let root = Lineage::root(entry("self.zip", None, "feed", 50));
        let err = guard.approve(&root, "self.zip", 50, "feed").unwrap_err();
        assert!(matches!(err, ScanHookError::CyclicExtractionDetected { .. }));
    }
}
