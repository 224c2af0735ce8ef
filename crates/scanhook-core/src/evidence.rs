//! 证据构建：字节偏移 + 字段弱引用
//!
//! 偏移始终使用内容源自身的字节下标，不做任何文本重编码；
//! 证据在内容流关闭之后仍可通过 `ObjectStore` 重新打开对象读取验证。
use std::io::{self, BufRead};

use crate::error::{Result, ScanHookError};
use crate::findings::{Finding, MatchString};
use crate::object::{FieldRef, FieldSelector, KeyValuePair, ObjectId};
use crate::store::ObjectStore;

/// 针对某个字段生成匹配证据
#[derive(Debug, Clone, Copy)]
pub struct EvidenceBuilder {
    field: FieldRef,
}

impl EvidenceBuilder {
    pub fn new(field: FieldRef) -> Self {
        Self { field }
    }

    pub fn content_of(object: ObjectId) -> Self {
        Self::new(FieldRef::new(object, FieldSelector::Content))
    }

    pub fn field(&self) -> FieldRef {
        self.field
    }

    /// 已知偏移处的匹配
    pub fn at(&self, offset: u64, data: impl Into<Vec<u8>>) -> MatchString {
        MatchString { data: data.into(), offset: Some(offset), field: Some(self.field) }
    }

    /// 在以 `base` 为起点的窗口 `haystack` 中查找 `needle`（从 `from` 开始）
    pub fn find(&self, haystack: &[u8], base: u64, needle: &[u8], from: usize) -> Option<MatchString> {
        if needle.is_empty() || from > haystack.len() {
            return None;
        }
        memchr::memmem::find(&haystack[from..], needle).map(|pos| self.at(base + (from + pos) as u64, needle))
    }
}

/// 校验 Finding 的每条证据：落在所引用字段的范围内，且重新读取的字节与匹配内容一致
///
/// 只有偏移、没有字段引用的证据视为指向 `current` 对象的内容。
pub(crate) fn validate(store: &ObjectStore, current: ObjectId, finding: &Finding) -> Result<()> {
    for m in &finding.match_strings {
        let Some(offset) = m.offset else { continue };
        let field = m.field.unwrap_or(FieldRef::new(current, FieldSelector::Content));
        let field_len = store.field_len(&field);
        let in_bounds = match (field_len, offset.checked_add(m.len())) {
            (Some(limit), Some(end)) => end <= limit,
            _ => false,
        };
        if !in_bounds {
            return Err(ScanHookError::InvalidOffset {
                object: field.object,
                field: field.field,
                offset,
                len: m.len(),
                field_len,
            });
        }
        let reread = store.read_field(&field, offset, m.data.len()).transpose()?;
        if reread.as_deref() != Some(m.data.as_slice()) {
            return Err(ScanHookError::EvidenceMismatch { object: field.object, field: field.field, offset, len: m.len() });
        }
    }
    Ok(())
}

/// 重新读取证据所指的字节；引用已失效时返回 None
pub fn resolve(store: &ObjectStore, m: &MatchString) -> Option<io::Result<Vec<u8>>> {
    let (field, offset) = (m.field?, m.offset?);
    store.read_field(&field, offset, m.data.len())
}

/// 结构化数据的序列化结果：每对 `key: value\n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredLayout {
    pub bytes: Vec<u8>,
    pub spans: Vec<PairSpan>,
}

/// 单个键值对在序列化结果中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairSpan {
    pub key_offset: u64,
    pub value_offset: u64,
}

pub const PAIR_SEPARATOR: &[u8] = b": ";

pub fn structured_layout(pairs: &[KeyValuePair]) -> StructuredLayout {
    let mut bytes = Vec::new();
    let mut spans = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let key_offset = bytes.len() as u64;
        bytes.extend_from_slice(pair.key.as_bytes());
        bytes.extend_from_slice(PAIR_SEPARATOR);
        let value_offset = bytes.len() as u64;
        bytes.extend_from_slice(pair.value.as_bytes());
        bytes.push(b'\n');
        spans.push(PairSpan { key_offset, value_offset });
    }
    StructuredLayout { bytes, spans }
}

/// 逐行读取并附带每行起始字节偏移（去掉行尾 `\n` / `\r\n`）
pub struct LineOffsets<R> {
    reader: R,
    offset: u64,
}

pub fn lines_with_offsets<R: BufRead>(reader: R) -> LineOffsets<R> {
    LineOffsets { reader, offset: 0 }
}

impl<R: BufRead> Iterator for LineOffsets<R> {
    type Item = io::Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(0) => None,
            Ok(n) => {
                let start = self.offset;
                self.offset += n as u64;
                if line.last() == Some(&b'\n') {
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                }
                Some(Ok((start, line)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::BytesSource;
    use crate::findings::{Signature, SignatureClass};
    use crate::object::{FileHashes, Object};
    use std::sync::Arc;

    fn file_store(data: &[u8]) -> (ObjectStore, ObjectId) {
        let mut store = ObjectStore::new();
        let object = Object::File {
            path: "/tmp/a".into(),
            magic_header: String::new(),
            hashes: FileHashes::compute(data),
            size: data.len() as u64,
            unpack: None,
        };
        let id = store.insert(object, Arc::new(BytesSource::new(data.to_vec())));
        (store, id)
    }

    #[test]
    fn structured_offsets_account_for_previous_pairs() {
        let pairs = [KeyValuePair::new("A", "1"), KeyValuePair::new("B", "2")];
        let layout = structured_layout(&pairs);
        assert_eq!(layout.bytes, b"A: 1\nB: 2\n");
        assert_eq!(layout.spans[1], PairSpan { key_offset: 5, value_offset: 8 });
    }

    #[test]
    fn duplicate_pairs_keep_distinct_offsets() {
        let pairs = [KeyValuePair::new("k", "v"), KeyValuePair::new("k", "v")];
        let layout = structured_layout(&pairs);
        assert_ne!(layout.spans[0].key_offset, layout.spans[1].key_offset);
    }

    #[test]
    fn line_offsets_handle_crlf_and_missing_newline() {
        let data = b"first\r\nsecond\nthird";
        let lines: Vec<_> = lines_with_offsets(&data[..]).map(|l| l.unwrap()).collect();
        assert_eq!(lines[0], (0, b"first".to_vec()));
        assert_eq!(lines[1], (7, b"second".to_vec()));
        assert_eq!(lines[2], (14, b"third".to_vec()));
    }

    #[test]
    fn validate_accepts_in_bounds_and_resolves() {
        let (store, id) = file_store(b"user:secret");
        let ev = EvidenceBuilder::content_of(id);
        let m = ev.find(b"user:secret", 0, b"secret", 0).unwrap();
        assert_eq!(m.offset, Some(5));
        let finding = Finding::new("x", Signature::custom(SignatureClass::Anomaly, 10), vec![m.clone()]);
        validate(&store, id, &finding).unwrap();
        assert_eq!(resolve(&store, &m).unwrap().unwrap(), b"secret");
    }

    #[test]
    fn validate_rejects_out_of_bounds() {
        let (store, id) = file_store(b"short");
        let ev = EvidenceBuilder::content_of(id);
        let finding = Finding::new("x", Signature::custom(SignatureClass::Anomaly, 10), vec![ev.at(3, "long")]);
        let err = validate(&store, id, &finding).unwrap_err();
        assert!(matches!(err, ScanHookError::InvalidOffset { offset: 3, len: 4, field_len: Some(5), .. }));
    }

    #[test]
    fn validate_rejects_bytes_that_differ_from_content() {
        let (store, id) = file_store(b"hay needle hay");
        let ev = EvidenceBuilder::content_of(id);
        let finding = Finding::new("x", Signature::custom(SignatureClass::Anomaly, 40), vec![ev.at(0, "needle")]);
        let err = validate(&store, id, &finding).unwrap_err();
        assert!(matches!(err, ScanHookError::EvidenceMismatch { offset: 0, len: 6, .. }));
        assert_eq!(err.diagnostic_kind(), crate::error::DiagnosticKind::InvalidOffset);
    }

    #[test]
    fn validate_rejects_overflowing_offset() {
        let (store, id) = file_store(b"abc");
        let ev = EvidenceBuilder::content_of(id);
        let finding = Finding::new("x", Signature::custom(SignatureClass::Anomaly, 1), vec![ev.at(u64::MAX, "a")]);
        assert!(validate(&store, id, &finding).is_err());
    }
}
