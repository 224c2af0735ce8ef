//! 存活对象表
//!
//! 证据里的 `FieldRef` 只记录 `ObjectId + FieldSelector`，在这里按需解析；
//! 对象释放后引用自然失效，Finding 不会延长对象或其内容的生命周期。
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use crate::content::{ContentReader, ContentSource};
use crate::object::{FieldRef, FieldSelector, Object, ObjectId};

struct StoredObject {
    object: Arc<Object>,
    content: Arc<dyn ContentSource>,
}

#[derive(Default)]
pub struct ObjectStore {
    entries: HashMap<ObjectId, StoredObject>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: Object, content: Arc<dyn ContentSource>) -> ObjectId {
        let id = ObjectId::next();
        self.entries.insert(id, StoredObject { object: Arc::new(object), content });
        id
    }

    pub fn object(&self, id: ObjectId) -> Option<Arc<Object>> {
        self.entries.get(&id).map(|e| Arc::clone(&e.object))
    }

    pub fn content(&self, id: ObjectId) -> Option<ContentReader> {
        self.entries.get(&id).map(|e| ContentReader::new(Arc::clone(&e.content)))
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn release(&mut self, id: ObjectId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 字段长度（字节）；对象已释放或字段不存在时为 None
    pub fn field_len(&self, field: &FieldRef) -> Option<u64> {
        let entry = self.entries.get(&field.object)?;
        match field.field {
            FieldSelector::Content => Some(entry.content.size()),
            sel => entry.object.text_field(sel).map(|s| s.len() as u64),
        }
    }

    /// 重新读取字段的 `[offset, offset+len)`
    pub fn read_field(&self, field: &FieldRef, offset: u64, len: usize) -> Option<io::Result<Vec<u8>>> {
        let entry = self.entries.get(&field.object)?;
        match field.field {
            FieldSelector::Content => {
                let reader = ContentReader::new(Arc::clone(&entry.content));
                Some(reader.read_range(offset, len))
            }
            sel => {
                let text = entry.object.text_field(sel)?.as_bytes();
                let start = usize::try_from(offset).ok()?.min(text.len());
                let end = start.saturating_add(len).min(text.len());
                Some(Ok(text[start..end].to_vec()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::BytesSource;

    fn registry_value() -> Object {
        Object::RegistryValue {
            key: "HKCU\\Run".into(),
            value_name: "svc".into(),
            parsed_value: "cmd.exe /c evil".into(),
        }
    }

    #[test]
    fn resolves_text_and_content_fields() {
        let mut store = ObjectStore::new();
        let id = store.insert(registry_value(), Arc::new(BytesSource::new(b"abcdef".to_vec())));
        let value = FieldRef::new(id, FieldSelector::ParsedValue);
        assert_eq!(store.field_len(&value), Some(15));
        assert_eq!(store.read_field(&value, 11, 4).unwrap().unwrap(), b"evil");
        let content = FieldRef::new(id, FieldSelector::Content);
        assert_eq!(store.read_field(&content, 2, 2).unwrap().unwrap(), b"cd");
        assert_eq!(store.field_len(&FieldRef::new(id, FieldSelector::Path)), None);
    }

    #[test]
    fn released_objects_no_longer_resolve() {
        let mut store = ObjectStore::new();
        let id = store.insert(registry_value(), Arc::new(BytesSource::new(Vec::new())));
        let field = FieldRef::new(id, FieldSelector::RegistryKey);
        assert!(store.is_live(id));
        assert!(store.release(id));
        assert!(!store.is_live(id));
        assert!(store.field_len(&field).is_none());
        assert!(store.read_field(&field, 0, 1).is_none());
        assert!(store.is_empty());
    }
}
