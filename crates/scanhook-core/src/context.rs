//! 钩子上下文（Scanner）
//!
//! `Scanner<'s>` 可变借用当前对象的扫描会话，生命周期严格限定在一次钩子调用内：
//! 钩子签名对其做高阶生命周期约束，钩子无法把它保存到调用之外。
//! 同一对象的钩子依次执行，Scanner 不需要也不支持并发使用。
use std::fmt;

use crate::content::ContentReader;
use crate::dispatch::ScanSession;
use crate::error::Result;
use crate::evidence::{structured_layout, EvidenceBuilder};
use crate::findings::Finding;
use crate::guard::Lineage;
use crate::logging::{Fields, Logger};
use crate::object::{FieldRef, FieldSelector, KeyValuePair, Object, ObjectId};
use crate::options::Configuration;

/// 规则命中时交给钩子的对象视图
pub struct MatchingObject<'a> {
    pub id: ObjectId,
    pub object: &'a Object,
    /// 与同一对象其它钩子共享数据源，游标独立
    pub content: ContentReader,
}

impl MatchingObject<'_> {
    pub fn field(&self, field: FieldSelector) -> FieldRef {
        FieldRef::new(self.id, field)
    }

    /// 针对对象内容的证据构建器
    pub fn evidence(&self) -> EvidenceBuilder {
        EvidenceBuilder::content_of(self.id)
    }
}

pub struct Scanner<'s> {
    session: &'s mut ScanSession,
    object: ObjectId,
    tag: &'s str,
    lineage: &'s Lineage,
    logger: Logger,
}

impl<'s> Scanner<'s> {
    pub(crate) fn new(
        session: &'s mut ScanSession,
        object: ObjectId,
        tag: &'s str,
        lineage: &'s Lineage,
        logger: Logger,
    ) -> Self {
        Self { session, object, tag, lineage, logger }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object
    }

    pub fn tag(&self) -> &str {
        self.tag
    }

    pub fn lineage(&self) -> &Lineage {
        self.lineage
    }

    /// 当前对象的解包深度（根对象为 0）
    pub fn depth(&self) -> usize {
        self.lineage.depth()
    }

    pub fn configuration(&self) -> &Configuration {
        self.session.config()
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// 用关键字规则扫描一段文本；超过 `max_string_length` 的部分被截掉
    pub fn scan_string(&mut self, text: &str) {
        let max = self.session.config().max_string_length;
        let text = truncate_at_char_boundary(text, max);
        let _ = self.session.inline(self.object, self.lineage, self.tag, "string", "STRING", text.as_bytes().to_vec());
    }

    /// 把解包出的数据当作新文件扫描（可能递归）。
    ///
    /// `unpack_method` 约定为大写单词，如 `ZIP`、`RAR`。
    /// 守卫拒绝时已在当前对象上记录诊断，返回值仅供钩子决定是否继续。
    pub fn scan_file(&mut self, name: &str, data: Vec<u8>, unpack_method: &str) -> Result<()> {
        self.session.extract(self.object, self.lineage, self.tag, name, data, unpack_method)
    }

    /// 扫描有序键值对；按 `key: value\n` 序列化后计算偏移
    pub fn scan_structured_data(&mut self, pairs: &[KeyValuePair]) {
        let layout = structured_layout(pairs);
        let _ = self.session.inline(self.object, self.lineage, self.tag, "structured_data", "STRUCTURED", layout.bytes);
    }

    /// 给当前对象追加 Finding；证据越界时丢弃并返回 InvalidOffset
    pub fn add_reason(&mut self, finding: Finding) -> Result<()> {
        self.session.add_reason(self.object, self.tag, finding)
    }

    /// 解压前按声明大小询问守卫；拒绝时记录诊断
    pub fn check_extraction(&mut self, name: &str, declared_size: u64) -> Result<()> {
        self.session.check_declared(self.object, self.lineage, self.tag, name, declared_size)
    }

    pub fn info(&self, text: &str, kv: Fields<'_>) {
        self.logger.info(text, &self.with_context(kv));
    }

    pub fn debug(&self, text: &str, kv: Fields<'_>) {
        self.logger.debug(text, &self.with_context(kv));
    }

    pub fn error(&self, text: &str, kv: Fields<'_>) {
        self.logger.error(text, &self.with_context(kv));
    }

    fn with_context<'a>(&'a self, kv: Fields<'a>) -> Vec<(&'a str, &'a dyn fmt::Display)> {
        let mut fields: Vec<(&str, &dyn fmt::Display)> = Vec::with_capacity(kv.len() + 2);
        fields.push(("object", &self.object));
        fields.push(("tag", &self.tag));
        fields.extend_from_slice(kv);
        fields
    }
}

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
