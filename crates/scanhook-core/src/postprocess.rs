//! 后处理钩子
//!
//! 对象的全部钩子执行完毕、释放之前调用；每个后处理钩子拿到独立的内容读取器，
//! 一个钩子失败（返回错误或 panic）只记日志，不影响其它钩子与报告。
use std::io;
use std::panic::{self, AssertUnwindSafe};

use crate::content::ContentReader;
use crate::dispatch::panic_message;
use crate::evidence;
use crate::findings::{total_score, Finding, MatchString};
use crate::logging::Logger;
use crate::object::{Object, ObjectId};
use crate::registry::RegisteredPostHook;
use crate::store::ObjectStore;

/// 扫描完成的对象视图
pub struct MatchedObject<'a> {
    pub id: ObjectId,
    pub object: &'a Object,
    pub findings: &'a [Finding],
    pub content: ContentReader,
    store: &'a ObjectStore,
}

impl<'a> MatchedObject<'a> {
    pub(crate) fn new(
        id: ObjectId,
        object: &'a Object,
        findings: &'a [Finding],
        content: ContentReader,
        store: &'a ObjectStore,
    ) -> Self {
        Self { id, object, findings, content, store }
    }

    pub fn score(&self) -> i64 {
        total_score(self.findings)
    }

    /// 按证据的字段引用重新读取匹配字节；对象已释放或证据无偏移时返回 None
    pub fn resolve(&self, m: &MatchString) -> Option<io::Result<Vec<u8>>> {
        evidence::resolve(self.store, m)
    }
}

/// 依次执行后处理钩子，返回失败数
pub(crate) fn run_post_processing(hooks: &[RegisteredPostHook], logger: &Logger, matched: &MatchedObject<'_>) -> usize {
    let mut faults = 0;
    for hook in hooks {
        let view = MatchedObject { content: matched.content.reopen(), ..*matched };
        let plugin_logger = logger.for_plugin(&hook.plugin);
        let message = match panic::catch_unwind(AssertUnwindSafe(|| (hook.callback)(&plugin_logger, &view))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => panic_message(&*payload),
        };
        faults += 1;
        tracing::error!(plugin = %hook.plugin, object = %matched.id, error = %message, "post-processing hook failed");
    }
    faults
}
