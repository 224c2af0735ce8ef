//! 规则与钩子注册表
//!
//! 注册只在初始化窗口内有效：`RegisterActions` 可以被插件克隆保存，
//! 但窗口关闭（`close`）之后的任何注册调用都是静默的空操作。
//! 关闭后得到的 `RuleRegistry` 不可变，可在工作线程间无锁共享。
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::context::{MatchingObject, Scanner};
use crate::engine::{CompiledRule, RuleCompiler};
use crate::error::Result;
use crate::logging::Logger;
use crate::postprocess::MatchedObject;
use crate::rules::RuleType;

/// 规则命中回调；`Scanner` 只在本次调用期间有效
pub type RuleHook = Arc<dyn Fn(&mut Scanner<'_>, &MatchingObject<'_>) -> anyhow::Result<()> + Send + Sync>;

/// 对象完整扫描后的回调
pub type PostProcessingHook = Arc<dyn Fn(&Logger, &MatchedObject<'_>) -> anyhow::Result<()> + Send + Sync>;

pub struct RegisteredRule {
    pub rule_type: RuleType,
    pub rule: Box<dyn CompiledRule>,
    pub plugin: Arc<str>,
}

#[derive(Clone)]
pub struct RegisteredHook {
    pub plugin: Arc<str>,
    pub callback: RuleHook,
}

#[derive(Clone)]
pub struct RegisteredPostHook {
    pub plugin: Arc<str>,
    pub callback: PostProcessingHook,
}

/// 初始化期间的规则编译失败记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    pub plugin: String,
    pub rule_type: RuleType,
    pub message: String,
}

#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<RegisteredRule>,
    by_type: HashMap<RuleType, Vec<usize>>,
    hooks: HashMap<String, Vec<RegisteredHook>>,
    post_hooks: Vec<RegisteredPostHook>,
    compile_errors: Vec<CompileFailure>,
}

impl RuleRegistry {
    /// 指定类型的规则，按注册顺序
    pub fn rules_for(&self, rule_type: RuleType) -> impl Iterator<Item = &RegisteredRule> + '_ {
        self.by_type
            .get(&rule_type)
            .into_iter()
            .flatten()
            .map(move |&i| &self.rules[i])
    }

    /// 标签上的钩子，按注册顺序
    pub fn hooks_for(&self, tag: &str) -> &[RegisteredHook] {
        self.hooks.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn post_processing_hooks(&self) -> &[RegisteredPostHook] {
        &self.post_hooks
    }

    /// 初始化期间记录的编译错误
    pub fn compile_errors(&self) -> &[CompileFailure] {
        &self.compile_errors
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    fn push_rule(&mut self, rule: RegisteredRule) {
        let index = self.rules.len();
        self.by_type.entry(rule.rule_type).or_default().push(index);
        self.rules.push(rule);
    }
}

struct InitWindow {
    /// None 表示窗口已关闭
    pending: Option<RuleRegistry>,
}

/// 插件初始化时可用的注册入口
#[derive(Clone)]
pub struct RegisterActions {
    plugin: Arc<str>,
    window: Arc<Mutex<InitWindow>>,
    compiler: Arc<dyn RuleCompiler>,
}

impl RegisterActions {
    pub(crate) fn open(compiler: Arc<dyn RuleCompiler>) -> Self {
        Self {
            plugin: Arc::from("host"),
            window: Arc::new(Mutex::new(InitWindow { pending: Some(RuleRegistry::default()) })),
            compiler,
        }
    }

    /// 同一窗口、不同插件名（用于归属日志与钩子）
    pub(crate) fn for_plugin(&self, plugin: &str) -> Self {
        Self { plugin: Arc::from(plugin), window: Arc::clone(&self.window), compiler: Arc::clone(&self.compiler) }
    }

    pub fn is_open(&self) -> bool {
        self.with_pending(|_| ()).is_some()
    }

    /// 窗口开启时对待注册表执行 `f`；已关闭返回 None
    fn with_pending<T>(&self, f: impl FnOnce(&mut RuleRegistry) -> T) -> Option<T> {
        let mut window = self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        window.pending.as_mut().map(f)
    }

    /// 添加一条或多条规则。
    ///
    /// 无效规则只影响自身：同一源码中的其它规则照常注册，
    /// 返回第一个编译错误（全部错误另记在注册表中）。窗口关闭后为空操作。
    pub fn add_rule(&self, rule_type: RuleType, source: &str) -> Result<()> {
        if !self.is_open() {
            tracing::debug!(plugin = %self.plugin, %rule_type, "rule registration after init ignored");
            return Ok(());
        }
        let compiled = self.compiler.compile(rule_type, source);
        let plugin = Arc::clone(&self.plugin);
        let first_error = self.with_pending(move |registry| {
            let mut first_error = None;
            for item in compiled {
                match item {
                    Ok(rule) => {
                        tracing::debug!(plugin = %plugin, rule = rule.name(), %rule_type, "rule registered");
                        registry.push_rule(RegisteredRule { rule_type, rule, plugin: Arc::clone(&plugin) });
                    }
                    Err(e) => {
                        tracing::error!(plugin = %plugin, %rule_type, error = %e, "rule compile failed");
                        registry.compile_errors.push(CompileFailure {
                            plugin: plugin.to_string(),
                            rule_type,
                            message: e.to_string(),
                        });
                        first_error.get_or_insert(e);
                    }
                }
            }
            first_error
        });
        match first_error.flatten() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 为标签绑定回调；同一标签上的多个回调按注册顺序执行
    pub fn add_hook<F>(&self, tag: &str, callback: F)
    where
        F: Fn(&mut Scanner<'_>, &MatchingObject<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hook = RegisteredHook { plugin: Arc::clone(&self.plugin), callback: Arc::new(callback) };
        let added = self.with_pending(|registry| registry.hooks.entry(tag.to_string()).or_default().push(hook));
        if added.is_none() {
            tracing::debug!(plugin = %self.plugin, tag, "hook registration after init ignored");
        }
    }

    pub fn add_post_processing_hook<F>(&self, callback: F)
    where
        F: Fn(&Logger, &MatchedObject<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hook = RegisteredPostHook { plugin: Arc::clone(&self.plugin), callback: Arc::new(callback) };
        let added = self.with_pending(|registry| registry.post_hooks.push(hook));
        if added.is_none() {
            tracing::debug!(plugin = %self.plugin, "post-processing hook registration after init ignored");
        }
    }

    /// 关闭初始化窗口，取出最终注册表；再次调用得到空注册表
    pub(crate) fn close(&self) -> RuleRegistry {
        let mut window = self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        window.pending.take().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PatternCompiler;
    use crate::error::ScanHookError;

    fn actions() -> RegisterActions {
        RegisterActions::open(Arc::new(PatternCompiler))
    }

    #[test]
    fn hooks_keep_registration_order() {
        let actions = actions();
        actions.for_plugin("a").add_hook("TAG", |_, _| Ok(()));
        actions.for_plugin("b").add_hook("TAG", |_, _| Ok(()));
        let registry = actions.close();
        let plugins: Vec<_> = registry.hooks_for("TAG").iter().map(|h| h.plugin.to_string()).collect();
        assert_eq!(plugins, ["a", "b"]);
        assert!(registry.hooks_for("OTHER").is_empty());
    }

    #[test]
    fn registrations_after_close_are_ignored() {
        let actions = actions();
        let late = actions.for_plugin("late");
        let registry = actions.close();
        assert!(!late.is_open());
        late.add_hook("TAG", |_, _| Ok(()));
        late.add_post_processing_hook(|_, _| Ok(()));
        late.add_rule(RuleType::Keyword, "[[rules]]\nid = \"X\"\nkeywords = [\"x\"]\n").unwrap();
        assert_eq!(registry.hook_count(), 0);
        assert_eq!(late.close().rule_count(), 0);
    }

    #[test]
    fn compile_error_is_local_to_rule() {
        let actions = actions();
        let err = actions
            .add_rule(
                RuleType::Default,
                "[[rules]]\nid = \"Bad\"\nstrings = ['[']\n\n[[rules]]\nid = \"Good\"\nkeywords = [\"ok\"]\n",
            )
            .unwrap_err();
        assert!(matches!(err, ScanHookError::CompileError { .. }));
        let registry = actions.close();
        assert_eq!(registry.rule_count(), 1);
        assert_eq!(registry.compile_errors().len(), 1);
        assert_eq!(registry.rules_for(RuleType::Default).next().unwrap().rule.name(), "Good");
        assert_eq!(registry.rules_for(RuleType::Meta).count(), 0);
    }
}
