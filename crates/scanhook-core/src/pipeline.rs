//! 插件管线：初始化窗口 + 扫描入口
//!
//! `PipelineBuilder::build` 依次调用各插件的 `init`，之后关闭初始化窗口，
//! 得到只读的 `Pipeline`。`Pipeline` 可在多个工作线程间共享，
//! 每个根对象在一个线程内完成全部调度。
use rayon::prelude::*;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use crate::content::{BytesSource, ContentReader, ContentSource, FileSource};
use crate::dispatch::{panic_message, ScanSession};
use crate::engine::{PatternCompiler, RuleCompiler};
use crate::error::{Result, ScanHookError};
use crate::logging::Logger;
use crate::object::{detect_magic, FileHashes, KeyValuePair, Object};
use crate::options::Configuration;
use crate::registry::{RegisterActions, RuleRegistry};
use crate::rules::RuleType;
use crate::types::ScanOutcome;

/// 工作线程栈大小：解包递归在同一线程内同步展开
pub const WORKER_STACK_SIZE: usize = 32 * 1024 * 1024;

/// 文件头探测长度
const MAGIC_PROBE_LEN: usize = 16;

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// 只在初始化窗口内被调用一次；注册失败由插件自行决定是否继续
    fn init(&self, config: &Configuration, logger: &Logger, actions: &RegisterActions);
}

/// 待扫描的根对象
pub struct ScanTarget {
    object: Object,
    content: Arc<dyn ContentSource>,
}

impl ScanTarget {
    pub fn new(object: Object, content: Arc<dyn ContentSource>) -> Self {
        Self { object, content }
    }

    /// 磁盘文件：内容按需读取，哈希流式计算
    pub fn file(path: &Path) -> io::Result<Self> {
        let source: Arc<dyn ContentSource> = Arc::new(FileSource::open(path)?);
        let mut reader = ContentReader::new(Arc::clone(&source));
        let magic = reader.read_range(0, MAGIC_PROBE_LEN)?;
        let hashes = FileHashes::from_reader(&mut reader)?;
        let object = Object::File {
            path: path.to_string_lossy().into_owned(),
            magic_header: detect_magic(&magic).to_string(),
            hashes,
            size: source.size(),
            unpack: None,
        };
        Ok(Self { object, content: source })
    }

    /// 内存中的文件
    pub fn file_bytes(path: impl Into<String>, data: Vec<u8>) -> Self {
        let object = Object::File {
            path: path.into(),
            magic_header: detect_magic(&data).to_string(),
            hashes: FileHashes::compute(&data),
            size: data.len() as u64,
            unpack: None,
        };
        Self { object, content: Arc::new(BytesSource::new(data)) }
    }

    /// 注册表值；内容为 `key;value_name;parsed_value`
    pub fn registry_value(
        key: impl Into<String>,
        value_name: impl Into<String>,
        parsed_value: impl Into<String>,
    ) -> Self {
        let (key, value_name, parsed_value) = (key.into(), value_name.into(), parsed_value.into());
        let content = format!("{key};{value_name};{parsed_value}").into_bytes();
        Self {
            object: Object::RegistryValue { key, value_name, parsed_value },
            content: Arc::new(BytesSource::new(content)),
        }
    }

    /// 日志条目；内容为消息正文
    pub fn log_entry(source: impl Into<String>, message: impl Into<String>, fields: Vec<KeyValuePair>) -> Self {
        let message = message.into();
        let content = message.clone().into_bytes();
        Self {
            object: Object::LogEntry { source: source.into(), message, fields },
            content: Arc::new(BytesSource::new(content)),
        }
    }

    /// 进程；内容为命令行
    pub fn process(pid: u32, name: impl Into<String>, image: impl Into<String>, command_line: impl Into<String>) -> Self {
        let command_line = command_line.into();
        let content = command_line.clone().into_bytes();
        Self {
            object: Object::Process { pid, name: name.into(), image: image.into(), command_line },
            content: Arc::new(BytesSource::new(content)),
        }
    }

    pub fn generic(label: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            object: Object::Generic { label: label.into() },
            content: Arc::new(BytesSource::new(data)),
        }
    }

    pub fn object(&self) -> &Object {
        &self.object
    }
}

pub struct PipelineBuilder {
    config: Configuration,
    compiler: Arc<dyn RuleCompiler>,
    plugins: Vec<Box<dyn Plugin>>,
    rules: Vec<(RuleType, String)>,
}

impl PipelineBuilder {
    pub fn new(config: Configuration) -> Self {
        Self { config, compiler: Arc::new(PatternCompiler), plugins: Vec::new(), rules: Vec::new() }
    }

    /// 替换签名引擎
    pub fn compiler(mut self, compiler: impl RuleCompiler + 'static) -> Self {
        self.compiler = Arc::new(compiler);
        self
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn plugins(mut self, plugins: impl IntoIterator<Item = Box<dyn Plugin>>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    /// 宿主自带的规则（在插件初始化之前注册）
    pub fn rules(mut self, rule_type: RuleType, source: impl Into<String>) -> Self {
        self.rules.push((rule_type, source.into()));
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let logger = Logger::new("host", self.config.thresholds);
        let actions = RegisterActions::open(self.compiler);

        for (rule_type, source) in &self.rules {
            // 单条规则失败已记录在注册表中，其余规则照常生效
            let _ = actions.add_rule(*rule_type, source);
        }

        for plugin in &self.plugins {
            let name = plugin.name();
            let plugin_actions = actions.for_plugin(name);
            let plugin_logger = logger.for_plugin(name);
            let init = panic::catch_unwind(AssertUnwindSafe(|| {
                plugin.init(&self.config, &plugin_logger, &plugin_actions)
            }));
            match init {
                Ok(()) => tracing::debug!(plugin = name, "plugin initialized"),
                Err(payload) => {
                    tracing::error!(plugin = name, error = %panic_message(&*payload), "plugin init failed")
                }
            }
        }

        let registry = actions.close();
        tracing::info!(
            rules = registry.rule_count(),
            hooks = registry.hook_count(),
            post_hooks = registry.post_processing_hooks().len(),
            compile_errors = registry.compile_errors().len(),
            "initialization window closed"
        );
        Ok(Pipeline { registry: Arc::new(registry), config: Arc::new(self.config), logger })
    }
}

pub struct Pipeline {
    registry: Arc<RuleRegistry>,
    config: Arc<Configuration>,
    logger: Logger,
}

impl Pipeline {
    pub fn builder(config: Configuration) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// 扫描一个根对象（在调用线程内同步完成）
    pub fn scan(&self, target: ScanTarget) -> ScanOutcome {
        let session = ScanSession::new(Arc::clone(&self.registry), Arc::clone(&self.config), self.logger.clone());
        session.run(target.object, target.content)
    }

    /// 带足够栈空间的工作线程池
    pub fn worker_pool(&self, threads: usize) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .stack_size(WORKER_STACK_SIZE)
            .thread_name(|i| format!("scanhook-worker-{i}"))
            .build()
            .map_err(|e| ScanHookError::Config(format!("build worker pool: {e}")))
    }

    /// 并行扫描多个根对象；结果顺序与输入一致
    pub fn scan_all(&self, targets: Vec<ScanTarget>, threads: usize) -> Result<Vec<ScanOutcome>> {
        let pool = self.worker_pool(threads)?;
        Ok(pool.install(|| targets.into_par_iter().map(|t| self.scan(t)).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagger;

    impl Plugin for Tagger {
        fn name(&self) -> &str {
            "tagger"
        }

        fn init(&self, _config: &Configuration, _logger: &Logger, actions: &RegisterActions) {
            actions
                .add_rule(RuleType::Keyword, "[[rules]]\nid = \"Evil\"\ntags = [\"EVIL\"]\nkeywords = [\"evil\"]\n")
                .unwrap();
            actions.add_hook("EVIL", |scanner, object| {
                let data = object.content.read_range(0, 64)?;
                let offset = data.windows(4).position(|w| w == b"evil").unwrap_or(0) as u64;
                scanner.add_reason(crate::findings::Finding::new(
                    "evil keyword",
                    crate::findings::Signature::custom(Default::default(), 50),
                    vec![object.evidence().at(offset, "evil")],
                ))?;
                Ok(())
            });
        }
    }

    struct Panicky;

    impl Plugin for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn init(&self, _config: &Configuration, _logger: &Logger, _actions: &RegisterActions) {
            panic!("init exploded");
        }
    }

    #[test]
    fn plugin_init_panic_does_not_abort_build() {
        let pipeline = Pipeline::builder(Configuration::default()).plugin(Panicky).plugin(Tagger).build().unwrap();
        assert_eq!(pipeline.registry().hook_count(), 1);
    }

    #[test]
    fn keyword_rules_apply_to_process_command_lines() {
        let pipeline = Pipeline::builder(Configuration::default()).plugin(Tagger).build().unwrap();
        let outcome = pipeline.scan(ScanTarget::process(42, "cmd.exe", "C:\\cmd.exe", "run evil now"));
        let report = outcome.root().unwrap();
        assert_eq!(report.score, 50);
        assert_eq!(report.findings[0].match_strings[0].offset, Some(4));
        assert_eq!(report.findings[0].tag.as_deref(), Some("EVIL"));
    }

    #[test]
    fn keyword_rules_do_not_apply_to_files() {
        let pipeline = Pipeline::builder(Configuration::default()).plugin(Tagger).build().unwrap();
        let outcome = pipeline.scan(ScanTarget::file_bytes("/tmp/evil.txt", b"evil".to_vec()));
        assert!(outcome.root().unwrap().findings.is_empty());
    }

    #[test]
    fn scan_all_keeps_input_order() {
        let pipeline = Pipeline::builder(Configuration::default()).plugin(Tagger).build().unwrap();
        let targets = vec![
            ScanTarget::generic("a", b"nothing".to_vec()),
            ScanTarget::generic("b", b"evil".to_vec()),
            ScanTarget::generic("c", b"".to_vec()),
        ];
        let outcomes = pipeline.scan_all(targets, 2).unwrap();
        let scores: Vec<_> = outcomes.iter().map(|o| o.root().unwrap().score).collect();
        assert_eq!(scores, [0, 50, 0]);
    }

    #[test]
    fn invalid_configuration_fails_build() {
        let config = Configuration { max_depth: 0, ..Configuration::default() };
        assert!(Pipeline::builder(config).build().is_err());
    }
}
