//! 规则触发式对象扫描插件管线
//!
//! 设计要点：
//! - 扫描对象（文件、注册表值、日志、进程、通用数据）先经签名规则评估，命中规则的标签触发插件钩子。
//! - 钩子可以追加 Finding，也可以把解包出的内容重新送入扫描（同步递归，受深度、大小、环路守卫约束）。
//! - 证据统一使用字节偏移 + 字段弱引用，可在扫描结束前通过对象存储重新读取验证。
//! - 插件只能在初始化窗口内注册规则与钩子；窗口关闭后注册表只读，可跨线程共享。
//! - 任一钩子失败只产生诊断 Finding，不影响同一对象的其它钩子与其它对象。

mod content;
mod context;
mod dispatch;
mod engine;
mod error;
mod evidence;
mod findings;
mod guard;
mod logging;
mod object;
mod options;
mod pipeline;
mod postprocess;
mod registry;
mod rules;
mod scan;
mod store;
mod types;

pub mod plugins;

pub use content::{BytesSource, ContentReader, ContentSource, FileSource};
pub use context::{MatchingObject, Scanner};
pub use engine::{CompiledRule, PatternCompiler, RawMatch, RuleCompiler, RuleInput, RuleMatch};
pub use error::{DiagnosticKind, Result, ScanHookError};
pub use evidence::{lines_with_offsets, resolve, structured_layout, EvidenceBuilder, PairSpan, StructuredLayout, PAIR_SEPARATOR};
pub use findings::{total_score, Finding, MatchString, Signature, SignatureClass, SignatureType};
pub use guard::{Lineage, LineageEntry, RecursionGuard};
pub use logging::{Fields, Logger, Severity};
pub use object::{
    detect_magic, ExternalVars, FieldRef, FieldSelector, FileHashes, KeyValuePair, Object, ObjectId, ObjectKind,
    UnpackInfo,
};
pub use options::{Configuration, EvidenceMode, ScanOptions, ScanStats, Thresholds, HARD_MAX_DEPTH};
pub use pipeline::{Pipeline, PipelineBuilder, Plugin, ScanTarget, WORKER_STACK_SIZE};
pub use postprocess::MatchedObject;
pub use registry::{
    CompileFailure, PostProcessingHook, RegisterActions, RegisteredHook, RegisteredPostHook, RegisteredRule,
    RuleHook, RuleRegistry,
};
pub use rules::{applicable_rule_types, RuleMeta, RuleType, META_PREFIX_LEN};
pub use scan::scan_and_write;
pub use store::ObjectStore;
pub use types::{ObjectReport, OutputItem, ScanOutcome};
