//! 对象调度器
//!
//! 一个 `ScanSession` 负责一个根对象及其全部解包子对象，单线程、同步递归：
//! 1. 按对象种类评估适用的规则类型，收集命中标签（去重、保序）；
//! 2. 按标签顺序、钩子注册顺序执行钩子，钩子内的 `scan_file` 等调用直接递归进入本调度器；
//! 3. 执行后处理钩子，生成报告，释放对象。
//!
//! 钩子的错误与 panic 被转换为诊断 Finding，不会跨钩子、跨对象传播。
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::content::{BytesSource, ContentReader, ContentSource};
use crate::context::{MatchingObject, Scanner};
use crate::engine::{CompiledRule, RuleInput, RuleMatch};
use crate::error::{Result, ScanHookError};
use crate::evidence::{self, EvidenceBuilder};
use crate::findings::{sort_match_strings_stable, total_score, Finding, Signature};
use crate::guard::{Lineage, LineageEntry, RecursionGuard};
use crate::logging::Logger;
use crate::object::{detect_magic, sha256_hex, FileHashes, Object, ObjectId, UnpackInfo};
use crate::options::{Configuration, EvidenceMode, ScanStats};
use crate::postprocess::{run_post_processing, MatchedObject};
use crate::registry::RuleRegistry;
use crate::rules::{applicable_rule_types, RuleType};
use crate::store::ObjectStore;
use crate::types::{ObjectReport, ScanOutcome};

/// 单条规则命中最多带入 Finding 的证据条数
const MAX_RULE_EVIDENCE: usize = 32;

pub(crate) struct ScanSession {
    registry: Arc<RuleRegistry>,
    config: Arc<Configuration>,
    logger: Logger,
    guard: RecursionGuard,
    store: ObjectStore,
    pending: HashMap<ObjectId, Vec<Finding>>,
    reports: Vec<ObjectReport>,
    stats: ScanStats,
}

impl ScanSession {
    pub(crate) fn new(registry: Arc<RuleRegistry>, config: Arc<Configuration>, logger: Logger) -> Self {
        let guard = RecursionGuard::from_config(&config);
        Self {
            registry,
            config,
            logger,
            guard,
            store: ObjectStore::new(),
            pending: HashMap::new(),
            reports: Vec::new(),
            stats: ScanStats::default(),
        }
    }

    pub(crate) fn config(&self) -> &Configuration {
        &self.config
    }

    /// 扫描一个根对象（及其递归解包出的全部对象）
    pub(crate) fn run(mut self, object: Object, content: Arc<dyn ContentSource>) -> ScanOutcome {
        let reader = ContentReader::new(Arc::clone(&content));
        let sha256 = match object.sha256() {
            Some(sha) => sha.to_string(),
            None => reader
                .read_range(0, usize::try_from(reader.size()).unwrap_or(usize::MAX))
                .map(|data| sha256_hex(&data))
                .unwrap_or_default(),
        };
        let lineage = Lineage::root(LineageEntry {
            name: object.display_name(),
            unpack_method: None,
            sha256,
            size: reader.size(),
        });
        let id = self.store.insert(object, content);
        self.dispatch(id, &lineage);
        ScanOutcome { reports: self.reports, stats: self.stats }
    }

    fn dispatch(&mut self, id: ObjectId, lineage: &Lineage) {
        let (Some(object), Some(reader)) = (self.store.object(id), self.store.content(id)) else {
            tracing::error!(object = %id, "dispatch on released object");
            return;
        };
        self.stats.objects_scanned += 1;
        let registry = Arc::clone(&self.registry);
        // 规则评估使用独立句柄，其读错误不计入钩子的句柄族
        let mut tags = Vec::new();
        if let Err(e) = self.evaluate_rules(&registry, id, &object, &reader.reopen(), &mut tags) {
            self.attach_diagnostic(id, None, &e);
        }
        self.run_hooks(&registry, id, &object, &reader, lineage, &tags);
        self.finish(&registry, id, &object, lineage);
    }

    /// 评估规则，把命中标签按首次出现顺序追加到 `tags`；
    /// 读取失败时中止评估，已收集的标签保留
    fn evaluate_rules(
        &mut self,
        registry: &RuleRegistry,
        id: ObjectId,
        object: &Object,
        reader: &ContentReader,
        tags: &mut Vec<String>,
    ) -> Result<()> {
        let vars = object.external_vars();
        let deep_scan = reader.size() <= self.config.max_file_size;
        for &rule_type in applicable_rule_types(object.kind()) {
            if rule_type == RuleType::Default && !deep_scan {
                tracing::debug!(object = %id, size = reader.size(), "content above max_file_size; default rules skipped");
                continue;
            }
            for registered in registry.rules_for(rule_type) {
                let input = RuleInput { rule_type, object, vars: &vars, content: reader };
                let matched = registered
                    .rule
                    .evaluate(&input)
                    .map_err(|e| ScanHookError::ReaderError { object: id, message: e.to_string() })?;
                let Some(matched) = matched else { continue };
                let rule = registered.rule.as_ref();
                tracing::debug!(object = %id, rule = rule.name(), %rule_type, "rule matched");
                if rule.meta().score != 0 {
                    let finding = rule_finding(id, rule, matched);
                    self.attach(id, finding);
                }
                for tag in rule.tags() {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn run_hooks(
        &mut self,
        registry: &RuleRegistry,
        id: ObjectId,
        object: &Object,
        reader: &ContentReader,
        lineage: &Lineage,
        tags: &[String],
    ) {
        for tag in tags {
            for hook in registry.hooks_for(tag) {
                let matching = MatchingObject { id, object, content: reader.handle() };
                let logger = self.logger.for_plugin(&hook.plugin);
                let outcome = {
                    let mut scanner = Scanner::new(self, id, tag, lineage, logger);
                    panic::catch_unwind(AssertUnwindSafe(|| (hook.callback)(&mut scanner, &matching)))
                };
                let fault = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{e:#}")),
                    Err(payload) => Some(panic_message(&*payload)),
                };
                if let Some(message) = fault {
                    self.stats.hook_faults += 1;
                    let err = ScanHookError::HookFault { tag: tag.clone(), message };
                    self.attach_diagnostic(id, Some(tag), &err);
                }
                // 内容读取失败后不再执行该对象的剩余钩子
                if let Some(message) = reader.fault() {
                    let err = ScanHookError::ReaderError { object: id, message };
                    self.attach_diagnostic(id, Some(tag), &err);
                    return;
                }
            }
        }
    }

    fn finish(&mut self, registry: &RuleRegistry, id: ObjectId, object: &Object, lineage: &Lineage) {
        let findings = self.pending.remove(&id).unwrap_or_default();
        if !registry.post_processing_hooks().is_empty() {
            if let Some(content) = self.store.content(id) {
                let faults = {
                    let matched = MatchedObject::new(id, object, &findings, content, &self.store);
                    run_post_processing(registry.post_processing_hooks(), &self.logger, &matched)
                };
                self.stats.hook_faults += faults;
            }
        }

        let score = total_score(&findings);
        let severity = self.config.thresholds.classify(score);
        let diagnostics = findings.iter().filter(|f| f.is_diagnostic()).count();
        self.stats.diagnostics += diagnostics;
        self.stats.findings_total += findings.len() - diagnostics;
        if findings.len() > diagnostics {
            let name = object.display_name();
            let count = findings.len() - diagnostics;
            self.logger.scored(score, "object matched", &[("object", &name), ("id", &id), ("findings", &count)]);
        }

        self.store.release(id);
        self.reports.push(ObjectReport {
            id,
            object: object.clone(),
            lineage: lineage.clone(),
            findings,
            score,
            severity,
        });
    }

    /// 挂到对象上；Plain 模式下去掉偏移并逐条输出带分数日志
    pub(crate) fn attach(&mut self, id: ObjectId, mut finding: Finding) {
        if self.config.evidence == EvidenceMode::Plain {
            finding.strip_offsets();
            let matches: Vec<String> = finding
                .match_strings
                .iter()
                .map(|m| String::from_utf8_lossy(&m.data).into_owned())
                .collect();
            let matches = matches.join(", ");
            self.logger.scored(finding.score(), &finding.description, &[("object", &id), ("matches", &matches)]);
        }
        self.pending.entry(id).or_default().push(finding);
    }

    pub(crate) fn attach_diagnostic(&mut self, id: ObjectId, tag: Option<&str>, err: &ScanHookError) {
        tracing::error!(
            object = %id,
            tag = tag.unwrap_or(""),
            kind = ?err.diagnostic_kind(),
            error = %err,
            "scan diagnostic"
        );
        self.pending.entry(id).or_default().push(Finding::diagnostic(tag, err));
    }

    /// `Scanner::add_reason`：Offsets 模式下先校验证据
    pub(crate) fn add_reason(&mut self, id: ObjectId, tag: &str, mut finding: Finding) -> Result<()> {
        if self.config.evidence == EvidenceMode::Offsets {
            if let Err(e) = evidence::validate(&self.store, id, &finding) {
                self.attach_diagnostic(id, Some(tag), &e);
                return Err(e);
            }
        }
        if finding.tag.is_none() {
            finding.tag = Some(tag.to_string());
        }
        self.attach(id, finding);
        Ok(())
    }

    /// `Scanner::check_extraction`
    pub(crate) fn check_declared(
        &mut self,
        parent: ObjectId,
        lineage: &Lineage,
        tag: &str,
        name: &str,
        size: u64,
    ) -> Result<()> {
        self.guard.check_declared(lineage, name, size).map_err(|e| {
            self.attach_diagnostic(parent, Some(tag), &e);
            e
        })
    }

    /// `Scanner::scan_file`：守卫通过后作为解包文件递归调度
    pub(crate) fn extract(
        &mut self,
        parent: ObjectId,
        lineage: &Lineage,
        tag: &str,
        name: &str,
        data: Vec<u8>,
        method: &str,
    ) -> Result<()> {
        let size = data.len() as u64;
        let hashes = FileHashes::compute(&data);
        if let Err(e) = self.guard.approve(lineage, name, size, &hashes.sha256) {
            self.attach_diagnostic(parent, Some(tag), &e);
            return Err(e);
        }
        let parent_name = self.store.object(parent).map(|o| o.display_name()).unwrap_or_default();
        let child_lineage = lineage.child(LineageEntry {
            name: name.to_string(),
            unpack_method: Some(method.to_string()),
            sha256: hashes.sha256.clone(),
            size,
        });
        let object = Object::File {
            path: format!("{parent_name}/{name}"),
            magic_header: detect_magic(&data).to_string(),
            hashes,
            size,
            unpack: Some(UnpackInfo { method: method.to_string(), parent: parent_name, depth: child_lineage.depth() }),
        };
        let id = self.store.insert(object, Arc::new(BytesSource::new(data)));
        self.stats.objects_extracted += 1;
        tracing::debug!(parent = %parent, object = %id, name, method, depth = child_lineage.depth(), "scanning extracted file");
        self.dispatch(id, &child_lineage);
        Ok(())
    }

    /// `Scanner::scan_string` / `scan_structured_data`：作为通用对象递归调度（只受深度约束）
    pub(crate) fn inline(
        &mut self,
        parent: ObjectId,
        lineage: &Lineage,
        tag: &str,
        label: &str,
        method: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        if let Err(e) = self.guard.check_depth(lineage, label) {
            self.attach_diagnostic(parent, Some(tag), &e);
            return Err(e);
        }
        let child_lineage = lineage.child(LineageEntry {
            name: label.to_string(),
            unpack_method: Some(method.to_string()),
            sha256: sha256_hex(&data),
            size: data.len() as u64,
        });
        let id = self.store.insert(Object::Generic { label: label.to_string() }, Arc::new(BytesSource::new(data)));
        self.dispatch(id, &child_lineage);
        Ok(())
    }
}

/// 规则命中 → Finding：证据指向对象内容
fn rule_finding(id: ObjectId, rule: &dyn CompiledRule, matched: RuleMatch) -> Finding {
    let meta = rule.meta();
    let evidence = EvidenceBuilder::content_of(id);
    let mut strings: Vec<_> = matched
        .strings
        .into_iter()
        .take(MAX_RULE_EVIDENCE)
        .map(|m| evidence.at(m.offset, m.data))
        .collect();
    sort_match_strings_stable(&mut strings);
    let description = match rule.description() {
        Some(d) => d.to_string(),
        None => format!("rule {} matched", rule.name()),
    };
    Finding::new(description, Signature::rule(rule.name(), meta.class, meta.score), strings)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
