//! 签名引擎接口与默认实现
//!
//! 核心把签名引擎当作黑盒：只消费规则名、标签、`{class, score}` 元数据以及匹配位置。
//! 默认实现 `PatternCompiler` 基于 TOML 规则：
//! - `strings`：`regex::bytes` 字节级正则，避免 UTF-8 解码失败导致漏检；
//! - `keywords`：Aho-Corasick 字面量集合；
//! - `meta`：外部变量等值约束。
//! 大内容按块随机读取，块间保留重叠区，匹配偏移映射回全局偏移。
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use std::collections::HashMap;
use std::fmt;
use std::io;

use crate::content::ContentReader;
use crate::error::{Result, ScanHookError};
use crate::object::{ExternalVars, Object};
use crate::rules::{parse_rule_source, Condition, RuleEntry, RuleMeta, RuleType};

/// 分块大小与重叠字节数
pub(crate) const CHUNK_SIZE: u64 = 4 * 1024 * 1024;
pub(crate) const CHUNK_OVERLAP: u64 = 512;
/// 每个字符串最多保留的匹配条数
pub(crate) const MAX_MATCHES_PER_STRING: usize = 16;

/// 规则评估输入
pub struct RuleInput<'a> {
    pub rule_type: RuleType,
    pub object: &'a Object,
    pub vars: &'a ExternalVars,
    pub content: &'a ContentReader,
}

/// 单条原始匹配（偏移为内容字节下标）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    pub identifier: String,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMatch {
    pub strings: Vec<RawMatch>,
}

pub trait CompiledRule: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn tags(&self) -> &[String];
    fn meta(&self) -> RuleMeta;
    fn description(&self) -> Option<&str> {
        None
    }
    fn evaluate(&self, input: &RuleInput<'_>) -> io::Result<Option<RuleMatch>>;
}

/// 规则编译器：源码中每条规则独立成功或失败
pub trait RuleCompiler: Send + Sync {
    fn compile(&self, rule_type: RuleType, source: &str) -> Vec<Result<Box<dyn CompiledRule>>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PatternCompiler;

impl RuleCompiler for PatternCompiler {
    fn compile(&self, _rule_type: RuleType, source: &str) -> Vec<Result<Box<dyn CompiledRule>>> {
        match parse_rule_source(source) {
            Ok(entries) => entries
                .into_iter()
                .map(|e| PatternRule::compile(e).map(|r| Box::new(r) as Box<dyn CompiledRule>))
                .collect(),
            Err(e) => vec![Err(e)],
        }
    }
}

struct PatternRule {
    id: String,
    tags: Vec<String>,
    meta: RuleMeta,
    description: Option<String>,
    strings: Vec<regex::bytes::Regex>,
    keywords: Option<AhoCorasick>,
    keyword_count: usize,
    condition: Condition,
    constraints: Vec<(String, String)>,
}

impl fmt::Debug for PatternRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternRule")
            .field("id", &self.id)
            .field("tags", &self.tags)
            .field("strings", &self.strings.len())
            .field("keywords", &self.keyword_count)
            .finish()
    }
}

impl PatternRule {
    fn compile(entry: RuleEntry) -> Result<Self> {
        entry.check()?;
        let fail = |message: String| ScanHookError::CompileError { rule: entry.id.clone(), message };

        let mut strings = Vec::with_capacity(entry.strings.len());
        for pat in &entry.strings {
            let rx = regex::bytes::RegexBuilder::new(pat)
                .case_insensitive(entry.nocase)
                .build()
                .map_err(|e| fail(e.to_string()))?;
            strings.push(rx);
        }

        let keywords = if entry.keywords.is_empty() {
            None
        } else {
            let ac = AhoCorasickBuilder::new()
                .ascii_case_insensitive(entry.nocase)
                .match_kind(MatchKind::Standard)
                .build(&entry.keywords)
                .map_err(|e| fail(e.to_string()))?;
            Some(ac)
        };

        Ok(Self {
            keyword_count: entry.keywords.len(),
            id: entry.id,
            tags: entry.tags,
            meta: RuleMeta { class: entry.class, score: entry.score },
            description: entry.description,
            strings,
            keywords,
            condition: entry.condition,
            constraints: entry.meta.into_iter().collect(),
        })
    }

    fn constraints_hold(&self, vars: &ExternalVars) -> bool {
        self.constraints.iter().all(|(name, want)| match vars.get(name) {
            Some(have) if name == "filetype" || name == "extension" => have.eq_ignore_ascii_case(want),
            Some(have) => have == *want,
            None => false,
        })
    }

    fn pattern_count(&self) -> usize {
        self.strings.len() + self.keyword_count
    }

    /// 在单个块上运行所有模式；`base` 为块在内容中的起始偏移
    fn scan_chunk(&self, chunk: &[u8], base: u64, seen: &mut Seen, hits: &mut [Vec<RawMatch>]) {
        for (i, rx) in self.strings.iter().enumerate() {
            for m in rx.find_iter(chunk) {
                if m.end() <= m.start() {
                    continue;
                }
                let data = &chunk[m.start()..m.end()];
                record(seen, &mut hits[i], i, format!("$s{i}"), base + m.start() as u64, data);
            }
        }
        if let Some(ac) = &self.keywords {
            for m in ac.find_overlapping_iter(chunk) {
                let k = m.pattern().as_usize();
                let slot = self.strings.len() + k;
                let data = &chunk[m.start()..m.end()];
                record(seen, &mut hits[slot], slot, format!("$k{k}"), base + m.start() as u64, data);
            }
        }
    }
}

/// `(模式槽位, 偏移)` → 在该槽位命中列表中的下标
type Seen = HashMap<(usize, u64), usize>;

/// 同一偏移只保留一条；块尾被截断的贪婪匹配由下一块更长的结果替换
fn record(seen: &mut Seen, hits: &mut Vec<RawMatch>, slot: usize, identifier: String, offset: u64, data: &[u8]) {
    if let Some(&idx) = seen.get(&(slot, offset)) {
        if data.len() > hits[idx].data.len() {
            hits[idx].data = data.to_vec();
        }
        return;
    }
    if hits.len() < MAX_MATCHES_PER_STRING {
        seen.insert((slot, offset), hits.len());
        hits.push(RawMatch { identifier, offset, data: data.to_vec() });
    }
}

impl CompiledRule for PatternRule {
    fn name(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn meta(&self) -> RuleMeta {
        self.meta
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn evaluate(&self, input: &RuleInput<'_>) -> io::Result<Option<RuleMatch>> {
        if !self.constraints_hold(input.vars) {
            return Ok(None);
        }
        if self.pattern_count() == 0 {
            return Ok(Some(RuleMatch::default()));
        }

        let size = input.content.size();
        let total = input.rule_type.content_limit().map_or(size, |limit| limit.min(size));
        let mut hits: Vec<Vec<RawMatch>> = vec![Vec::new(); self.pattern_count()];
        let mut seen = Seen::new();

        let mut base = 0u64;
        while base < total {
            let end = (base + CHUNK_SIZE).min(total);
            let chunk = input.content.read_range(base, (end - base) as usize)?;
            self.scan_chunk(&chunk, base, &mut seen, &mut hits);
            if end >= total {
                break;
            }
            // 下一块从重叠区开始，覆盖跨块的匹配
            base = end.saturating_sub(CHUNK_OVERLAP).max(base + 1);
        }

        let matched = match self.condition {
            Condition::Any => hits.iter().any(|h| !h.is_empty()),
            Condition::All => hits.iter().all(|h| !h.is_empty()),
        };
        if !matched {
            return Ok(None);
        }
        let mut strings: Vec<RawMatch> = hits.into_iter().flatten().collect();
        strings.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.identifier.cmp(&b.identifier)));
        Ok(Some(RuleMatch { strings }))
    }
}
