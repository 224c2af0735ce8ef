#![allow(dead_code)]

use scanhook_core::{Configuration, DiagnosticKind, Logger, ObjectReport, Plugin, RegisterActions};
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

/// 由闭包构成的一次性插件
pub struct FnPlugin<F> {
    name: &'static str,
    init: F,
}

impl<F> FnPlugin<F>
where
    F: Fn(&Configuration, &Logger, &RegisterActions) + Send + Sync,
{
    pub fn new(name: &'static str, init: F) -> Self {
        Self { name, init }
    }
}

impl<F> Plugin for FnPlugin<F>
where
    F: Fn(&Configuration, &Logger, &RegisterActions) + Send + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    fn init(&self, config: &Configuration, logger: &Logger, actions: &RegisterActions) {
        (self.init)(config, logger, actions)
    }
}

/// 在内存中构造 ZIP（不压缩）
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn diagnostics(report: &ObjectReport) -> Vec<DiagnosticKind> {
    report.findings.iter().filter_map(|f| f.diagnostic).collect()
}

pub fn keyword_rule(id: &str, tag: &str, keyword: &str, score: i64) -> String {
    format!("[[rules]]\nid = \"{id}\"\ntags = [\"{tag}\"]\nscore = {score}\nkeywords = [\"{keyword}\"]\n")
}
