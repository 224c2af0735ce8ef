//! 目录扫描主流程与并行调度
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::options::{ScanOptions, ScanStats};
use crate::pipeline::{Pipeline, ScanTarget};
use crate::types::ScanOutcome;

/// 扫描目录并将对象报告以 JSON 数组流式写入 `out`
/// 稳定性保证：
/// - 根文件按路径排序，输出顺序与线程数无关
/// - 同一根文件内，子对象报告先于父对象（按完成顺序）
/// - 只输出有 Finding 且总分不低于 `min_score` 的对象
pub fn scan_and_write(
    input: &Path,
    out: &mut dyn Write,
    pipeline: &Pipeline,
    opts: &ScanOptions,
) -> Result<ScanStats> {
    let files = collect_files(input, opts.max_walk_depth);
    tracing::info!(files = files.len(), input = %input.display(), "collected scan targets");

    let threads = opts
        .threads
        .or(pipeline.configuration().threads)
        .unwrap_or_else(num_cpus::get)
        .max(1);

    let mut writer = ReportWriter::new(out, opts.min_score);
    writer.begin()?;
    if threads > 1 {
        scan_parallel(&files, &mut writer, pipeline, threads)?;
    } else {
        for path in &files {
            if let Some(outcome) = scan_path(pipeline, path) {
                writer.write(outcome)?;
            }
        }
    }
    writer.finish()
}

/// 单个文件作为根对象；文件本身打不开时只记日志
fn scan_path(pipeline: &Pipeline, path: &Path) -> Option<ScanOutcome> {
    match ScanTarget::file(path) {
        Ok(target) => Some(pipeline.scan(target)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot open file");
            None
        }
    }
}

fn collect_files(input: &Path, max_depth: Option<usize>) -> Vec<PathBuf> {
    if input.is_file() {
        return vec![input.to_path_buf()];
    }
    let mut walker = WalkDir::new(input).min_depth(1);
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in walker {
        match entry {
            Ok(e) if e.file_type().is_file() => files.push(e.into_path()),
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "walk error"),
        }
    }
    files.sort();
    files
}

/// 并行调度：
/// - 扫描线程内使用 Rayon 线程池并行扫描
/// - 当前线程作为 Writer 按 idx 重排并流式写 JSON，保证稳定顺序
fn scan_parallel(files: &[PathBuf], writer: &mut ReportWriter<'_>, pipeline: &Pipeline, threads: usize) -> Result<()> {
    use crossbeam_channel as channel;
    use rayon::prelude::*;

    type Msg = (usize, Option<ScanOutcome>);
    let (tx, rx) = channel::bounded::<Msg>(256);
    let pool = pipeline.worker_pool(threads)?;

    std::thread::scope(|scope| -> Result<()> {
        // Receiver 归闭包所有：写出失败提前返回时随之丢弃，扫描侧 send 失败后停止
        let rx = rx;
        scope.spawn(move || {
            pool.install(|| {
                let _ = files
                    .par_iter()
                    .enumerate()
                    .try_for_each_with(tx, |tx, (idx, path)| tx.send((idx, scan_path(pipeline, path))));
            });
            // 结束后 Sender 全部被丢弃，Receiver 将收到关闭信号
        });

        let mut next_idx = 0usize;
        let mut buffer: BTreeMap<usize, Option<ScanOutcome>> = BTreeMap::new();
        while let Ok((idx, outcome)) = rx.recv() {
            buffer.insert(idx, outcome);
            while let Some(outcome) = buffer.remove(&next_idx) {
                if let Some(outcome) = outcome {
                    writer.write(outcome)?;
                }
                next_idx += 1;
            }
        }
        Ok(())
    })
}

struct ReportWriter<'a> {
    out: &'a mut dyn Write,
    min_score: i64,
    first: bool,
    stats: ScanStats,
}

impl<'a> ReportWriter<'a> {
    fn new(out: &'a mut dyn Write, min_score: i64) -> Self {
        Self { out, min_score, first: true, stats: ScanStats::default() }
    }

    fn begin(&mut self) -> Result<()> {
        write!(self.out, "[")?;
        Ok(())
    }

    fn write(&mut self, outcome: ScanOutcome) -> Result<()> {
        self.stats.merge(&outcome.stats);
        for report in &outcome.reports {
            if !report.has_findings() || report.score < self.min_score {
                continue;
            }
            if !self.first {
                write!(self.out, ",")?;
            } else {
                self.first = false;
            }
            serde_json::to_writer(&mut *self.out, &report.output_item()).context("serialize report")?;
            self.stats.outputs_written += 1;
        }
        Ok(())
    }

    fn finish(self) -> Result<ScanStats> {
        write!(self.out, "]")?;
        self.out.flush()?;
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Configuration;
    use crate::rules::RuleType;

    const RULE: &str = "[[rules]]\nid = \"Marker\"\nscore = 50\nkeywords = [\"MARKER\"]\n";

    fn pipeline() -> Pipeline {
        Pipeline::builder(Configuration::default()).rules(RuleType::Default, RULE).build().unwrap()
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [("b.txt", "MARKER here"), ("a.txt", "clean"), ("c.txt", "also MARKER")] {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        dir
    }

    fn run(threads: usize) -> (serde_json::Value, ScanStats) {
        let dir = fixture();
        let mut out = Vec::new();
        let opts = ScanOptions { threads: Some(threads), ..ScanOptions::default() };
        let stats = scan_and_write(dir.path(), &mut out, &pipeline(), &opts).unwrap();
        (serde_json::from_slice(&out).unwrap(), stats)
    }

    #[test]
    fn serial_output_is_sorted_and_filtered() {
        let (json, stats) = run(1);
        let items = json.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0]["object"].as_str().unwrap().ends_with("b.txt"));
        assert!(items[1]["object"].as_str().unwrap().ends_with("c.txt"));
        assert_eq!(items[0]["score"], 50);
        assert_eq!(stats.objects_scanned, 3);
        assert_eq!(stats.outputs_written, 2);
    }

    #[test]
    fn parallel_output_matches_serial() {
        let (serial, _) = run(1);
        let (parallel, _) = run(4);
        let names = |v: &serde_json::Value| -> Vec<String> {
            v.as_array()
                .unwrap()
                .iter()
                .map(|i| i["object"].as_str().unwrap().rsplit('/').next().unwrap().to_string())
                .collect()
        };
        assert_eq!(names(&serial), names(&parallel));
    }

    /// 前 `budget` 次写入成功，之后全部失败
    struct FailingOutput {
        budget: usize,
    }

    impl Write for FailingOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "output closed"));
            }
            self.budget -= 1;
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn parallel_write_error_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..600 {
            std::fs::write(dir.path().join(format!("f{i:04}.txt")), "MARKER").unwrap();
        }
        let mut out = FailingOutput { budget: 3 };
        let opts = ScanOptions { threads: Some(2), ..ScanOptions::default() };
        let err = scan_and_write(dir.path(), &mut out, &pipeline(), &opts).unwrap_err();
        assert!(format!("{err:#}").contains("output closed"));
    }

    #[test]
    fn min_score_filters_reports() {
        let dir = fixture();
        let mut out = Vec::new();
        let opts = ScanOptions { threads: Some(1), min_score: 60, ..ScanOptions::default() };
        scan_and_write(dir.path(), &mut out, &pipeline(), &opts).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[]");
    }
}
