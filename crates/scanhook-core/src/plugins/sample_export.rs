//! 样本导出（后处理）
//!
//! 目录布局：`<dir>/<sha256[..2]>/<sha256>.data` 存内容（同一哈希只写一次），
//! `<sha256>.filename.txt` 逐行追加出现过的路径。
use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::logging::Logger;
use crate::object::Object;
use crate::options::Configuration;
use crate::pipeline::Plugin;
use crate::postprocess::MatchedObject;
use crate::registry::RegisterActions;

pub struct SampleExportPlugin {
    dir: PathBuf,
    filetypes: Vec<String>,
}

impl SampleExportPlugin {
    /// 默认只导出 EXE
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), filetypes: vec!["EXE".to_string()] }
    }

    pub fn with_filetypes<I, S>(mut self, filetypes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filetypes = filetypes.into_iter().map(Into::into).collect();
        self
    }
}

impl Plugin for SampleExportPlugin {
    fn name(&self) -> &str {
        "sample_export"
    }

    fn init(&self, _config: &Configuration, logger: &Logger, actions: &RegisterActions) {
        let dir: Arc<Path> = Arc::from(self.dir.as_path());
        let filetypes = self.filetypes.clone();
        actions.add_post_processing_hook(move |logger, object| export_sample(&dir, &filetypes, logger, object));
        let dir = self.dir.display();
        logger.info("sample export plugin loaded", &[("dir", &dir)]);
    }
}

fn export_sample(dir: &Path, filetypes: &[String], logger: &Logger, object: &MatchedObject<'_>) -> anyhow::Result<()> {
    let Object::File { path, magic_header, hashes, .. } = object.object else {
        return Ok(());
    };
    if !filetypes.iter().any(|t| t.eq_ignore_ascii_case(magic_header)) {
        return Ok(());
    }
    let sha = hashes.sha256.as_str();
    let prefix = sha.get(..2).with_context(|| format!("invalid sha256: {sha}"))?;
    let bucket = dir.join(prefix);
    fs::create_dir_all(&bucket).with_context(|| format!("create {}", bucket.display()))?;

    let data_path = bucket.join(format!("{sha}.data"));
    match OpenOptions::new().write(true).create_new(true).open(&data_path) {
        Ok(mut file) => {
            let mut content = object.content.reopen();
            io::copy(&mut content, &mut file).with_context(|| format!("write {}", data_path.display()))?;
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e).with_context(|| format!("create {}", data_path.display())),
    }

    let names_path = bucket.join(format!("{sha}.filename.txt"));
    let mut names = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&names_path)
        .with_context(|| format!("open {}", names_path.display()))?;
    writeln!(names, "{path}")?;

    logger.info("exported sample", &[("path", path), ("sha256", &sha)]);
    Ok(())
}
