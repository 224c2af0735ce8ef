//! ZIP 解包插件
//!
//! 元数据规则按魔数识别 ZIP，钩子逐个成员先按声明大小询问守卫，
//! 再以 `ZIP` 解包方式把成员内容送回扫描。
use std::io::Read;

use crate::context::{MatchingObject, Scanner};
use crate::logging::Logger;
use crate::object::Object;
use crate::options::Configuration;
use crate::pipeline::Plugin;
use crate::registry::RegisterActions;
use crate::rules::RuleType;

const ZIP_RULE: &str = r#"
[[rules]]
id = "DetectZipFiles"
tags = ["ZIPFILE"]

[rules.meta]
filetype = "ZIP"
"#;

pub struct ZipPlugin;

impl Plugin for ZipPlugin {
    fn name(&self) -> &str {
        "zip"
    }

    fn init(&self, _config: &Configuration, logger: &Logger, actions: &RegisterActions) {
        if let Err(e) = actions.add_rule(RuleType::Meta, ZIP_RULE) {
            logger.error("failed to register zip rule", &[("error", &e)]);
            return;
        }
        actions.add_hook("ZIPFILE", scan_zip);
        logger.info("zip plugin loaded", &[]);
    }
}

fn scan_zip(scanner: &mut Scanner<'_>, object: &MatchingObject<'_>) -> anyhow::Result<()> {
    let Object::File { path, .. } = object.object else {
        return Ok(());
    };
    let depth = scanner.depth();
    scanner.debug("scanning zip file", &[("path", path), ("depth", &depth)]);
    let mut archive = match ::zip::ZipArchive::new(object.content.handle()) {
        Ok(archive) => archive,
        Err(e) => {
            scanner.error("could not parse zip file", &[("path", path), ("error", &e)]);
            return Ok(());
        }
    };

    let limit = scanner.configuration().max_file_size;
    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                scanner.error("could not open file in zip file", &[("index", &i), ("error", &e)]);
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        // 声明大小超限的成员不解压
        if scanner.check_extraction(&name, entry.size()).is_err() {
            continue;
        }
        // 声明大小可能是伪造的：多读一个字节，让守卫按实际大小拒绝
        let mut data = Vec::new();
        if let Err(e) = entry.by_ref().take(limit.saturating_add(1)).read_to_end(&mut data) {
            scanner.error("could not read file in zip file", &[("file", &name), ("error", &e)]);
            continue;
        }
        drop(entry);
        // 可能递归：成员本身是 ZIP 时本钩子会再次被调用
        let _ = scanner.scan_file(&name, data, "ZIP");
    }
    Ok(())
}
