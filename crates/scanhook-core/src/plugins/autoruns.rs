//! 注册表自启动项插件
//!
//! 命中 Run 键的注册表值按 `key;value_name;parsed_value` 拆分，记录并扫描其中的命令行。
use std::io::BufReader;

use crate::context::{MatchingObject, Scanner};
use crate::evidence::lines_with_offsets;
use crate::logging::Logger;
use crate::options::Configuration;
use crate::pipeline::Plugin;
use crate::registry::RegisterActions;
use crate::rules::RuleType;

/// 注册表内容格式：`key;value_name;parsed_value`
const RUN_KEY_RULE: &str = r#"
[[rules]]
id = "RunKey"
tags = ["RUNKEY"]
nocase = true
strings = ['SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Run']
"#;

pub struct AutorunsPlugin;

impl Plugin for AutorunsPlugin {
    fn name(&self) -> &str {
        "autoruns"
    }

    fn init(&self, _config: &Configuration, logger: &Logger, actions: &RegisterActions) {
        if let Err(e) = actions.add_rule(RuleType::Registry, RUN_KEY_RULE) {
            logger.error("failed to register run key rule", &[("error", &e)]);
            return;
        }
        actions.add_hook("RUNKEY", report_autorun);
        logger.info("autoruns plugin loaded", &[]);
    }
}

fn report_autorun(scanner: &mut Scanner<'_>, object: &MatchingObject<'_>) -> anyhow::Result<()> {
    for line in lines_with_offsets(BufReader::new(object.content.handle())) {
        let (_, line) = line?;
        let line = String::from_utf8_lossy(&line);
        let parts: Vec<&str> = line.splitn(3, ';').collect();
        let [_, value, command] = parts[..] else {
            scanner.error("malformed registry entry", &[("entry", &line)]);
            continue;
        };
        scanner.info("found autorun entry in registry", &[("value", &value), ("command", &command)]);
        // 启动命令本身交给关键字规则
        scanner.scan_string(command);
    }
    Ok(())
}
