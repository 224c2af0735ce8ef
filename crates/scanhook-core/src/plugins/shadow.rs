//! `/etc/shadow` 检查插件
//!
//! 逐行解析 9 字段的 shadow 记录，密码字段为 MD5-crypt（`$1$`）时报告用户名与哈希的偏移。
use std::io::BufReader;

use crate::context::{MatchingObject, Scanner};
use crate::evidence::lines_with_offsets;
use crate::findings::{Finding, Signature, SignatureClass};
use crate::logging::Logger;
use crate::options::Configuration;
use crate::pipeline::Plugin;
use crate::registry::RegisterActions;
use crate::rules::RuleType;

const SHADOW_RULE: &str = r#"
[[rules]]
id = "Shadow"
tags = ["SHADOWFILE"]

[rules.meta]
filepath = "/etc"
filename = "shadow"
"#;

/// shadow 文件每行固定 9 个字段
const SHADOW_FIELDS: usize = 9;
const MD5_CRYPT_PREFIX: &[u8] = b"$1$";

pub struct ShadowPlugin;

impl Plugin for ShadowPlugin {
    fn name(&self) -> &str {
        "shadow"
    }

    fn init(&self, _config: &Configuration, logger: &Logger, actions: &RegisterActions) {
        if let Err(e) = actions.add_rule(RuleType::Meta, SHADOW_RULE) {
            logger.error("failed to register shadow rule", &[("error", &e)]);
            return;
        }
        actions.add_hook("SHADOWFILE", check_shadow);
        logger.info("shadow plugin loaded", &[]);
    }
}

fn check_shadow(scanner: &mut Scanner<'_>, object: &MatchingObject<'_>) -> anyhow::Result<()> {
    let evidence = object.evidence();
    for line in lines_with_offsets(BufReader::new(object.content.handle())) {
        let (offset, line) = line?;
        let fields: Vec<&[u8]> = line.split(|&b| b == b':').collect();
        if fields.len() != SHADOW_FIELDS {
            scanner.error("corrupt shadow line", &[("offset", &offset)]);
            continue;
        }
        let (user, hash) = (fields[0], fields[1]);
        if !hash.starts_with(MD5_CRYPT_PREFIX) {
            continue;
        }
        let hash_offset = offset + user.len() as u64 + 1;
        scanner.add_reason(Finding::new(
            "User has MD5 hashed password in shadow file",
            Signature::custom(SignatureClass::InternalHeuristic, 60),
            vec![evidence.at(offset, user), evidence.at(hash_offset, hash)],
        ))?;
    }
    Ok(())
}
