mod common;

use common::{diagnostics, keyword_rule, zip_bytes, FnPlugin};

use scanhook_core::plugins::ZipPlugin;
use scanhook_core::{Configuration, DiagnosticKind, Object, Pipeline, RuleType, ScanTarget};

/// 只对 ZIP 中名为 payload.exe 的成员生效
const PAYLOAD_RULE: &str = r#"
[[rules]]
id = "Bad"
tags = ["BAD"]
score = 80
keywords = ["MALICIOUS"]

[rules.meta]
filename = "payload.exe"
unpack_source = "ZIP"
"#;

#[test]
fn nested_zip_is_unpacked_exactly_two_levels() {
    let inner = zip_bytes(&[("payload.exe", b"this is MALICIOUS content")]);
    let outer = zip_bytes(&[("nested.zip", &inner), ("readme.txt", b"clean")]);
    let pipeline = Pipeline::builder(Configuration::default())
        .plugin(ZipPlugin)
        .rules(RuleType::Meta, PAYLOAD_RULE)
        .build()
        .unwrap();

    let outcome = pipeline.scan(ScanTarget::file_bytes("/tmp/outer.zip", outer));
    let names: Vec<String> = outcome.reports.iter().map(|r| r.object.display_name()).collect();
    assert_eq!(
        names,
        [
            "/tmp/outer.zip/nested.zip/payload.exe",
            "/tmp/outer.zip/nested.zip",
            "/tmp/outer.zip/readme.txt",
            "/tmp/outer.zip",
        ]
    );
    assert_eq!(outcome.stats.objects_extracted, 3);

    let payload = &outcome.reports[0];
    assert_eq!(payload.lineage.unpack_methods(), ["ZIP", "ZIP"]);
    assert_eq!(payload.score, 80);
    assert_eq!(payload.findings[0].match_strings[0].offset, Some(8));
    let Object::File { unpack: Some(unpack), .. } = &payload.object else { panic!("expected extracted file") };
    assert_eq!(unpack.depth, 2);
    assert_eq!(unpack.method, "ZIP");
    assert_eq!(unpack.parent, "/tmp/outer.zip/nested.zip");

    // 父对象不继承子对象的分数
    assert_eq!(outcome.root().unwrap().score, 0);
}

#[test]
fn oversized_zip_member_is_refused_before_extraction() {
    let big = vec![b'A'; 4096];
    let archive = zip_bytes(&[("big.bin", &big), ("small.txt", b"ok")]);
    let config = Configuration { max_file_size: 1024, ..Configuration::default() };
    let pipeline = Pipeline::builder(config).plugin(ZipPlugin).build().unwrap();

    let outcome = pipeline.scan(ScanTarget::file_bytes("/tmp/bomb.zip", archive));
    let names: Vec<String> = outcome.reports.iter().map(|r| r.object.display_name()).collect();
    assert_eq!(names, ["/tmp/bomb.zip/small.txt", "/tmp/bomb.zip"]);

    let root = outcome.root().unwrap();
    assert_eq!(diagnostics(root), [DiagnosticKind::SizeLimitExceeded]);
    assert_eq!(root.findings[0].tag.as_deref(), Some("ZIPFILE"));
    assert_eq!(root.score, 0);
}

fn resubmit_plugin(grow: bool) -> impl scanhook_core::Plugin {
    FnPlugin::new("resubmit", move |_, _, actions| {
        actions.add_rule(RuleType::Default, &keyword_rule("Loop", "LOOP", "LOOPME", 0)).unwrap();
        actions.add_hook("LOOP", move |scanner, object| {
            let mut data = object.content.read_range(0, object.content.size() as usize)?;
            if grow {
                data.push(b'x');
            }
            let _ = scanner.scan_file("again", data, "COPY");
            Ok(())
        });
    })
}

#[test]
fn self_resubmission_is_a_cycle() {
    let pipeline = Pipeline::builder(Configuration::default()).plugin(resubmit_plugin(false)).build().unwrap();
    let outcome = pipeline.scan(ScanTarget::file_bytes("/tmp/loop.bin", b"LOOPME".to_vec()));
    assert_eq!(outcome.reports.len(), 1);
    assert_eq!(diagnostics(outcome.root().unwrap()), [DiagnosticKind::CyclicExtractionDetected]);
}

#[test]
fn growing_resubmission_stops_at_depth_limit() {
    let config = Configuration { max_depth: 3, ..Configuration::default() };
    let pipeline = Pipeline::builder(config).plugin(resubmit_plugin(true)).build().unwrap();
    let outcome = pipeline.scan(ScanTarget::file_bytes("/tmp/grow.bin", b"LOOPME".to_vec()));

    // 深度 0..=3 各一个对象
    assert_eq!(outcome.reports.len(), 4);
    let deepest = &outcome.reports[0];
    assert_eq!(deepest.lineage.depth(), 3);
    assert_eq!(diagnostics(deepest), [DiagnosticKind::RecursionLimitExceeded]);
    assert!(outcome.reports[1..].iter().all(|r| r.findings.is_empty()));
}

#[test]
fn cumulative_size_limit_stops_unpacking() {
    let config = Configuration { max_total_extracted: 10, ..Configuration::default() };
    let pipeline = Pipeline::builder(config).plugin(resubmit_plugin(true)).build().unwrap();
    // 根 6 字节不计入；子对象 7 字节，孙对象 8 字节 → 累计 15 > 10
    let outcome = pipeline.scan(ScanTarget::file_bytes("/tmp/grow.bin", b"LOOPME".to_vec()));
    assert_eq!(outcome.reports.len(), 2);
    assert_eq!(diagnostics(&outcome.reports[0]), [DiagnosticKind::SizeLimitExceeded]);
}

#[test]
fn hard_depth_cap_applies_to_large_configured_depth() {
    let config = Configuration { max_depth: 1000, ..Configuration::default() };
    let pipeline = Pipeline::builder(config).plugin(resubmit_plugin(true)).build().unwrap();
    let outcome = pipeline.scan(ScanTarget::file_bytes("/tmp/grow.bin", b"LOOPME".to_vec()));
    assert_eq!(outcome.reports.len(), scanhook_core::HARD_MAX_DEPTH + 1);
}
