use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scanhook_core::plugins::builtin_plugins;
use scanhook_core::{scan_and_write, Configuration, EvidenceMode, Pipeline, RuleType, ScanOptions};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, warn};

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "scanhook", version, about = "规则触发式对象扫描")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 扫描文件或目录并生成 JSON 报告
    Scan {
        /// 输入文件或目录
        #[arg(long)]
        input: PathBuf,

        /// 输出文件（JSON 数组）
        #[arg(long, default_value = "./result.json")]
        output: PathBuf,

        /// 线程数（"auto"=CPU 核心数）
        #[arg(long, default_value = "auto")]
        threads: String,

        /// 只输出总分不低于该值的对象
        #[arg(long, default_value_t = 0)]
        min_score: i64,

        /// 单个文件（含解包成员）的最大大小，单位字节
        #[arg(long)]
        max_file_size: Option<u64>,

        /// 目录遍历最大深度
        #[arg(long)]
        max_walk_depth: Option<usize>,

        /// 额外规则文件，可重复；格式 `[类型:]路径`，类型缺省为 default
        #[arg(long)]
        rules: Vec<String>,

        /// 配置文件路径（TOML）
        #[arg(long)]
        config: Option<PathBuf>,

        /// 样本导出目录；给出时启用 sample_export 插件
        #[arg(long)]
        export_dir: Option<PathBuf>,

        /// 证据模式：offsets 或 plain
        #[arg(long, value_parser = ["offsets", "plain"])]
        evidence: Option<String>,
    },
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            input,
            output,
            threads,
            min_score,
            max_file_size,
            max_walk_depth,
            rules,
            config,
            export_dir,
            evidence,
        } => {
            info!(?input, ?output, "starting scan");

            // 配置文件在前，命令行参数覆盖
            let mut configuration = match &config {
                Some(path) => Configuration::from_toml_file(path)
                    .with_context(|| format!("load config {}", path.display()))?,
                None => Configuration::default(),
            };
            if let Some(max) = max_file_size {
                configuration.max_file_size = max;
            }
            if let Some(mode) = evidence {
                configuration.evidence = mode.parse::<EvidenceMode>()?;
            }

            let mut builder = Pipeline::builder(configuration).plugins(builtin_plugins(export_dir));
            for arg in &rules {
                let (rule_type, path) = parse_rule_arg(arg);
                let source = std::fs::read_to_string(&path).with_context(|| format!("read rules {}", path.display()))?;
                builder = builder.rules(rule_type, source);
            }
            let pipeline = builder.build().context("initialize pipeline")?;
            for failure in pipeline.registry().compile_errors() {
                warn!(plugin = %failure.plugin, rule_type = %failure.rule_type, error = %failure.message, "rule skipped");
            }

            // 以缓冲方式打开输出文件，按 JSON 数组流式写入
            let mut out = BufWriter::new(File::create(&output).context("create output file")?);
            let opts = ScanOptions { min_score, threads: parse_threads(&threads), max_walk_depth };
            let stats = scan_and_write(&input, &mut out, &pipeline, &opts).context("scan and write failed")?;
            out.flush().ok();

            info!(
                objects_scanned = stats.objects_scanned,
                objects_extracted = stats.objects_extracted,
                findings = stats.findings_total,
                diagnostics = stats.diagnostics,
                hook_faults = stats.hook_faults,
                outputs_written = stats.outputs_written,
                "scan finished"
            );
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 支持通过环境变量 RUST_LOG 控制日志等级，如：RUST_LOG=debug
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") {
        return None;
    }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}

/// `meta:rules/meta.toml` → (Meta, 路径)；前缀不是规则类型时整体视为路径
fn parse_rule_arg(arg: &str) -> (RuleType, PathBuf) {
    if let Some((prefix, path)) = arg.split_once(':') {
        if let Ok(rule_type) = prefix.parse::<RuleType>() {
            return (rule_type, PathBuf::from(path));
        }
    }
    (RuleType::Default, PathBuf::from(arg))
}
