mod techniques;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vigia_core::{log_mode_from_flags, Executor, FileEntry, IncrementalStore, LogMode, MetricsHistory, RunOptions};
use walkdir::WalkDir;

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "vigia", version, about = "增量静态分析执行器")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 分析目录并输出发现（JSON 数组）
    Run {
        /// 项目根目录；状态文件与指标历史也写在其下
        #[arg(long)]
        input: PathBuf,

        /// 配置文件（TOML），缺省使用默认配置
        #[arg(long)]
        config: Option<PathBuf>,

        /// 输出文件
        #[arg(long, default_value = "./result.json")]
        output: PathBuf,

        /// 每个 技术×文件 组合输出一行
        #[arg(long, conflicts_with = "compact")]
        verbose: bool,

        /// 只输出最终汇总
        #[arg(long)]
        compact: bool,

        /// 启用工作池并指定线程数（"auto"=CPU 核心数）
        #[arg(long)]
        workers: Option<String>,

        /// 单个技术的时间预算（毫秒），0 表示不限
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// 忽略并且不更新增量状态
        #[arg(long)]
        no_incremental: bool,
    },
    /// 查看指标历史与增量状态
    History {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// 命令行上的覆盖项
#[derive(Debug, Default)]
struct Overrides {
    verbose: bool,
    compact: bool,
    workers: Option<String>,
    timeout_ms: Option<u64>,
    no_incremental: bool,
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { input, config, output, verbose, compact, workers, timeout_ms, no_incremental } => {
            let mut opts = load_options(config.as_deref())?;
            apply_overrides(&mut opts, Overrides { verbose, compact, workers, timeout_ms, no_incremental })?;
            let chatty = announces_progress(&opts);
            if chatty {
                info!(?input, ?output, "starting analysis");
            }

            let files = collect_files(&input);
            let techniques = techniques::builtin()?;
            let executor = Executor::new(opts).context("invalid options")?;
            let result = executor.run(&files, &techniques, &input);

            // 以缓冲方式写出 JSON 数组
            let mut out = BufWriter::new(File::create(&output).context("create output file")?);
            serde_json::to_writer_pretty(&mut out, &result.occurrences).context("write occurrences")?;
            out.flush().context("flush output")?;

            if chatty {
                info!(
                    files = result.stats.files_total,
                    occurrences = result.occurrences.len(),
                    worker_errors = executor.pool_stats().error_count,
                    "results written"
                );
            }
        }
        Commands::History { input, config } => {
            let opts = load_options(config.as_deref())?;
            let history = MetricsHistory::load(&opts.history_path(&input));
            let store = IncrementalStore::load(
                &opts.state_path(&input),
                opts.incremental.version,
                opts.incremental.hash_algorithm,
            );
            let report = serde_json::json!({
                "runs": history.len(),
                "averageAnalysisTimeMs": history.average_analysis_time_ms(),
                "latest": history.latest(),
                "cachedFiles": store.len(),
                "store": store.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
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

fn load_options(config: Option<&Path>) -> Result<RunOptions> {
    match config {
        Some(p) => RunOptions::load(p).with_context(|| format!("load config {}", p.display())),
        None => Ok(RunOptions::default()),
    }
}

fn apply_overrides(opts: &mut RunOptions, o: Overrides) -> Result<()> {
    if o.verbose || o.compact {
        opts.log_mode = log_mode_from_flags(o.verbose, o.compact)?;
    }
    if let Some(w) = o.workers.as_deref() {
        opts.worker_pool.enabled = true;
        opts.worker_pool.max_workers = parse_workers(w);
    }
    if let Some(ms) = o.timeout_ms {
        opts.execution.technique_timeout_ms = ms;
    }
    if o.no_incremental {
        opts.incremental.enabled = false;
    }
    Ok(())
}

/// compact 模式下只保留引擎的最终汇总
fn announces_progress(opts: &RunOptions) -> bool {
    opts.log_mode != LogMode::Compact
}

/// 解析线程参数："auto" 或非法值表示自动
fn parse_workers(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") {
        return None;
    }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}

/// 递归收集文件，跳过隐藏目录与常见的构建产物目录
fn collect_files(root: &Path) -> Vec<FileEntry> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).min_depth(1).into_iter().filter_entry(|e| {
        // 根目录本身可能是隐藏目录（如临时目录），不参与过滤
        let name = e.file_name().to_string_lossy();
        e.depth() == 0 || !(name.starts_with('.') || name == "target" || name == "node_modules")
    });
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skip unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(r) => r.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        // 非 UTF-8 内容留空，由技术自行决定如何处理
        let content = std::fs::read_to_string(entry.path()).ok();
        files.push(FileEntry::new(rel, entry.into_path(), content));
    }
    // 按相对路径排序，确保输出顺序稳定
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    files
}
