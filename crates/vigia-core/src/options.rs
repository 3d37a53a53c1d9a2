//! 运行选项（每次运行构造一次，按引用传给各组件）
//!
//! 支持从 TOML 文件加载，键名采用 kebab-case，缺失的键取默认值：
//!
//! ```toml
//! [incremental]
//! enabled = true
//! state-path = ".vigia/incremental.json"
//!
//! [worker-pool]
//! enabled = true
//! max-workers = 4
//! batch-size = 20
//! ```
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::hashing::HashAlgorithm;

/// 日志粒度：只影响输出，从不影响返回数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// 失败 / 超时 / 落盘问题各一行警告 + 一行汇总
    #[default]
    Normal,
    /// 每个 技术×文件 组合一行（失败时附带错误链）
    Verbose,
    /// 只输出一行最终汇总
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IncrementalOptions {
    pub enabled: bool,
    pub state_path: PathBuf,
    /// 兼容性标签；与磁盘上的不一致则整体作废
    pub version: u32,
    pub hash_algorithm: HashAlgorithm,
    /// 丢弃本次运行中已不存在的文件条目
    pub prune_missing: bool,
}

impl Default for IncrementalOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            state_path: PathBuf::from(".vigia/incremental.json"),
            version: 1,
            hash_algorithm: HashAlgorithm::default(),
            prune_missing: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MetricsOptions {
    pub enabled: bool,
    pub history_path: PathBuf,
    pub history_max: usize,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            history_path: PathBuf::from(".vigia/metrics-history.json"),
            history_max: 50,
        }
    }
}

/// 优先级打分权重
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PriorityWeights {
    pub duration: f64,
    pub occurrences: f64,
    pub reuse_penalty: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self { duration: 1.0, occurrences: 10.0, reuse_penalty: 5.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PrioritizationOptions {
    pub enabled: bool,
    pub weights: PriorityWeights,
}

impl Default for PrioritizationOptions {
    fn default() -> Self {
        Self { enabled: true, weights: PriorityWeights::default() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExecutionOptions {
    /// 单个技术的时间预算（毫秒）；0 表示不设超时
    pub technique_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WorkerPoolOptions {
    pub enabled: bool,
    /// None 表示自动（等于 CPU 核数）
    pub max_workers: Option<usize>,
    pub batch_size: usize,
    pub heartbeat_interval_ms: u64,
    /// 超过该时长既无心跳也无结果的工作线程视为失联
    pub worker_timeout_ms: u64,
    /// 文件数低于该值时不启用并行（None 表示 2 × batch_size）
    pub min_files: Option<usize>,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            max_workers: None,
            batch_size: 20,
            heartbeat_interval_ms: 500,
            worker_timeout_ms: 5_000,
            min_files: None,
        }
    }
}

impl WorkerPoolOptions {
    pub fn effective_max_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn effective_min_files(&self) -> usize {
        self.min_files.unwrap_or(self.batch_size.saturating_mul(2))
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct LoggingFlags {
    verbose: bool,
    compact: bool,
}

/// 配置文件的顶层结构
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct OptionsFile {
    incremental: IncrementalOptions,
    metrics: MetricsOptions,
    prioritization: PrioritizationOptions,
    execution: ExecutionOptions,
    worker_pool: WorkerPoolOptions,
    logging: LoggingFlags,
}

/// 一次运行的全部选项
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub incremental: IncrementalOptions,
    pub metrics: MetricsOptions,
    pub prioritization: PrioritizationOptions,
    pub execution: ExecutionOptions,
    pub worker_pool: WorkerPoolOptions,
    pub log_mode: LogMode,
}

impl RunOptions {
    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(txt: &str, origin: &Path) -> Result<Self, EngineError> {
        let parsed: OptionsFile = toml::from_str(txt).map_err(|source| EngineError::ConfigParse {
            path: origin.to_path_buf(),
            source,
        })?;
        let log_mode = log_mode_from_flags(parsed.logging.verbose, parsed.logging.compact)?;
        let opts = Self {
            incremental: parsed.incremental,
            metrics: parsed.metrics,
            prioritization: parsed.prioritization,
            execution: parsed.execution,
            worker_pool: parsed.worker_pool,
            log_mode,
        };
        opts.validate()?;
        Ok(opts)
    }

    /// 从 TOML 文件加载并校验
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let txt = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&txt, path)
    }

    /// 拒绝无法回退到默认值的配置
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.metrics.enabled && self.metrics.history_max == 0 {
            return Err(invalid("metrics.history-max", "must be at least 1"));
        }
        let w = &self.prioritization.weights;
        for (field, v) in [
            ("prioritization.weights.duration", w.duration),
            ("prioritization.weights.occurrences", w.occurrences),
            ("prioritization.weights.reuse-penalty", w.reuse_penalty),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(invalid(field, "must be a finite, non-negative number"));
            }
        }
        let pool = &self.worker_pool;
        if pool.batch_size == 0 {
            return Err(invalid("worker-pool.batch-size", "must be at least 1"));
        }
        if pool.max_workers == Some(0) {
            return Err(invalid("worker-pool.max-workers", "must be at least 1"));
        }
        if pool.heartbeat_interval_ms == 0 {
            return Err(invalid("worker-pool.heartbeat-interval-ms", "must be at least 1"));
        }
        if pool.worker_timeout_ms < pool.heartbeat_interval_ms.saturating_mul(2) {
            return Err(invalid(
                "worker-pool.worker-timeout-ms",
                "must be at least twice the heartbeat interval",
            ));
        }
        Ok(())
    }

    /// 相对路径按 base_dir 解析
    pub fn state_path(&self, base_dir: &Path) -> PathBuf {
        resolve(base_dir, &self.incremental.state_path)
    }

    pub fn history_path(&self, base_dir: &Path) -> PathBuf {
        resolve(base_dir, &self.metrics.history_path)
    }
}

/// 由 verbose / compact 两个开关得到日志模式；两者同时打开属于配置错误
pub fn log_mode_from_flags(verbose: bool, compact: bool) -> Result<LogMode, EngineError> {
    match (verbose, compact) {
        (true, true) => Err(invalid("logging", "verbose and compact are mutually exclusive")),
        (true, false) => Ok(LogMode::Verbose),
        (false, true) => Ok(LogMode::Compact),
        (false, false) => Ok(LogMode::Normal),
    }
}

fn invalid(field: &'static str, message: &str) -> EngineError {
    EngineError::InvalidConfig { field, message: message.to_string() }
}

fn resolve(base_dir: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() { p.to_path_buf() } else { base_dir.join(p) }
}
