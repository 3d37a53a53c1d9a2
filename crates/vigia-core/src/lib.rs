//! 分析执行引擎
//!
//! 设计要点：
//! - 对一批文件与一组技术，决定运行什么、以什么顺序、多大并行度、哪些可以复用
//! - 增量复用以内容哈希为键；历史代价高的文件优先运行
//! - 每个技术调用有独立时间预算，失败与超时被隔离成 Occurrence，不影响其余文件
//! - 可选工作池按批并行执行，并通过心跳检测失联的工作线程
//! - 状态文件与指标历史只由协调线程写入

mod error;
mod executor;
mod hashing;
mod incremental;
mod invoke;
mod metrics;
mod options;
mod persist;
mod pool;
mod prioritize;
mod runlog;
mod technique;
mod types;

pub use error::{EngineError, PersistError};
pub use executor::{run, AnalysisOutput, Executor, FileOutcome, RunStats};
pub use hashing::{hash_bytes, HashAlgorithm};
pub use incremental::{CachedResult, FileState, IncrementalState, IncrementalStore, StoreStats, StoredOccurrence, TechniqueStat};
pub use metrics::{MetricsHistory, RunMetrics, TechniqueMetric};
pub use options::{
    log_mode_from_flags, ExecutionOptions, IncrementalOptions, LogMode, MetricsOptions, PrioritizationOptions,
    PriorityWeights, RunOptions, WorkerPoolOptions,
};
pub use pool::{create_batches, PoolOutput, PoolStats, WorkerBatchResult, WorkerError, WorkerPool};
pub use prioritize::{order as prioritize, score as priority_score, REUSE_PENALTY_CAP};
pub use technique::{Outcome, Technique, TechniqueContext, TechniqueInput, TechniqueRef, TechniqueScope};
pub use types::{FileEntry, Occurrence, Severity, SyntaxTree, KIND_TECHNIQUE_ERROR, KIND_TIMEOUT};
