//! 工作池：按批并行执行按文件技术
//!
//! - 文件列表切成固定大小的批次，每批作为一条 `BatchJob` 投递到 Rayon 线程池
//! - 工作线程独占自己的批次，只通过 crossbeam 通道回送消息
//!   （`Started` / `Heartbeat` / `Result` / `Error`），不共享可变状态
//! - 工作线程在技术运行期间也持续发心跳（见 invoke 的 watched 模式），所以慢不等于失联
//! - 协调线程记录每批最后一次收到消息的时间；超过 worker_timeout 仍无心跳也无结果的批次
//!   判定失联，其文件计为错误（不自动重试）。失联线程视为占用槽位；所有槽位都失联后，
//!   仍在排队的批次同样判定失败。失联批次的迟到结果 / 错误直接丢弃并释放槽位。
//! - 禁用、文件太少或线程池创建失败时，在当前线程串行执行同一套逻辑
use crossbeam_channel::{RecvTimeoutError, Sender};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::executor::{analyze_file, run_globals, FileOutcome, JobEnv};
use crate::invoke::{elapsed_ms, panic_message};
use crate::metrics::{MetricsAccumulator, TechniqueMetric};
use crate::options::WorkerPoolOptions;
use crate::runlog::RunLog;
use crate::technique::{TechniqueContext, TechniqueRef};
use crate::types::{FileEntry, Occurrence};

/// 投递给工作线程的一批文件
struct BatchJob {
    batch_id: usize,
    files: Vec<FileEntry>,
}

/// 单批执行结果
#[derive(Debug, Clone)]
pub struct WorkerBatchResult {
    pub worker_id: usize,
    pub outcomes: Vec<FileOutcome>,
    pub metrics: Vec<TechniqueMetric>,
    pub processed_file_count: usize,
    /// 批内技术失败 / 超时的描述
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl WorkerBatchResult {
    pub fn occurrences(&self) -> impl Iterator<Item = &Occurrence> + '_ {
        self.outcomes.iter().flat_map(|o| o.occurrences.iter())
    }
}

/// 工作线程 → 协调线程
enum WorkerMessage {
    Started { batch_id: usize },
    Heartbeat { batch_id: usize },
    Result(WorkerBatchResult),
    Error { batch_id: usize, message: String },
}

/// 一个失败批次
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerError {
    pub batch_id: usize,
    pub files: Vec<String>,
    pub reason: String,
}

/// 工作池的聚合结果
#[derive(Debug, Clone, Default)]
pub struct PoolOutput {
    /// 全局技术的发现（仅 `process_files` 填写）
    pub globals: Vec<Occurrence>,
    pub outcomes: Vec<FileOutcome>,
    pub total_processed: usize,
    pub metrics: Vec<TechniqueMetric>,
    pub errors: Vec<WorkerError>,
    /// errors 中涉及的文件总数
    pub failed_files: usize,
}

impl PoolOutput {
    pub fn occurrences(&self) -> impl Iterator<Item = &Occurrence> + '_ {
        self.globals.iter().chain(self.outcomes.iter().flat_map(|o| o.occurrences.iter()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub enabled: bool,
    pub max_workers: usize,
    pub batch_size: usize,
    /// 累计因失联 / 崩溃未处理的文件数
    pub error_count: usize,
}

/// 切分批次；最后一批可能较短
pub fn create_batches(files: Vec<FileEntry>, batch_size: usize) -> Vec<Vec<FileEntry>> {
    let size = batch_size.max(1);
    let mut batches = Vec::with_capacity(files.len().div_ceil(size));
    let mut it = files.into_iter().peekable();
    while it.peek().is_some() {
        batches.push(it.by_ref().take(size).collect());
    }
    batches
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BatchState {
    Queued,
    Running { last_seen: Instant },
    Done,
    Failed,
}

struct Tracked {
    state: BatchState,
    files: Vec<String>,
}

pub struct WorkerPool {
    opts: WorkerPoolOptions,
    error_count: AtomicUsize,
}

impl WorkerPool {
    pub fn new(opts: WorkerPoolOptions) -> Self {
        Self { opts, error_count: AtomicUsize::new(0) }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            enabled: self.opts.enabled,
            max_workers: self.opts.effective_max_workers(),
            batch_size: self.opts.batch_size,
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    /// 独立使用工作池（不经过执行器）；`technique_timeout_ms` 为 0 表示不设超时。
    /// 全局技术在调用线程上各运行一次，按文件技术交给工作线程；不读写增量存储。
    pub fn process_files(
        &self,
        files: Vec<FileEntry>,
        techniques: &[TechniqueRef],
        context: Arc<TechniqueContext>,
        technique_timeout_ms: u64,
        log_mode: crate::options::LogMode,
    ) -> PoolOutput {
        let env = JobEnv {
            context,
            policy: crate::invoke::InvokePolicy::from_ms(
                technique_timeout_ms,
                Duration::from_millis(self.opts.heartbeat_interval_ms),
            ),
            log: Arc::new(RunLog::new(log_mode)),
        };
        let mut acc = MetricsAccumulator::default();
        let globals = run_globals(techniques, &env, &mut acc);
        let mut out = self.process_with(files, techniques, &env);
        acc.merge(&out.metrics);
        out.metrics = acc.into_vec();
        out.globals = globals.occurrences;
        out
    }

    /// 只处理按文件技术；全局技术由调用方负责
    pub(crate) fn process_with(&self, files: Vec<FileEntry>, techniques: &[TechniqueRef], env: &JobEnv) -> PoolOutput {
        if files.is_empty() {
            return PoolOutput::default();
        }
        let workers = self.opts.effective_max_workers();
        if !self.opts.enabled || workers <= 1 || files.len() < self.opts.effective_min_files() {
            return run_sequential(files, techniques, env);
        }
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("vigia-worker-{i}"))
            .build()
        {
            Ok(p) => p,
            Err(e) => {
                env.log.notice("worker pool unavailable, running sequentially", &e.to_string());
                return run_sequential(files, techniques, env);
            }
        };
        let out = self.run_parallel(&pool, workers, files, techniques, env);
        self.error_count.fetch_add(out.failed_files, Ordering::Relaxed);
        // 卡死的工作线程不会阻塞 drop，线程池在其结束后自行回收
        drop(pool);
        out
    }

    fn run_parallel(
        &self,
        pool: &rayon::ThreadPool,
        workers: usize,
        files: Vec<FileEntry>,
        techniques: &[TechniqueRef],
        env: &JobEnv,
    ) -> PoolOutput {
        let batches = create_batches(files, self.opts.batch_size);
        let shared: Arc<[TechniqueRef]> = Arc::from(techniques.to_vec());
        let heartbeat = Duration::from_millis(self.opts.heartbeat_interval_ms);
        let worker_timeout = Duration::from_millis(self.opts.worker_timeout_ms);
        let (tx, rx) = crossbeam_channel::unbounded::<WorkerMessage>();

        let mut tracked: Vec<Tracked> = Vec::with_capacity(batches.len());
        for (batch_id, files) in batches.into_iter().enumerate() {
            tracked.push(Tracked { state: BatchState::Queued, files: files.iter().map(|f| f.rel_path.clone()).collect() });
            let job = BatchJob { batch_id, files };
            let tx = tx.clone();
            let techniques = Arc::clone(&shared);
            let env = env.clone();
            pool.spawn(move || worker_main(job, &techniques, &env, heartbeat, &tx));
        }
        // 所有发送端都在工作线程手里：全部退出后通道断开
        drop(tx);

        let mut monitor = Monitor::new(tracked, workers, &env.log);
        while monitor.pending() {
            match rx.recv_timeout(heartbeat) {
                Ok(msg) => monitor.on_message(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    monitor.fail_remaining("worker exited without reporting");
                    break;
                }
            }
            monitor.check_liveness(Instant::now(), worker_timeout);
        }
        monitor.finish()
    }
}

/// 协调线程上的批次状态机；只由协调线程访问
struct Monitor<'a> {
    tracked: Vec<Tracked>,
    workers: usize,
    /// 被失联批次占住的线程数
    lost_slots: usize,
    out: PoolOutput,
    acc: MetricsAccumulator,
    log: &'a RunLog,
}

impl<'a> Monitor<'a> {
    fn new(tracked: Vec<Tracked>, workers: usize, log: &'a RunLog) -> Self {
        Self { tracked, workers, lost_slots: 0, out: PoolOutput::default(), acc: MetricsAccumulator::default(), log }
    }

    fn pending(&self) -> bool {
        self.tracked.iter().any(|t| matches!(t.state, BatchState::Queued | BatchState::Running { .. }))
    }

    fn on_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Started { batch_id } | WorkerMessage::Heartbeat { batch_id } => {
                if let Some(t) = self.tracked.get_mut(batch_id) {
                    if matches!(t.state, BatchState::Queued | BatchState::Running { .. }) {
                        t.state = BatchState::Running { last_seen: Instant::now() };
                    }
                }
            }
            WorkerMessage::Result(result) => {
                let batch_id = result.worker_id;
                let Some(state) = self.tracked.get(batch_id).map(|t| t.state) else { return };
                match state {
                    BatchState::Failed => {
                        // 迟到结果：丢弃，但该线程已空闲
                        self.lost_slots = self.lost_slots.saturating_sub(1);
                        self.log.notice("discarded late result from failed worker", &format!("batch {batch_id}"));
                    }
                    BatchState::Done => {}
                    _ => {
                        self.tracked[batch_id].state = BatchState::Done;
                        self.out.total_processed += result.processed_file_count;
                        self.acc.merge(&result.metrics);
                        self.out.outcomes.extend(result.outcomes);
                    }
                }
            }
            WorkerMessage::Error { batch_id, message } => {
                let Some(state) = self.tracked.get(batch_id).map(|t| t.state) else { return };
                match state {
                    // 失联批次最终崩溃：线程同样已空闲
                    BatchState::Failed => self.lost_slots = self.lost_slots.saturating_sub(1),
                    BatchState::Done => {}
                    _ => self.fail(batch_id, format!("worker crashed: {message}")),
                }
            }
        }
    }

    /// 判定超时的运行中批次；所有线程都失联后，排队中的批次一并失败
    fn check_liveness(&mut self, now: Instant, worker_timeout: Duration) {
        for id in 0..self.tracked.len() {
            if let BatchState::Running { last_seen } = self.tracked[id].state {
                if now.duration_since(last_seen) > worker_timeout {
                    self.lost_slots += 1;
                    self.fail(id, format!("no heartbeat for {}ms", worker_timeout.as_millis()));
                }
            }
        }
        if self.lost_slots >= self.workers {
            for id in 0..self.tracked.len() {
                if self.tracked[id].state == BatchState::Queued {
                    self.fail(id, "no live workers left".to_string());
                }
            }
        }
    }

    fn fail_remaining(&mut self, reason: &str) {
        for id in 0..self.tracked.len() {
            if matches!(self.tracked[id].state, BatchState::Queued | BatchState::Running { .. }) {
                self.fail(id, reason.to_string());
            }
        }
    }

    fn fail(&mut self, batch_id: usize, reason: String) {
        let t = &mut self.tracked[batch_id];
        t.state = BatchState::Failed;
        self.log.notice("worker batch failed", &format!("batch {batch_id} ({} files): {reason}", t.files.len()));
        self.out.failed_files += t.files.len();
        self.out.errors.push(WorkerError { batch_id, files: t.files.clone(), reason });
    }

    fn finish(mut self) -> PoolOutput {
        self.out.metrics = self.acc.into_vec();
        self.out
    }
}

/// 串行路径：与工作线程完全相同的逐文件逻辑
fn run_sequential(files: Vec<FileEntry>, techniques: &[TechniqueRef], env: &JobEnv) -> PoolOutput {
    let mut acc = MetricsAccumulator::default();
    let mut outcomes = Vec::with_capacity(files.len());
    for file in &files {
        let outcome = analyze_file(file, techniques, env, &mut || {});
        record_metrics(&mut acc, &outcome);
        outcomes.push(outcome);
    }
    PoolOutput { total_processed: outcomes.len(), outcomes, metrics: acc.into_vec(), ..Default::default() }
}

fn record_metrics(acc: &mut MetricsAccumulator, outcome: &FileOutcome) {
    for (name, stat) in &outcome.per_technique {
        acc.add(name, false, stat.duration_ms, stat.occurrence_count);
    }
}

fn worker_main(job: BatchJob, techniques: &[TechniqueRef], env: &JobEnv, heartbeat: Duration, tx: &Sender<WorkerMessage>) {
    let batch_id = job.batch_id;
    let _ = tx.send(WorkerMessage::Started { batch_id });
    let msg = match catch_unwind(AssertUnwindSafe(|| run_batch(job, techniques, env, heartbeat, tx))) {
        Ok(result) => WorkerMessage::Result(result),
        Err(payload) => WorkerMessage::Error { batch_id, message: panic_message(payload.as_ref()) },
    };
    // 协调线程已放弃等待时发送失败，结果丢弃
    let _ = tx.send(msg);
}

fn run_batch(job: BatchJob, techniques: &[TechniqueRef], env: &JobEnv, heartbeat: Duration, tx: &Sender<WorkerMessage>) -> WorkerBatchResult {
    let start = Instant::now();
    let batch_id = job.batch_id;
    // 无预算的技术也放到独立线程上等待，保证长时间运行期间心跳不断
    let env = JobEnv { policy: env.policy.watched(), ..env.clone() };
    let mut last_beat = Instant::now();
    let mut beat = || {
        if last_beat.elapsed() >= heartbeat {
            let _ = tx.send(WorkerMessage::Heartbeat { batch_id });
            last_beat = Instant::now();
        }
    };

    let mut acc = MetricsAccumulator::default();
    let mut outcomes = Vec::with_capacity(job.files.len());
    let mut errors = Vec::new();
    for file in &job.files {
        let outcome = analyze_file(file, techniques, &env, &mut beat);
        if !outcome.is_clean() {
            errors.push(format!(
                "{}: {} failed, {} timed out",
                outcome.rel_path, outcome.failures, outcome.timeouts
            ));
        }
        record_metrics(&mut acc, &outcome);
        outcomes.push(outcome);
        beat();
    }
    tracing::debug!(batch_id, thread = ?rayon::current_thread_index(), files = outcomes.len(), "batch finished");

    WorkerBatchResult {
        worker_id: batch_id,
        processed_file_count: outcomes.len(),
        outcomes,
        metrics: acc.into_vec(),
        errors,
        duration_ms: elapsed_ms(start),
    }
}
