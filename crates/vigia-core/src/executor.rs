//! 执行主流程
//!
//! 一次运行：
//! 1. 加载增量状态，按历史代价排序文件
//! 2. 全局技术在协调线程上各运行一次
//! 3. 每个文件先查缓存；命中则直接复用，未命中的交给 WorkerPool（可能退化为串行）
//! 4. 协调线程是状态文件与历史文件的唯一写者：记录新结果、汇总指标、落盘
//!
//! 技术失败、超时、缓存损坏、工作线程失联、落盘失败都不会从 `run` 逃逸，
//! 只会变成 Occurrence、计数器或日志。
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::hashing::hash_file;
use crate::incremental::{IncrementalStore, StoredOccurrence, TechniqueStat};
use crate::invoke::{elapsed_ms, invoke, InvokePolicy, Invocation};
use crate::metrics::{MetricsAccumulator, MetricsHistory, RunMetrics};
use crate::options::RunOptions;
use crate::pool::{PoolStats, WorkerPool};
use crate::prioritize;
use crate::runlog::{RunLog, Summary};
use crate::technique::{applicable, is_global, TechniqueContext, TechniqueInput, TechniqueRef};
use crate::types::{FileEntry, Occurrence};

/// 单个文件的处理结果（串行路径与工作线程共用）
#[derive(Debug, Clone, Default)]
pub struct FileOutcome {
    pub rel_path: String,
    pub occurrences: Vec<Occurrence>,
    pub per_technique: BTreeMap<String, TechniqueStat>,
    pub failures: usize,
    pub timeouts: usize,
    /// 与 occurrences 一一对应：产出该条发现时实际调用的技术
    pub(crate) invoked_by: Vec<String>,
}

impl FileOutcome {
    /// 没有失败 / 超时的结果才会写入增量存储
    pub fn is_clean(&self) -> bool {
        self.failures == 0 && self.timeouts == 0
    }

    fn push(&mut self, technique: &str, occurrence: Occurrence) {
        self.invoked_by.push(technique.to_string());
        self.occurrences.push(occurrence);
    }

    /// 写入增量存储的形式
    pub(crate) fn stored(&self) -> Vec<StoredOccurrence> {
        self.invoked_by
            .iter()
            .zip(&self.occurrences)
            .map(|(by, o)| StoredOccurrence { invoked_by: by.clone(), occurrence: o.clone() })
            .collect()
    }
}

/// 本次运行的计数汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub files_total: usize,
    pub files_processed: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub technique_failures: usize,
    pub timeouts: usize,
    /// 因工作线程失联 / 崩溃而未处理的文件数
    pub worker_errors: usize,
    pub persist_errors: usize,
}

/// 引擎公共入口的返回值
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub occurrences: Vec<Occurrence>,
    /// 仅在启用指标时存在
    pub metrics: Option<RunMetrics>,
    pub stats: RunStats,
}

/// 技术调用所需的共享环境（协调线程与工作线程各持一份）
#[derive(Clone)]
pub(crate) struct JobEnv {
    pub(crate) context: Arc<TechniqueContext>,
    pub(crate) policy: InvokePolicy,
    pub(crate) log: Arc<RunLog>,
}

/// 对单个文件运行所有适用的按文件技术（不触碰增量存储）
pub(crate) fn analyze_file(file: &FileEntry, techniques: &[TechniqueRef], env: &JobEnv, tick: &mut dyn FnMut()) -> FileOutcome {
    let mut out = FileOutcome { rel_path: file.rel_path.clone(), ..Default::default() };
    for t in applicable(techniques, &file.rel_path) {
        let name = t.name();
        let input = TechniqueInput::for_file(file, &env.context);
        match invoke(t, input, env.policy, tick) {
            Invocation::Completed { occurrences, duration_ms } => {
                let occurrences = normalize(occurrences, name, &file.rel_path);
                env.log.technique_done(name, &file.rel_path, duration_ms, occurrences.len());
                out.per_technique
                    .insert(name.to_string(), TechniqueStat { occurrence_count: occurrences.len(), duration_ms });
                for o in occurrences {
                    out.push(name, o);
                }
            }
            Invocation::Failed { message, trace, duration_ms } => {
                env.log.technique_failed(name, &file.rel_path, &message, &trace);
                out.failures += 1;
                out.per_technique.insert(name.to_string(), TechniqueStat { occurrence_count: 1, duration_ms });
                out.push(name, Occurrence::technique_error(name, Some(&file.rel_path), &message));
            }
            Invocation::TimedOut { budget_ms } => {
                env.log.technique_timed_out(name, &file.rel_path, budget_ms);
                out.timeouts += 1;
                out.per_technique
                    .insert(name.to_string(), TechniqueStat { occurrence_count: 1, duration_ms: budget_ms });
                out.push(name, Occurrence::timeout(name, Some(&file.rel_path), budget_ms));
            }
        }
    }
    out
}

/// 技术未填写来源 / 路径时补齐
fn normalize(mut occurrences: Vec<Occurrence>, technique: &str, rel_path: &str) -> Vec<Occurrence> {
    for o in occurrences.iter_mut() {
        if o.origin_technique.is_empty() {
            o.origin_technique = technique.to_string();
        }
        if o.rel_path.is_none() && !rel_path.is_empty() {
            o.rel_path = Some(rel_path.to_string());
        }
    }
    occurrences
}

/// 全局技术的汇总结果
#[derive(Debug, Default)]
pub(crate) struct GlobalOutcome {
    pub(crate) occurrences: Vec<Occurrence>,
    pub(crate) failures: usize,
    pub(crate) timeouts: usize,
}

pub(crate) fn run_globals(techniques: &[TechniqueRef], env: &JobEnv, acc: &mut MetricsAccumulator) -> GlobalOutcome {
    let mut out = GlobalOutcome::default();
    for t in techniques.iter().filter(|t| is_global(t)) {
        let name = t.name();
        match invoke(t, TechniqueInput::for_global(&env.context), env.policy, &mut || {}) {
            Invocation::Completed { occurrences, duration_ms } => {
                let occurrences = normalize(occurrences, name, "");
                env.log.technique_done(name, "<global>", duration_ms, occurrences.len());
                acc.add(name, true, duration_ms, occurrences.len());
                out.occurrences.extend(occurrences);
            }
            Invocation::Failed { message, trace, duration_ms } => {
                env.log.technique_failed(name, "<global>", &message, &trace);
                acc.add(name, true, duration_ms, 1);
                out.failures += 1;
                out.occurrences.push(Occurrence::technique_error(name, None, &message));
            }
            Invocation::TimedOut { budget_ms } => {
                env.log.technique_timed_out(name, "<global>", budget_ms);
                acc.add(name, true, budget_ms, 1);
                out.timeouts += 1;
                out.occurrences.push(Occurrence::timeout(name, None, budget_ms));
            }
        }
    }
    out
}

/// 执行器：持有本次（及后续）运行的选项与工作池
pub struct Executor {
    options: RunOptions,
    pool: WorkerPool,
}

impl Executor {
    /// 校验选项；只有无法回退的配置会在这里失败
    pub fn new(options: RunOptions) -> Result<Self, EngineError> {
        options.validate()?;
        let pool = WorkerPool::new(options.worker_pool.clone());
        Ok(Self { options, pool })
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn run(&self, files: &[FileEntry], techniques: &[TechniqueRef], base_dir: &Path) -> AnalysisOutput {
        self.run_with_parse_time(files, techniques, base_dir, 0)
    }

    /// `parse_time_ms` 由调用方（解析器宿主）测得，原样写入指标
    pub fn run_with_parse_time(
        &self,
        files: &[FileEntry],
        techniques: &[TechniqueRef],
        base_dir: &Path,
        parse_time_ms: u64,
    ) -> AnalysisOutput {
        let opts = &self.options;
        let started = Instant::now();
        let timestamp = Utc::now();
        let log = Arc::new(RunLog::new(opts.log_mode));
        let mut stats = RunStats { files_total: files.len(), ..Default::default() };

        // 排序也需要历史，因此关闭增量但开启排序时仍只读加载状态
        let incremental = opts.incremental.enabled;
        let mut store = (incremental || opts.prioritization.enabled).then(|| {
            let (store, discarded) = IncrementalStore::open(
                &opts.state_path(base_dir),
                opts.incremental.version,
                opts.incremental.hash_algorithm,
            );
            if let Some(reason) = discarded {
                log.notice("incremental state discarded, starting a full run", &reason);
            }
            store
        });

        let ordered: Vec<FileEntry> = match (&store, opts.prioritization.enabled) {
            (Some(s), true) => prioritize::order(files, s.state(), &opts.prioritization.weights),
            _ => files.to_vec(),
        };

        let env = JobEnv {
            context: Arc::new(TechniqueContext { base_dir: base_dir.to_path_buf(), files: Arc::from(files.to_vec()) }),
            policy: InvokePolicy::from_ms(
                opts.execution.technique_timeout_ms,
                Duration::from_millis(opts.worker_pool.heartbeat_interval_ms),
            ),
            log: Arc::clone(&log),
        };

        let mut acc = MetricsAccumulator::for_techniques(techniques);
        let globals = run_globals(techniques, &env, &mut acc);
        stats.technique_failures += globals.failures;
        stats.timeouts += globals.timeouts;

        // 逐文件查缓存；未命中的收集起来统一执行
        let mut slots: Vec<Vec<Occurrence>> = vec![Vec::new(); ordered.len()];
        let mut pending: Vec<FileEntry> = Vec::new();
        let mut pending_meta: HashMap<String, (usize, Option<String>)> = HashMap::new();
        for (idx, file) in ordered.iter().enumerate() {
            let names: Vec<&str> = applicable(techniques, &file.rel_path).map(|t| t.name()).collect();
            if names.is_empty() {
                stats.files_processed += 1;
                continue;
            }
            let hash = if incremental { hash_file(opts.incremental.hash_algorithm, file) } else { None };
            if let (Some(store), Some(h)) = (store.as_mut().filter(|_| incremental), hash.as_deref()) {
                if let Some(cached) = store.lookup(&file.rel_path, h, &names) {
                    log.cache_hit(&file.rel_path);
                    for (name, stat) in &cached.per_technique {
                        acc.add(name, false, 0, stat.occurrence_count);
                    }
                    slots[idx] = cached.occurrences;
                    stats.cache_hits += 1;
                    stats.files_processed += 1;
                    continue;
                }
            }
            if incremental {
                stats.cache_misses += 1;
            }
            pending_meta.insert(file.rel_path.clone(), (idx, hash));
            pending.push(file.clone());
        }

        let pooled = self.pool.process_with(pending, techniques, &env);
        stats.files_processed += pooled.total_processed;
        stats.worker_errors += pooled.failed_files;
        acc.merge(&pooled.metrics);

        for outcome in pooled.outcomes {
            stats.technique_failures += outcome.failures;
            stats.timeouts += outcome.timeouts;
            let Some((idx, hash)) = pending_meta.remove(&outcome.rel_path) else { continue };
            if let (true, Some(store), Some(hash)) = (incremental && outcome.is_clean(), store.as_mut(), hash) {
                store.record(&outcome.rel_path, hash, outcome.stored(), outcome.per_technique.clone());
            }
            slots[idx] = outcome.occurrences;
        }

        let mut occurrences = globals.occurrences;
        occurrences.extend(slots.into_iter().flatten());

        if let (true, Some(store)) = (incremental, store.as_mut()) {
            if opts.incremental.prune_missing {
                let dropped = store.prune(ordered.iter().map(|f| f.rel_path.as_str()));
                if dropped > 0 {
                    tracing::debug!(dropped, "pruned stale incremental entries");
                }
            }
            store.mark_run(timestamp);
            if let Err(e) = store.save() {
                stats.persist_errors += 1;
                log.notice("could not persist incremental state", &e.to_string());
            }
        }

        let analysis_time_ms = elapsed_ms(started);
        let metrics = opts.metrics.enabled.then(|| RunMetrics {
            timestamp,
            total_files: files.len(),
            parse_time_ms,
            analysis_time_ms,
            cache_hits: stats.cache_hits,
            cache_misses: stats.cache_misses,
            per_technique: acc.into_vec(),
        });
        if let Some(m) = &metrics {
            let path = opts.history_path(base_dir);
            let (mut history, discarded) = MetricsHistory::open(&path);
            if let Some(reason) = discarded {
                log.notice("metrics history discarded", &reason);
            }
            history.push(m.clone(), opts.metrics.history_max);
            if let Err(e) = history.save(&path) {
                stats.persist_errors += 1;
                log.notice("could not persist metrics history", &e.to_string());
            }
        }

        log.summary(&Summary {
            files: stats.files_total,
            processed: stats.files_processed,
            occurrences: occurrences.len(),
            cache_hits: stats.cache_hits,
            cache_misses: stats.cache_misses,
            failures: stats.technique_failures,
            timeouts: stats.timeouts,
            worker_errors: stats.worker_errors,
            persist_errors: stats.persist_errors,
            elapsed_ms: analysis_time_ms,
        });

        AnalysisOutput { occurrences, metrics, stats }
    }
}

/// 便捷入口：校验选项、运行一次
pub fn run(
    files: &[FileEntry],
    techniques: &[TechniqueRef],
    base_dir: &Path,
    options: &RunOptions,
) -> Result<AnalysisOutput, EngineError> {
    Ok(Executor::new(options.clone())?.run(files, techniques, base_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LogMode;
    use crate::technique::{Outcome, Technique};
    use crate::types::Severity;
    use std::path::PathBuf;

    struct Tagger;

    impl Technique for Tagger {
        fn name(&self) -> &str {
            "tagger"
        }
        fn apply(&self, input: &TechniqueInput) -> anyhow::Result<Outcome> {
            // 不填写路径与来源，交给执行器补齐
            Ok(Occurrence::new("tag", Severity::Info, input.rel_path.clone(), "").into())
        }
    }

    fn env() -> JobEnv {
        JobEnv {
            context: Arc::new(TechniqueContext { base_dir: PathBuf::from("/r"), files: Arc::from(Vec::new()) }),
            policy: InvokePolicy::from_ms(0, Duration::from_millis(10)),
            log: Arc::new(RunLog::new(LogMode::Normal)),
        }
    }

    #[test]
    fn analyze_file_fills_missing_origin_and_path() {
        let techniques: Vec<TechniqueRef> = vec![Arc::new(Tagger)];
        let f = FileEntry::new("a.ts", "/r/a.ts", Some("x".into()));
        let out = analyze_file(&f, &techniques, &env(), &mut || {});
        assert!(out.is_clean());
        assert_eq!(out.occurrences.len(), 1);
        assert_eq!(out.occurrences[0].origin_technique, "tagger");
        assert_eq!(out.occurrences[0].rel_path.as_deref(), Some("a.ts"));
        assert_eq!(out.per_technique["tagger"].occurrence_count, 1);
        assert_eq!(out.stored()[0].invoked_by, "tagger");
    }

    #[test]
    fn invalid_options_are_rejected_up_front() {
        let mut opts = RunOptions::default();
        opts.worker_pool.batch_size = 0;
        assert!(Executor::new(opts).is_err());
    }
}
