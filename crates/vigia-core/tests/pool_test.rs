//! 工作池测试：串行 / 并行等价、心跳失联、崩溃隔离

mod common;

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use vigia_core::{
    Executor, FileEntry, LogMode, Outcome, RunOptions, Technique, TechniqueContext, TechniqueInput, TechniqueRef,
    WorkerPool, WorkerPoolOptions,
};

fn corpus(dir: &std::path::Path, n: usize) -> Vec<FileEntry> {
    (0..n)
        .map(|i| {
            let body = if i % 3 == 0 { format!("line\n// TODO {i}\n") } else { "clean\n".to_string() };
            file(dir, &format!("src/f{i:02}.ts"), &body)
        })
        .collect()
}

fn parallel(mut opts: RunOptions) -> RunOptions {
    opts.worker_pool = WorkerPoolOptions {
        enabled: true,
        max_workers: Some(4),
        batch_size: 3,
        min_files: Some(1),
        ..Default::default()
    };
    opts
}

#[test]
fn sequential_and_parallel_agree() {
    let dir = tempfile::tempdir().unwrap();
    let files = corpus(dir.path(), 25);
    let (t, _) = Counting::new("T");
    let techniques: Vec<TechniqueRef> = vec![t, Arc::new(Throwing)];

    let mut base = options();
    base.incremental.enabled = false;
    base.metrics.enabled = false;

    let seq = Executor::new(base.clone()).unwrap().run(&files, &techniques, dir.path());
    let par_exec = Executor::new(parallel(base)).unwrap();
    let par = par_exec.run(&files, &techniques, dir.path());

    assert_eq!(sorted_json(&seq.occurrences), sorted_json(&par.occurrences));
    assert_eq!(seq.stats.files_processed, 25);
    assert_eq!(par.stats.files_processed, 25);
    assert_eq!(par.stats.worker_errors, 0);
    assert_eq!(par_exec.pool_stats().error_count, 0);
}

#[test]
fn parallel_run_feeds_the_incremental_store() {
    let dir = tempfile::tempdir().unwrap();
    let files = corpus(dir.path(), 12);
    let (t, calls) = Counting::new("T");
    let techniques = vec![t];
    let exec = Executor::new(parallel(options())).unwrap();

    let first = exec.run(&files, &techniques, dir.path());
    assert_eq!(count(&calls), 12);
    let second = exec.run(&files, &techniques, dir.path());
    assert_eq!(count(&calls), 12, "all files reused on the second run");
    assert_eq!(sorted_json(&first.occurrences), sorted_json(&second.occurrences));
    assert_eq!(second.stats.cache_hits, 12);
}

#[test]
fn unresponsive_worker_is_declared_failed() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = corpus(dir.path(), 6);
    files.insert(0, file(dir.path(), "stuck.ts", "x"));
    let (t, _) = Counting::new("T");
    let techniques: Vec<TechniqueRef> = vec![
        Arc::new(StuckOnWorker { only: "stuck.ts", sleep: Duration::from_secs(3) }),
        t,
    ];

    let mut opts = options();
    opts.incremental.enabled = false;
    opts.metrics.enabled = false;
    opts.worker_pool = WorkerPoolOptions {
        enabled: true,
        max_workers: Some(2),
        batch_size: 1,
        min_files: Some(1),
        heartbeat_interval_ms: 20,
        worker_timeout_ms: 200,
    };
    let exec = Executor::new(opts).unwrap();

    let start = Instant::now();
    let out = exec.run(&files, &techniques, dir.path());
    assert!(start.elapsed() < Duration::from_millis(2_500), "run must not wait for the stuck worker");

    assert_eq!(out.stats.worker_errors, 1);
    assert_eq!(out.stats.files_processed, 6);
    assert!(out.occurrences.iter().all(|o| o.rel_path.as_deref() != Some("stuck.ts")));
    assert_eq!(out.occurrences.len(), 2);
    assert_eq!(exec.pool_stats().error_count, 1);
}

struct Crashing;

impl Technique for Crashing {
    fn name(&self) -> &str {
        "crashing"
    }
    fn apply(&self, _input: &TechniqueInput) -> anyhow::Result<Outcome> {
        panic!("worker-level bug")
    }
}

#[test]
fn technique_panic_inside_worker_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    let files = corpus(dir.path(), 9);
    let techniques: Vec<TechniqueRef> = vec![Arc::new(Crashing)];
    let mut opts = parallel(options());
    opts.incremental.enabled = false;

    let out = Executor::new(opts).unwrap().run(&files, &techniques, dir.path());
    assert_eq!(out.occurrences.len(), 9);
    assert_eq!(out.stats.technique_failures, 9);
    assert_eq!(out.stats.worker_errors, 0);
}

#[test]
fn long_technique_under_budget_keeps_worker_alive() {
    let dir = tempfile::tempdir().unwrap();
    let files = vec![file(dir.path(), "slowish.ts", "x"), file(dir.path(), "b.ts", "x")];
    let techniques: Vec<TechniqueRef> = vec![Arc::new(Hanging { only: "slowish.ts", sleep: Duration::from_millis(400) })];

    let mut opts = options();
    opts.incremental.enabled = false;
    opts.metrics.enabled = false;
    opts.execution.technique_timeout_ms = 2_000;
    opts.worker_pool = WorkerPoolOptions {
        enabled: true,
        max_workers: Some(2),
        batch_size: 1,
        min_files: Some(1),
        heartbeat_interval_ms: 25,
        worker_timeout_ms: 150,
    };

    let out = Executor::new(opts).unwrap().run(&files, &techniques, dir.path());
    assert_eq!(out.stats.worker_errors, 0, "heartbeats during the wait keep the batch alive");
    assert_eq!(out.stats.files_processed, 2);
    assert!(out.occurrences.is_empty());
}

#[test]
fn long_technique_without_budget_keeps_worker_alive() {
    let dir = tempfile::tempdir().unwrap();
    let files = vec![file(dir.path(), "slowish.ts", "x"), file(dir.path(), "b.ts", "x")];
    let techniques: Vec<TechniqueRef> = vec![Arc::new(Hanging { only: "slowish.ts", sleep: Duration::from_millis(400) })];

    let mut opts = options();
    opts.incremental.enabled = false;
    opts.metrics.enabled = false;
    opts.execution.technique_timeout_ms = 0;
    let seq = Executor::new(opts.clone()).unwrap().run(&files, &techniques, dir.path());

    opts.worker_pool = WorkerPoolOptions {
        enabled: true,
        max_workers: Some(2),
        batch_size: 1,
        min_files: Some(1),
        heartbeat_interval_ms: 25,
        worker_timeout_ms: 150,
    };
    let exec = Executor::new(opts).unwrap();
    let out = exec.run(&files, &techniques, dir.path());
    assert_eq!(out.stats.worker_errors, 0, "an unbounded call still heartbeats while it runs");
    assert_eq!(out.stats.files_processed, 2);
    assert_eq!(out.stats.timeouts, 0);
    assert_eq!(exec.pool_stats().error_count, 0);
    assert_eq!(sorted_json(&seq.occurrences), sorted_json(&out.occurrences));
}

#[test]
fn pool_used_directly_falls_back_for_small_input() {
    let dir = tempfile::tempdir().unwrap();
    let files = corpus(dir.path(), 3);
    let census_calls = Arc::new(AtomicUsize::new(0));
    let (t, calls) = Counting::new("T");
    let techniques: Vec<TechniqueRef> = vec![t, Arc::new(Census { calls: Arc::clone(&census_calls), fail: false })];
    let pool = WorkerPool::new(WorkerPoolOptions { enabled: true, max_workers: Some(4), ..Default::default() });
    let ctx = Arc::new(TechniqueContext { base_dir: PathBuf::from(dir.path()), files: Arc::from(files.clone()) });

    let out = pool.process_files(files, &techniques, ctx, 0, LogMode::Compact);
    assert_eq!(out.total_processed, 3);
    assert_eq!(count(&calls), 3);
    assert_eq!(count(&census_calls), 1, "global techniques run once on the calling thread");
    assert_eq!(out.globals.len(), 1);
    assert_eq!(out.occurrences().count(), 2);
    assert!(out.errors.is_empty());
}
