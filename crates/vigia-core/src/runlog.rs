//! 运行日志：按 LogMode 决定输出粒度
//!
//! - Verbose：每个 技术×文件 组合一行，失败附带错误链
//! - Normal：失败 / 超时 / 落盘问题各一行警告，最后一行汇总
//! - Compact：只输出最后一行汇总，其余事件只计数
//! 任何模式都不影响返回的数据。
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::options::LogMode;

#[derive(Debug, Default)]
pub(crate) struct RunLog {
    mode: LogMode,
    suppressed: AtomicUsize,
}

/// 最终汇总行的字段
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Summary {
    pub(crate) files: usize,
    pub(crate) processed: usize,
    pub(crate) occurrences: usize,
    pub(crate) cache_hits: usize,
    pub(crate) cache_misses: usize,
    pub(crate) failures: usize,
    pub(crate) timeouts: usize,
    pub(crate) worker_errors: usize,
    pub(crate) persist_errors: usize,
    pub(crate) elapsed_ms: u64,
}

impl RunLog {
    pub(crate) fn new(mode: LogMode) -> Self {
        Self { mode, suppressed: AtomicUsize::new(0) }
    }

    /// 成功的组合只在 Verbose 下输出
    pub(crate) fn technique_done(&self, technique: &str, file: &str, duration_ms: u64, occurrences: usize) {
        if self.mode == LogMode::Verbose {
            info!(technique, file, duration_ms, occurrences, "technique finished");
        }
    }

    pub(crate) fn technique_failed(&self, technique: &str, file: &str, message: &str, trace: &str) {
        match self.mode {
            LogMode::Verbose => warn!(technique, file, error = message, trace, "technique failed"),
            LogMode::Normal => warn!(technique, file, error = message, "technique failed"),
            LogMode::Compact => self.suppress(),
        }
    }

    pub(crate) fn technique_timed_out(&self, technique: &str, file: &str, budget_ms: u64) {
        match self.mode {
            LogMode::Compact => self.suppress(),
            _ => warn!(technique, file, budget_ms, "technique timed out, result abandoned"),
        }
    }

    pub(crate) fn cache_hit(&self, file: &str) {
        if self.mode == LogMode::Verbose {
            info!(file, "reused cached result");
        }
    }

    /// 工作线程失联 / 崩溃 / 落盘失败等
    pub(crate) fn notice(&self, what: &str, detail: &str) {
        match self.mode {
            LogMode::Compact => self.suppress(),
            _ => warn!(detail, "{what}"),
        }
    }

    pub(crate) fn summary(&self, s: &Summary) {
        info!(
            files = s.files,
            processed = s.processed,
            occurrences = s.occurrences,
            cache_hits = s.cache_hits,
            cache_misses = s.cache_misses,
            failures = s.failures,
            timeouts = s.timeouts,
            worker_errors = s.worker_errors,
            persist_errors = s.persist_errors,
            suppressed = self.suppressed.load(Ordering::Relaxed),
            elapsed_ms = s.elapsed_ms,
            "analysis finished"
        );
    }

    fn suppress(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn suppressed(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_counts_instead_of_logging() {
        let log = RunLog::new(LogMode::Compact);
        log.technique_failed("t", "a.ts", "boom", "trace");
        log.technique_timed_out("t", "b.ts", 10);
        log.notice("worker lost", "batch 3");
        log.technique_done("t", "c.ts", 1, 0);
        assert_eq!(log.suppressed(), 3);
    }

    #[test]
    fn normal_and_verbose_do_not_suppress() {
        for mode in [LogMode::Normal, LogMode::Verbose] {
            let log = RunLog::new(mode);
            log.technique_failed("t", "a.ts", "boom", "trace");
            log.notice("worker lost", "batch 3");
            assert_eq!(log.suppressed(), 0);
        }
    }
}
