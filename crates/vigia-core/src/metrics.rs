//! 运行指标与有界历史（FIFO 淘汰）
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

use crate::error::PersistError;
use crate::persist::{load_json, save_json};
use crate::technique::{is_global, TechniqueRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechniqueMetric {
    pub name: String,
    pub duration_ms: u64,
    pub occurrence_count: usize,
    pub is_global: bool,
}

/// 单次运行的汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_files: usize,
    pub parse_time_ms: u64,
    pub analysis_time_ms: u64,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub per_technique: Vec<TechniqueMetric>,
}

/// 按技术累加耗时与发现数；输出顺序与注册顺序一致
#[derive(Debug, Clone, Default)]
pub(crate) struct MetricsAccumulator {
    entries: Vec<TechniqueMetric>,
    index: HashMap<String, usize>,
}

impl MetricsAccumulator {
    pub(crate) fn for_techniques(techniques: &[TechniqueRef]) -> Self {
        let mut acc = Self::default();
        for t in techniques {
            acc.slot(t.name(), is_global(t));
        }
        acc
    }

    fn slot(&mut self, name: &str, global: bool) -> &mut TechniqueMetric {
        let idx = match self.index.get(name) {
            Some(i) => *i,
            None => {
                self.entries.push(TechniqueMetric {
                    name: name.to_string(),
                    duration_ms: 0,
                    occurrence_count: 0,
                    is_global: global,
                });
                self.index.insert(name.to_string(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx]
    }

    pub(crate) fn add(&mut self, name: &str, global: bool, duration_ms: u64, occurrences: usize) {
        let m = self.slot(name, global);
        m.duration_ms = m.duration_ms.saturating_add(duration_ms);
        m.occurrence_count += occurrences;
    }

    pub(crate) fn merge(&mut self, other: &[TechniqueMetric]) {
        for m in other {
            self.add(&m.name, m.is_global, m.duration_ms, m.occurrence_count);
        }
    }

    pub(crate) fn into_vec(self) -> Vec<TechniqueMetric> {
        self.entries
    }
}

/// 持久化的历史列表
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsHistory {
    pub runs: VecDeque<RunMetrics>,
}

impl MetricsHistory {
    /// 读取历史；缺失或损坏时为空
    pub fn load(path: &Path) -> Self {
        let (history, discarded) = Self::open(path);
        if let Some(reason) = discarded {
            tracing::debug!(path = %path.display(), reason, "metrics history discarded");
        }
        history
    }

    /// 同 `load`，损坏时把原因交给调用方上报
    pub fn open(path: &Path) -> (Self, Option<String>) {
        match load_json(path) {
            Ok(h) => (h.unwrap_or_default(), None),
            Err(e) => (Self::default(), Some(e.to_string())),
        }
    }

    /// 追加一条；超过 max 时从最旧的开始淘汰
    pub fn push(&mut self, run: RunMetrics, max: usize) {
        self.runs.push_back(run);
        while self.runs.len() > max.max(1) {
            self.runs.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&RunMetrics> {
        self.runs.back()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn average_analysis_time_ms(&self) -> Option<f64> {
        if self.runs.is_empty() {
            return None;
        }
        let total: u64 = self.runs.iter().map(|r| r.analysis_time_ms).sum();
        Some(total as f64 / self.runs.len() as f64)
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        save_json(path, self)
    }
}
