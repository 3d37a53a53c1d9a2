//! 增量存储：按内容哈希复用上次运行的结果
//!
//! 状态文件版本（或哈希算法）与当前配置不一致时整体作废，从不部分信任。
//! 每个 FileState 在重新处理时被整体替换，不做字段级合并。
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::PersistError;
use crate::hashing::HashAlgorithm;
use crate::persist::{load_json, save_json};
use crate::types::Occurrence;

/// 单个技术在单个文件上的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechniqueStat {
    pub occurrence_count: usize,
    pub duration_ms: u64,
}

/// 缓存中的一条发现，连同实际调用它的技术名。
/// 技术可以自由填写 `origin_technique`，因此复用时按 `invoked_by` 过滤。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOccurrence {
    pub invoked_by: String,
    pub occurrence: Occurrence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    pub content_hash: String,
    pub occurrences: Vec<StoredOccurrence>,
    pub per_technique: BTreeMap<String, TechniqueStat>,
    #[serde(default)]
    pub reuse_count: u64,
}

/// 跨运行累计的命中统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub runs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

/// 磁盘上的完整文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalState {
    pub version: u32,
    pub hash_algorithm: HashAlgorithm,
    pub per_file: BTreeMap<String, FileState>,
    pub stats: StoreStats,
}

impl IncrementalState {
    pub fn empty(version: u32, hash_algorithm: HashAlgorithm) -> Self {
        Self { version, hash_algorithm, per_file: BTreeMap::new(), stats: StoreStats::default() }
    }
}

/// 命中时返回的缓存结果
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub occurrences: Vec<Occurrence>,
    pub per_technique: BTreeMap<String, TechniqueStat>,
}

/// 增量存储（由执行器独占读写）
#[derive(Debug)]
pub struct IncrementalStore {
    path: PathBuf,
    state: IncrementalState,
}

impl IncrementalStore {
    /// 加载状态；缺失 / 损坏 / 版本不符一律得到空状态，从不报错
    pub fn load(path: &Path, version: u32, hash_algorithm: HashAlgorithm) -> Self {
        let (store, discarded) = Self::open(path, version, hash_algorithm);
        if let Some(reason) = discarded {
            tracing::debug!(path = %path.display(), reason, "incremental state discarded");
        }
        store
    }

    /// 同 `load`，但把丢弃已有状态的原因交给调用方上报
    pub fn open(path: &Path, version: u32, hash_algorithm: HashAlgorithm) -> (Self, Option<String>) {
        let (state, discarded) = match load_json::<IncrementalState>(path) {
            Ok(Some(s)) if s.version == version && s.hash_algorithm == hash_algorithm => (s, None),
            Ok(Some(s)) => (
                IncrementalState::empty(version, hash_algorithm),
                Some(format!(
                    "incompatible state (version {}, {}), expected version {version}, {}",
                    s.version,
                    s.hash_algorithm.as_str(),
                    hash_algorithm.as_str()
                )),
            ),
            Ok(None) => (IncrementalState::empty(version, hash_algorithm), None),
            Err(e) => (IncrementalState::empty(version, hash_algorithm), Some(e.to_string())),
        };
        (Self { path: path.to_path_buf(), state }, discarded)
    }

    /// 不读磁盘的空存储
    pub fn empty(path: &Path, version: u32, hash_algorithm: HashAlgorithm) -> Self {
        Self { path: path.to_path_buf(), state: IncrementalState::empty(version, hash_algorithm) }
    }

    pub fn state(&self) -> &IncrementalState {
        &self.state
    }

    pub fn stats(&self) -> StoreStats {
        self.state.stats
    }

    pub fn len(&self) -> usize {
        self.state.per_file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.per_file.is_empty()
    }

    /// 查询缓存。命中条件：哈希相同，且当前适用的每个技术都有记录。
    /// 命中时只返回当前适用技术产出的发现，并累加 reuse_count。
    pub fn lookup(&mut self, rel_path: &str, new_hash: &str, applicable: &[&str]) -> Option<CachedResult> {
        let hit = match self.state.per_file.get_mut(rel_path) {
            Some(fs) if fs.content_hash == new_hash && applicable.iter().all(|n| fs.per_technique.contains_key(*n)) => {
                fs.reuse_count += 1;
                let wanted: HashSet<&str> = applicable.iter().copied().collect();
                Some(CachedResult {
                    occurrences: fs
                        .occurrences
                        .iter()
                        .filter(|o| wanted.contains(o.invoked_by.as_str()))
                        .map(|o| o.occurrence.clone())
                        .collect(),
                    per_technique: fs
                        .per_technique
                        .iter()
                        .filter(|(k, _)| wanted.contains(k.as_str()))
                        .map(|(k, v)| (k.clone(), *v))
                        .collect(),
                })
            }
            _ => None,
        };
        if hit.is_some() {
            self.state.stats.cache_hits += 1;
        } else {
            self.state.stats.cache_misses += 1;
        }
        hit
    }

    /// 整体替换该路径的 FileState
    pub fn record(
        &mut self,
        rel_path: &str,
        hash: String,
        occurrences: Vec<StoredOccurrence>,
        per_technique: BTreeMap<String, TechniqueStat>,
    ) {
        self.state.per_file.insert(
            rel_path.to_string(),
            FileState { content_hash: hash, occurrences, per_technique, reuse_count: 0 },
        );
    }

    /// 丢弃不在 keep 中的条目，返回丢弃数量
    pub fn prune<'a>(&mut self, keep: impl IntoIterator<Item = &'a str>) -> usize {
        let keep: HashSet<&str> = keep.into_iter().collect();
        let before = self.state.per_file.len();
        self.state.per_file.retain(|k, _| keep.contains(k.as_str()));
        before - self.state.per_file.len()
    }

    pub(crate) fn mark_run(&mut self, at: DateTime<Utc>) {
        self.state.stats.runs += 1;
        self.state.stats.last_run = Some(at);
    }

    /// 落盘；失败返回错误，由调用方记录日志
    pub fn save(&self) -> Result<(), PersistError> {
        save_json(&self.path, &self.state)
    }
}
