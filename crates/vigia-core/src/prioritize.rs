//! 优先级排序：历史上耗时多 / 发现多的文件先跑
//!
//! score = Σ(duration_ms × w_duration + occurrence_count × w_occurrences)
//!         − min(reuse_count, REUSE_PENALTY_CAP) × w_reuse_penalty
//!
//! - 纯函数，不修改状态
//! - 分数降序；没有历史的文件排在所有有分数的文件之后
//! - 稳定排序：同分保持输入顺序
use crate::incremental::{FileState, IncrementalState};
use crate::options::PriorityWeights;
use crate::types::FileEntry;

/// 复用惩罚最多按这么多次计算，分数下界为 −REUSE_PENALTY_CAP × w_reuse_penalty
pub const REUSE_PENALTY_CAP: u64 = 100;

/// 单个文件的历史分数；没有历史时为 None
pub fn score(state: Option<&FileState>, weights: &PriorityWeights) -> Option<f64> {
    let fs = state?;
    let work: f64 = fs
        .per_technique
        .values()
        .map(|s| s.duration_ms as f64 * weights.duration + s.occurrence_count as f64 * weights.occurrences)
        .sum();
    let penalty = fs.reuse_count.min(REUSE_PENALTY_CAP) as f64 * weights.reuse_penalty;
    Some(work - penalty)
}

/// 返回排序后的文件列表（克隆；FileEntry 内部均为 Arc，代价很小）
pub fn order(files: &[FileEntry], state: &IncrementalState, weights: &PriorityWeights) -> Vec<FileEntry> {
    let mut keyed: Vec<(Option<f64>, &FileEntry)> = files
        .iter()
        .map(|f| (score(state.per_file.get(&f.rel_path), weights), f))
        .collect();
    // sort_by 是稳定排序
    keyed.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(x), Some(y)) => y.total_cmp(x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    keyed.into_iter().map(|(_, f)| f.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::HashAlgorithm;
    use crate::incremental::TechniqueStat;
    use std::collections::BTreeMap;

    fn entry(p: &str) -> FileEntry {
        FileEntry::new(p, format!("/r/{p}"), Some(String::new()))
    }

    fn state_with(rows: &[(&str, u64, usize, u64)]) -> IncrementalState {
        let mut st = IncrementalState::empty(1, HashAlgorithm::Xxh3);
        for (p, dur, occ, reuse) in rows {
            let mut per = BTreeMap::new();
            per.insert("T".to_string(), TechniqueStat { occurrence_count: *occ, duration_ms: *dur });
            st.per_file.insert(
                p.to_string(),
                FileState { content_hash: "h".into(), occurrences: vec![], per_technique: per, reuse_count: *reuse },
            );
        }
        st
    }

    fn names(v: &[FileEntry]) -> Vec<&str> {
        v.iter().map(|f| f.rel_path.as_str()).collect()
    }

    #[test]
    fn expensive_first_unseen_last() {
        let files = vec![entry("new.ts"), entry("cheap.ts"), entry("slow.ts"), entry("noisy.ts")];
        let st = state_with(&[("cheap.ts", 1, 0, 0), ("slow.ts", 500, 0, 0), ("noisy.ts", 0, 20, 0)]);
        let w = PriorityWeights::default();
        assert_eq!(names(&order(&files, &st, &w)), vec!["slow.ts", "noisy.ts", "cheap.ts", "new.ts"]);
    }

    #[test]
    fn reused_files_sink_but_stay_ahead_of_unseen() {
        let files = vec![entry("x.ts"), entry("reused.ts"), entry("fresh.ts")];
        let st = state_with(&[("reused.ts", 0, 0, 30), ("fresh.ts", 2, 0, 0)]);
        let w = PriorityWeights::default();
        assert_eq!(names(&order(&files, &st, &w)), vec!["fresh.ts", "reused.ts", "x.ts"]);
    }

    #[test]
    fn ties_keep_input_order() {
        let files = vec![entry("b.ts"), entry("a.ts"), entry("c.ts")];
        let st = state_with(&[("a.ts", 5, 0, 0), ("b.ts", 5, 0, 0), ("c.ts", 5, 0, 0)]);
        let w = PriorityWeights::default();
        assert_eq!(names(&order(&files, &st, &w)), vec!["b.ts", "a.ts", "c.ts"]);
    }

    #[test]
    fn penalty_is_clamped() {
        let w = PriorityWeights::default();
        let st = state_with(&[("a.ts", 0, 0, 1_000_000)]);
        let s = score(st.per_file.get("a.ts"), &w).unwrap();
        assert_eq!(s, -(REUSE_PENALTY_CAP as f64) * w.reuse_penalty);
    }

    #[test]
    fn empty_state_keeps_order() {
        let files = vec![entry("b.ts"), entry("a.ts")];
        let st = IncrementalState::empty(1, HashAlgorithm::Xxh3);
        assert_eq!(names(&order(&files, &st, &PriorityWeights::default())), vec!["b.ts", "a.ts"]);
    }
}
