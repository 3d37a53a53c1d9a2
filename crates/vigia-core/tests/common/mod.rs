//! 测试用的假技术与辅助函数
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vigia_core::{FileEntry, Occurrence, Outcome, RunOptions, Severity, Technique, TechniqueInput, TechniqueRef, TechniqueScope};

/// 统计调用次数；内容含 TODO 时产出一条发现
pub struct Counting {
    pub name: &'static str,
    pub calls: Arc<AtomicUsize>,
}

impl Counting {
    pub fn new(name: &'static str) -> (TechniqueRef, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Arc::new(Self { name, calls: Arc::clone(&calls) }), calls)
    }
}

impl Technique for Counting {
    fn name(&self) -> &str {
        self.name
    }
    fn apply(&self, input: &TechniqueInput) -> anyhow::Result<Outcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = input.content.as_deref().unwrap_or("");
        Ok(content.lines().position(|l| l.contains("TODO")).map(|i| {
            Occurrence::new("todo", Severity::Warning, "TODO marker", self.name).at(input.rel_path.clone(), Some(i as u32 + 1))
        }).into())
    }
}

/// 永远返回错误
pub struct Throwing;

impl Technique for Throwing {
    fn name(&self) -> &str {
        "throwing"
    }
    fn apply(&self, _input: &TechniqueInput) -> anyhow::Result<Outcome> {
        anyhow::bail!("parser exploded")
    }
}

/// 只匹配指定文件并睡很久
pub struct Hanging {
    pub only: &'static str,
    pub sleep: Duration,
}

impl Technique for Hanging {
    fn name(&self) -> &str {
        "hanging"
    }
    fn matches(&self, rel_path: &str) -> bool {
        self.only.is_empty() || rel_path == self.only
    }
    fn apply(&self, _input: &TechniqueInput) -> anyhow::Result<Outcome> {
        std::thread::sleep(self.sleep);
        Ok(Outcome::None)
    }
}

/// 工作线程上在 `matches` 里卡住（调用之外，不会有心跳）；协调线程上立即返回
pub struct StuckOnWorker {
    pub only: &'static str,
    pub sleep: Duration,
}

impl Technique for StuckOnWorker {
    fn name(&self) -> &str {
        "stuck"
    }
    fn matches(&self, rel_path: &str) -> bool {
        let on_worker = std::thread::current().name().is_some_and(|n| n.starts_with("vigia-worker"));
        if rel_path == self.only && on_worker {
            std::thread::sleep(self.sleep);
        }
        rel_path == self.only
    }
    fn apply(&self, _input: &TechniqueInput) -> anyhow::Result<Outcome> {
        Ok(Outcome::None)
    }
}

/// 全局技术：睡很久
pub struct SlowGlobal {
    pub sleep: Duration,
}

impl Technique for SlowGlobal {
    fn name(&self) -> &str {
        "slow-global"
    }
    fn scope(&self) -> TechniqueScope {
        TechniqueScope::Global
    }
    fn apply(&self, _input: &TechniqueInput) -> anyhow::Result<Outcome> {
        std::thread::sleep(self.sleep);
        Ok(Outcome::None)
    }
}

/// 记录调用顺序
pub struct Recorder {
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl Technique for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }
    fn apply(&self, input: &TechniqueInput) -> anyhow::Result<Outcome> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(input.rel_path.clone());
        }
        Ok(Outcome::None)
    }
}

/// 发现的来源字段与技术名不同
pub struct Lint;

impl Technique for Lint {
    fn name(&self) -> &str {
        "lint"
    }
    fn apply(&self, input: &TechniqueInput) -> anyhow::Result<Outcome> {
        Ok(Occurrence::new("rule", Severity::Error, "unexpected var", "lint/no-var").at(input.rel_path.clone(), Some(1)).into())
    }
}

/// 全局技术：报告文件总数
pub struct Census {
    pub calls: Arc<AtomicUsize>,
    pub fail: bool,
}

impl Technique for Census {
    fn name(&self) -> &str {
        "census"
    }
    fn scope(&self) -> TechniqueScope {
        TechniqueScope::Global
    }
    fn apply(&self, input: &TechniqueInput) -> anyhow::Result<Outcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("census unavailable");
        }
        Ok(Occurrence::new("census", Severity::Info, format!("{} files", input.context.files.len()), "census").into())
    }
}

pub fn file(dir: &Path, rel: &str, content: &str) -> FileEntry {
    FileEntry::new(rel, dir.join(rel), Some(content.to_string()))
}

pub fn count(c: &Arc<AtomicUsize>) -> usize {
    c.load(Ordering::SeqCst)
}

/// 状态与历史写入临时目录；关闭排序以便断言顺序
pub fn options() -> RunOptions {
    let mut opts = RunOptions::default();
    opts.prioritization.enabled = false;
    opts
}

/// 便于比较集合的排序键
pub fn sorted_json(occ: &[Occurrence]) -> Vec<String> {
    let mut v: Vec<String> = occ.iter().map(|o| serde_json::to_string(o).unwrap()).collect();
    v.sort();
    v
}
