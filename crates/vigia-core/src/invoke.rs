//! 带时间预算的技术调用
//!
//! 有预算时技术在独立线程上运行，调用方在 crossbeam 通道上按片 `recv_timeout` 等待：
//! - 每片超时回调一次 `tick`（工作线程借此发心跳）
//! - 预算耗尽即放弃等待并丢弃接收端；技术线程被分离，其迟到结果 send 失败后直接丢弃，
//!   因此不可能回写到已经返回的数据
//! 无预算时直接在当前线程调用，不装定时器；但在工作池里（`watched`）仍放到独立线程、
//! 按片等待且不设截止时间，好让工作线程在长时间运行的技术期间继续发心跳。
//! 两条路径都用 catch_unwind 把 panic 转成失败。
use crossbeam_channel::RecvTimeoutError;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::technique::{TechniqueInput, TechniqueRef};
use crate::types::Occurrence;

/// 一次调用的结局
#[derive(Debug)]
pub(crate) enum Invocation {
    Completed { occurrences: Vec<Occurrence>, duration_ms: u64 },
    Failed { message: String, trace: String, duration_ms: u64 },
    TimedOut { budget_ms: u64 },
}

struct Failure {
    message: String,
    trace: String,
}

/// 调用参数：预算与等待分片
#[derive(Debug, Clone, Copy)]
pub(crate) struct InvokePolicy {
    /// None 表示不设超时
    pub(crate) budget: Option<Duration>,
    /// 等待分片长度，每片结束调用一次 tick
    pub(crate) slice: Duration,
    /// 调用方需要在等待期间持续 tick（工作池心跳）
    pub(crate) watched: bool,
}

impl InvokePolicy {
    pub(crate) fn from_ms(budget_ms: u64, slice: Duration) -> Self {
        Self {
            budget: (budget_ms > 0).then(|| Duration::from_millis(budget_ms)),
            slice: slice.max(Duration::from_millis(1)),
            watched: false,
        }
    }

    pub(crate) fn watched(self) -> Self {
        Self { watched: true, ..self }
    }
}

pub(crate) fn invoke(technique: &TechniqueRef, input: TechniqueInput, policy: InvokePolicy, tick: &mut dyn FnMut()) -> Invocation {
    let start = Instant::now();
    if policy.budget.is_none() && !policy.watched {
        return finish(call(technique.as_ref(), &input), start);
    }

    let (tx, rx) = crossbeam_channel::bounded::<Result<Vec<Occurrence>, Failure>>(1);
    let worker_technique = Arc::clone(technique);
    let spawned = thread::Builder::new()
        .name(format!("technique-{}", technique.name()))
        .spawn(move || {
            let res = call(worker_technique.as_ref(), &input);
            // 调用方已超时离开时接收端已丢弃，结果在此被丢弃
            let _ = tx.send(res);
        });
    if let Err(e) = spawned {
        // 线程创建失败：本次无法设置超时，按失败处理
        return Invocation::Failed {
            message: format!("could not start technique thread: {e}"),
            trace: format!("{e:?}"),
            duration_ms: elapsed_ms(start),
        };
    }

    let deadline = policy.budget.map(|b| (start + b, b));
    loop {
        let wait = match deadline {
            Some((at, budget)) => {
                let now = Instant::now();
                if now >= at {
                    return Invocation::TimedOut { budget_ms: budget.as_millis() as u64 };
                }
                (at - now).min(policy.slice)
            }
            None => policy.slice,
        };
        match rx.recv_timeout(wait) {
            Ok(res) => return finish(res, start),
            Err(RecvTimeoutError::Timeout) => tick(),
            Err(RecvTimeoutError::Disconnected) => {
                return Invocation::Failed {
                    message: "technique thread exited without a result".to_string(),
                    trace: String::new(),
                    duration_ms: elapsed_ms(start),
                };
            }
        }
    }
}

fn call(technique: &dyn crate::technique::Technique, input: &TechniqueInput) -> Result<Vec<Occurrence>, Failure> {
    match catch_unwind(AssertUnwindSafe(|| technique.apply(input))) {
        Ok(Ok(outcome)) => Ok(outcome.into_vec()),
        Ok(Err(e)) => Err(Failure { message: format!("{e:#}"), trace: format!("{e:?}") }),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            Err(Failure { trace: format!("panic: {message}"), message })
        }
    }
}

fn finish(res: Result<Vec<Occurrence>, Failure>, start: Instant) -> Invocation {
    let duration_ms = elapsed_ms(start);
    match res {
        Ok(occurrences) => Invocation::Completed { occurrences, duration_ms },
        Err(f) => Invocation::Failed { message: f.message, trace: f.trace, duration_ms },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "technique panicked".to_string()
    }
}

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::technique::{Outcome, Technique, TechniqueContext};
    use crate::types::Severity;
    use std::path::PathBuf;

    struct Sleepy(u64);

    impl Technique for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn apply(&self, _input: &TechniqueInput) -> anyhow::Result<Outcome> {
            thread::sleep(Duration::from_millis(self.0));
            Ok(Occurrence::new("k", Severity::Info, "done", "sleepy").into())
        }
    }

    struct Boom;

    impl Technique for Boom {
        fn name(&self) -> &str {
            "boom"
        }
        fn apply(&self, _input: &TechniqueInput) -> anyhow::Result<Outcome> {
            panic!("kaboom")
        }
    }

    fn input() -> TechniqueInput {
        let ctx = Arc::new(TechniqueContext { base_dir: PathBuf::from("/r"), files: Arc::from(Vec::new()) });
        TechniqueInput::for_global(&ctx)
    }

    #[test]
    fn no_budget_runs_inline_to_completion() {
        let t: TechniqueRef = Arc::new(Sleepy(20));
        let res = invoke(&t, input(), InvokePolicy::from_ms(0, Duration::from_millis(5)), &mut || {});
        assert!(matches!(res, Invocation::Completed { ref occurrences, .. } if occurrences.len() == 1));
    }

    #[test]
    fn budget_expiry_stops_waiting() {
        let t: TechniqueRef = Arc::new(Sleepy(5_000));
        let start = Instant::now();
        let mut ticks = 0;
        let res = invoke(&t, input(), InvokePolicy::from_ms(100, Duration::from_millis(20)), &mut || ticks += 1);
        assert!(matches!(res, Invocation::TimedOut { budget_ms: 100 }));
        assert!(start.elapsed() < Duration::from_millis(2_000));
        assert!(ticks >= 1);
    }

    #[test]
    fn watched_call_without_budget_ticks_until_done() {
        let t: TechniqueRef = Arc::new(Sleepy(120));
        let mut ticks = 0;
        let policy = InvokePolicy::from_ms(0, Duration::from_millis(10)).watched();
        let res = invoke(&t, input(), policy, &mut || ticks += 1);
        assert!(matches!(res, Invocation::Completed { ref occurrences, .. } if occurrences.len() == 1));
        assert!(ticks >= 3, "ticks = {ticks}");
    }

    #[test]
    fn fast_technique_beats_budget() {
        let t: TechniqueRef = Arc::new(Sleepy(1));
        let res = invoke(&t, input(), InvokePolicy::from_ms(2_000, Duration::from_millis(50)), &mut || {});
        assert!(matches!(res, Invocation::Completed { .. }));
    }

    #[test]
    fn panic_becomes_failure_on_both_paths() {
        let t: TechniqueRef = Arc::new(Boom);
        for budget in [0, 1_000] {
            let res = invoke(&t, input(), InvokePolicy::from_ms(budget, Duration::from_millis(10)), &mut || {});
            match res {
                Invocation::Failed { message, .. } => assert!(message.contains("kaboom")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
