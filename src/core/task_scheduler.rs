//! 后台编排调度：任务变更后防抖一段时间，再在不打扰用户的前提下重新触发整日编排
//!
//! 触发时重新检查五个守卫：有未处理的变更、当前没有 Turn 在流式输出、查看的日期未变、
//! 没有待审提案、最近没有用户消息（否则延后重排）。被取消的任务绝不调用回调。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerSection;

/// 守卫所需的会话状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct GuardSnapshot {
    pub unresolved_mutations: bool,
    pub streaming: bool,
    pub viewed_date: NaiveDate,
    pub proposal_pending: bool,
    pub last_user_message_at: Option<Instant>,
}

/// 守卫状态来源（由会话门面实现）
#[async_trait]
pub trait GuardSource: Send + Sync {
    async fn snapshot(&self) -> GuardSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Fire,
    /// 暂不合适，稍后再试
    Defer(&'static str),
    /// 前提已不成立，放弃
    Drop(&'static str),
}

#[derive(Debug, Clone)]
pub struct BackgroundJob {
    pub scheduled_date: NaiveDate,
    pub fire_deadline: Instant,
    /// 安排时的守卫快照
    pub guard_snapshot: GuardSnapshot,
    pub deferrals: u32,
    /// 此时刻之后的用户消息都会让任务再延后一次
    quiet_since: Instant,
}

impl BackgroundJob {
    pub fn new(
        scheduled_date: NaiveDate,
        guard_snapshot: GuardSnapshot,
        now: Instant,
        delay: Duration,
        user_quiet: Duration,
    ) -> Self {
        Self {
            scheduled_date,
            fire_deadline: now + delay,
            guard_snapshot,
            deferrals: 0,
            quiet_since: now.checked_sub(user_quiet).unwrap_or(now),
        }
    }
}

/// 触发时的守卫判定（纯函数）
pub fn evaluate(
    job: &BackgroundJob,
    current: &GuardSnapshot,
    now: Instant,
    user_quiet: Duration,
) -> GuardVerdict {
    if !current.unresolved_mutations {
        return GuardVerdict::Drop("no unresolved mutations");
    }
    if current.viewed_date != job.guard_snapshot.viewed_date {
        return GuardVerdict::Drop("viewed date changed");
    }
    if current.proposal_pending {
        return GuardVerdict::Drop("proposal already pending");
    }
    if current.streaming {
        return GuardVerdict::Defer("turn in progress");
    }
    if let Some(at) = current.last_user_message_at {
        if at >= job.quiet_since || now.saturating_duration_since(at) < user_quiet {
            return GuardVerdict::Defer("recent user message");
        }
    }
    GuardVerdict::Fire
}

/// [min, max] 内的随机防抖时长
fn random_delay(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

pub type FireCallback = Arc<dyn Fn(NaiveDate) + Send + Sync>;

struct Slot {
    job: Option<BackgroundJob>,
    token: Option<CancellationToken>,
    generation: u64,
}

/// 至多一个后台任务；新安排会取消旧任务（重新防抖）
pub struct BackgroundScheduler {
    debounce_min: Duration,
    debounce_max: Duration,
    user_quiet: Duration,
    max_deferrals: u32,
    guards: Arc<dyn GuardSource>,
    on_fire: FireCallback,
    slot: Arc<Mutex<Slot>>,
}

impl BackgroundScheduler {
    pub fn new(cfg: &SchedulerSection, guards: Arc<dyn GuardSource>, on_fire: FireCallback) -> Self {
        let debounce_min = Duration::from_millis(cfg.debounce_min_ms);
        Self {
            debounce_min,
            debounce_max: Duration::from_millis(cfg.debounce_max_ms).max(debounce_min),
            user_quiet: Duration::from_millis(cfg.user_quiet_ms),
            max_deferrals: cfg.max_deferrals,
            guards,
            on_fire,
            slot: Arc::new(Mutex::new(Slot {
                job: None,
                token: None,
                generation: 0,
            })),
        }
    }

    /// 安排（或重新安排）某天的后台编排
    pub async fn schedule(&self, date: NaiveDate) {
        let snapshot = self.guards.snapshot().await;
        let delay = random_delay(self.debounce_min, self.debounce_max);
        let job = BackgroundJob::new(date, snapshot, Instant::now(), delay, self.user_quiet);
        let token = CancellationToken::new();

        let generation = {
            let mut slot = self.slot.lock().await;
            if let Some(old) = slot.token.take() {
                old.cancel();
            }
            slot.generation += 1;
            slot.job = Some(job.clone());
            slot.token = Some(token.clone());
            slot.generation
        };
        debug!(%date, delay_ms = delay.as_millis() as u64, "background orchestration scheduled");

        let runner = JobRunner {
            job,
            token,
            generation,
            guards: self.guards.clone(),
            on_fire: self.on_fire.clone(),
            slot: self.slot.clone(),
            debounce_min: self.debounce_min,
            debounce_max: self.debounce_max,
            user_quiet: self.user_quiet,
            max_deferrals: self.max_deferrals,
        };
        tokio::spawn(runner.run());
    }

    /// 取消当前任务；返回是否确有任务被取消
    pub async fn cancel(&self) -> bool {
        let mut slot = self.slot.lock().await;
        slot.job = None;
        match slot.token.take() {
            Some(token) => {
                token.cancel();
                debug!("background orchestration cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn pending_job(&self) -> Option<BackgroundJob> {
        self.slot.lock().await.job.clone()
    }
}

struct JobRunner {
    job: BackgroundJob,
    token: CancellationToken,
    generation: u64,
    guards: Arc<dyn GuardSource>,
    on_fire: FireCallback,
    slot: Arc<Mutex<Slot>>,
    debounce_min: Duration,
    debounce_max: Duration,
    user_quiet: Duration,
    max_deferrals: u32,
}

impl JobRunner {
    async fn run(mut self) {
        let date = self.job.scheduled_date;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = sleep_until(self.job.fire_deadline) => {}
            }
            let current = self.guards.snapshot().await;
            let now = Instant::now();
            match evaluate(&self.job, &current, now, self.user_quiet) {
                GuardVerdict::Fire => {
                    // 持锁回调，与 cancel 互斥
                    let mut slot = self.slot.lock().await;
                    if self.token.is_cancelled() || slot.generation != self.generation {
                        return;
                    }
                    slot.job = None;
                    slot.token = None;
                    info!(%date, deferrals = self.job.deferrals, "background orchestration firing");
                    (self.on_fire)(date);
                    return;
                }
                GuardVerdict::Drop(reason) => {
                    info!(%date, reason, "background orchestration dropped");
                    self.finish().await;
                    return;
                }
                GuardVerdict::Defer(reason) => {
                    self.job.deferrals += 1;
                    if self.job.deferrals > self.max_deferrals {
                        warn!(%date, reason, "background orchestration gave up after too many deferrals");
                        self.finish().await;
                        return;
                    }
                    let delay = random_delay(self.debounce_min, self.debounce_max);
                    self.job.fire_deadline = now + delay;
                    self.job.quiet_since = now;
                    debug!(%date, reason, deferrals = self.job.deferrals, "background orchestration deferred");
                    let mut slot = self.slot.lock().await;
                    if slot.generation == self.generation {
                        slot.job = Some(self.job.clone());
                    }
                }
            }
        }
    }

    async fn finish(&self) {
        let mut slot = self.slot.lock().await;
        if slot.generation == self.generation {
            slot.job = None;
            slot.token = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    fn snap() -> GuardSnapshot {
        GuardSnapshot {
            unresolved_mutations: true,
            streaming: false,
            viewed_date: day(20),
            proposal_pending: false,
            last_user_message_at: None,
        }
    }

    struct FakeGuards(StdMutex<GuardSnapshot>);

    #[async_trait]
    impl GuardSource for FakeGuards {
        async fn snapshot(&self) -> GuardSnapshot {
            self.0.lock().unwrap().clone()
        }
    }

    fn cfg() -> SchedulerSection {
        SchedulerSection {
            debounce_min_ms: 3000,
            debounce_max_ms: 6000,
            user_quiet_ms: 2000,
            max_deferrals: 20,
        }
    }

    fn counting() -> (FireCallback, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        (
            Arc::new(move |_d| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            fired,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluate_guards() {
        let now = Instant::now();
        let quiet = Duration::from_secs(2);
        let job = BackgroundJob::new(day(20), snap(), now, Duration::from_secs(3), quiet);
        let later = now + Duration::from_secs(3);

        assert_eq!(evaluate(&job, &snap(), later, quiet), GuardVerdict::Fire);

        let mut s = snap();
        s.unresolved_mutations = false;
        assert!(matches!(evaluate(&job, &s, later, quiet), GuardVerdict::Drop(_)));

        let mut s = snap();
        s.viewed_date = day(21);
        assert!(matches!(evaluate(&job, &s, later, quiet), GuardVerdict::Drop(_)));

        let mut s = snap();
        s.proposal_pending = true;
        assert!(matches!(evaluate(&job, &s, later, quiet), GuardVerdict::Drop(_)));

        let mut s = snap();
        s.streaming = true;
        assert!(matches!(evaluate(&job, &s, later, quiet), GuardVerdict::Defer(_)));

        // 安排前 1 秒的用户消息：触发时已过 4 秒，仍需延后一次
        let mut s = snap();
        s.last_user_message_at = Some(now - Duration::from_secs(1));
        assert!(matches!(evaluate(&job, &s, later, quiet), GuardVerdict::Defer(_)));

        // 很早以前的消息不影响
        let mut s = snap();
        s.last_user_message_at = now.checked_sub(Duration::from_secs(30));
        assert_eq!(evaluate(&job, &s, later, quiet), GuardVerdict::Fire);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_debounce() {
        let guards = Arc::new(FakeGuards(StdMutex::new(snap())));
        let (cb, fired) = counting();
        let scheduler = BackgroundScheduler::new(&cfg(), guards, cb);
        scheduler.schedule(day(20)).await;

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(3200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.pending_job().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_user_message_defers_at_least_once() {
        let mut s = snap();
        s.last_user_message_at = Some(Instant::now());
        let guards = Arc::new(FakeGuards(StdMutex::new(s)));
        let (cb, fired) = counting();
        let scheduler = BackgroundScheduler::new(&cfg(), guards, cb);
        scheduler.schedule(day(20)).await;

        tokio::time::sleep(Duration::from_millis(6100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let job = scheduler.pending_job().await.unwrap();
        assert_eq!(job.deferrals, 1);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_never_fires() {
        let guards = Arc::new(FakeGuards(StdMutex::new(snap())));
        let (cb, fired) = counting();
        let scheduler = BackgroundScheduler::new(&cfg(), guards, cb);
        scheduler.schedule(day(20)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.cancel().await);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.cancel().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_job() {
        let guards = Arc::new(FakeGuards(StdMutex::new(snap())));
        let (cb, fired) = counting();
        let scheduler = BackgroundScheduler::new(&cfg(), guards, cb);
        scheduler.schedule(day(20)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.schedule(day(20)).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_defers_until_turn_ends() {
        let mut s = snap();
        s.streaming = true;
        let guards = Arc::new(FakeGuards(StdMutex::new(s)));
        let (cb, fired) = counting();
        let scheduler = BackgroundScheduler::new(&cfg(), guards.clone(), cb);
        scheduler.schedule(day(20)).await;

        tokio::time::sleep(Duration::from_secs(13)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        guards.0.lock().unwrap().streaming = false;
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
