//! Headless 会话门面
//!
//! 供任意前端（终端 REPL、HTTP、桌面 UI）调用的无界面逻辑：
//! navigate 切换查看日期并开启新会话，send_message 跑一个普通 Turn，
//! run_orchestration 跑整日重建 Turn，提案的接受 / 拒绝，联系人提案的处理。
//! 忙碌标志保证同一时刻只有一个 Turn 或提案操作；任务变更后安排后台编排，触发日期经 channel 交给前端。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{AppConfig, TurnSection};
use crate::core::{
    AgentError, BackgroundJob, BackgroundScheduler, ContextBlock, DayContext, GuardSnapshot,
    GuardSource, SessionManager,
};
use crate::llm::{LlmClient, MediaBlob};
use crate::memory::estimate_tokens;
use crate::proposal::{ApprovalRecord, ContactProposal, ProposalHost, ScheduleProposal};
use crate::react::prompts::{ORCHESTRATION_REQUEST, REJECTION_FOLLOWUP};
use crate::react::{run_turn, Prompts, TurnContext, TurnEvent, TurnOutcome, TurnRequest};
use crate::tools::{host_registry, ToolExecutor, ToolHost};

/// 后台守卫所需的会话活动状态
#[derive(Debug, Clone)]
struct Activity {
    unresolved_mutations: bool,
    streaming: bool,
    viewed_date: NaiveDate,
    last_user_message_at: Option<Instant>,
}

/// 会话活动监视：记录最近用户消息、是否在流式输出、是否有未处理的变更
pub struct ActivityMonitor {
    state: Mutex<Activity>,
}

impl ActivityMonitor {
    pub fn new(viewed_date: NaiveDate) -> Self {
        Self {
            state: Mutex::new(Activity {
                unresolved_mutations: false,
                streaming: false,
                viewed_date,
                last_user_message_at: None,
            }),
        }
    }

    pub async fn user_message(&self) {
        self.state.lock().await.last_user_message_at = Some(Instant::now());
    }

    pub async fn set_streaming(&self, streaming: bool) {
        self.state.lock().await.streaming = streaming;
    }

    pub async fn mark_mutated(&self) {
        self.state.lock().await.unresolved_mutations = true;
    }

    pub async fn clear_mutations(&self) {
        self.state.lock().await.unresolved_mutations = false;
    }

    /// 切换日期：未处理的变更属于旧日期，一并清除
    pub async fn set_viewed(&self, date: NaiveDate) {
        let mut st = self.state.lock().await;
        st.viewed_date = date;
        st.unresolved_mutations = false;
    }

    pub async fn viewed_date(&self) -> NaiveDate {
        self.state.lock().await.viewed_date
    }

    pub async fn has_unresolved_mutations(&self) -> bool {
        self.state.lock().await.unresolved_mutations
    }
}

struct Guards<H> {
    activity: Arc<ActivityMonitor>,
    host: Arc<H>,
}

#[async_trait]
impl<H: ProposalHost + 'static> GuardSource for Guards<H> {
    async fn snapshot(&self) -> GuardSnapshot {
        let a = self.activity.state.lock().await.clone();
        let proposal_pending = self.host.pending_schedule(a.viewed_date).await.is_some();
        GuardSnapshot {
            unresolved_mutations: a.unresolved_mutations,
            streaming: a.streaming,
            viewed_date: a.viewed_date,
            proposal_pending,
            last_user_message_at: a.last_user_message_at,
        }
    }
}

/// 忙碌标志的持有者，drop 时释放
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 会话门面
pub struct Assistant<H> {
    host: Arc<H>,
    sessions: Mutex<SessionManager>,
    executor: ToolExecutor,
    turn: TurnSection,
    activity: Arc<ActivityMonitor>,
    scheduler: BackgroundScheduler,
    busy: AtomicBool,
    /// 当前会话的取消令牌；切换日期时在拿到会话锁之前先取消，打断进行中的读取
    live_token: Mutex<Option<CancellationToken>>,
    background_rx: Mutex<Option<mpsc::UnboundedReceiver<NaiveDate>>>,
    event_tx: Option<mpsc::UnboundedSender<TurnEvent>>,
}

impl<H: ToolHost + ProposalHost + 'static> Assistant<H> {
    pub fn new(config: &AppConfig, llm: Arc<dyn LlmClient>, host: Arc<H>) -> Self {
        Self::with_prompts(config, llm, host, Prompts::load())
    }

    pub fn with_prompts(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        host: Arc<H>,
        prompts: Prompts,
    ) -> Self {
        let registry = host_registry(host.clone());
        let executor = ToolExecutor::new(registry, config.tools.tool_timeout_secs);
        let sessions = SessionManager::new(llm, executor.specs(), prompts);

        let activity = Arc::new(ActivityMonitor::new(Local::now().date_naive()));
        let guards = Arc::new(Guards {
            activity: activity.clone(),
            host: host.clone(),
        });
        let (bg_tx, bg_rx) = mpsc::unbounded_channel();
        let scheduler = BackgroundScheduler::new(
            &config.scheduler,
            guards,
            Arc::new(move |date| {
                let _ = bg_tx.send(date);
            }),
        );

        Self {
            host,
            sessions: Mutex::new(sessions),
            executor,
            turn: config.turn.clone(),
            activity,
            scheduler,
            busy: AtomicBool::new(false),
            live_token: Mutex::new(None),
            background_rx: Mutex::new(Some(bg_rx)),
            event_tx: None,
        }
    }

    /// 过程事件（流式增量、工具调用、阶段变化）
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 后台编排触发的日期；前端收到后自行决定是否调用 run_orchestration。只能取走一次。
    pub async fn background_triggers(&self) -> Option<mpsc::UnboundedReceiver<NaiveDate>> {
        self.background_rx.lock().await.take()
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn viewed_date(&self) -> NaiveDate {
        self.activity.viewed_date().await
    }

    pub async fn pending_background_job(&self) -> Option<BackgroundJob> {
        self.scheduler.pending_job().await
    }

    fn acquire(&self) -> Result<BusyGuard<'_>, AgentError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AgentError::Busy)?;
        Ok(BusyGuard(&self.busy))
    }

    /// 切换到某天：取消旧会话与后台任务，以该日上下文开启新会话
    pub async fn navigate(&self, date: NaiveDate) -> Result<(), AgentError> {
        let mut ctx = DayContext::new(date, Local::now().date_naive());
        ctx.approval_status = Some(self.host.approval_status(date).await.as_str().to_string());
        ctx.memory_digest = self.host.memory_digest().await;
        self.navigate_with_context(date, ctx.into_block()).await
    }

    /// 以调用方给出的上下文块开启会话
    pub async fn navigate_with_context(
        &self,
        date: NaiveDate,
        block: ContextBlock,
    ) -> Result<(), AgentError> {
        if let Some(token) = self.live_token.lock().await.take() {
            token.cancel();
        }
        // 被打断的 Turn 持有会话锁直到收尾完毕；拿到锁之后再切换日期
        let mut sessions = self.sessions.lock().await;
        self.scheduler.cancel().await;
        self.activity.set_viewed(date).await;
        self.host.set_viewed_date(date).await;

        let session = sessions.start_session(block).await?;
        *self.live_token.lock().await = Some(session.cancel_token());
        info!(%date, mode = %session.mode, "navigated");
        Ok(())
    }

    /// 丢弃当前会话（下一次发送会用系统时钟兜底重建）
    pub async fn reset(&self) {
        if let Some(token) = self.live_token.lock().await.take() {
            token.cancel();
        }
        let mut sessions = self.sessions.lock().await;
        self.scheduler.cancel().await;
        sessions.reset_session();
    }

    /// 普通 Turn
    pub async fn send_message(
        &self,
        text: &str,
        media: Option<MediaBlob>,
    ) -> Result<TurnOutcome, AgentError> {
        let _busy = self.acquire()?;
        self.activity.user_message().await;
        let mut request = TurnRequest::user(text);
        if let Some(m) = media {
            request = request.with_media(m);
        }
        self.run_locked(request).await
    }

    /// 整日重建 Turn（唯一允许 propose_schedule 执行的场景）
    pub async fn run_orchestration(&self, date: NaiveDate) -> Result<TurnOutcome, AgentError> {
        let _busy = self.acquire()?;
        if self.activity.viewed_date().await != date {
            self.navigate(date).await?;
        }
        self.scheduler.cancel().await;
        let outcome = self
            .run_locked(TurnRequest::orchestration(ORCHESTRATION_REQUEST))
            .await?;
        self.activity.clear_mutations().await;
        Ok(outcome)
    }

    pub async fn pending_schedule_proposal(&self, date: NaiveDate) -> Option<ScheduleProposal> {
        self.host.pending_schedule(date).await
    }

    /// 接受提案：原子替换当天任务并生成审批记录
    pub async fn accept_schedule_proposal(
        &self,
        date: NaiveDate,
    ) -> Result<ApprovalRecord, AgentError> {
        let _busy = self.acquire()?;
        let record = self.host.accept_schedule(date).await?;
        if self.activity.viewed_date().await == date {
            self.activity.clear_mutations().await;
            self.scheduler.cancel().await;
        }
        Ok(record)
    }

    /// 拒绝提案，并跑一个跟进 Turn 询问用户想改什么
    pub async fn reject_schedule_proposal(
        &self,
        date: NaiveDate,
    ) -> Result<TurnOutcome, AgentError> {
        let _busy = self.acquire()?;
        self.host.reject_schedule(date).await?;
        self.run_locked(TurnRequest::user(REJECTION_FOLLOWUP)).await
    }

    pub async fn pending_contacts(&self, date: NaiveDate) -> Vec<ContactProposal> {
        self.host.pending_contacts(date).await
    }

    pub async fn accept_contact(
        &self,
        date: NaiveDate,
        id: Uuid,
    ) -> Result<ContactProposal, AgentError> {
        let _busy = self.acquire()?;
        Ok(self.host.accept_contact(date, id).await?)
    }

    pub async fn accept_all_contacts(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<ContactProposal>, AgentError> {
        let _busy = self.acquire()?;
        Ok(self.host.accept_all_contacts(date).await)
    }

    pub async fn reject_contact(
        &self,
        date: NaiveDate,
        id: Uuid,
    ) -> Result<ContactProposal, AgentError> {
        let _busy = self.acquire()?;
        Ok(self.host.reject_contact(date, id).await?)
    }

    /// 尽力而为的 token 估算（UI 展示用）；Turn 进行中不等待会话锁，改用本地估算
    pub async fn token_count(&self, text: &str) -> usize {
        match self.sessions.try_lock() {
            Ok(sessions) => sessions.token_count(text).await,
            Err(_) => estimate_tokens(text),
        }
    }

    /// 调用方已持有忙碌标志
    ///
    /// 会话锁覆盖整个 Turn 与变更登记，查看日期在此期间不会变化；后台编排只针对 Turn 开始时的日期。
    async fn run_locked(&self, request: TurnRequest) -> Result<TurnOutcome, AgentError> {
        let orchestration = request.orchestration;
        let mut sessions = self.sessions.lock().await;
        let turn_date = self.activity.viewed_date().await;

        self.activity.set_streaming(true).await;
        let result = self.drive(&mut sessions, request).await;
        self.activity.set_streaming(false).await;
        let outcome = result?;

        if outcome.touched_tasks() && !orchestration {
            if self.activity.viewed_date().await == turn_date {
                self.activity.mark_mutated().await;
                self.scheduler.schedule(turn_date).await;
            } else {
                debug!(%turn_date, "viewed date changed during turn; background orchestration skipped");
            }
        }
        Ok(outcome)
    }

    async fn drive(
        &self,
        sessions: &mut SessionManager,
        request: TurnRequest,
    ) -> Result<TurnOutcome, AgentError> {
        let had_session = sessions.has_session();
        let session = sessions.ensure_session().await?;
        if !had_session {
            *self.live_token.lock().await = Some(session.cancel_token());
        }
        if session.target_date != self.activity.viewed_date().await {
            debug!(session_date = %session.target_date, "session date differs from viewed date");
        }
        let mut ctx = TurnContext::new(&self.executor, &self.turn);
        if let Some(tx) = &self.event_tx {
            ctx = ctx.with_event_tx(tx);
        }
        run_turn(&ctx, session, request).await
    }
}
