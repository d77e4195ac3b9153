//! Turn 执行器：单个用户 Turn 的状态机
//!
//! 流式读取 -> 取最终响应中的工具调用 -> 按序串行执行 -> 结果整批回传 -> 读后续流（最多 max_tool_rounds 轮工具）；
//! 编排类 Turn 若始终没有执行 propose_schedule，则追加且仅追加一次强制补救轮。
//! 每个阻塞点都有超时；已有部分文本时超时视为软成功。

use std::time::Duration;

use chrono::Local;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::TurnSection;
use crate::core::session_supervisor::Session;
use crate::core::{AgentError, TimeoutStage, TurnPhase};
use crate::llm::{ChatHandle, MediaBlob, Submission, ToolCallRequest, ToolResponse};
use crate::react::events::{Checkpoint, TurnEvent};
use crate::react::fallback::{answer_too_short, applied_mutation, synthesize_ack, MutationTally};
use crate::react::prompts::{turn_footer, RESCUE_PROMPT};
use crate::tools::{
    MutationKind, ToolCall, ToolEffect, ToolExecutor, ToolPayload, ToolResult, PROPOSE_SCHEDULE,
};

/// propose_schedule 出现在非编排 Turn 时回传给模型的说明
pub const PROPOSE_BLOCKED: &str = "propose_schedule was not executed: it is only available when the \
user explicitly asks to rebuild the whole day's schedule. Make targeted changes with add_tasks, \
move_tasks, update_task or delete_tasks instead.";

/// 一次 Turn 的输入
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub text: String,
    pub media: Option<MediaBlob>,
    /// 是否为整天重建（唯一允许执行 propose_schedule 的场景）
    pub orchestration: bool,
}

impl TurnRequest {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: None,
            orchestration: false,
        }
    }

    pub fn orchestration(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: None,
            orchestration: true,
        }
    }

    pub fn with_media(mut self, media: MediaBlob) -> Self {
        self.media = Some(media);
        self
    }
}

/// Turn 结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnOutcome {
    /// 最终展示的文本（可能含兜底确认）
    pub text: String,
    pub reasoning: String,
    /// 按执行顺序
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    /// 读取过的流数量
    pub streams: usize,
    pub tool_rounds: usize,
    pub fallback_used: bool,
    pub rescue_attempted: bool,
    pub proposal_executed: bool,
    /// 软成功时的中断原因
    pub interrupted: Option<String>,
    #[serde(skip)]
    pub mutations: MutationTally,
}

impl TurnOutcome {
    pub fn touched_tasks(&self) -> bool {
        self.mutations.touched_tasks()
    }

    pub fn proposed_schedule(&self) -> bool {
        self.mutations.count(MutationKind::ScheduleProposed) > 0
    }
}

/// 运行 Turn 所需的依赖（借用）
pub struct TurnContext<'a> {
    pub executor: &'a ToolExecutor,
    pub config: &'a TurnSection,
    /// 可选：进度与过程事件
    pub event_tx: Option<&'a mpsc::UnboundedSender<TurnEvent>>,
}

impl<'a> TurnContext<'a> {
    pub fn new(executor: &'a ToolExecutor, config: &'a TurnSection) -> Self {
        Self {
            executor,
            config,
            event_tx: None,
        }
    }

    pub fn with_event_tx(mut self, tx: &'a mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn send_event(&self, ev: TurnEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }
}

/// Turn 内部累计状态
struct TurnState {
    orchestration: bool,
    answer: String,
    reasoning: String,
    last_activity: Instant,
    streams: usize,
    tool_rounds: usize,
    calls: Vec<ToolCall>,
    results: Vec<ToolResult>,
    tally: MutationTally,
    proposal_executed: bool,
    rescue_attempted: bool,
}

impl TurnState {
    fn new(orchestration: bool) -> Self {
        Self {
            orchestration,
            answer: String::new(),
            reasoning: String::new(),
            last_activity: Instant::now(),
            streams: 0,
            tool_rounds: 0,
            calls: Vec::new(),
            results: Vec::new(),
            tally: MutationTally::default(),
            proposal_executed: false,
            rescue_attempted: false,
        }
    }

    /// 出错时是否还有可交付的内容
    fn has_salvage(&self) -> bool {
        !self.answer.is_empty() || !self.tally.is_empty()
    }

    fn progress(&self, ctx: &TurnContext<'_>, checkpoint: Option<Checkpoint>) {
        ctx.send_event(TurnEvent::Progress {
            answer: self.answer.clone(),
            reasoning: self.reasoning.clone(),
            checkpoint,
        });
    }

    fn phase(&self, ctx: &TurnContext<'_>, phase: TurnPhase) {
        tracing::debug!(?phase, round = self.tool_rounds, "turn phase");
        ctx.send_event(TurnEvent::Phase {
            phase,
            round: self.tool_rounds,
        });
    }

    /// 提交一次并读完流，返回最终响应中的工具调用
    async fn stream_round(
        &mut self,
        ctx: &TurnContext<'_>,
        handle: &mut dyn ChatHandle,
        submission: Submission,
        stage: TimeoutStage,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolCallRequest>, AgentError> {
        let chunk_timeout = ctx.config.chunk_timeout(self.orchestration);
        let timeout_err = |d: Duration| AgentError::Timeout {
            stage,
            secs: d.as_secs(),
        };
        self.streams += 1;

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = timeout(chunk_timeout, handle.send(submission)) => r,
        };
        let mut response = sent.map_err(|_| timeout_err(chunk_timeout))??;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = timeout(chunk_timeout, response.chunks.next()) => r,
            };
            match next {
                Err(_) => {
                    tracing::warn!(
                        %stage,
                        idle_ms = self.last_activity.elapsed().as_millis() as u64,
                        partial_chars = self.answer.chars().count(),
                        "stream chunk timeout"
                    );
                    return Err(timeout_err(chunk_timeout));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(chunk))) => {
                    self.answer.push_str(&chunk.text);
                    self.reasoning.push_str(&chunk.reasoning);
                    self.last_activity = Instant::now();
                    self.progress(ctx, None);
                }
            }
        }

        let finalize_timeout = ctx.config.finalize_timeout(self.orchestration);
        let finalized = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = timeout(finalize_timeout, response.finalized) => r,
        };
        let finalized = finalized.map_err(|_| AgentError::Timeout {
            stage: TimeoutStage::Finalize,
            secs: finalize_timeout.as_secs(),
        })??;
        Ok(finalized.tool_calls)
    }

    /// 按请求顺序串行执行一批工具；单个失败不影响其余
    async fn execute_batch(
        &mut self,
        ctx: &TurnContext<'_>,
        requested: Vec<ToolCallRequest>,
    ) -> Vec<ToolResponse> {
        self.tool_rounds += 1;
        let round = self.tool_rounds;
        let mut responses = Vec::with_capacity(requested.len());

        for req in requested {
            let call = ToolCall {
                id: req.id,
                name: req.name,
                args: req.args,
                round,
            };
            ctx.send_event(TurnEvent::ToolCall {
                tool: call.name.clone(),
                args: call.args.clone(),
                round,
            });

            let is_proposal = call.name == PROPOSE_SCHEDULE;
            let result = if is_proposal && !self.orchestration {
                tracing::info!(round, "propose_schedule blocked outside orchestration turn");
                ToolResult::policy_blocked(&call, PROPOSE_BLOCKED)
            } else {
                ctx.executor.execute(&call).await
            };

            if is_proposal && result.was_executed() {
                self.proposal_executed = true;
            }
            if let (Some(ToolEffect::Mutating(kind)), ToolPayload::Success(payload)) =
                (ctx.executor.effect_of(&call.name), &result.payload)
            {
                if let Some((kind, count)) = applied_mutation(kind, payload) {
                    self.tally.record(kind, count);
                }
            }

            ctx.send_event(TurnEvent::ToolResult {
                tool: call.name.clone(),
                status: result.status,
                round,
            });
            responses.push(result.to_response());
            self.calls.push(call);
            self.results.push(result);
        }
        responses
    }

    /// 主回合 + 可选补救
    async fn drive(
        &mut self,
        ctx: &TurnContext<'_>,
        session: &mut Session,
        first: Submission,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let mut submission = first;
        let mut stage = TimeoutStage::InitialStream;
        self.phase(ctx, TurnPhase::Streaming);

        loop {
            let requested = self
                .stream_round(ctx, session.handle_mut(), submission, stage, cancel)
                .await?;
            if requested.is_empty() {
                break;
            }
            if self.tool_rounds >= ctx.config.max_tool_rounds {
                tracing::warn!(
                    ignored = requested.len(),
                    "tool round cap reached; ignoring further tool calls"
                );
                break;
            }
            self.phase(ctx, TurnPhase::ExecutingTools);
            let results = self.execute_batch(ctx, requested).await;
            self.progress(ctx, Some(Checkpoint::AfterTools));
            submission = Submission::ToolResults { results };
            stage = TimeoutStage::FollowupStream;
            self.phase(ctx, TurnPhase::StreamingFollowup);
        }

        if self.orchestration && !self.proposal_executed {
            self.rescue(ctx, session, cancel).await?;
        }
        Ok(())
    }

    /// 强制补救轮：只发一次，之后无论结果如何都结束
    async fn rescue(
        &mut self,
        ctx: &TurnContext<'_>,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        tracing::info!("orchestration turn without propose_schedule; issuing rescue");
        self.rescue_attempted = true;
        self.progress(ctx, Some(Checkpoint::BeforeRescue));
        self.phase(ctx, TurnPhase::Rescue);

        let requested = self
            .stream_round(
                ctx,
                session.handle_mut(),
                Submission::user(RESCUE_PROMPT),
                TimeoutStage::RescueStream,
                cancel,
            )
            .await?;
        if !requested.is_empty() {
            let results = self.execute_batch(ctx, requested).await;
            self.progress(ctx, Some(Checkpoint::AfterTools));
            // 确认轮中再请求的工具不再执行
            let ignored = self
                .stream_round(
                    ctx,
                    session.handle_mut(),
                    Submission::ToolResults { results },
                    TimeoutStage::RescueStream,
                    cancel,
                )
                .await?;
            if !ignored.is_empty() {
                tracing::warn!(ignored = ignored.len(), "tool calls after rescue ignored");
            }
        }
        if !self.proposal_executed {
            tracing::warn!("rescue round ended without a proposal");
        }
        self.progress(ctx, Some(Checkpoint::AfterRescue));
        Ok(())
    }

    fn finish(self, min_answer_chars: usize, interrupted: Option<String>) -> TurnOutcome {
        let mut text = self.answer;
        let mut fallback_used = false;
        if answer_too_short(&text, min_answer_chars) {
            if let Some(ack) = synthesize_ack(&self.tally) {
                text = if text.trim().is_empty() {
                    ack
                } else {
                    format!("{} {}", text.trim(), ack)
                };
                fallback_used = true;
            }
        }
        TurnOutcome {
            text,
            reasoning: self.reasoning,
            tool_calls: self.calls,
            tool_results: self.results,
            streams: self.streams,
            tool_rounds: self.tool_rounds,
            fallback_used,
            rescue_attempted: self.rescue_attempted,
            proposal_executed: self.proposal_executed,
            interrupted,
            mutations: self.tally,
        }
    }
}

/// 执行一个 Turn
///
/// 可恢复错误（超时、协议错误、取消、LLM 错误）在已有部分文本或已执行变更时吸收为软成功，
/// 否则向调用方传播。
pub async fn run_turn(
    ctx: &TurnContext<'_>,
    session: &mut Session,
    request: TurnRequest,
) -> Result<TurnOutcome, AgentError> {
    let cancel = session.cancel_token();
    let mut state = TurnState::new(request.orchestration);
    let text = format!("{}{}", request.text, turn_footer(Local::now(), session.mode));
    let first = Submission::User {
        text,
        media: request.media,
    };

    tracing::info!(
        session = %session.id,
        orchestration = request.orchestration,
        "turn started"
    );
    let result = state.drive(ctx, session, first, &cancel).await;

    let interrupted = match result {
        Ok(()) => None,
        Err(e) if e.is_recoverable() && state.has_salvage() => {
            tracing::warn!(error = %e, partial_chars = state.answer.chars().count(), "turn interrupted; returning partial result");
            ctx.send_event(TurnEvent::Interrupted {
                reason: e.to_string(),
                partial: !state.answer.is_empty(),
            });
            Some(e.to_string())
        }
        Err(e) => {
            ctx.send_event(TurnEvent::Interrupted {
                reason: e.to_string(),
                partial: false,
            });
            state.phase(ctx, TurnPhase::Done);
            return Err(e);
        }
    };

    state.phase(ctx, TurnPhase::Done);
    let outcome = state.finish(ctx.config.min_answer_chars, interrupted);
    tracing::info!(
        streams = outcome.streams,
        tool_rounds = outcome.tool_rounds,
        fallback = outcome.fallback_used,
        rescue = outcome.rescue_attempted,
        "turn finished"
    );
    Ok(outcome)
}
