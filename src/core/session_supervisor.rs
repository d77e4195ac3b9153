//! 会话管理：生命周期、取消
//!
//! 任一时刻只持有一个会话句柄。start_session 拼装 system 指令（基础策略 + 模式策略 + 上下文块），
//! 打开新句柄并签发新的 CancellationToken（旧 token 立即取消，仍在读旧流的操作随之中止）。

use std::sync::{Arc, OnceLock};

use chrono::{Local, NaiveDate};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::temporal::{classify, TemporalMode};
use crate::core::AgentError;
use crate::llm::{ChatHandle, LlmClient, ToolSpec};
use crate::react::prompts::Prompts;

/// 调用方提供的上下文块：自由文本，可附带显式元数据
#[derive(Debug, Clone, Default)]
pub struct ContextBlock {
    pub text: String,
    pub target_date: Option<NaiveDate>,
    pub today: Option<NaiveDate>,
    pub mode: Option<TemporalMode>,
}

impl ContextBlock {
    /// 无元数据的原始文本，模式由启发式推断
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// 结构化的单日上下文，渲染为 ContextBlock
#[derive(Debug, Clone)]
pub struct DayContext {
    pub target_date: NaiveDate,
    pub today: NaiveDate,
    pub timezone: String,
    pub approval_status: Option<String>,
    pub user_mode: Option<String>,
    pub memory_digest: Option<String>,
}

impl DayContext {
    pub fn new(target_date: NaiveDate, today: NaiveDate) -> Self {
        Self {
            target_date,
            today,
            timezone: Local::now().format("%:z").to_string(),
            approval_status: None,
            user_mode: None,
            memory_digest: None,
        }
    }

    pub fn into_block(self) -> ContextBlock {
        let mode = classify(self.target_date, self.today);
        let mut text = format!(
            "Target date: {}\nCurrent date: {}\nMode: {}\nTimezone: {}",
            self.target_date, self.today, mode, self.timezone
        );
        if let Some(s) = &self.approval_status {
            text.push_str(&format!("\nApproval status: {s}"));
        }
        if let Some(s) = &self.user_mode {
            text.push_str(&format!("\nUser mode: {s}"));
        }
        if let Some(s) = &self.memory_digest {
            text.push_str(&format!("\nMemory:\n{s}"));
        }
        ContextBlock {
            text,
            target_date: Some(self.target_date),
            today: Some(self.today),
            mode: Some(mode),
        }
    }
}

fn line_regex(label: &'static str, cell: &'static OnceLock<Option<Regex>>) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(&format!(r"(?im)^\s*{label}\s*:\s*(\S+)")).ok())
        .as_ref()
}

fn scan_date(text: &str, label: &'static str, cell: &'static OnceLock<Option<Regex>>) -> Option<NaiveDate> {
    let re = line_regex(label, cell)?;
    let caps = re.captures(text)?;
    NaiveDate::parse_from_str(caps.get(1)?.as_str(), "%Y-%m-%d").ok()
}

static TARGET_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TODAY_RE: OnceLock<Option<Regex>> = OnceLock::new();
static MODE_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 解析出的目标日与模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedContext {
    pub target_date: NaiveDate,
    pub mode: TemporalMode,
}

/// 优先级：显式模式 > 显式日期 > 文本中的 Mode 行 > 文本中的日期行 > 视为今天
pub fn resolve_context(block: &ContextBlock, wall_clock_today: NaiveDate) -> ResolvedContext {
    let target = block
        .target_date
        .or_else(|| scan_date(&block.text, "target date", &TARGET_RE));
    let today = block
        .today
        .or_else(|| scan_date(&block.text, "current date", &TODAY_RE))
        .unwrap_or(wall_clock_today);
    let target_date = target.unwrap_or(today);

    let scanned_mode = || {
        let re = line_regex("mode", &MODE_RE)?;
        let caps = re.captures(&block.text)?;
        TemporalMode::parse_loose(caps.get(1)?.as_str())
    };
    let mode = block
        .mode
        .or_else(|| {
            block
                .target_date
                .zip(block.today)
                .map(|(t, d)| classify(t, d))
        })
        .or_else(scanned_mode)
        .unwrap_or_else(|| classify(target_date, today));
    ResolvedContext { target_date, mode }
}

/// 一个活跃会话
pub struct Session {
    pub id: Uuid,
    pub target_date: NaiveDate,
    pub mode: TemporalMode,
    pub instructions: String,
    cancel_token: CancellationToken,
    handle: Box<dyn ChatHandle>,
}

impl Session {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn handle_mut(&mut self) -> &mut dyn ChatHandle {
        self.handle.as_mut()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target_date", &self.target_date)
            .field("mode", &self.mode)
            .finish()
    }
}

/// 会话管理器：持有 LLM、工具声明与提示词，同一时刻至多一个 Session
pub struct SessionManager {
    llm: Arc<dyn LlmClient>,
    tools: Vec<ToolSpec>,
    prompts: Prompts,
    current: Option<Session>,
}

impl SessionManager {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Vec<ToolSpec>, prompts: Prompts) -> Self {
        Self {
            llm,
            tools,
            prompts,
            current: None,
        }
    }

    /// 拼装 system 指令：基础策略 + 模式策略 + 上下文块
    pub fn build_instructions(&self, mode: TemporalMode, block: &ContextBlock) -> String {
        format!(
            "{}\n\n{}\n\n[Context]\n{}",
            self.prompts.base,
            self.prompts.mode_policy(mode),
            block.text.trim()
        )
    }

    /// 开启新会话：旧会话 token 立即取消，句柄被替换
    pub async fn start_session(&mut self, block: ContextBlock) -> Result<&mut Session, AgentError> {
        self.reset_session();
        let resolved = resolve_context(&block, Local::now().date_naive());
        let instructions = self.build_instructions(resolved.mode, &block);
        let handle = self.llm.open_chat(&instructions, &self.tools).await?;
        let session = Session {
            id: Uuid::new_v4(),
            target_date: resolved.target_date,
            mode: resolved.mode,
            instructions,
            cancel_token: CancellationToken::new(),
            handle,
        };
        tracing::info!(
            session = %session.id,
            date = %session.target_date,
            mode = %session.mode,
            "session started"
        );
        Ok(self.current.insert(session))
    }

    /// 硬重置：取消进行中的读取并丢弃句柄
    pub fn reset_session(&mut self) {
        if let Some(old) = self.current.take() {
            old.cancel_token.cancel();
            tracing::debug!(session = %old.id, "session reset");
        }
    }

    /// 无会话时快速失败
    pub fn require_session(&mut self) -> Result<&mut Session, AgentError> {
        self.current.as_mut().ok_or(AgentError::NoSession)
    }

    /// 兜底：调用顺序异常导致无会话时，用系统时钟合成最小上下文并告警
    pub async fn ensure_session(&mut self) -> Result<&mut Session, AgentError> {
        if self.current.is_none() {
            let today = Local::now().date_naive();
            tracing::warn!(%today, "send without session; synthesizing minimal context from wall clock");
            let block = ContextBlock {
                text: format!("Target date: {today}\nCurrent date: {today}"),
                target_date: Some(today),
                today: Some(today),
                mode: None,
            };
            return self.start_session(block).await;
        }
        self.require_session()
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.current.is_some()
    }

    /// 尽力而为的 token 估算，失败时返回 0
    pub async fn token_count(&self, text: &str) -> usize {
        match self.llm.count_tokens(text).await {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "token count failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn manager(client: &ScriptedLlmClient) -> SessionManager {
        SessionManager::new(Arc::new(client.clone()), Vec::new(), Prompts::default())
    }

    #[test]
    fn test_resolve_prefers_explicit_metadata() {
        let block = DayContext::new(d(2026, 10, 18), d(2026, 10, 19)).into_block();
        let r = resolve_context(&block, d(2000, 1, 1));
        assert_eq!(r.mode, TemporalMode::Retrospective);
        assert_eq!(r.target_date, d(2026, 10, 18));
    }

    #[test]
    fn test_resolve_scans_text_when_metadata_absent() {
        let block = ContextBlock::raw("Target date: 2026-10-21\nCurrent date: 2026-10-19\nTimezone: +08:00");
        let r = resolve_context(&block, d(2000, 1, 1));
        assert_eq!(r.mode, TemporalMode::Prospective);
        assert_eq!(r.target_date, d(2026, 10, 21));

        let block = ContextBlock::raw("mode: retrospective\nsome notes");
        assert_eq!(resolve_context(&block, d(2026, 10, 19)).mode, TemporalMode::Retrospective);
    }

    #[test]
    fn test_resolve_defaults_to_wall_clock_today() {
        let r = resolve_context(&ContextBlock::raw("nothing useful"), d(2026, 10, 19));
        assert_eq!(r.mode, TemporalMode::RealTime);
        assert_eq!(r.target_date, d(2026, 10, 19));
    }

    #[tokio::test]
    async fn test_start_session_builds_instructions_and_replaces_token() {
        let client = ScriptedLlmClient::default();
        let mut mgr = manager(&client);
        let first = mgr
            .start_session(DayContext::new(d(2026, 10, 20), d(2026, 10, 19)).into_block())
            .await
            .unwrap();
        assert_eq!(first.mode, TemporalMode::Prospective);
        let old_token = first.cancel_token();

        mgr.start_session(DayContext::new(d(2026, 10, 19), d(2026, 10, 19)).into_block())
            .await
            .unwrap();
        assert!(old_token.is_cancelled());
        assert!(!mgr.require_session().unwrap().is_cancelled());

        let instructions = client.instructions();
        assert_eq!(instructions.len(), 2);
        assert!(instructions[0].contains("MODE: PROSPECTIVE"));
        assert!(instructions[1].contains("MODE: REAL-TIME"));
        assert!(instructions[1].contains("Target date: 2026-10-19"));
    }

    #[tokio::test]
    async fn test_reset_cancels_and_requires_restart() {
        let client = ScriptedLlmClient::default();
        let mut mgr = manager(&client);
        let token = mgr
            .start_session(ContextBlock::raw("Target date: 2026-10-19"))
            .await
            .unwrap()
            .cancel_token();
        mgr.reset_session();
        assert!(token.is_cancelled());
        assert!(matches!(mgr.require_session(), Err(AgentError::NoSession)));
    }

    #[tokio::test]
    async fn test_ensure_session_falls_back_to_wall_clock() {
        let client = ScriptedLlmClient::default();
        let mut mgr = manager(&client);
        let s = mgr.ensure_session().await.unwrap();
        assert_eq!(s.mode, TemporalMode::RealTime);
        assert_eq!(s.target_date, Local::now().date_naive());
    }

    #[tokio::test]
    async fn test_token_count_is_best_effort() {
        let client = ScriptedLlmClient::default();
        let mgr = manager(&client);
        assert!(mgr.token_count("plan my day please").await > 0);
        assert_eq!(mgr.token_count("").await, 0);
    }
}
