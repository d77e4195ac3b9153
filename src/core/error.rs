//! Agent 错误类型
//!
//! 可恢复的错误（超时、协议错误）在 Turn 执行器内部被吸收并转为用户可见文本；
//! 只有无部分文本可返回、或配置错误时才会向调用方传播。

use thiserror::Error;

use crate::llm::LlmError;
use crate::proposal::ProposalError;

/// 发生超时的阻塞点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// 首轮流式读取
    InitialStream,
    /// 工具结果回传后的后续流
    FollowupStream,
    /// 强制补救轮的流
    RescueStream,
    /// 流结束后获取最终响应
    Finalize,
}

impl std::fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeoutStage::InitialStream => "initial stream",
            TimeoutStage::FollowupStream => "follow-up stream",
            TimeoutStage::RescueStream => "rescue stream",
            TimeoutStage::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// 引擎运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 缺少凭据等启动期错误，致命
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Timeout during {stage} after {secs}s")]
    Timeout { stage: TimeoutStage, secs: u64 },

    /// 传输层返回了无法解析的数据
    #[error("Stream protocol error: {0}")]
    StreamProtocol(String),

    #[error("LLM error: {0}")]
    LlmError(LlmError),

    #[error("No active session")]
    NoSession,

    /// 上一个 Turn 或提案操作尚未结束
    #[error("Another operation is in progress")]
    Busy,

    #[error("Cancelled")]
    Cancelled,

    /// 提案操作失败（去抖窗口内、无待审提案、应用失败已回滚）
    #[error(transparent)]
    Proposal(#[from] ProposalError),
}

impl AgentError {
    /// 是否属于「有部分文本即可软成功」的可恢复错误
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::Timeout { .. }
                | AgentError::StreamProtocol(_)
                | AgentError::Cancelled
                | AgentError::LlmError(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Timeout { .. })
    }
}

impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::MissingCredentials(msg) => AgentError::ConfigError(msg),
            LlmError::Protocol(msg) => AgentError::StreamProtocol(msg),
            other => AgentError::LlmError(other),
        }
    }
}
