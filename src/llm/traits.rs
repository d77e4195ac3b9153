//! LLM 客户端抽象
//!
//! LlmClient 负责打开一个带 system 指令与工具声明的会话句柄（ChatHandle）；
//! 每次 send 返回 ResponseStream：增量文本流 + 流结束后可获取的最终响应（含工具调用）。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::tokenizer::estimate_tokens;

/// LLM 层错误；is_transient 决定是否值得重试
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Request rejected {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    /// 流帧或最终响应格式错误
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("API error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// 网络抖动、限流、5xx 视为瞬时错误；凭据、4xx、协议错误视为致命
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Server { .. } | LlmError::Network(_)
        )
    }

    /// 服务端给出的最短等待时间（限流时）
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }
}

/// 提供给模型的工具声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 内联媒体（已由调用方压缩并 base64 编码）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaBlob {
    pub mime_type: String,
    pub data_base64: String,
}

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// 提供方分配的调用 id（回传结果时需要）
    pub id: Option<String>,
    pub name: String,
    pub args: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            args,
        }
    }
}

/// 回传给模型的单个工具结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub call_id: Option<String>,
    pub name: String,
    /// 成功载荷或 {"error": "..."}
    pub payload: serde_json::Value,
}

/// 一次提交：用户输入，或一整批工具结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Submission {
    User {
        text: String,
        media: Option<MediaBlob>,
    },
    ToolResults { results: Vec<ToolResponse> },
}

impl Submission {
    pub fn user(text: impl Into<String>) -> Self {
        Submission::User {
            text: text.into(),
            media: None,
        }
    }
}

/// 流中的一个增量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub text: String,
    /// 推理轨迹增量（部分模型提供）
    pub reasoning: String,
}

/// 流结束后的最终响应
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalResponse {
    pub tool_calls: Vec<ToolCallRequest>,
}

/// send 的返回：增量流 + 最终响应（需在流读完后 await）
pub struct ResponseStream {
    pub chunks: BoxStream<'static, Result<StreamChunk, LlmError>>,
    pub finalized: BoxFuture<'static, Result<FinalResponse, LlmError>>,
}

/// 会话句柄：持有对话历史，按顺序提交
#[async_trait]
pub trait ChatHandle: Send {
    async fn send(&mut self, submission: Submission) -> Result<ResponseStream, LlmError>;
}

/// LLM 客户端 trait：打开会话、估算 token
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 以 system 指令与工具声明打开一个新会话
    async fn open_chat(
        &self,
        instructions: &str,
        tools: &[ToolSpec],
    ) -> Result<Box<dyn ChatHandle>, LlmError>;

    /// token 数估算；默认本地启发式，具体实现可覆盖为远程计数
    async fn count_tokens(&self, text: &str) -> Result<usize, LlmError> {
        Ok(estimate_tokens(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::RateLimited { retry_after_ms: 10 }.is_transient());
        assert!(LlmError::Server { status: 503, body: String::new() }.is_transient());
        assert!(LlmError::Network("reset".into()).is_transient());
        assert!(!LlmError::MissingCredentials("k".into()).is_transient());
        assert!(!LlmError::Rejected { status: 400, body: String::new() }.is_transient());
        assert!(!LlmError::Protocol("x".into()).is_transient());
    }

    #[test]
    fn test_submission_serializes_with_kind_tag() {
        let v = serde_json::to_value(Submission::user("hi")).unwrap();
        assert_eq!(v["kind"], "user");
        assert_eq!(v["text"], "hi");
    }
}
