//! 脚本化 LLM 客户端（用于测试，无需 API）
//!
//! 每次 send 按顺序弹出一个 ScriptedReply：逐段输出文本（每段可带延迟），
//! 可在末尾停顿以模拟「模型沉默」，最终响应中返回预设的工具调用。
//! 所有提交与 system 指令都会被记录，便于断言。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use futures_util::FutureExt;

use crate::llm::{
    ChatHandle, FinalResponse, LlmClient, LlmError, ResponseStream, StreamChunk, Submission,
    ToolCallRequest, ToolSpec,
};

/// 单段输出
#[derive(Debug, Clone, Default)]
pub struct ScriptedChunk {
    pub delay: Duration,
    pub text: String,
    pub reasoning: String,
}

/// 一次 send 的脚本
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    pub chunks: Vec<ScriptedChunk>,
    /// 最后一段之后、流结束之前的停顿
    pub stall: Option<Duration>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finalize_delay: Duration,
    /// 设置后 send 直接失败
    pub send_error: Option<LlmError>,
    /// 设置后流在输出完 chunks 后产出一个错误
    pub stream_error: Option<LlmError>,
}

impl ScriptedReply {
    /// 一段立即输出的文本
    pub fn text(text: impl Into<String>) -> Self {
        Self::default().chunk(Duration::ZERO, text)
    }

    /// 不输出任何内容
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn chunk(mut self, delay: Duration, text: impl Into<String>) -> Self {
        self.chunks.push(ScriptedChunk {
            delay,
            text: text.into(),
            reasoning: String::new(),
        });
        self
    }

    pub fn reasoning(mut self, text: impl Into<String>) -> Self {
        self.chunks.push(ScriptedChunk {
            delay: Duration::ZERO,
            text: String::new(),
            reasoning: text.into(),
        });
        self
    }

    pub fn tool_call(mut self, name: &str, args: serde_json::Value) -> Self {
        let id = format!("call_{}", self.tool_calls.len());
        self.tool_calls.push(ToolCallRequest {
            id: Some(id),
            name: name.to_string(),
            args,
        });
        self
    }

    pub fn then_stall(mut self, stall: Duration) -> Self {
        self.stall = Some(stall);
        self
    }

    pub fn finalize_after(mut self, delay: Duration) -> Self {
        self.finalize_delay = delay;
        self
    }

    pub fn fail_send(mut self, err: LlmError) -> Self {
        self.send_error = Some(err);
        self
    }

    pub fn fail_stream(mut self, err: LlmError) -> Self {
        self.stream_error = Some(err);
        self
    }
}

#[derive(Default)]
struct Shared {
    replies: VecDeque<ScriptedReply>,
    submissions: Vec<Submission>,
    instructions: Vec<String>,
    tool_names: Vec<String>,
}

/// 脚本化客户端：replies 用尽后返回空回复
#[derive(Clone, Default)]
pub struct ScriptedLlmClient {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedLlmClient {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        let client = Self::default();
        client.push_replies(replies);
        client
    }

    pub fn push_replies(&self, replies: Vec<ScriptedReply>) {
        if let Ok(mut s) = self.shared.lock() {
            s.replies.extend(replies);
        }
    }

    /// 已记录的全部提交（跨会话）
    pub fn submissions(&self) -> Vec<Submission> {
        self.shared
            .lock()
            .map(|s| s.submissions.clone())
            .unwrap_or_default()
    }

    /// 每次 open_chat 收到的 system 指令
    pub fn instructions(&self) -> Vec<String> {
        self.shared
            .lock()
            .map(|s| s.instructions.clone())
            .unwrap_or_default()
    }

    /// 最近一次 open_chat 声明的工具名
    pub fn declared_tools(&self) -> Vec<String> {
        self.shared
            .lock()
            .map(|s| s.tool_names.clone())
            .unwrap_or_default()
    }

    pub fn remaining_replies(&self) -> usize {
        self.shared.lock().map(|s| s.replies.len()).unwrap_or(0)
    }
}

struct ScriptedChat {
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn open_chat(
        &self,
        instructions: &str,
        tools: &[ToolSpec],
    ) -> Result<Box<dyn ChatHandle>, LlmError> {
        if let Ok(mut s) = self.shared.lock() {
            s.instructions.push(instructions.to_string());
            s.tool_names = tools.iter().map(|t| t.name.clone()).collect();
        }
        Ok(Box::new(ScriptedChat {
            shared: self.shared.clone(),
        }))
    }
}

#[async_trait]
impl ChatHandle for ScriptedChat {
    async fn send(&mut self, submission: Submission) -> Result<ResponseStream, LlmError> {
        let reply = {
            let mut s = self
                .shared
                .lock()
                .map_err(|_| LlmError::ApiError("script poisoned".into()))?;
            s.submissions.push(submission);
            s.replies.pop_front().unwrap_or_default()
        };
        if let Some(err) = reply.send_error {
            return Err(err);
        }

        let ScriptedReply {
            chunks,
            stall,
            tool_calls,
            finalize_delay,
            stream_error,
            ..
        } = reply;

        enum Step {
            Chunk(ScriptedChunk),
            Stall(Duration),
            Fail(LlmError),
        }
        let mut steps: VecDeque<Step> = chunks.into_iter().map(Step::Chunk).collect();
        if let Some(err) = stream_error {
            steps.push_back(Step::Fail(err));
        }
        if let Some(d) = stall {
            steps.push_back(Step::Stall(d));
        }

        let chunks = stream::unfold(steps, |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    Step::Chunk(c) => {
                        if !c.delay.is_zero() {
                            tokio::time::sleep(c.delay).await;
                        }
                        let item = Ok(StreamChunk {
                            text: c.text,
                            reasoning: c.reasoning,
                        });
                        return Some((item, steps));
                    }
                    Step::Stall(d) => {
                        tokio::time::sleep(d).await;
                    }
                    Step::Fail(e) => return Some((Err(e), steps)),
                }
            }
        });

        let finalized = async move {
            if !finalize_delay.is_zero() {
                tokio::time::sleep(finalize_delay).await;
            }
            Ok(FinalResponse { tool_calls })
        };

        Ok(ResponseStream {
            chunks: Box::pin(chunks),
            finalized: finalized.boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_scripted_reply_streams_chunks_and_tool_calls() {
        let client = ScriptedLlmClient::new(vec![ScriptedReply::text("hello ")
            .chunk(Duration::ZERO, "world")
            .tool_call("get_tasks", serde_json::json!({"date": "2026-10-19"}))]);
        let mut chat = client.open_chat("sys", &[]).await.unwrap();
        let mut resp = chat.send(Submission::user("hi")).await.unwrap();
        let mut text = String::new();
        while let Some(c) = resp.chunks.next().await {
            text.push_str(&c.unwrap().text);
        }
        assert_eq!(text, "hello world");
        let fin = resp.finalized.await.unwrap();
        assert_eq!(fin.tool_calls.len(), 1);
        assert_eq!(client.submissions().len(), 1);
        assert_eq!(client.instructions(), vec!["sys".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_script_yields_empty_reply() {
        let client = ScriptedLlmClient::default();
        let mut chat = client.open_chat("sys", &[]).await.unwrap();
        let mut resp = chat.send(Submission::user("hi")).await.unwrap();
        assert!(resp.chunks.next().await.is_none());
        assert!(resp.finalized.await.unwrap().tool_calls.is_empty());
    }
}
