//! OpenAI 兼容 API 客户端
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点（可配置 base_url）的流式 chat/completions；支持 DeepSeek、OpenAI、自建代理等。
//! SSE 帧在后台任务中解析：文本增量经 channel 推给调用方，工具调用增量拼装完毕后作为最终响应交付。
//! 工具参数保持模型给出的原文，只在能解析为 JSON 时转换。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LlmSection;
use crate::core::retry::{retry_with_backoff, RetryPolicy};
use crate::llm::traits::*;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// 未执行的工具调用在历史中的占位结果
const NOT_EXECUTED: &str = "not executed";

struct Inner {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    retry: RetryPolicy,
}

/// OpenAI 兼容客户端
#[derive(Clone)]
pub struct OpenAiClient {
    inner: Arc<Inner>,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                base_url: base_url
                    .unwrap_or(DEFAULT_BASE_URL)
                    .trim_end_matches('/')
                    .to_string(),
                model: model.to_string(),
                api_key: api_key.to_string(),
                retry,
            }),
        }
    }

    /// 从配置创建；API Key 从 api_key_env 指定的环境变量读取，缺失即配置错误
    pub fn from_config(cfg: &LlmSection) -> Result<Self, LlmError> {
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::MissingCredentials(format!("{} is not set", cfg.api_key_env)))?;
        Ok(Self::new(
            cfg.base_url.as_deref(),
            &cfg.model,
            &api_key,
            RetryPolicy::from(&cfg.retry),
        ))
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn open_chat(
        &self,
        instructions: &str,
        tools: &[ToolSpec],
    ) -> Result<Box<dyn ChatHandle>, LlmError> {
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        Ok(Box::new(OpenAiChat {
            inner: self.inner.clone(),
            tools,
            history: Arc::new(Mutex::new(vec![
                json!({ "role": "system", "content": instructions }),
            ])),
            inflight: None,
        }))
    }
}

/// 一个会话：历史在本地维护，每次 send 全量提交
struct OpenAiChat {
    inner: Arc<Inner>,
    tools: Vec<Value>,
    history: Arc<Mutex<Vec<Value>>>,
    inflight: Option<JoinHandle<()>>,
}

impl Drop for OpenAiChat {
    fn drop(&mut self) {
        if let Some(h) = self.inflight.take() {
            h.abort();
        }
    }
}

#[async_trait]
impl ChatHandle for OpenAiChat {
    async fn send(&mut self, submission: Submission) -> Result<ResponseStream, LlmError> {
        // 上一次的流若被调用方放弃（超时 / 取消），其回复不再写入历史
        if let Some(h) = self.inflight.take() {
            h.abort();
        }
        let messages = {
            let mut history = self.history.lock().await;
            append_submission(&mut history, submission);
            history.clone()
        };

        let mut body = json!({
            "model": self.inner.model,
            "messages": messages,
            "stream": true,
        });
        if !self.tools.is_empty() {
            body["tools"] = Value::Array(self.tools.clone());
        }

        let inner = self.inner.clone();
        let response = retry_with_backoff(&inner.retry, "chat_completions", || {
            let inner = inner.clone();
            let body = body.clone();
            async move { post_stream(&inner, &body).await }
        })
        .await?;

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (final_tx, final_rx) = oneshot::channel();
        let history = self.history.clone();
        self.inflight = Some(tokio::spawn(pump(response, chunk_tx, final_tx, history)));

        let chunks = futures_util::stream::unfold(chunk_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        let finalized = async move {
            match final_rx.await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Protocol(
                    "stream closed without a final response".into(),
                )),
            }
        }
        .boxed();
        Ok(ResponseStream { chunks, finalized })
    }
}

async fn post_stream(inner: &Inner, body: &Value) -> Result<reqwest::Response, LlmError> {
    let url = format!("{}/chat/completions", inner.base_url);
    let response = inner
        .http
        .post(&url)
        .bearer_auth(&inner.api_key)
        .json(body)
        .send()
        .await
        .map_err(|e| LlmError::Network(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs * 1000);
    let text = response.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), text, retry_after_ms))
}

fn classify_status(status: u16, body: String, retry_after_ms: Option<u64>) -> LlmError {
    match status {
        429 => LlmError::RateLimited {
            retry_after_ms: retry_after_ms.unwrap_or(1000),
        },
        401 | 403 => LlmError::MissingCredentials(format!("{status}: {body}")),
        500..=599 => LlmError::Server { status, body },
        _ => LlmError::Rejected { status, body },
    }
}

/// 把提交追加到历史（OpenAI 消息格式）
fn append_submission(history: &mut Vec<Value>, submission: Submission) {
    match submission {
        Submission::User { text, media } => {
            fill_unanswered_calls(history);
            let content = match media {
                None => json!(text),
                Some(m) => json!([
                    { "type": "text", "text": text },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:{};base64,{}", m.mime_type, m.data_base64) }
                    }
                ]),
            };
            history.push(json!({ "role": "user", "content": content }));
        }
        Submission::ToolResults { results } => {
            for r in results {
                history.push(json!({
                    "role": "tool",
                    "tool_call_id": r.call_id.unwrap_or_default(),
                    "content": r.payload.to_string(),
                }));
            }
        }
    }
}

/// 最后一条带 tool_calls 的 assistant 消息若有未回复的调用（超出轮次上限被忽略），补上占位结果，
/// 否则端点会拒绝下一条用户消息
fn fill_unanswered_calls(history: &mut Vec<Value>) {
    let Some(pos) = history
        .iter()
        .rposition(|m| m["role"] == "assistant" && m["tool_calls"].is_array())
    else {
        return;
    };
    if history[pos + 1..].iter().any(|m| m["role"] == "user") {
        return;
    }
    let answered: Vec<String> = history[pos + 1..]
        .iter()
        .filter(|m| m["role"] == "tool")
        .filter_map(|m| m["tool_call_id"].as_str().map(String::from))
        .collect();
    let missing: Vec<String> = history[pos]["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| c["id"].as_str().map(String::from))
                .filter(|id| !answered.contains(id))
                .collect()
        })
        .unwrap_or_default();
    for id in missing {
        history.push(json!({
            "role": "tool",
            "tool_call_id": id,
            "content": json!({ "error": NOT_EXECUTED }).to_string(),
        }));
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// SSE 数据帧的累积器
#[derive(Debug, Default)]
struct SseAssembler {
    text: String,
    reasoning: String,
    calls: BTreeMap<u64, PartialCall>,
    done: bool,
}

impl SseAssembler {
    /// 处理一行 SSE；返回需要推给调用方的增量
    fn feed_line(&mut self, line: &str) -> Result<Option<StreamChunk>, LlmError> {
        let line = line.trim_end_matches('\r');
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }
        let frame: Value = serde_json::from_str(data)
            .map_err(|e| LlmError::Protocol(format!("bad SSE frame: {e}")))?;
        if let Some(err) = frame.get("error") {
            return Err(LlmError::ApiError(err.to_string()));
        }
        let Some(delta) = frame["choices"].get(0).map(|c| &c["delta"]) else {
            return Ok(None);
        };

        let mut chunk = StreamChunk::default();
        if let Some(t) = delta["content"].as_str() {
            chunk.text = t.to_string();
        }
        if let Some(r) = delta["reasoning_content"].as_str() {
            chunk.reasoning = r.to_string();
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for c in calls {
                let index = c["index"].as_u64().unwrap_or(0);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = c["id"].as_str() {
                    entry.id = Some(id.to_string());
                }
                if let Some(name) = c["function"]["name"].as_str() {
                    entry.name.push_str(name);
                }
                if let Some(args) = c["function"]["arguments"].as_str() {
                    entry.arguments.push_str(args);
                }
            }
        }
        self.text.push_str(&chunk.text);
        self.reasoning.push_str(&chunk.reasoning);
        if chunk.text.is_empty() && chunk.reasoning.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }

    /// 历史中的 assistant 消息 + 交付给调用方的最终响应
    fn finish(self) -> (Value, FinalResponse) {
        let mut wire_calls = Vec::new();
        let mut tool_calls = Vec::new();
        for (index, call) in self.calls {
            let id = call.id.unwrap_or_else(|| format!("call_{index}"));
            let args = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.arguments).unwrap_or(Value::String(call.arguments.clone()))
            };
            wire_calls.push(json!({
                "id": id,
                "type": "function",
                "function": { "name": call.name, "arguments": call.arguments },
            }));
            tool_calls.push(ToolCallRequest {
                id: Some(id),
                name: call.name,
                args,
            });
        }
        let content = if self.text.is_empty() {
            Value::Null
        } else {
            Value::String(self.text)
        };
        let mut message = json!({ "role": "assistant", "content": content });
        if !wire_calls.is_empty() {
            message["tool_calls"] = Value::Array(wire_calls);
        }
        (message, FinalResponse { tool_calls })
    }
}

/// 读取响应体，逐行解析 SSE
async fn pump(
    response: reqwest::Response,
    chunk_tx: mpsc::UnboundedSender<Result<StreamChunk, LlmError>>,
    final_tx: oneshot::Sender<Result<FinalResponse, LlmError>>,
    history: Arc<Mutex<Vec<Value>>>,
) {
    let mut body = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut asm = SseAssembler::default();

    'read: while let Some(item) = body.next().await {
        let bytes = match item {
            Ok(b) => b,
            Err(e) => {
                let err = LlmError::Network(e.to_string());
                let _ = chunk_tx.send(Err(err.clone()));
                let _ = final_tx.send(Err(err));
                return;
            }
        };
        buf.extend_from_slice(&bytes);
        while let Some(nl) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=nl).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            match asm.feed_line(&line) {
                Ok(Some(chunk)) => {
                    // 接收端被丢弃（调用方超时）时继续读完，保证历史完整
                    let _ = chunk_tx.send(Ok(chunk));
                }
                Ok(None) if asm.done => break 'read,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "stream protocol error");
                    let _ = chunk_tx.send(Err(e.clone()));
                    let _ = final_tx.send(Err(e));
                    return;
                }
            }
        }
    }
    drop(chunk_tx);

    let (message, finalized) = asm.finish();
    debug!(tool_calls = finalized.tool_calls.len(), "stream finished");
    history.lock().await.push(message);
    let _ = final_tx.send(Ok(finalized));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(asm: &mut SseAssembler, lines: &[&str]) -> Vec<StreamChunk> {
        lines
            .iter()
            .filter_map(|l| asm.feed_line(l).unwrap())
            .collect()
    }

    #[test]
    fn test_text_and_reasoning_deltas() {
        let mut asm = SseAssembler::default();
        let chunks = feed(
            &mut asm,
            &[
                r#"data: {"choices":[{"delta":{"reasoning_content":"thinking"}}]}"#,
                "",
                r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
                ": keep-alive",
                "data: [DONE]",
            ],
        );
        assert_eq!(chunks.len(), 3);
        assert!(asm.done);
        let (msg, fin) = asm.finish();
        assert_eq!(msg["content"], "Hello");
        assert!(fin.tool_calls.is_empty());
        assert!(msg.get("tool_calls").is_none());
    }

    #[test]
    fn test_tool_call_deltas_are_assembled() {
        let mut asm = SseAssembler::default();
        feed(
            &mut asm,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"get_tasks","arguments":""}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"date\":"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"2026-10-20\"}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"save_memory","arguments":"{oops"}}]}}]}"#,
            ],
        );
        let (msg, fin) = asm.finish();
        assert_eq!(fin.tool_calls.len(), 2);
        assert_eq!(fin.tool_calls[0].name, "get_tasks");
        assert_eq!(fin.tool_calls[0].args, json!({"date": "2026-10-20"}));
        assert_eq!(fin.tool_calls[0].id.as_deref(), Some("call_a"));
        // 非法 JSON 原样传给执行器
        assert_eq!(fin.tool_calls[1].args, json!("{oops"));
        assert_eq!(msg["tool_calls"][1]["function"]["arguments"], "{oops");
        assert!(msg["content"].is_null());
    }

    #[test]
    fn test_bad_frame_is_protocol_error() {
        let mut asm = SseAssembler::default();
        assert!(matches!(
            asm.feed_line("data: {not json"),
            Err(LlmError::Protocol(_))
        ));
        assert!(matches!(
            asm.feed_line(r#"data: {"error":{"message":"overloaded"}}"#),
            Err(LlmError::ApiError(_))
        ));
    }

    #[test]
    fn test_unanswered_calls_are_filled_before_user_message() {
        let mut history = vec![
            json!({"role": "system", "content": "s"}),
            json!({"role": "assistant", "content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "a", "arguments": "{}"}},
                {"id": "c2", "type": "function", "function": {"name": "b", "arguments": "{}"}}
            ]}),
            json!({"role": "tool", "tool_call_id": "c1", "content": "{}"}),
        ];
        append_submission(&mut history, Submission::user("next"));
        assert_eq!(history.len(), 5);
        assert_eq!(history[3]["tool_call_id"], "c2");
        assert_eq!(history[4]["role"], "user");
    }

    #[test]
    fn test_media_becomes_data_uri() {
        let mut history = Vec::new();
        append_submission(
            &mut history,
            Submission::User {
                text: "what is this".into(),
                media: Some(MediaBlob {
                    mime_type: "image/jpeg".into(),
                    data_base64: "AAAA".into(),
                }),
            },
        );
        assert_eq!(
            history[0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(429, String::new(), Some(2000)).is_transient());
        assert!(classify_status(502, String::new(), None).is_transient());
        assert!(matches!(
            classify_status(401, String::new(), None),
            LlmError::MissingCredentials(_)
        ));
        assert!(!classify_status(400, String::new(), None).is_transient());
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let cfg = LlmSection {
            api_key_env: "DAYLOOM_TEST_SURELY_UNSET_KEY".into(),
            ..Default::default()
        };
        assert!(matches!(
            OpenAiClient::from_config(&cfg),
            Err(LlmError::MissingCredentials(_))
        ));
    }
}
