//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时。execute 永不返回 Err：
//! 工具拒绝 → Rejected（拒绝说明原样给模型）；工具 Err / panic → Failed（通用失败标记）；超时 → TimedOut。
//! 每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;

use crate::llm::{ToolResponse, ToolSpec};
use crate::tools::catalog::{ToolEffect, ToolOutcome};
use crate::tools::ToolRegistry;

/// 执行器异常时回传给模型的通用失败标记
pub const GENERIC_FAILURE: &str =
    "The tool failed due to an internal error. Tell the user the action could not be completed.";

/// 模型请求的一次调用（含所在回合）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
    pub round: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    /// 宿主的业务拒绝（如日期在过去）
    Rejected,
    /// 宿主返回 Err 或 panic
    Failed,
    TimedOut,
    /// 引擎策略拦截，未执行（propose_schedule 出现在非编排 Turn）
    PolicyBlocked,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPayload {
    Success(Value),
    Error(String),
}

/// 单次调用结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub call_id: Option<String>,
    pub name: String,
    pub status: ToolStatus,
    pub payload: ToolPayload,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    /// 宿主是否真的被调用（拦截与未知工具不算）
    pub fn was_executed(&self) -> bool {
        !matches!(self.status, ToolStatus::PolicyBlocked | ToolStatus::Unknown)
    }

    pub fn policy_blocked(call: &ToolCall, reason: &str) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            status: ToolStatus::PolicyBlocked,
            payload: ToolPayload::Error(reason.to_string()),
        }
    }

    /// 转为回传给模型的格式：成功为原载荷，失败为 {"error": "..."}
    pub fn to_response(&self) -> ToolResponse {
        let payload = match &self.payload {
            ToolPayload::Success(v) => v.clone(),
            ToolPayload::Error(msg) => serde_json::json!({ "error": msg }),
        };
        ToolResponse {
            call_id: self.call_id.clone(),
            name: self.name.clone(),
            payload,
        }
    }
}

/// 工具执行器：对每次调用施加超时，并把所有失败映射为模型可见的载荷
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行一次调用；参数原样传给工具
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let args_preview = args_preview(&call.args);

        let (status, payload) = match self.registry.get(&call.name) {
            None => (
                ToolStatus::Unknown,
                ToolPayload::Error(format!("Unknown tool: {}", call.name)),
            ),
            Some(tool) => {
                let fut = AssertUnwindSafe(tool.execute(call.args.clone())).catch_unwind();
                match timeout(self.timeout, fut).await {
                    Ok(Ok(Ok(ToolOutcome::Success(v)))) => (ToolStatus::Ok, ToolPayload::Success(v)),
                    Ok(Ok(Ok(ToolOutcome::Rejected(msg)))) => {
                        (ToolStatus::Rejected, ToolPayload::Error(msg))
                    }
                    Ok(Ok(Err(e))) => {
                        tracing::warn!(tool = %call.name, error = %e, "tool executor failed");
                        (ToolStatus::Failed, ToolPayload::Error(GENERIC_FAILURE.to_string()))
                    }
                    Ok(Err(_)) => {
                        tracing::error!(tool = %call.name, "tool executor panicked");
                        (ToolStatus::Failed, ToolPayload::Error(GENERIC_FAILURE.to_string()))
                    }
                    Err(_) => (
                        ToolStatus::TimedOut,
                        ToolPayload::Error(format!(
                            "Tool {} timed out after {}s",
                            call.name,
                            self.timeout.as_secs()
                        )),
                    ),
                }
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "round": call.round,
            "outcome": status,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        ToolResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            status,
            payload,
        }
    }

    pub fn effect_of(&self, name: &str) -> Option<ToolEffect> {
        self.registry.effect_of(name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
