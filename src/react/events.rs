//! Turn 过程事件：用于流式展示进度、工具调用与检查点

use serde::Serialize;

use crate::core::TurnPhase;
use crate::tools::ToolStatus;

/// 进度回调的检查点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// 一批工具执行完毕
    AfterTools,
    BeforeRescue,
    AfterRescue,
}

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 状态机阶段切换
    Phase { phase: TurnPhase, round: usize },
    /// 进度：当前累计的回复与推理轨迹（每个增量及各检查点各一次）
    Progress {
        answer: String,
        reasoning: String,
        checkpoint: Option<Checkpoint>,
    },
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
        round: usize,
    },
    /// 工具返回
    ToolResult {
        tool: String,
        status: ToolStatus,
        round: usize,
    },
    /// 超时或中断，partial 表示已有部分文本
    Interrupted { reason: String, partial: bool },
}
