//! Turn 状态机的阶段（供 UI 投影与日志）

use serde::Serialize;

/// STREAMING → EXECUTING_TOOLS → STREAMING_FOLLOWUP →（可再来一轮）→ 可选 RESCUE → DONE
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Streaming,
    ExecutingTools,
    StreamingFollowup,
    Rescue,
    Done,
}

impl TurnPhase {
    /// 调用方据此决定是否锁定输入
    pub fn is_active(&self) -> bool {
        !matches!(self, TurnPhase::Done)
    }
}
