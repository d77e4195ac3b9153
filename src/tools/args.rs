//! 工具参数：已知形状的标签联合 + 兜底变体
//!
//! 引擎把模型给出的 JSON 原样传给工具；只有在执行器边界才解析为这里的类型。
//! 日期等字段保持字符串，由宿主做业务校验（例如「不能改过去的日子」），拒绝信息回传给模型。

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::catalog::ToolKind;

/// 任务草稿（新增任务 / 提案中的候选任务）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskDraft {
    /// 任务标题
    pub title: String,
    /// YYYY-MM-DD；缺省时为当前查看的日期
    #[serde(default)]
    pub date: Option<String>,
    /// HH:MM（24 小时制）
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GetLedgerArgs {
    /// 按姓名过滤（可选，子串匹配）
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GetTasksArgs {
    /// YYYY-MM-DD
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProposeScheduleArgs {
    /// YYYY-MM-DD；缺省时为当前查看的日期
    #[serde(default)]
    pub date: Option<String>,
    /// 整天时间线（人类可读）
    pub timeline: String,
    /// 安排理由
    pub rationale: String,
    /// 该日全部候选任务
    pub tasks: Vec<TaskDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UpsertPersonArgs {
    pub name: String,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// YYYY-MM-DD
    #[serde(default)]
    pub last_contacted: Option<String>,
    /// 期望的联系频率（天）
    #[serde(default)]
    pub contact_every_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AddTasksArgs {
    pub tasks: Vec<TaskDraft>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeleteTasksArgs {
    #[serde(default)]
    pub ids: Vec<String>,
    /// 按精确标题删除；同名多个时不会猜测
    #[serde(default)]
    pub titles: Vec<String>,
    /// 限定按标题查找的日期
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskMove {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub from_date: Option<String>,
    pub to_date: String,
    #[serde(default)]
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MoveTasksArgs {
    pub moves: Vec<TaskMove>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateTaskArgs {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub new_title: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub done: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SaveMemoryArgs {
    pub note: String,
}

/// 解析后的工具参数
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArgs {
    GetLedger(GetLedgerArgs),
    GetTasks(GetTasksArgs),
    ProposeSchedule(ProposeScheduleArgs),
    UpsertPerson(UpsertPersonArgs),
    AddTasks(AddTasksArgs),
    DeleteTasks(DeleteTasksArgs),
    MoveTasks(MoveTasksArgs),
    UpdateTask(UpdateTaskArgs),
    SaveMemory(SaveMemoryArgs),
    /// 未知工具：保留原始 JSON
    Other { name: String, raw: Value },
}

fn decode<T: DeserializeOwned>(raw: &Value) -> Result<T, String> {
    // 部分模型对无参工具给出 null
    let raw = if raw.is_null() {
        Value::Object(Default::default())
    } else {
        raw.clone()
    };
    serde_json::from_value(raw).map_err(|e| format!("invalid arguments: {e}"))
}

impl ToolArgs {
    pub fn parse(name: &str, raw: &Value) -> Result<Self, String> {
        let Some(kind) = ToolKind::from_name(name) else {
            return Ok(ToolArgs::Other {
                name: name.to_string(),
                raw: raw.clone(),
            });
        };
        Ok(match kind {
            ToolKind::GetLedger => ToolArgs::GetLedger(decode(raw)?),
            ToolKind::GetTasks => ToolArgs::GetTasks(decode(raw)?),
            ToolKind::ProposeSchedule => ToolArgs::ProposeSchedule(decode(raw)?),
            ToolKind::UpsertPerson => ToolArgs::UpsertPerson(decode(raw)?),
            ToolKind::AddTasks => ToolArgs::AddTasks(decode(raw)?),
            ToolKind::DeleteTasks => ToolArgs::DeleteTasks(decode(raw)?),
            ToolKind::MoveTasks => ToolArgs::MoveTasks(decode(raw)?),
            ToolKind::UpdateTask => ToolArgs::UpdateTask(decode(raw)?),
            ToolKind::SaveMemory => ToolArgs::SaveMemory(decode(raw)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_shapes() {
        let args = ToolArgs::parse(
            "add_tasks",
            &json!({"tasks": [{"title": "Gym", "start_time": "07:00"}, {"title": "Call mom"}]}),
        )
        .unwrap();
        match args {
            ToolArgs::AddTasks(a) => assert_eq!(a.tasks[0].start_time.as_deref(), Some("07:00")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_null_args_for_optional_tool() {
        let args = ToolArgs::parse("get_ledger", &Value::Null).unwrap();
        assert_eq!(args, ToolArgs::GetLedger(GetLedgerArgs::default()));
    }

    #[test]
    fn test_unknown_tool_is_kept_verbatim() {
        let raw = json!({"anything": [1, 2, 3]});
        let args = ToolArgs::parse("open_calendar", &raw).unwrap();
        assert_eq!(
            args,
            ToolArgs::Other {
                name: "open_calendar".into(),
                raw
            }
        );
    }

    #[test]
    fn test_malformed_args_report_error() {
        let err = ToolArgs::parse("get_tasks", &json!({"day": "today"})).unwrap_err();
        assert!(err.starts_with("invalid arguments"));
    }
}
