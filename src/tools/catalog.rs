//! 固定的九个工具与执行器契约
//!
//! ToolHost 由调用方实现（任务 / 关系台账 / 笔记 / 提案状态都归调用方所有）；
//! HostTool 把某个 ToolKind 绑定到宿主方法上，并在边界处把原始 JSON 解析为 ToolArgs。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde_json::Value;

use crate::tools::args::*;
use crate::tools::registry::{Tool, ToolRegistry};

/// 工具执行结果：成功载荷，或面向用户的拒绝说明（拒绝不是故障，模型需据此调整）
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Rejected(String),
}

impl ToolOutcome {
    pub fn ok(v: Value) -> Self {
        ToolOutcome::Success(v)
    }

    pub fn reject(msg: impl Into<String>) -> Self {
        ToolOutcome::Rejected(msg.into())
    }
}

/// 变更类别（兜底确认按类别生成文案）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    TasksAdded,
    TasksDeleted,
    TasksMoved,
    TaskUpdated,
    LedgerUpdated,
    /// 新人仅进入联系人提案队列，尚未写入台账
    ContactProposed,
    MemorySaved,
    ScheduleProposed,
}

impl MutationKind {
    /// 是否修改了某天的任务列表（会使该日审批记录失效，并触发后台编排）
    pub fn touches_tasks(&self) -> bool {
        matches!(
            self,
            MutationKind::TasksAdded
                | MutationKind::TasksDeleted
                | MutationKind::TasksMoved
                | MutationKind::TaskUpdated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEffect {
    ReadOnly,
    Mutating(MutationKind),
}

/// 九个工具
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    GetLedger,
    GetTasks,
    ProposeSchedule,
    UpsertPerson,
    AddTasks,
    DeleteTasks,
    MoveTasks,
    UpdateTask,
    SaveMemory,
}

pub const PROPOSE_SCHEDULE: &str = "propose_schedule";

impl ToolKind {
    pub const ALL: [ToolKind; 9] = [
        ToolKind::GetLedger,
        ToolKind::GetTasks,
        ToolKind::ProposeSchedule,
        ToolKind::UpsertPerson,
        ToolKind::AddTasks,
        ToolKind::DeleteTasks,
        ToolKind::MoveTasks,
        ToolKind::UpdateTask,
        ToolKind::SaveMemory,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::GetLedger => "get_ledger",
            ToolKind::GetTasks => "get_tasks",
            ToolKind::ProposeSchedule => PROPOSE_SCHEDULE,
            ToolKind::UpsertPerson => "upsert_person",
            ToolKind::AddTasks => "add_tasks",
            ToolKind::DeleteTasks => "delete_tasks",
            ToolKind::MoveTasks => "move_tasks",
            ToolKind::UpdateTask => "update_task",
            ToolKind::SaveMemory => "save_memory",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::GetLedger => "Read the relationship ledger: people, relation, notes and when they were last contacted.",
            ToolKind::GetTasks => "Read all tasks for a date (YYYY-MM-DD), including recurring ones.",
            ToolKind::ProposeSchedule => "Propose a complete rewrite of one day's schedule for the user to approve. Only allowed for full-day rebuild requests.",
            ToolKind::UpsertPerson => "Update a person in the relationship ledger; new people are queued for the user's approval.",
            ToolKind::AddTasks => "Add one or more tasks.",
            ToolKind::DeleteTasks => "Delete tasks by id or exact title.",
            ToolKind::MoveTasks => "Move tasks to another date and/or start time.",
            ToolKind::UpdateTask => "Update one task's title, time, duration, notes or completion.",
            ToolKind::SaveMemory => "Save a long-term note about the user's preferences or life.",
        }
    }

    pub fn effect(&self) -> ToolEffect {
        match self {
            ToolKind::GetLedger | ToolKind::GetTasks => ToolEffect::ReadOnly,
            ToolKind::ProposeSchedule => ToolEffect::Mutating(MutationKind::ScheduleProposed),
            ToolKind::UpsertPerson => ToolEffect::Mutating(MutationKind::LedgerUpdated),
            ToolKind::AddTasks => ToolEffect::Mutating(MutationKind::TasksAdded),
            ToolKind::DeleteTasks => ToolEffect::Mutating(MutationKind::TasksDeleted),
            ToolKind::MoveTasks => ToolEffect::Mutating(MutationKind::TasksMoved),
            ToolKind::UpdateTask => ToolEffect::Mutating(MutationKind::TaskUpdated),
            ToolKind::SaveMemory => ToolEffect::Mutating(MutationKind::MemorySaved),
        }
    }

    pub fn parameters_schema(&self) -> Value {
        match self {
            ToolKind::GetLedger => schema_of::<GetLedgerArgs>(),
            ToolKind::GetTasks => schema_of::<GetTasksArgs>(),
            ToolKind::ProposeSchedule => schema_of::<ProposeScheduleArgs>(),
            ToolKind::UpsertPerson => schema_of::<UpsertPersonArgs>(),
            ToolKind::AddTasks => schema_of::<AddTasksArgs>(),
            ToolKind::DeleteTasks => schema_of::<DeleteTasksArgs>(),
            ToolKind::MoveTasks => schema_of::<MoveTasksArgs>(),
            ToolKind::UpdateTask => schema_of::<UpdateTaskArgs>(),
            ToolKind::SaveMemory => schema_of::<SaveMemoryArgs>(),
        }
    }
}

/// 执行器契约：九个异步操作。Err 与 panic 都会被引擎捕获并转为通用失败标记。
#[async_trait]
pub trait ToolHost: Send + Sync {
    async fn get_ledger(&self, args: GetLedgerArgs) -> anyhow::Result<ToolOutcome>;
    async fn get_tasks(&self, args: GetTasksArgs) -> anyhow::Result<ToolOutcome>;
    async fn propose_schedule(&self, args: ProposeScheduleArgs) -> anyhow::Result<ToolOutcome>;
    async fn upsert_person(&self, args: UpsertPersonArgs) -> anyhow::Result<ToolOutcome>;
    async fn add_tasks(&self, args: AddTasksArgs) -> anyhow::Result<ToolOutcome>;
    async fn delete_tasks(&self, args: DeleteTasksArgs) -> anyhow::Result<ToolOutcome>;
    async fn move_tasks(&self, args: MoveTasksArgs) -> anyhow::Result<ToolOutcome>;
    async fn update_task(&self, args: UpdateTaskArgs) -> anyhow::Result<ToolOutcome>;
    async fn save_memory(&self, args: SaveMemoryArgs) -> anyhow::Result<ToolOutcome>;
}

/// 绑定到宿主方法的工具
pub struct HostTool {
    kind: ToolKind,
    host: Arc<dyn ToolHost>,
}

impl HostTool {
    pub fn new(kind: ToolKind, host: Arc<dyn ToolHost>) -> Self {
        Self { kind, host }
    }
}

#[async_trait]
impl Tool for HostTool {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn description(&self) -> &str {
        self.kind.description()
    }

    fn parameters_schema(&self) -> Value {
        self.kind.parameters_schema()
    }

    fn effect(&self) -> ToolEffect {
        self.kind.effect()
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutcome> {
        let parsed = match ToolArgs::parse(self.kind.name(), &args) {
            Ok(p) => p,
            Err(msg) => return Ok(ToolOutcome::Rejected(msg)),
        };
        let host = &self.host;
        match parsed {
            ToolArgs::GetLedger(a) => host.get_ledger(a).await,
            ToolArgs::GetTasks(a) => host.get_tasks(a).await,
            ToolArgs::ProposeSchedule(a) => host.propose_schedule(a).await,
            ToolArgs::UpsertPerson(a) => host.upsert_person(a).await,
            ToolArgs::AddTasks(a) => host.add_tasks(a).await,
            ToolArgs::DeleteTasks(a) => host.delete_tasks(a).await,
            ToolArgs::MoveTasks(a) => host.move_tasks(a).await,
            ToolArgs::UpdateTask(a) => host.update_task(a).await,
            ToolArgs::SaveMemory(a) => host.save_memory(a).await,
            ToolArgs::Other { name, .. } => Ok(ToolOutcome::Rejected(format!("Unknown tool: {name}"))),
        }
    }
}

/// 注册全部九个工具
pub fn host_registry(host: Arc<dyn ToolHost>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for kind in ToolKind::ALL {
        registry.register(HostTool::new(kind, host.clone()));
    }
    registry
}

/// 参数类型的 JSON Schema（子结构内联，避免 $ref，部分兼容端点不支持引用）
pub fn schema_of<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|s| s.inline_subschemas = true)
        .into_generator();
    serde_json::to_value(generator.into_root_schema_for::<T>())
        .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}
