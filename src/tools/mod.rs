//! 工具层：参数类型、九个工具的目录与执行器契约、注册表、执行器

pub mod args;
pub mod catalog;
pub mod executor;
pub mod registry;

pub use args::{
    AddTasksArgs, DeleteTasksArgs, GetLedgerArgs, GetTasksArgs, MoveTasksArgs, ProposeScheduleArgs,
    SaveMemoryArgs, TaskDraft, TaskMove, ToolArgs, UpdateTaskArgs, UpsertPersonArgs,
};
pub use catalog::{
    host_registry, HostTool, MutationKind, ToolEffect, ToolHost, ToolKind, ToolOutcome,
    PROPOSE_SCHEDULE,
};
pub use executor::{ToolCall, ToolExecutor, ToolPayload, ToolResult, ToolStatus, GENERIC_FAILURE};
pub use registry::{Tool, ToolRegistry};
