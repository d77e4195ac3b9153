//! Dayloom - 对话式日程助手的工具编排引擎
//!
//! 模块划分：
//! - **agent**: 无头会话门面（切换日期、发送消息、整日编排、提案审批、后台触发）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、重试、时间模式、会话监管、后台编排调度
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **memory**: 调用方状态的参考实现（任务、关系台账、长期笔记、DayBook）
//! - **proposal**: 日程提案与联系人提案的生命周期
//! - **react**: 提示词、Turn 状态机、兜底确认、过程事件
//! - **tools**: 九个工具、执行器契约、注册表与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod proposal;
pub mod react;
pub mod tools;

pub use agent::{ActivityMonitor, Assistant};
