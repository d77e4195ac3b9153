//! 核心层：错误、重试、时间模式、会话监管、Turn 阶段、后台编排调度

pub mod error;
pub mod retry;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;
pub mod temporal;

pub use error::{AgentError, TimeoutStage};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use session_supervisor::{resolve_context, ContextBlock, DayContext, Session, SessionManager};
pub use state::TurnPhase;
pub use task_scheduler::{
    evaluate, BackgroundJob, BackgroundScheduler, FireCallback, GuardSnapshot, GuardSource,
    GuardVerdict,
};
pub use temporal::{classify, TemporalMode};
