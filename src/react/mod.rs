//! 对话层：提示词、Turn 状态机、兜底确认、过程事件

pub mod events;
pub mod fallback;
pub mod loop_;
pub mod prompts;

pub use events::{Checkpoint, TurnEvent};
pub use fallback::{synthesize_ack, MutationTally};
pub use loop_::{run_turn, TurnContext, TurnOutcome, TurnRequest, PROPOSE_BLOCKED};
pub use prompts::Prompts;
