//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{ScriptedChunk, ScriptedLlmClient, ScriptedReply};
pub use openai::OpenAiClient;
pub use traits::{
    ChatHandle, FinalResponse, LlmClient, LlmError, MediaBlob, ResponseStream, StreamChunk,
    Submission, ToolCallRequest, ToolResponse, ToolSpec,
};
