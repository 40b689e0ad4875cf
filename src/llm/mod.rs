//! LLM 层：补全 / 抽取服务抽象与实现（OpenAI 兼容 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{ScriptedCompletion, ScriptedExtraction};
pub use openai::{OpenAiCompatClient, TokenUsage};
pub use traits::{
    CompletionService, ExistingDocument, ExtractionService, LlmError, Mutation, MutationAction,
    TargetSchema, ToolSchema,
};
