//! Agent 错误类型
//!
//! 回合编排过程中向宿主传播的错误：补全 / 抽取失败、类别记录写入失败、
//! 触发调用缺失、幻觉工具、回合上限等。工具执行失败与审计日志写入失败在各自组件内消化，不会出现在这里。

use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::{MemoryCategory, StoreError};

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 补全 / 抽取服务失败：原样上抛，重试与退避由调用方决定
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// profile / todo / instructions / email 记录写入失败：用户请求的更新丢失必须可见
    #[error("Memory store error: {0}")]
    Store(#[from] StoreError),

    /// 更新处理器找不到触发它的 ToolCall id
    #[error("No pending memory update call found for category {category}")]
    MissingToolCall { category: MemoryCategory },

    /// 既不是记忆标记也不是已注册工具的调用名
    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    /// 记忆标记声明了未知的类别
    #[error("Unknown memory category: {0}")]
    UnknownCategory(String),

    /// 抽取结果不符合类别 schema
    #[error("Schema violation for {category}: {reason}")]
    SchemaViolation {
        category: MemoryCategory,
        reason: String,
    },

    /// 达到单回合最大步数（宿主安全上限）
    #[error("Turn step limit exceeded ({0})")]
    TurnLimitExceeded(usize),
}
