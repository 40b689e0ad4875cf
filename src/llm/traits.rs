//! 补全与结构化抽取服务的抽象
//!
//! 本核心只定义契约：CompletionService 产出一条 assistant 消息，ExtractionService 把对话转换为
//! 符合目标 schema 的文档变更。二者的超时、重试与取消由宿主负责。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::Message;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// 提供给补全服务的工具描述（名称、说明、参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 补全服务：(system 前言, 历史, 可用工具) -> assistant 消息
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        preamble: &str,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<Message, LlmError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Patch,
    None,
}

/// 抽取得到的一次文档变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub action: MutationAction,
    #[serde(default)]
    pub document_id: Option<String>,
    /// 抽取器对本次修改的说明（可选）
    #[serde(default)]
    pub planned_edits: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl Mutation {
    pub fn create(value: Value) -> Self {
        Self {
            action: MutationAction::Create,
            document_id: None,
            planned_edits: None,
            value,
        }
    }

    pub fn patch(document_id: impl Into<String>, value: Value) -> Self {
        Self {
            action: MutationAction::Patch,
            document_id: Some(document_id.into()),
            planned_edits: None,
            value,
        }
    }

    pub fn none(document_id: impl Into<String>) -> Self {
        Self {
            action: MutationAction::None,
            document_id: Some(document_id.into()),
            planned_edits: None,
            value: Value::Null,
        }
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.planned_edits = Some(plan.into());
        self
    }
}

/// 交给抽取器的既有文档：(key, schema 名, 值)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingDocument {
    pub key: String,
    pub schema_name: String,
    pub value: Value,
}

/// 抽取目标：schema 名与 JSON Schema
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSchema {
    pub name: String,
    pub schema: Value,
}

/// 结构化抽取服务
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(
        &self,
        instruction: &str,
        messages: &[Message],
        existing: &[ExistingDocument],
        target: &TargetSchema,
    ) -> Result<Vec<Mutation>, LlmError>;
}
