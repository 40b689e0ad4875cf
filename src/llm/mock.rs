//! 脚本化的补全 / 抽取服务（用于测试，无需 API）
//!
//! 按顺序回放预先排好的回复，并记录每次收到的调用，便于断言上下文拼装与调用次数。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{
    CompletionService, ExistingDocument, ExtractionService, LlmError, Mutation, TargetSchema,
    ToolSchema,
};
use crate::memory::Message;

/// 一次补全调用的记录
#[derive(Debug, Clone)]
pub struct CompletionCall {
    pub preamble: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

/// 按顺序返回预设 assistant 消息；脚本耗尽时返回错误
#[derive(Default)]
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<Message, String>>>,
    calls: Mutex<Vec<CompletionCall>>,
}

impl ScriptedCompletion {
    pub fn new(replies: impl IntoIterator<Item = Message>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一次失败的补全
    pub fn push_error(&self, reason: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Err(reason.into()));
        }
    }

    pub fn calls(&self) -> Vec<CompletionCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        preamble: &str,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<Message, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(CompletionCall {
                preamble: preamble.to_string(),
                messages: messages.to_vec(),
                tools: tools.to_vec(),
            });
        }
        let next = self
            .replies
            .lock()
            .map_err(|_| LlmError::ApiError("script lock poisoned".to_string()))?
            .pop_front();
        match next {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(reason)) => Err(LlmError::ApiError(reason)),
            None => Err(LlmError::ApiError("completion script exhausted".to_string())),
        }
    }
}

/// 一次抽取调用的记录
#[derive(Debug, Clone)]
pub struct ExtractionCall {
    pub instruction: String,
    pub messages: Vec<Message>,
    pub existing: Vec<ExistingDocument>,
    pub target: String,
}

/// 按顺序返回预设变更列表；脚本耗尽时返回空列表（即「无变更」）
#[derive(Default)]
pub struct ScriptedExtraction {
    results: Mutex<VecDeque<Result<Vec<Mutation>, String>>>,
    calls: Mutex<Vec<ExtractionCall>>,
}

impl ScriptedExtraction {
    pub fn new(results: impl IntoIterator<Item = Vec<Mutation>>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().map(Ok).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_error(&self, reason: impl Into<String>) {
        if let Ok(mut q) = self.results.lock() {
            q.push_back(Err(reason.into()));
        }
    }

    pub fn calls(&self) -> Vec<ExtractionCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ExtractionService for ScriptedExtraction {
    async fn extract(
        &self,
        instruction: &str,
        messages: &[Message],
        existing: &[ExistingDocument],
        target: &TargetSchema,
    ) -> Result<Vec<Mutation>, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ExtractionCall {
                instruction: instruction.to_string(),
                messages: messages.to_vec(),
                existing: existing.to_vec(),
                target: target.name.clone(),
            });
        }
        let next = self
            .results
            .lock()
            .map_err(|_| LlmError::ApiError("script lock poisoned".to_string()))?
            .pop_front();
        match next {
            Some(Ok(mutations)) => Ok(mutations),
            Some(Err(reason)) => Err(LlmError::ApiError(reason)),
            None => Ok(Vec::new()),
        }
    }
}
