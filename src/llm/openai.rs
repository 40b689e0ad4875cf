//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）：补全时附带 tools，
//! 抽取时强制调用 `Mutations` 函数，其参数 schema 由目标文档 schema 拼出。
//! 返回的工具调用统一经 `ToolCall::from_value` 规范化。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolChoiceOption, ChatCompletionTools,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{
    CompletionService, ExistingDocument, ExtractionService, LlmError, Mutation, TargetSchema,
    ToolSchema,
};
use crate::memory::{Message, Role, ToolCall};

/// 抽取时强制调用的函数名
const MUTATIONS_FUNCTION: &str = "Mutations";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let prompt = self.prompt_tokens.load(Ordering::Relaxed);
        let completion = self.completion_tokens.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

/// OpenAI 兼容客户端：同时实现 CompletionService 与 ExtractionService
pub struct OpenAiCompatClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiCompatClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, timeout_secs: u64) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: Duration::from_secs(timeout_secs),
            usage: TokenUsage::default(),
        }
    }

    /// 发送请求并取首条回复；超时与接口错误映射为 LlmError
    async fn create(&self, request: CreateChatCompletionRequest) -> Result<Message, LlmError> {
        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Network(format!("request timed out after {}s", self.timeout.as_secs())))?
            .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            self.usage.add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
            let (prompt, completion, total) = self.usage.get();
            tracing::debug!(prompt, completion, total, "Cumulative token usage");
        }

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;

        let raw_calls = message
            .tool_calls
            .unwrap_or_default()
            .iter()
            .filter_map(|tc| serde_json::to_value(tc).ok())
            .collect::<Vec<_>>();
        Ok(parse_assistant(message.content, &raw_calls))
    }
}

fn map_openai_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::Reqwest(e) => LlmError::Network(e.to_string()),
        other => LlmError::ApiError(other.to_string()),
    }
}

fn build_error(e: OpenAIError) -> LlmError {
    LlmError::InvalidResponse(format!("failed to build request: {e}"))
}

/// 本地消息 -> API 消息；system 前言放在最前
fn to_openai_messages(preamble: &str, messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(ChatCompletionRequestMessage::System(
        ChatCompletionRequestSystemMessageArgs::default()
            .content(preamble)
            .build()
            .map_err(build_error)?,
    ));

    for m in messages {
        let msg = match m.role {
            Role::System => ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(build_error)?,
            ),
            Role::User => ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(build_error)?,
            ),
            Role::Assistant => {
                let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                if !m.content.is_empty() {
                    args.content(m.content.clone());
                }
                if !m.tool_calls.is_empty() {
                    let calls: Vec<ChatCompletionMessageToolCalls> = m
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            ChatCompletionMessageToolCalls::Function(ChatCompletionMessageToolCall {
                                id: tc.id.clone(),
                                function: FunctionCall {
                                    name: tc.name.clone(),
                                    arguments: Value::Object(tc.arguments.clone()).to_string(),
                                },
                            })
                        })
                        .collect();
                    args.tool_calls(calls);
                }
                ChatCompletionRequestMessage::Assistant(args.build().map_err(build_error)?)
            }
            Role::Tool => ChatCompletionRequestMessage::Tool(
                ChatCompletionRequestToolMessageArgs::default()
                    .content(m.content.clone())
                    .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                    .build()
                    .map_err(build_error)?,
            ),
        };
        out.push(msg);
    }
    Ok(out)
}

fn to_openai_tools(tools: &[ToolSchema]) -> Result<Vec<ChatCompletionTools>, LlmError> {
    tools
        .iter()
        .map(|t| {
            let function = FunctionObjectArgs::default()
                .name(t.name.clone())
                .description(t.description.clone())
                .parameters(t.parameters.clone())
                .build()
                .map_err(build_error)?;
            Ok(ChatCompletionTools::Function(ChatCompletionTool { function }))
        })
        .collect()
}

/// API 回复 -> 本地 assistant 消息（工具调用在此规范化，缺 id 的被跳过）
fn parse_assistant(content: Option<String>, raw_calls: &[Value]) -> Message {
    let calls: Vec<ToolCall> = raw_calls.iter().filter_map(ToolCall::from_value).collect();
    Message::assistant_with_tools(content.unwrap_or_default(), calls)
}

/// 以目标文档 schema 拼出 `Mutations` 函数的参数 schema；schemars 的 definitions 提到根上，使 $ref 可解析
fn mutations_parameters(target: &TargetSchema) -> Value {
    let mut doc_schema = target.schema.clone();
    let definitions = doc_schema
        .as_object_mut()
        .and_then(|o| {
            o.remove("$schema");
            o.remove("definitions")
        })
        .unwrap_or_else(|| json!({}));
    json!({
        "type": "object",
        "definitions": definitions,
        "properties": {
            "mutations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "action": { "type": "string", "enum": ["create", "patch", "none"] },
                        "document_id": { "type": ["string", "null"] },
                        "planned_edits": { "type": ["string", "null"] },
                        "value": doc_schema,
                    },
                    "required": ["action"]
                }
            }
        },
        "required": ["mutations"]
    })
}

/// 强制调用指定函数
fn forced_tool_choice(name: &str) -> Result<ChatCompletionToolChoiceOption, LlmError> {
    serde_json::from_value(json!({ "type": "function", "function": { "name": name } }))
        .map_err(|e| LlmError::InvalidResponse(format!("invalid tool choice: {e}")))
}

fn render_existing(existing: &[ExistingDocument]) -> String {
    if existing.is_empty() {
        return "(none)".to_string();
    }
    existing
        .iter()
        .map(|d| format!("- id={} schema={} value={}", d.key, d.schema_name, d.value))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl CompletionService for OpenAiCompatClient {
    async fn complete(
        &self,
        preamble: &str,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<Message, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .temperature(0.0)
            .messages(to_openai_messages(preamble, messages)?);
        if !tools.is_empty() {
            args.tools(to_openai_tools(tools)?).parallel_tool_calls(false);
        }
        let request = args.build().map_err(build_error)?;
        self.create(request).await
    }
}

#[async_trait]
impl ExtractionService for OpenAiCompatClient {
    async fn extract(
        &self,
        instruction: &str,
        messages: &[Message],
        existing: &[ExistingDocument],
        target: &TargetSchema,
    ) -> Result<Vec<Mutation>, LlmError> {
        let preamble = format!(
            "{instruction}\n\nExisting {} documents (patch them by id, or create new ones):\n{}",
            target.name,
            render_existing(existing)
        );
        let tool = ToolSchema {
            name: MUTATIONS_FUNCTION.to_string(),
            description: format!("Create, patch or keep {} documents.", target.name),
            parameters: mutations_parameters(target),
        };
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(0.0)
            .messages(to_openai_messages(&preamble, messages)?)
            .tools(to_openai_tools(std::slice::from_ref(&tool))?)
            .tool_choice(forced_tool_choice(MUTATIONS_FUNCTION)?)
            .build()
            .map_err(build_error)?;

        let message = self.create(request).await?;
        let call = message
            .tool_calls
            .into_iter()
            .find(|tc| tc.name == MUTATIONS_FUNCTION)
            .ok_or_else(|| LlmError::InvalidResponse("extractor did not call Mutations".to_string()))?;
        let raw = call.arguments.get("mutations").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(raw).map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}
