//! 工具分发器
//!
//! 对一条 assistant 消息中所有待应答的外部工具调用逐个执行（有界并发），结果按原调用顺序组装成 tool 消息：
//! - 未注册的工具名：应答 "Unsupported operation"，视为已应答，永不重试
//! - 执行失败 / 超时：应答错误描述，只影响该调用
//! - 每次执行输出结构化审计日志（JSON），全部完成后向 tool-log 命名空间写一条尽力而为的审计记录

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::config::SessionConfig;
use crate::memory::{ConversationState, MemoryCategory, MemoryStore, Message, Namespace, ToolCall};
use crate::tools::{is_memory_marker, ToolRegistry};

/// 单个调用的执行结果：应答消息 + 成功触达工具时的操作记录
struct CallOutcome {
    message: Message,
    operation: Option<Value>,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    store: Arc<dyn MemoryStore>,
    timeout: Duration,
    max_concurrency: usize,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, store: Arc<dyn MemoryStore>, timeout_secs: u64) -> Self {
        Self {
            registry,
            store,
            timeout: Duration::from_secs(timeout_secs),
            max_concurrency: 4,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行一组调用；返回的 tool 消息与输入一一对应、顺序一致
    pub async fn dispatch(&self, calls: &[ToolCall], session: &SessionConfig) -> Vec<Message> {
        let outcomes: Vec<CallOutcome> = stream::iter(calls.iter().map(|call| self.run_one(call, session)))
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let mut messages = Vec::with_capacity(outcomes.len());
        let mut operations = Vec::new();
        for outcome in outcomes {
            messages.push(outcome.message);
            operations.extend(outcome.operation);
        }
        self.record_operations(operations, session).await;
        messages
    }

    /// 对最近一条 assistant 消息中未应答的外部调用执行分发并追加应答；记忆标记留给更新处理器
    pub async fn dispatch_pending(&self, state: &mut ConversationState, session: &SessionConfig) -> usize {
        let pending: Vec<ToolCall> = state
            .unanswered_calls()
            .into_iter()
            .filter(|tc| !is_memory_marker(&tc.name))
            .cloned()
            .collect();
        if pending.is_empty() {
            return 0;
        }
        let answers = self.dispatch(&pending, session).await;
        let n = answers.len();
        state.extend(answers);
        n
    }

    async fn run_one(&self, call: &ToolCall, session: &SessionConfig) -> CallOutcome {
        let Some(tool) = self.registry.lookup(&call.name) else {
            tracing::warn!(tool = %call.name, "Unhandled tool call, answering as unsupported");
            return CallOutcome {
                message: Message::tool(&call.id, format!("Unsupported operation '{}'", call.name)),
                operation: None,
            };
        };

        let start = Instant::now();
        let result = timeout(self.timeout, tool.execute(call.arguments.clone(), session)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = json!({
            "event": "tool_audit",
            "tool": call.name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let content = match result {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => format!("Error executing {}: {}", call.name, e),
            Err(_) => format!(
                "Error executing {}: timed out after {}s",
                call.name,
                self.timeout.as_secs()
            ),
        };
        CallOutcome {
            message: Message::tool(&call.id, content),
            operation: Some(json!({
                "operation": call.name,
                "args": call.arguments,
                "timestamp": Utc::now().to_rfc3339(),
            })),
        }
    }

    /// 尽力而为：写入失败只记日志
    async fn record_operations(&self, operations: Vec<Value>, session: &SessionConfig) {
        if operations.is_empty() {
            return;
        }
        let names: Vec<&str> = operations
            .iter()
            .filter_map(|op| op.get("operation").and_then(Value::as_str))
            .collect();
        let summary = format!("Tool operations performed: {}", names.join(", "));
        let namespace = Namespace::for_session(MemoryCategory::ToolLog, session);
        let key = uuid::Uuid::new_v4().to_string();
        let record = json!({
            "operations": operations,
            "summary": summary,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.store.put(&namespace, &key, record).await {
            tracing::warn!(error = %e, namespace = %namespace, "Failed to persist tool log");
        }
    }
}

fn args_preview(args: &crate::memory::ToolArgs) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
