//! Router：根据最新消息决定下一步
//!
//! 纯函数，无副作用。决策顺序：
//! 1. 空历史 -> 结束
//! 2. 最后一条是 user / tool -> 结束（需要先有 assistant 回复）
//! 3. 最后一条是 assistant 且无工具调用 -> 结束
//! 4. 有工具调用：全部已应答 -> 结束（至多一次分发）；循环检测命中 -> 结束；
//!    否则取第一个未应答调用：记忆标记按类别交给更新处理器，已注册工具交给分发器，其余结束并由调用方报错

use std::collections::HashMap;
use std::sync::Arc;

use crate::memory::{ConversationState, MemoryCategory, Message, Role};
use crate::tools::{is_memory_marker, parse_update_category, ToolRegistry};

/// 结束原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    EmptyHistory,
    /// 最后一条不是 assistant 消息
    AwaitingAssistant,
    NoToolCalls,
    /// 所有待处理调用都已有应答
    AllAnswered,
    /// 同一签名在窗口内重复超过阈值
    LoopDetected { tool: String },
    /// 未注册的工具名
    UnknownTool(String),
    /// 记忆标记声明了未知类别
    UnknownCategory(String),
}

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    End(EndReason),
    /// 交给对应类别的更新处理器
    Update { category: MemoryCategory, call_id: String },
    /// 交给工具分发器
    Dispatch,
}

impl Route {
    pub fn is_end(&self) -> bool {
        matches!(self, Route::End(_))
    }
}

/// 循环检测：最近 window 条消息中，同一 (name, 规范化参数) 出现超过 threshold 次即判定为循环
#[derive(Debug, Clone, Copy)]
pub struct LoopGuard {
    window: usize,
    threshold: usize,
}

impl LoopGuard {
    pub fn new(window: usize, threshold: usize) -> Self {
        Self { window, threshold }
    }

    /// 命中时返回重复的工具名
    pub fn detect(&self, messages: &[Message]) -> Option<String> {
        let start = messages.len().saturating_sub(self.window);
        let mut counts: HashMap<(String, String), usize> = HashMap::new();
        for msg in &messages[start..] {
            for tc in &msg.tool_calls {
                *counts.entry(tc.signature()).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .find(|(_, n)| *n > self.threshold)
            .map(|((name, _), _)| name)
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new(5, 2)
    }
}

pub struct Router {
    registry: Arc<ToolRegistry>,
    guard: LoopGuard,
}

impl Router {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            guard: LoopGuard::default(),
        }
    }

    pub fn with_loop_guard(mut self, guard: LoopGuard) -> Self {
        self.guard = guard;
        self
    }

    /// 完整决策（步骤 1-4）
    pub fn route(&self, state: &ConversationState) -> Route {
        let Some(last) = state.last() else {
            return Route::End(EndReason::EmptyHistory);
        };
        match last.role {
            Role::Assistant if last.tool_calls.is_empty() => Route::End(EndReason::NoToolCalls),
            Role::Assistant => self.route_pending(state),
            _ => Route::End(EndReason::AwaitingAssistant),
        }
    }

    /// 对最近一条 assistant 消息的待处理调用执行步骤 4（即使其后已有部分 tool 应答）
    pub fn route_pending(&self, state: &ConversationState) -> Route {
        let Some(idx) = state.latest_assistant_index() else {
            return Route::End(EndReason::EmptyHistory);
        };
        let calls = &state.messages()[idx].tool_calls;
        if calls.is_empty() {
            return Route::End(EndReason::NoToolCalls);
        }

        let answered = state.answered_ids();
        let Some(first) = calls.iter().find(|tc| !answered.contains(tc.id.as_str())) else {
            tracing::debug!("All tool calls already answered");
            return Route::End(EndReason::AllAnswered);
        };

        if let Some(tool) = self.guard.detect(state.messages()) {
            tracing::warn!(tool = %tool, "Repeated identical tool call, breaking loop");
            return Route::End(EndReason::LoopDetected { tool });
        }

        if is_memory_marker(&first.name) {
            return match parse_update_category(&first.arguments) {
                Ok(category) => {
                    tracing::debug!(category = %category, call_id = %first.id, "Routing to memory update");
                    Route::Update {
                        category,
                        call_id: first.id.clone(),
                    }
                }
                Err(raw) => Route::End(EndReason::UnknownCategory(raw)),
            };
        }

        if self.registry.contains(&first.name) {
            tracing::debug!(tool = %first.name, "Routing to tool dispatcher");
            return Route::Dispatch;
        }

        Route::End(EndReason::UnknownTool(first.name.clone()))
    }
}
