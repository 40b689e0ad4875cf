//! 对话历史清洗：在交给补全服务前去重并剔除孤立的 tool 应答
//!
//! - assistant 消息：有工具调用时按 (name, 规范化参数) 列表计算指纹，否则按 (role, 前 100 字符)；
//!   同一指纹只保留首次出现
//! - tool 消息：tool_call_id 必须指向此前已保留的 assistant 消息中的某个 ToolCall，否则丢弃
//!
//! 保持相对顺序；对已清洗的历史再次清洗结果不变。

use std::collections::HashSet;

use crate::memory::{Message, Role};

/// 内容指纹取前多少个字符
const CONTENT_PREFIX_CHARS: usize = 100;

fn assistant_fingerprint(msg: &Message) -> String {
    if msg.tool_calls.is_empty() {
        let prefix: String = msg.content.chars().take(CONTENT_PREFIX_CHARS).collect();
        format!("{}:{}", msg.role.as_str(), prefix)
    } else {
        let calls: Vec<(String, String)> = msg.tool_calls.iter().map(|tc| tc.signature()).collect();
        format!("{}:tool_calls:{:?}", msg.role.as_str(), calls)
    }
}

/// 清洗历史，返回新的消息列表
pub fn sanitize(messages: &[Message]) -> Vec<Message> {
    let mut seen = HashSet::new();
    let mut known_call_ids: HashSet<&str> = HashSet::new();
    let mut cleaned = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::Assistant => {
                if !seen.insert(assistant_fingerprint(msg)) {
                    tracing::debug!(content = %msg.content, "Dropping duplicate assistant message");
                    continue;
                }
                known_call_ids.extend(msg.tool_calls.iter().map(|tc| tc.id.as_str()));
            }
            Role::Tool => {
                let known = msg
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| known_call_ids.contains(id));
                if !known {
                    tracing::debug!(tool_call_id = ?msg.tool_call_id, "Dropping orphaned tool message");
                    continue;
                }
            }
            Role::System | Role::User => {}
        }
        cleaned.push(msg.clone());
    }

    cleaned
}
