//! 对话日志：Message / ToolCall / ConversationState
//!
//! ConversationState 只追加不修改；工具调用在进入系统的边界处统一规范化为 ToolCall，
//! 之后所有组件只看这一种结构。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 规范化后的工具参数
pub type ToolArgs = Map<String, Value>;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// assistant 消息中携带的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArgs,
}

impl ToolCall {
    /// arguments 可以是对象、JSON 字符串或其它任意值，统一规范化为对象
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: normalize_arguments(&arguments),
        }
    }

    /// 从外部载荷解析 ToolCall，兼容三种形态：
    /// `{id, name, args}`、`{id, name, arguments}`、`{id, function: {name, arguments}}`。
    /// 缺少 id 或 name 时返回 None。
    pub fn from_value(raw: &Value) -> Option<Self> {
        let id = raw.get("id").and_then(Value::as_str).filter(|s| !s.is_empty());
        let Some(id) = id else {
            tracing::warn!(call = %raw, "Skipping tool call without id");
            return None;
        };
        let (name, args) = match raw.get("function").filter(|f| f.is_object()) {
            Some(function) => (
                function
                    .get("name")
                    .or_else(|| raw.get("name"))
                    .and_then(Value::as_str),
                function.get("arguments"),
            ),
            None => (
                raw.get("name").and_then(Value::as_str),
                raw.get("args").or_else(|| raw.get("arguments")),
            ),
        };
        let name = name.filter(|n| !n.is_empty())?;
        Some(Self::new(id, name, args.cloned().unwrap_or(Value::Null)))
    }

    /// 调用签名：(名称, 规范化参数 JSON)，供循环检测与去重使用
    pub fn signature(&self) -> (String, String) {
        (
            self.name.clone(),
            canonical_json(&Value::Object(self.arguments.clone())),
        )
    }
}

/// 参数规范化：对象原样保留，字符串尝试解析为 JSON 对象，其余一律降级为空 map（不是错误）
pub fn normalize_arguments(raw: &Value) -> ToolArgs {
    match raw {
        Value::Object(map) => map.clone(),
        Value::String(s) if s.trim().is_empty() => Map::new(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => {
                tracing::warn!(arguments = %s, "Failed to parse tool arguments, using empty map");
                Map::new()
            }
        },
        _ => Map::new(),
    }
}

/// 键按字典序递归排序后的 JSON 文本
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// 单条消息：tool_calls 只出现在 assistant 消息上，tool_call_id 只出现在 tool 消息上
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content.into())
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content.into())
        }
    }

    /// 对某个 ToolCall 的应答
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content.into())
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// 只追加的对话状态
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn extend(&mut self, msgs: impl IntoIterator<Item = Message>) {
        self.messages.extend(msgs);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 历史中所有 tool 消息应答过的调用 id
    pub fn answered_ids(&self) -> HashSet<&str> {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect()
    }

    /// 最近一条 assistant 消息的下标
    pub fn latest_assistant_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::Assistant)
    }

    /// 最近一条 assistant 消息中尚未被应答的调用（保持原顺序）
    pub fn unanswered_calls(&self) -> Vec<&ToolCall> {
        let Some(idx) = self.latest_assistant_index() else {
            return Vec::new();
        };
        let answered = self.answered_ids();
        self.messages[idx]
            .tool_calls
            .iter()
            .filter(|tc| !answered.contains(tc.id.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_accepts_all_shapes() {
        let a = ToolCall::from_value(&json!({"id": "1", "name": "search", "args": {"q": "x"}})).unwrap();
        let b = ToolCall::from_value(&json!({"id": "1", "name": "search", "arguments": "{\"q\":\"x\"}"}))
            .unwrap();
        let c = ToolCall::from_value(&json!({
            "id": "1",
            "type": "function",
            "function": {"name": "search", "arguments": "{\"q\": \"x\"}"}
        }))
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.arguments.get("q"), Some(&json!("x")));
    }

    #[test]
    fn test_from_value_requires_id_and_name() {
        assert!(ToolCall::from_value(&json!({"name": "search"})).is_none());
        assert!(ToolCall::from_value(&json!({"id": "1"})).is_none());
    }

    #[test]
    fn test_malformed_arguments_degrade_to_empty_map() {
        let call = ToolCall::new("1", "search", json!("{not json"));
        assert!(call.arguments.is_empty());
        let call = ToolCall::new("1", "search", json!([1, 2]));
        assert!(call.arguments.is_empty());
        let call = ToolCall::new("1", "search", json!("\"just a string\""));
        assert!(call.arguments.is_empty());
    }

    #[test]
    fn test_signature_ignores_key_order() {
        let a = ToolCall::new("1", "search", json!({"q": "x", "limit": 3}));
        let b = ToolCall::new("2", "search", json!({"limit": 3, "q": "x"}));
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_unanswered_calls_of_latest_assistant() {
        let mut state = ConversationState::new();
        state.push(Message::user("hi"));
        state.push(Message::assistant_with_tools(
            "",
            vec![
                ToolCall::new("a", "search", json!({})),
                ToolCall::new("b", "search", json!({"q": "y"})),
            ],
        ));
        state.push(Message::tool("a", "done"));
        let pending: Vec<&str> = state.unanswered_calls().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(pending, vec!["b"]);
    }
}
