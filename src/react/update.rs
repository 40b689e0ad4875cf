//! 记忆更新处理器
//!
//! 由 UpdateMemory 标记触发，按类别把对话抽取为文档变更并写入会话命名空间：
//! - profile / todo / email：结构化抽取 -> schema 校验 -> 逐条原子写入 -> 汇总
//! - instructions：单例，直接补全生成新的自由文本，整体覆盖
//!
//! 两种路径送给服务的历史都先经过清洗，与 TurnController 看到的一致。
//!
//! 每次调用恰好追加一条 tool 应答（tool_call_id = 触发调用 id）。找不到触发调用时直接报错，
//! 不会静默返回。写入失败上抛。

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use crate::config::SessionConfig;
use crate::core::AgentError;
use crate::llm::{
    CompletionService, ExistingDocument, ExtractionService, Mutation, MutationAction, TargetSchema,
};
use crate::memory::documents::{target_schema, validate_document};
use crate::memory::{sanitize, ConversationState, MemoryCategory, MemoryStore, Message, Namespace};
use crate::tools::is_memory_marker;

const EXTRACTION_INSTRUCTION: &str = "Reflect on following interaction.

Use the provided tools to retain any necessary memories about the user.

Use parallel tool calling to handle updates and insertions simultaneously.

System Time: {time}";

const CREATE_INSTRUCTIONS: &str = "Reflect on the following interaction.

Based on this interaction, update your instructions for how to update ToDo list items. Use any feedback from the user to update how they like to have items added, etc.

Your current instructions are:

<current_instructions>
{current_instructions}
</current_instructions>";

const INSTRUCTIONS_REQUEST: &str = "Please update the instructions based on the conversation";
const INSTRUCTIONS_ACK: &str = "updated instructions";
const NO_CHANGES: &str = "no changes";

pub struct UpdateHandler {
    completion: Arc<dyn CompletionService>,
    extraction: Arc<dyn ExtractionService>,
    store: Arc<dyn MemoryStore>,
}

impl UpdateHandler {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        extraction: Arc<dyn ExtractionService>,
        store: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            completion,
            extraction,
            store,
        }
    }

    /// 处理一次记忆更新；返回追加的应答内容
    pub async fn handle(
        &self,
        category: MemoryCategory,
        call_id: &str,
        state: &mut ConversationState,
        session: &SessionConfig,
    ) -> Result<String, AgentError> {
        let trigger = locate_trigger(state, call_id).ok_or(AgentError::MissingToolCall { category })?;
        let history = sanitize(&state.messages()[..trigger]);

        let summary = match category {
            MemoryCategory::Instructions => self.update_instructions(&history, session).await?,
            MemoryCategory::Profile | MemoryCategory::Todo | MemoryCategory::Email => {
                self.update_documents(category, &history, session).await?
            }
            MemoryCategory::ToolLog => {
                return Err(AgentError::UnknownCategory(category.to_string()));
            }
        };

        tracing::info!(category = %category, call_id = %call_id, "Memory updated");
        state.push(Message::tool(call_id, summary.clone()));
        Ok(summary)
    }

    async fn update_documents(
        &self,
        category: MemoryCategory,
        history: &[Message],
        session: &SessionConfig,
    ) -> Result<String, AgentError> {
        let (schema_name, schema) =
            target_schema(category).ok_or_else(|| AgentError::UnknownCategory(category.to_string()))?;
        let namespace = Namespace::for_session(category, session);

        let existing: Vec<ExistingDocument> = self
            .store
            .search(&namespace)
            .await?
            .into_iter()
            .map(|r| ExistingDocument {
                key: r.key,
                schema_name: schema_name.to_string(),
                value: r.value,
            })
            .collect();

        let instruction = EXTRACTION_INSTRUCTION.replace("{time}", &Utc::now().to_rfc3339());
        let target = TargetSchema {
            name: schema_name.to_string(),
            schema,
        };
        let mutations = self
            .extraction
            .extract(&instruction, history, &existing, &target)
            .await?;
        tracing::debug!(category = %category, mutations = mutations.len(), "Extraction finished");

        // 先整体校验，任何一条不符合 schema 都不写入
        let mut planned = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            let value = match mutation.action {
                MutationAction::None => None,
                MutationAction::Create | MutationAction::Patch => Some(
                    validate_document(category, mutation.value.clone()).map_err(|reason| {
                        AgentError::SchemaViolation {
                            category,
                            reason,
                        }
                    })?,
                ),
            };
            planned.push((mutation, value));
        }

        let mut parts = Vec::with_capacity(planned.len());
        for (mutation, value) in planned {
            let key = document_key(category, &mutation);
            match value {
                Some(value) => {
                    self.store.put(&namespace, &key, value.clone()).await?;
                    parts.push(describe(schema_name, &key, &mutation, Some(&value)));
                }
                None => parts.push(describe(schema_name, &key, &mutation, None)),
            }
        }

        if parts.is_empty() {
            return Ok(NO_CHANGES.to_string());
        }
        Ok(parts.join("\n\n"))
    }

    async fn update_instructions(&self, history: &[Message], session: &SessionConfig) -> Result<String, AgentError> {
        let namespace = Namespace::for_session(MemoryCategory::Instructions, session);
        let key = MemoryCategory::Instructions
            .singleton_key()
            .unwrap_or("user_instructions");
        let current = self
            .store
            .get(&namespace, key)
            .await?
            .and_then(|r| r.value.get("memory").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();

        let prompt = CREATE_INSTRUCTIONS.replace("{current_instructions}", &current);
        let mut messages = history.to_vec();
        messages.push(Message::user(INSTRUCTIONS_REQUEST));
        let reply = self.completion.complete(&prompt, &messages, &[]).await?;

        self.store
            .put(&namespace, key, json!({ "memory": reply.content }))
            .await?;
        Ok(INSTRUCTIONS_ACK.to_string())
    }
}

/// 触发调用所在 assistant 消息的下标：必须是最近一条 assistant 消息中、尚未应答的同 id 记忆标记
fn locate_trigger(state: &ConversationState, call_id: &str) -> Option<usize> {
    let idx = state.latest_assistant_index()?;
    let found = state.messages()[idx]
        .tool_calls
        .iter()
        .any(|tc| tc.id == call_id && is_memory_marker(&tc.name));
    if !found || state.answered_ids().contains(call_id) {
        return None;
    }
    Some(idx)
}

/// 单例类别固定 key；其余按 document_id，缺省时新建
fn document_key(category: MemoryCategory, mutation: &Mutation) -> String {
    if let Some(key) = category.singleton_key() {
        return key.to_string();
    }
    match (&mutation.action, &mutation.document_id) {
        (MutationAction::Create, _) | (_, None) => uuid::Uuid::new_v4().to_string(),
        (_, Some(id)) => id.clone(),
    }
}

fn describe(schema_name: &str, key: &str, mutation: &Mutation, value: Option<&Value>) -> String {
    let plan = mutation.planned_edits.as_deref().unwrap_or("");
    let content = value.map(Value::to_string).unwrap_or_default();
    match mutation.action {
        MutationAction::Create => format!("New {schema_name} created:\nContent: {content}"),
        MutationAction::Patch => {
            format!("Document {key} updated:\nPlan: {plan}\nAdded content: {content}")
        }
        MutationAction::None => format!("Document {key} unchanged:\n{plan}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedCompletion, ScriptedExtraction};
    use crate::memory::{InMemoryStore, MemoryRecord, StoreError, ToolCall};
    use async_trait::async_trait;

    fn session(subject: &str) -> SessionConfig {
        SessionConfig::new(subject, "general")
    }

    fn triggered(user: &str, id: &str, update_type: &str) -> ConversationState {
        ConversationState::from_messages(vec![
            Message::user(user),
            Message::assistant_with_tools(
                "",
                vec![ToolCall::new(id, "UpdateMemory", json!({ "update_type": update_type }))],
            ),
        ])
    }

    fn handler(extraction: ScriptedExtraction, store: Arc<dyn MemoryStore>) -> UpdateHandler {
        UpdateHandler::new(Arc::new(ScriptedCompletion::default()), Arc::new(extraction), store)
    }

    struct ReadOnlyStore;

    #[async_trait]
    impl MemoryStore for ReadOnlyStore {
        async fn get(&self, _ns: &Namespace, _key: &str) -> Result<Option<MemoryRecord>, StoreError> {
            Ok(None)
        }

        async fn search(&self, _ns: &Namespace) -> Result<Vec<MemoryRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn put(&self, _ns: &Namespace, _key: &str, _value: Value) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }
    }

    #[tokio::test]
    async fn test_profile_none_leaves_record_unchanged() {
        let store = Arc::new(InMemoryStore::new());
        let s = session("alice");
        let ns = Namespace::for_session(MemoryCategory::Profile, &s);
        store.put(&ns, "user_profile", json!({"name": "Alice"})).await.unwrap();

        let extraction = ScriptedExtraction::new(vec![vec![
            Mutation::none("user_profile").with_plan("nothing new about the user"),
        ]]);
        let h = handler(extraction, store.clone());
        let mut state = triggered("what's the weather?", "m1", "user");

        let summary = h.handle(MemoryCategory::Profile, "m1", &mut state, &s).await.unwrap();

        assert!(summary.starts_with("Document user_profile unchanged"));
        let record = store.get(&ns, "user_profile").await.unwrap().unwrap();
        assert_eq!(record.value, json!({"name": "Alice"}));
        assert_eq!(state.last().unwrap().tool_call_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_todo_create_single_record() {
        let store = Arc::new(InMemoryStore::new());
        let s = session("alice");
        let extraction = Arc::new(ScriptedExtraction::new(vec![vec![Mutation::create(json!({
            "task": "call the dentist",
            "solutions": ["Dr. Smith's office, 555-0100"]
        }))]]));
        let h = UpdateHandler::new(Arc::new(ScriptedCompletion::default()), extraction.clone(), store.clone());
        let mut state = triggered("remind me to call the dentist", "m1", "todo");

        let summary = h.handle(MemoryCategory::Todo, "m1", &mut state, &s).await.unwrap();

        assert!(summary.starts_with("New ToDo created:"));
        let records = store.search(&Namespace::for_session(MemoryCategory::Todo, &s)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].value["task"].as_str().unwrap().contains("call the dentist"));
        assert!(!records[0].value["solutions"].as_array().unwrap().is_empty());

        // 抽取器看到的历史不包含触发它的 assistant 消息
        let call = &extraction.calls()[0];
        assert_eq!(call.messages.len(), 1);
        assert_eq!(call.target, "ToDo");
        assert!(call.instruction.contains("System Time:"));
    }

    #[tokio::test]
    async fn test_todo_patch_replaces_existing() {
        let store = Arc::new(InMemoryStore::new());
        let s = session("alice");
        let ns = Namespace::for_session(MemoryCategory::Todo, &s);
        store
            .put(&ns, "t1", json!({"task": "call the dentist", "solutions": ["Dr. Smith"]}))
            .await
            .unwrap();
        let extraction = ScriptedExtraction::new(vec![vec![Mutation::patch(
            "t1",
            json!({"task": "call the dentist", "solutions": ["Dr. Smith"], "status": "done"}),
        )
        .with_plan("mark as done")]]);
        let h = handler(extraction, store.clone());
        let mut state = triggered("I called the dentist", "m1", "todo");

        let summary = h.handle(MemoryCategory::Todo, "m1", &mut state, &s).await.unwrap();

        assert!(summary.contains("Document t1 updated:\nPlan: mark as done"));
        let records = store.search(&ns).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value["status"], "done");
    }

    #[tokio::test]
    async fn test_schema_violation_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let s = session("alice");
        let extraction = ScriptedExtraction::new(vec![vec![
            Mutation::create(json!({"task": "ok", "solutions": ["a"]})),
            Mutation::create(json!({"task": "bad", "solutions": []})),
        ]]);
        let h = handler(extraction, store.clone());
        let mut state = triggered("two tasks", "m1", "todo");

        let err = h.handle(MemoryCategory::Todo, "m1", &mut state, &s).await.unwrap_err();
        assert!(matches!(err, AgentError::SchemaViolation { .. }));
        assert!(store.search(&Namespace::for_session(MemoryCategory::Todo, &s)).await.unwrap().is_empty());
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_extraction_reports_no_changes() {
        let h = handler(ScriptedExtraction::default(), Arc::new(InMemoryStore::new()));
        let mut state = triggered("hi", "m1", "email");
        let summary = h.handle(MemoryCategory::Email, "m1", &mut state, &session("alice")).await.unwrap();
        assert_eq!(summary, "no changes");
    }

    #[tokio::test]
    async fn test_missing_trigger_is_an_error() {
        let h = handler(ScriptedExtraction::default(), Arc::new(InMemoryStore::new()));
        let mut state = triggered("hi", "m1", "todo");
        let err = h
            .handle(MemoryCategory::Todo, "other", &mut state, &session("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MissingToolCall { category: MemoryCategory::Todo }));

        // 已应答的调用同样找不到
        state.push(Message::tool("m1", "done"));
        let err = h
            .handle(MemoryCategory::Todo, "m1", &mut state, &session("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MissingToolCall { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let extraction = ScriptedExtraction::new(vec![vec![Mutation::create(json!({"name": "Alice"}))]]);
        let h = handler(extraction, Arc::new(ReadOnlyStore));
        let mut state = triggered("I'm Alice", "m1", "user");
        let err = h
            .handle(MemoryCategory::Profile, "m1", &mut state, &session("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Store(_)));
    }

    #[tokio::test]
    async fn test_instructions_overwrite_singleton() {
        let store = Arc::new(InMemoryStore::new());
        let s = session("alice");
        let ns = Namespace::for_session(MemoryCategory::Instructions, &s);
        store.put(&ns, "user_instructions", json!({"memory": "old rules"})).await.unwrap();

        let completion = Arc::new(ScriptedCompletion::new(vec![Message::assistant(
            "Always add a deadline to new tasks.",
        )]));
        let h = UpdateHandler::new(completion.clone(), Arc::new(ScriptedExtraction::default()), store.clone());
        let mut state = triggered("please always add deadlines", "m1", "instructions");

        let ack = h.handle(MemoryCategory::Instructions, "m1", &mut state, &s).await.unwrap();

        assert_eq!(ack, "updated instructions");
        let record = store.get(&ns, "user_instructions").await.unwrap().unwrap();
        assert_eq!(record.value["memory"], "Always add a deadline to new tasks.");
        assert_eq!(store.search(&ns).await.unwrap().len(), 1);

        let call = &completion.calls()[0];
        assert!(call.preamble.contains("old rules"));
        assert!(call.tools.is_empty());
        assert_eq!(call.messages.last().unwrap().content, INSTRUCTIONS_REQUEST);
    }

    fn replayed(update_type: &str) -> ConversationState {
        ConversationState::from_messages(vec![
            Message::user("hi"),
            Message::assistant("Hello!"),
            Message::assistant("Hello!"),
            Message::tool("lost", "dangling answer"),
            Message::user("always add deadlines"),
            Message::assistant_with_tools(
                "",
                vec![ToolCall::new("m1", "UpdateMemory", json!({ "update_type": update_type }))],
            ),
        ])
    }

    #[tokio::test]
    async fn test_side_calls_see_sanitized_history() {
        let store = Arc::new(InMemoryStore::new());
        let s = session("alice");

        let completion = Arc::new(ScriptedCompletion::new(vec![Message::assistant("Add deadlines.")]));
        let h = UpdateHandler::new(completion.clone(), Arc::new(ScriptedExtraction::default()), store.clone());
        let mut state = replayed("instructions");
        h.handle(MemoryCategory::Instructions, "m1", &mut state, &s).await.unwrap();

        let calls = completion.calls();
        let seen = &calls[0].messages;
        assert!(seen.iter().all(|m| m.tool_call_id.is_none()));
        // user, 去重后的一条 assistant, user, 追加的请求
        assert_eq!(seen.len(), 4);

        let extraction = Arc::new(ScriptedExtraction::default());
        let h = UpdateHandler::new(Arc::new(ScriptedCompletion::default()), extraction.clone(), store);
        let mut state = replayed("todo");
        h.handle(MemoryCategory::Todo, "m1", &mut state, &s).await.unwrap();

        let calls = extraction.calls();
        let seen = &calls[0].messages;
        assert!(seen.iter().all(|m| m.tool_call_id.is_none()));
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_subjects_do_not_cross_write() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        let alice = session("alice");
        let bob = session("bob");

        let h_alice = handler(
            ScriptedExtraction::new(vec![vec![Mutation::create(json!({"name": "Alice"}))]]),
            store.clone(),
        );
        let h_bob = handler(
            ScriptedExtraction::new(vec![vec![Mutation::create(json!({"name": "Bob"}))]]),
            store.clone(),
        );
        let mut s_alice = triggered("I'm Alice", "a1", "user");
        let mut s_bob = triggered("I'm Bob", "b1", "user");

        let (ra, rb) = tokio::join!(
            h_alice.handle(MemoryCategory::Profile, "a1", &mut s_alice, &alice),
            h_bob.handle(MemoryCategory::Profile, "b1", &mut s_bob, &bob),
        );
        ra.unwrap();
        rb.unwrap();

        let a = store
            .get(&Namespace::for_session(MemoryCategory::Profile, &alice), "user_profile")
            .await
            .unwrap()
            .unwrap();
        let b = store
            .get(&Namespace::for_session(MemoryCategory::Profile, &bob), "user_profile")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.value["name"], "Alice");
        assert_eq!(b.value["name"], "Bob");
    }
}
