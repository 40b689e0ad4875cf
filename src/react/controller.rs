//! TurnController：拼装记忆上下文并调用补全服务
//!
//! 每次调用恰好一次补全、不写记忆：读取 profile / todo / email / instructions 四类记录，
//! 与人设一起渲染为 system 前言；历史先经 sanitize 清洗；返回的 assistant 消息追加到状态末尾。
//! 补全失败原样上抛。

use std::sync::Arc;

use serde_json::Value;

use crate::config::SessionConfig;
use crate::core::AgentError;
use crate::llm::{CompletionService, ToolSchema};
use crate::memory::{sanitize, ConversationState, MemoryCategory, MemoryStore, Namespace};

const MODEL_SYSTEM_MESSAGE: &str = "{persona}

You have a long term memory which keeps track of four things:
1. The user's profile (general information about them)
2. The user's ToDo list
3. General instructions for updating the ToDo list
4. Email drafts and composition requests

Here is the current User Profile (may be empty if no information has been collected yet):
<user_profile>
{user_profile}
</user_profile>

Here is the current ToDo List (may be empty if no tasks have been added yet):
<todo>
{todo}
</todo>

Here are current Email Drafts (may be empty if no emails have been drafted yet):
<emails>
{emails}
</emails>

Here are the current user-specified preferences for updating the ToDo list (may be empty if no preferences have been specified yet):
<instructions>
{instructions}
</instructions>

Here are your instructions for reasoning about the user's messages:

1. Reason carefully about the user's messages as presented below.

2. Use the external tools only when the user asks for an operation they provide.

3. Decide whether any of your long-term memory should be updated:
- If personal information was provided about the user, update the user's profile by calling UpdateMemory tool with type `user`
- If tasks are mentioned, update the ToDo list by calling UpdateMemory tool with type `todo`
- If the user has specified preferences for how to update the ToDo list, update the instructions by calling UpdateMemory tool with type `instructions`
- If email composition, replies, or email-related requests are mentioned, update emails by calling UpdateMemory tool with type `email`

4. Tell the user that you have updated your memory, if appropriate:
- Do not tell the user you have updated the user's profile
- Tell the user when you update the todo list
- Do not tell the user that you have updated instructions
- Tell the user when you create or update email drafts

5. For simple greetings, questions, or general conversation, respond directly without using tools.

6. Respond naturally and conversationally.";

pub struct TurnController {
    completion: Arc<dyn CompletionService>,
    store: Arc<dyn MemoryStore>,
    tools: Vec<ToolSchema>,
}

impl TurnController {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        store: Arc<dyn MemoryStore>,
        tools: Vec<ToolSchema>,
    ) -> Self {
        Self {
            completion,
            store,
            tools,
        }
    }

    /// 读取四类记忆并渲染 system 前言
    pub async fn build_preamble(&self, session: &SessionConfig) -> Result<String, AgentError> {
        let profile = self.singleton(MemoryCategory::Profile, session).await?;
        let instructions = self
            .singleton(MemoryCategory::Instructions, session)
            .await?
            .and_then(|v| v.get("memory").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        let todo = self.listing(MemoryCategory::Todo, session).await?;
        let emails = self.listing(MemoryCategory::Email, session).await?;

        let user_profile = profile
            .map(|v| v.to_string())
            .unwrap_or_else(|| "None".to_string());

        Ok(MODEL_SYSTEM_MESSAGE
            .replace("{persona}", &session.persona)
            .replace("{user_profile}", &user_profile)
            .replace("{todo}", &todo)
            .replace("{emails}", &emails)
            .replace("{instructions}", &instructions))
    }

    /// 一个回合：恰好一次补全，追加返回的 assistant 消息
    pub async fn run(&self, state: &mut ConversationState, session: &SessionConfig) -> Result<(), AgentError> {
        let preamble = self.build_preamble(session).await?;
        let history = sanitize(state.messages());
        tracing::debug!(
            raw = state.len(),
            sanitized = history.len(),
            "Calling completion service"
        );
        let reply = self.completion.complete(&preamble, &history, &self.tools).await?;
        tracing::debug!(tool_calls = reply.tool_calls.len(), "Assistant replied");
        state.push(reply);
        Ok(())
    }

    async fn singleton(&self, category: MemoryCategory, session: &SessionConfig) -> Result<Option<Value>, AgentError> {
        let Some(key) = category.singleton_key() else {
            return Ok(None);
        };
        let namespace = Namespace::for_session(category, session);
        Ok(self.store.get(&namespace, key).await?.map(|r| r.value))
    }

    async fn listing(&self, category: MemoryCategory, session: &SessionConfig) -> Result<String, AgentError> {
        let namespace = Namespace::for_session(category, session);
        let records = self.store.search(&namespace).await?;
        Ok(records
            .iter()
            .map(|r| r.value.to_string())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
