//! 回合主循环
//!
//! TurnController -> Router -> (UpdateHandler | ToolDispatcher) -> 下一轮 TurnController，
//! 由宿主驱动、不递归。同一条 assistant 消息上的多个待处理调用在交还 TurnController 之前全部应答，
//! 补全服务永远看不到只应答了一部分的 assistant 消息。步数上限防止死循环。

use crate::config::SessionConfig;
use crate::core::AgentError;
use crate::memory::{ConversationState, Message, Role};
use crate::react::{EndReason, Route, Router, TurnController, UpdateHandler};
use crate::tools::ToolDispatcher;

/// 单个回合的默认最大补全次数
pub const DEFAULT_MAX_TURN_STEPS: usize = 10;

/// 回合结果
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// 最后一条 assistant 消息的文本
    pub reply: String,
    pub end: EndReason,
    /// 本回合调用补全服务的次数
    pub steps: usize,
}

/// 跑一个回合所需的组件引用
pub struct TurnSession<'a> {
    pub controller: &'a TurnController,
    pub router: &'a Router,
    pub updater: &'a UpdateHandler,
    pub dispatcher: &'a ToolDispatcher,
    pub max_steps: usize,
}

impl<'a> TurnSession<'a> {
    pub fn new(
        controller: &'a TurnController,
        router: &'a Router,
        updater: &'a UpdateHandler,
        dispatcher: &'a ToolDispatcher,
    ) -> Self {
        Self {
            controller,
            router,
            updater,
            dispatcher,
            max_steps: DEFAULT_MAX_TURN_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }
}

/// 运行一个回合直到 Router 给出终止
///
/// 幻觉工具名与未知记忆类别以错误形式返回；循环检测与已应答终止属于正常结束。
/// 无论以何种方式结束，最近一条 assistant 消息上仍未应答的调用都会补上说明性应答，
/// 下一回合的补全请求不会带着悬空的调用。
pub async fn run_turn(
    session: &TurnSession<'_>,
    state: &mut ConversationState,
    config: &SessionConfig,
) -> Result<TurnOutcome, AgentError> {
    let result = drive_turn(session, state, config).await;
    close_unanswered(state, &result);
    result
}

async fn drive_turn(
    session: &TurnSession<'_>,
    state: &mut ConversationState,
    config: &SessionConfig,
) -> Result<TurnOutcome, AgentError> {
    let mut steps = 0;

    loop {
        if steps >= session.max_steps {
            tracing::warn!(max_steps = session.max_steps, "Turn step limit reached");
            return Err(AgentError::TurnLimitExceeded(session.max_steps));
        }
        steps += 1;
        session.controller.run(state, config).await?;

        let mut route = session.router.route(state);
        loop {
            match route {
                Route::End(EndReason::AllAnswered) if answered_since_latest_assistant(state) => break,
                Route::End(reason) => return finish(state, reason, steps),
                Route::Update { category, call_id } => {
                    session.updater.handle(category, &call_id, state, config).await?;
                }
                Route::Dispatch => {
                    let n = session.dispatcher.dispatch_pending(state, config).await;
                    tracing::debug!(answered = n, "Dispatched pending tool calls");
                }
            }
            route = session.router.route_pending(state);
        }
    }
}

/// 为最近一条 assistant 消息上仍未应答的调用追加应答，内容说明本回合为何没有执行它
fn close_unanswered(state: &mut ConversationState, result: &Result<TurnOutcome, AgentError>) {
    let answers: Vec<Message> = state
        .unanswered_calls()
        .into_iter()
        .map(|call| {
            let content = match result {
                Err(AgentError::HallucinatedTool(name)) if *name == call.name => {
                    format!("Unsupported operation '{}'", call.name)
                }
                Err(e) => format!("Error executing {}: {e}", call.name),
                Ok(outcome) => match &outcome.end {
                    EndReason::LoopDetected { .. } => {
                        format!("Skipped repeated call to {} with identical arguments", call.name)
                    }
                    end => format!("Not executed: turn ended ({end:?})"),
                },
            };
            Message::tool(call.id.clone(), content)
        })
        .collect();

    if !answers.is_empty() {
        tracing::debug!(closed = answers.len(), "Answered calls left open at turn end");
        state.extend(answers);
    }
}

/// 最近一条 assistant 消息之后是否已有应答（即本轮刚处理过它的调用）
fn answered_since_latest_assistant(state: &ConversationState) -> bool {
    state
        .latest_assistant_index()
        .is_some_and(|idx| idx + 1 < state.len())
}

fn finish(state: &ConversationState, end: EndReason, steps: usize) -> Result<TurnOutcome, AgentError> {
    match end {
        EndReason::UnknownTool(name) => {
            tracing::warn!(tool = %name, "Model requested an unregistered tool");
            Err(AgentError::HallucinatedTool(name))
        }
        EndReason::UnknownCategory(raw) => Err(AgentError::UnknownCategory(raw)),
        end => {
            let reply = state
                .messages()
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            tracing::debug!(end = ?end, steps, "Turn finished");
            Ok(TurnOutcome { reply, end, steps })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::llm::{Mutation, ScriptedCompletion, ScriptedExtraction};
    use crate::memory::{InMemoryStore, MemoryCategory, MemoryStore, Namespace, ToolCall};
    use crate::tools::{tool_schemas, EchoTool, ToolRegistry};

    struct Fixture {
        completion: Arc<ScriptedCompletion>,
        store: Arc<InMemoryStore>,
        controller: TurnController,
        router: Router,
        updater: UpdateHandler,
        dispatcher: ToolDispatcher,
    }

    impl Fixture {
        fn new(replies: Vec<Message>, extractions: Vec<Vec<Mutation>>) -> Self {
            let completion = Arc::new(ScriptedCompletion::new(replies));
            let store = Arc::new(InMemoryStore::new());
            let mut registry = ToolRegistry::new();
            registry.register(EchoTool);
            let registry = Arc::new(registry);
            Self {
                controller: TurnController::new(completion.clone(), store.clone(), tool_schemas(&registry)),
                router: Router::new(registry.clone()),
                updater: UpdateHandler::new(
                    completion.clone(),
                    Arc::new(ScriptedExtraction::new(extractions)),
                    store.clone(),
                ),
                dispatcher: ToolDispatcher::new(registry, store.clone(), 5),
                completion,
                store,
            }
        }

        fn session(&self) -> TurnSession<'_> {
            TurnSession::new(&self.controller, &self.router, &self.updater, &self.dispatcher)
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new("alice", "general")
    }

    #[tokio::test]
    async fn test_plain_reply_is_one_step() {
        let f = Fixture::new(vec![Message::assistant("Hello!")], vec![]);
        let mut state = ConversationState::from_messages(vec![Message::user("hi")]);

        let outcome = run_turn(&f.session(), &mut state, &config()).await.unwrap();

        assert_eq!(outcome.reply, "Hello!");
        assert_eq!(outcome.end, EndReason::NoToolCalls);
        assert_eq!(outcome.steps, 1);
    }

    #[tokio::test]
    async fn test_todo_update_then_reply() {
        let f = Fixture::new(
            vec![
                Message::assistant_with_tools(
                    "",
                    vec![ToolCall::new("m1", "UpdateMemory", json!({"update_type": "todo"}))],
                ),
                Message::assistant("Added it to your list."),
            ],
            vec![vec![Mutation::create(json!({
                "task": "call the dentist",
                "solutions": ["Dr. Smith, 555-0100"]
            }))]],
        );
        let mut state = ConversationState::from_messages(vec![Message::user("remind me to call the dentist")]);

        let outcome = run_turn(&f.session(), &mut state, &config()).await.unwrap();

        assert_eq!(outcome.reply, "Added it to your list.");
        assert_eq!(outcome.steps, 2);
        let todos = f
            .store
            .search(&Namespace::for_session(MemoryCategory::Todo, &config()))
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);
        // 第二次补全能看到新的 ToDo
        assert!(f.completion.calls()[1].preamble.contains("call the dentist"));
    }

    #[tokio::test]
    async fn test_siblings_answered_before_next_completion() {
        let f = Fixture::new(
            vec![
                Message::assistant_with_tools(
                    "",
                    vec![
                        ToolCall::new("c1", "echo", json!({"text": "ping"})),
                        ToolCall::new("m1", "UpdateMemory", json!({"update_type": "email"})),
                    ],
                ),
                Message::assistant("Done."),
            ],
            vec![],
        );
        let mut state = ConversationState::from_messages(vec![Message::user("echo and draft")]);

        run_turn(&f.session(), &mut state, &config()).await.unwrap();

        let second = &f.completion.calls()[1];
        let answered: Vec<&str> = second
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(answered, vec!["c1", "m1"]);
    }

    #[tokio::test]
    async fn test_hallucinated_tool_is_an_error() {
        let f = Fixture::new(
            vec![Message::assistant_with_tools(
                "",
                vec![ToolCall::new("c1", "send_fax", json!({}))],
            )],
            vec![],
        );
        let mut state = ConversationState::from_messages(vec![Message::user("fax it")]);
        let err = run_turn(&f.session(), &mut state, &config()).await.unwrap_err();
        assert!(matches!(err, AgentError::HallucinatedTool(name) if name == "send_fax"));
    }

    #[tokio::test]
    async fn test_failed_turn_leaves_no_open_calls_for_the_next_turn() {
        let f = Fixture::new(
            vec![
                Message::assistant_with_tools(
                    "",
                    vec![
                        ToolCall::new("c1", "send_fax", json!({"to": "bob"})),
                        ToolCall::new("m1", "UpdateMemory", json!({"update_type": "todo"})),
                    ],
                ),
                Message::assistant("Sorry, I can't send faxes."),
            ],
            vec![],
        );
        let mut state = ConversationState::from_messages(vec![Message::user("fax bob and remind me")]);

        let err = run_turn(&f.session(), &mut state, &config()).await.unwrap_err();
        assert!(matches!(err, AgentError::HallucinatedTool(_)));
        assert!(state.unanswered_calls().is_empty());

        state.push(Message::user("ok, just tell me what you can do"));
        let outcome = run_turn(&f.session(), &mut state, &config()).await.unwrap();
        assert_eq!(outcome.reply, "Sorry, I can't send faxes.");

        let calls = f.completion.calls();
        let seen = &calls[1].messages;
        let answers: Vec<&Message> = seen.iter().filter(|m| m.tool_call_id.is_some()).collect();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].tool_call_id.as_deref(), Some("c1"));
        assert!(answers[0].content.contains("Unsupported operation 'send_fax'"));
        assert_eq!(answers[1].tool_call_id.as_deref(), Some("m1"));
        assert!(answers[1].content.starts_with("Error executing UpdateMemory"));
    }

    #[tokio::test]
    async fn test_loop_break_answers_the_repeated_call() {
        let replies = (1..=3)
            .map(|i| {
                Message::assistant_with_tools(
                    "",
                    vec![ToolCall::new(format!("c{i}"), "echo", json!({"text": "x"}))],
                )
            })
            .collect();
        let f = Fixture::new(replies, vec![]);
        let mut state = ConversationState::from_messages(vec![Message::user("echo x")]);

        let outcome = run_turn(&f.session(), &mut state, &config()).await.unwrap();

        assert!(matches!(outcome.end, EndReason::LoopDetected { .. }));
        assert!(state.unanswered_calls().is_empty());
        let last = state.last().unwrap();
        assert_eq!(last.tool_call_id.as_deref(), Some("c3"));
        assert!(last.content.starts_with("Skipped repeated call"));
    }

    #[tokio::test]
    async fn test_step_limit() {
        let replies = (0..5)
            .map(|i| {
                Message::assistant_with_tools(
                    "",
                    vec![ToolCall::new(format!("c{i}"), "echo", json!({ "text": format!("{i}") }))],
                )
            })
            .collect();
        let f = Fixture::new(replies, vec![]);
        let session = f.session().with_max_steps(3);
        let mut state = ConversationState::from_messages(vec![Message::user("keep going")]);

        let err = run_turn(&session, &mut state, &config()).await.unwrap_err();
        assert!(matches!(err, AgentError::TurnLimitExceeded(3)));
        assert_eq!(f.completion.calls().len(), 3);
    }
}
