//! Headless Agent 运行时
//!
//! 供外部前端（HTTP、CLI 等）调用的无界面入口：
//! create_agent_components 按配置构建存储、补全 / 抽取客户端、工具注册表与编排组件，
//! process_message 对单条用户输入跑完整回合并返回最终回复。

use std::sync::Arc;

use anyhow::Context;

use crate::config::{AppConfig, SessionConfig, StoreBackend};
use crate::core::AgentError;
use crate::llm::{CompletionService, ExtractionService, OpenAiCompatClient};
use crate::memory::{ConversationState, InMemoryStore, MemoryStore, Message, SqliteMemoryStore};
use crate::react::{run_turn, LoopGuard, Router, TurnController, TurnOutcome, TurnSession, UpdateHandler};
use crate::tools::{tool_schemas, EchoTool, ToolDispatcher, ToolRegistry};

/// 预构建的 Agent 组件，可多会话共享；会话间的隔离完全由 SessionConfig 决定的命名空间保证
pub struct AgentComponents {
    pub controller: TurnController,
    pub router: Router,
    pub updater: UpdateHandler,
    pub dispatcher: ToolDispatcher,
    pub store: Arc<dyn MemoryStore>,
    pub max_turn_steps: usize,
}

impl AgentComponents {
    /// 由已构建的服务组装（测试与自定义宿主使用）
    pub fn new(
        cfg: &AppConfig,
        completion: Arc<dyn CompletionService>,
        extraction: Arc<dyn ExtractionService>,
        store: Arc<dyn MemoryStore>,
        registry: ToolRegistry,
    ) -> Self {
        let registry = Arc::new(registry);
        let guard = LoopGuard::new(cfg.agent.loop_window, cfg.agent.loop_threshold);
        Self {
            controller: TurnController::new(completion.clone(), store.clone(), tool_schemas(&registry)),
            router: Router::new(registry.clone()).with_loop_guard(guard),
            updater: UpdateHandler::new(completion, extraction, store.clone()),
            dispatcher: ToolDispatcher::new(registry, store.clone(), cfg.tools.tool_timeout_secs)
                .with_max_concurrency(cfg.tools.max_concurrency),
            store,
            max_turn_steps: cfg.agent.max_turn_steps,
        }
    }

    pub fn session(&self) -> TurnSession<'_> {
        TurnSession::new(&self.controller, &self.router, &self.updater, &self.dispatcher)
            .with_max_steps(self.max_turn_steps)
    }
}

/// 按配置创建 Agent 组件：存储后端、OpenAI 兼容客户端（同时作为补全与抽取服务）、内置工具
pub fn create_agent_components(cfg: &AppConfig) -> anyhow::Result<AgentComponents> {
    let store: Arc<dyn MemoryStore> = match cfg.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(
            SqliteMemoryStore::open(&cfg.store.path)
                .with_context(|| format!("failed to open memory store at {}", cfg.store.path.display()))?,
        ),
    };

    let client = Arc::new(OpenAiCompatClient::new(
        cfg.llm.base_url.as_deref(),
        &cfg.llm.model,
        cfg.llm.api_key.as_deref(),
        cfg.llm.request_timeout_secs,
    ));

    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);

    tracing::info!(
        model = %cfg.llm.model,
        backend = ?cfg.store.backend,
        tools = ?tools.tool_names(),
        "Agent components ready"
    );

    Ok(AgentComponents::new(cfg, client.clone(), client, store, tools))
}

/// 处理单条用户消息：追加到对话、跑完整回合，返回最终回复与结束原因
pub async fn process_message_with_outcome(
    components: &AgentComponents,
    state: &mut ConversationState,
    session: &SessionConfig,
    user_input: &str,
) -> Result<TurnOutcome, AgentError> {
    state.push(Message::user(user_input));
    run_turn(&components.session(), state, session).await
}

/// 处理单条用户消息，只返回最终回复文本
pub async fn process_message(
    components: &AgentComponents,
    state: &mut ConversationState,
    session: &SessionConfig,
    user_input: &str,
) -> Result<String, AgentError> {
    let outcome = process_message_with_outcome(components, state, session, user_input).await?;
    Ok(outcome.reply)
}
