//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MAISTRO__*` 覆盖（双下划线表示嵌套，如 `MAISTRO__SESSION__SCOPE=work`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 默认的助手角色描述
pub const DEFAULT_PERSONA: &str = "You are a helpful chatbot. You are designed to be a companion to a user, \
helping them keep track of their ToDo list, their email drafts and the things they care about.";

/// 会话身份与人设（只读），决定命名空间并随工具调用一并传入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub subject_id: String,
    pub scope: String,
    pub persona: String,
}

impl SessionConfig {
    pub fn new(subject_id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            scope: scope.into(),
            persona: DEFAULT_PERSONA.to_string(),
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(default_subject_id(), default_scope())
    }
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub store: StoreSection,
    pub tools: ToolsSection,
}

impl AppConfig {
    /// 由 [session] 段构造默认会话
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.session.subject_id.clone(), self.session.scope.clone())
            .with_persona(self.session.persona.clone())
    }
}

/// [session] 段：默认会话身份
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_subject_id")]
    pub subject_id: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_persona")]
    pub persona: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            subject_id: default_subject_id(),
            scope: default_scope(),
            persona: default_persona(),
        }
    }
}

fn default_subject_id() -> String {
    "default-user".to_string()
}

fn default_scope() -> String {
    "general".to_string()
}

fn default_persona() -> String {
    DEFAULT_PERSONA.to_string()
}

/// [agent] 段：回合步数上限与循环检测
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 单回合内 TurnController + 分发的最大步数
    #[serde(default = "default_max_turn_steps")]
    pub max_turn_steps: usize,
    /// 循环检测回看的消息条数
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,
    /// 同一签名出现次数超过此值即终止
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_turn_steps: default_max_turn_steps(),
            loop_window: default_loop_window(),
            loop_threshold: default_loop_threshold(),
        }
    }
}

fn default_max_turn_steps() -> usize {
    10
}

fn default_loop_window() -> usize {
    5
}

fn default_loop_threshold() -> usize {
    2
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// 未设置时读取环境变量 OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            model: default_model(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

/// [store] 段：记忆存储后端
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("memory.db")
}

/// [tools] 段：工具超时与单次分发的并发度
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

/// 从 config 目录加载配置，环境变量 MAISTRO__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MAISTRO__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MAISTRO")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
