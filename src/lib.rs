//! Maistro - 对话式任务助手的回合编排核心
//!
//! 模块划分：
//! - **agent**: 无头运行时（组件装配、单条消息处理）
//! - **config**: 应用配置加载（TOML + 环境变量）与会话身份
//! - **core**: 错误类型
//! - **llm**: 补全 / 结构化抽取服务抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **memory**: 对话日志、历史清洗、命名空间记忆存储与文档结构
//! - **react**: TurnController、Router、记忆更新处理器、回合主循环
//! - **tools**: 工具注册表、UpdateMemory 标记、工具分发器
//! - **observability**: tracing 初始化

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{create_agent_components, process_message, AgentComponents};
pub use config::{load_config, AppConfig, SessionConfig};
pub use core::AgentError;
