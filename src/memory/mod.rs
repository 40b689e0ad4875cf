//! 记忆层：对话日志、历史清洗、命名空间记忆存储（内存 / SQLite）、持久化文档结构

pub mod conversation;
pub mod documents;
pub mod sanitizer;
pub mod sqlite;
pub mod store;

pub use conversation::{
    canonical_json, normalize_arguments, ConversationState, Message, Role, ToolArgs, ToolCall,
};
pub use documents::{
    target_schema, validate_document, EmailDraft, EmailStatus, EmailType, Instructions, Profile,
    ToDo, TodoStatus,
};
pub use sanitizer::sanitize;
pub use sqlite::SqliteMemoryStore;
pub use store::{InMemoryStore, MemoryCategory, MemoryRecord, MemoryStore, Namespace, StoreError};
