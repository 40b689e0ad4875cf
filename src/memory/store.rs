//! 命名空间隔离的记忆存储
//!
//! 命名空间为 (category, scope, subject) 三元组，由会话身份派生；不同会话之间没有共享的可变状态。
//! MemoryStore 只提供 get / search / put，本核心内不做删除。单条记录的写入是原子的。

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::SessionConfig;

/// 记忆类别；profile 与 instructions 为单例（固定键），其余为多值（生成键）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryCategory {
    Profile,
    Todo,
    Instructions,
    Email,
    ToolLog,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Profile => "profile",
            MemoryCategory::Todo => "todo",
            MemoryCategory::Instructions => "instructions",
            MemoryCategory::Email => "email",
            MemoryCategory::ToolLog => "tool-log",
        }
    }

    /// 单例类别的固定键
    pub fn singleton_key(&self) -> Option<&'static str> {
        match self {
            MemoryCategory::Profile => Some("user_profile"),
            MemoryCategory::Instructions => Some("user_instructions"),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 存储分区标识
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub category: MemoryCategory,
    pub scope: String,
    pub subject: String,
}

impl Namespace {
    pub fn new(category: MemoryCategory, scope: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            category,
            scope: scope.into(),
            subject: subject.into(),
        }
    }

    /// 由会话身份派生命名空间
    pub fn for_session(category: MemoryCategory, session: &SessionConfig) -> Self {
        Self::new(category, session.scope.clone(), session.subject_id.clone())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.category, self.scope, self.subject)
    }
}

/// 命名空间内的一条记录：key 在命名空间内唯一
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// 记忆存储 trait
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<MemoryRecord>, StoreError>;

    /// 命名空间内全部记录，按首次写入顺序
    async fn search(&self, namespace: &Namespace) -> Result<Vec<MemoryRecord>, StoreError>;

    /// 创建或整体覆盖一条记录
    async fn put(&self, namespace: &Namespace, key: &str, value: Value) -> Result<(), StoreError>;
}

/// 进程内存储
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<Namespace, Vec<MemoryRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前已有记录的命名空间
    pub async fn namespaces(&self) -> Vec<Namespace> {
        self.records.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<MemoryRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(namespace)
            .and_then(|items| items.iter().find(|r| r.key == key))
            .cloned())
    }

    async fn search(&self, namespace: &Namespace) -> Result<Vec<MemoryRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(namespace).cloned().unwrap_or_default())
    }

    async fn put(&self, namespace: &Namespace, key: &str, value: Value) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let items = records.entry(namespace.clone()).or_default();
        match items.iter_mut().find(|r| r.key == key) {
            Some(existing) => {
                existing.value = value;
                existing.updated_at = now;
            }
            None => items.push(MemoryRecord {
                key: key.to_string(),
                value,
                created_at: now,
                updated_at: now,
            }),
        }
        Ok(())
    }
}
