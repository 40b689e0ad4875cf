//! SQLite 持久化的记忆存储
//!
//! 单表 memory_records，主键 (category, scope, subject, key)。每次 put 是一条
//! `INSERT .. ON CONFLICT DO UPDATE`，单条记录原子写入；search 按首次写入（rowid）排序。

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::memory::{MemoryRecord, MemoryStore, Namespace, StoreError};

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS memory_records (
    category   TEXT NOT NULL,
    scope      TEXT NOT NULL,
    subject    TEXT NOT NULL,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (category, scope, subject, key)
)";

pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    /// 打开（或创建）数据库文件
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, DateTime<Utc>, DateTime<Utc>)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }
}

fn into_record(
    (key, raw, created_at, updated_at): (String, String, DateTime<Utc>, DateTime<Utc>),
) -> Result<MemoryRecord, StoreError> {
    Ok(MemoryRecord {
        key,
        value: serde_json::from_str(&raw)?,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<MemoryRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let row = conn
            .query_row(
                "SELECT key, value, created_at, updated_at FROM memory_records
                 WHERE category = ?1 AND scope = ?2 AND subject = ?3 AND key = ?4",
                params![namespace.category.as_str(), namespace.scope, namespace.subject, key],
                Self::row_to_record,
            )
            .optional()?;
        row.map(into_record).transpose()
    }

    async fn search(&self, namespace: &Namespace) -> Result<Vec<MemoryRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT key, value, created_at, updated_at FROM memory_records
             WHERE category = ?1 AND scope = ?2 AND subject = ?3
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(
            params![namespace.category.as_str(), namespace.scope, namespace.subject],
            Self::row_to_record,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(into_record(row?)?);
        }
        Ok(records)
    }

    async fn put(&self, namespace: &Namespace, key: &str, value: Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&value)?;
        let now = Utc::now();
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO memory_records (category, scope, subject, key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(category, scope, subject, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                namespace.category.as_str(),
                namespace.scope,
                namespace.subject,
                key,
                raw,
                now
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCategory;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMemoryStore::open(dir.path().join("memory.db")).unwrap();
        let ns = Namespace::new(MemoryCategory::Todo, "general", "alice");

        store.put(&ns, "t1", json!({"task": "call the dentist"})).await.unwrap();
        store.put(&ns, "t2", json!({"task": "buy milk"})).await.unwrap();
        store.put(&ns, "t1", json!({"task": "call the dentist at 9"})).await.unwrap();

        let items = store.search(&ns).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key, "t1");
        assert_eq!(items[0].value["task"], "call the dentist at 9");
        assert!(items[0].updated_at >= items[0].created_at);

        let got = store.get(&ns, "t2").await.unwrap().unwrap();
        assert_eq!(got.value["task"], "buy milk");
        assert!(store.get(&ns, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_namespaces_are_isolated() {
        let store = SqliteMemoryStore::open_in_memory().unwrap();
        let alice = Namespace::new(MemoryCategory::Profile, "general", "alice");
        let bob = Namespace::new(MemoryCategory::Profile, "general", "bob");
        let work = Namespace::new(MemoryCategory::Profile, "work", "alice");

        store.put(&alice, "user_profile", json!({"name": "Alice"})).await.unwrap();

        assert!(store.get(&bob, "user_profile").await.unwrap().is_none());
        assert!(store.search(&work).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.db");
        let ns = Namespace::new(MemoryCategory::Instructions, "general", "alice");
        {
            let store = SqliteMemoryStore::open(&path).unwrap();
            store.put(&ns, "user_instructions", json!({"memory": "short tasks"})).await.unwrap();
        }
        let store = SqliteMemoryStore::open(&path).unwrap();
        let got = store.get(&ns, "user_instructions").await.unwrap().unwrap();
        assert_eq!(got.value["memory"], "short tasks");
    }
}
