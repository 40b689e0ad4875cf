//! 持久化文档结构：Profile / ToDo / EmailDraft / Instructions
//!
//! schemars 生成的 JSON Schema 作为抽取服务的目标 schema；抽取结果反序列化为这些类型即视为符合 schema。

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::MemoryCategory;

/// 抽取模型给出的时间常不带时区或只有日期：RFC 3339 优先，其余按 UTC 解释
mod lenient_date {
    use super::*;
    use serde::de::Error;
    use serde::Deserializer;

    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"];

    fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn required<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("unrecognized datetime '{raw}'")))
    }

    pub fn option<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => parse(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("unrecognized datetime '{raw}'"))),
        }
    }
}

/// 正在对话的用户的资料
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Profile {
    /// The user's name
    #[serde(default)]
    pub name: Option<String>,
    /// The user's location
    #[serde(default)]
    pub location: Option<String>,
    /// The user's job
    #[serde(default)]
    pub job: Option<String>,
    /// Personal connections of the user, such as family members, friends, or coworkers
    #[serde(default)]
    pub connections: Vec<String>,
    /// Interests that the user has
    #[serde(default)]
    pub interests: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TodoStatus {
    #[default]
    #[serde(rename = "not started")]
    NotStarted,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "archived")]
    Archived,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToDo {
    /// The task to be completed.
    pub task: String,
    /// Estimated time to complete the task (minutes).
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
    /// When the task needs to be completed by (if applicable)
    #[serde(default, deserialize_with = "lenient_date::option")]
    pub deadline: Option<DateTime<Utc>>,
    /// List of specific, actionable solutions (e.g., specific ideas, service providers,
    /// or concrete options relevant to completing the task)
    pub solutions: Vec<String>,
    /// Current status of the task
    #[serde(default)]
    pub status: TodoStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmailType {
    #[default]
    Reply,
    New,
    Forward,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    #[default]
    Draft,
    ReadyToSend,
    Sent,
}

/// Email draft to be composed and sent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EmailDraft {
    /// Email recipient name or address
    pub recipient: String,
    /// Email subject line
    #[serde(default)]
    pub subject: Option<String>,
    /// Email content/body text
    pub body: String,
    #[serde(default, rename = "type")]
    pub email_type: EmailType,
    /// Context about the original email or conversation
    #[serde(default)]
    pub reference_context: Option<String>,
    #[serde(default)]
    pub status: EmailStatus,
    #[serde(default = "Utc::now", deserialize_with = "lenient_date::required")]
    pub created_date: DateTime<Utc>,
}

/// 用户对 ToDo 列表维护方式的偏好（自由文本）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Instructions {
    #[serde(rename = "memory")]
    pub free_text: String,
}

/// 类别对应的 schema 名与 JSON Schema（tool-log 无 schema）
pub fn target_schema(category: MemoryCategory) -> Option<(&'static str, Value)> {
    let (name, schema) = match category {
        MemoryCategory::Profile => ("Profile", schema_for!(Profile)),
        MemoryCategory::Todo => ("ToDo", schema_for!(ToDo)),
        MemoryCategory::Email => ("EmailDraft", schema_for!(EmailDraft)),
        MemoryCategory::Instructions => ("Instructions", schema_for!(Instructions)),
        MemoryCategory::ToolLog => return None,
    };
    serde_json::to_value(schema).ok().map(|v| (name, v))
}

/// 按类别 schema 校验并规范化抽取值：反序列化为对应类型后再序列化回 JSON
pub fn validate_document(category: MemoryCategory, value: Value) -> Result<Value, String> {
    fn roundtrip<T: Serialize + for<'de> Deserialize<'de>>(value: Value) -> Result<Value, String> {
        let doc: T = serde_json::from_value(value).map_err(|e| e.to_string())?;
        serde_json::to_value(doc).map_err(|e| e.to_string())
    }

    match category {
        MemoryCategory::Profile => roundtrip::<Profile>(value),
        MemoryCategory::Todo => {
            let todo: ToDo = serde_json::from_value(value).map_err(|e| e.to_string())?;
            if todo.solutions.is_empty() {
                return Err("solutions must contain at least one item".to_string());
            }
            serde_json::to_value(todo).map_err(|e| e.to_string())
        }
        MemoryCategory::Email => roundtrip::<EmailDraft>(value),
        MemoryCategory::Instructions => roundtrip::<Instructions>(value),
        MemoryCategory::ToolLog => Ok(value),
    }
}
