//! 记忆更新标记工具的 schema（schemars 自动生成）
//!
//! `UpdateMemory` 是保留的工具名：它不对应任何外部工具，而是告诉 Router 应当交给哪个更新处理器。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::llm::ToolSchema;
use crate::memory::{MemoryCategory, ToolArgs};
use crate::tools::ToolRegistry;

/// 保留的记忆更新标记名
pub const UPDATE_MEMORY_TOOL: &str = "UpdateMemory";

/// 要更新的记忆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    #[serde(alias = "profile")]
    User,
    Todo,
    Instructions,
    Email,
}

impl UpdateType {
    pub fn category(self) -> MemoryCategory {
        match self {
            UpdateType::User => MemoryCategory::Profile,
            UpdateType::Todo => MemoryCategory::Todo,
            UpdateType::Instructions => MemoryCategory::Instructions,
            UpdateType::Email => MemoryCategory::Email,
        }
    }
}

/// Decision on what memory type to update.
#[allow(dead_code)]
#[derive(Debug, Deserialize, JsonSchema)]
struct UpdateMemory {
    /// Which memory to update: user profile, ToDo list, ToDo instructions, or email drafts
    update_type: UpdateType,
}

pub fn is_memory_marker(name: &str) -> bool {
    name == UPDATE_MEMORY_TOOL
}

/// 解析标记调用声明的类别；无法识别时返回原始 update_type 文本
pub fn parse_update_category(args: &ToolArgs) -> Result<MemoryCategory, String> {
    let raw = args.get("update_type").cloned().unwrap_or(Value::Null);
    serde_json::from_value::<UpdateType>(raw.clone())
        .map(UpdateType::category)
        .map_err(|_| match raw {
            Value::String(s) => s,
            other => other.to_string(),
        })
}

/// 标记工具的 schema
pub fn memory_update_schema() -> ToolSchema {
    let mut parameters = serde_json::to_value(schema_for!(UpdateMemory)).unwrap_or_default();
    if let Some(obj) = parameters.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    ToolSchema {
        name: UPDATE_MEMORY_TOOL.to_string(),
        description: "Decision on what memory type to update. Use only when specifically needed \
                      to update user info, todos, instructions, or email drafts."
            .to_string(),
        parameters,
    }
}

/// 提供给补全服务的全部工具：记忆标记 + 注册表中的外部工具
pub fn tool_schemas(registry: &ToolRegistry) -> Vec<ToolSchema> {
    let mut schemas = vec![memory_update_schema()];
    schemas.extend(registry.schemas());
    schemas
}
