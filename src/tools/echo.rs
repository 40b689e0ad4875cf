//! Echo 工具（测试用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::SessionConfig;
use crate::memory::ToolArgs;
use crate::tools::{Tool, ToolError};

/// Echo 工具：回显文本，缺少 text 时报参数错误
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: ToolArgs, _session: &SessionConfig) -> Result<String, ToolError> {
        args.get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ToolError::InvalidArgs("missing 'text'".to_string()))
    }
}
