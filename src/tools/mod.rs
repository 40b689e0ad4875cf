pub mod dispatcher;
pub mod echo;
pub mod registry;
pub mod schema;

pub use dispatcher::ToolDispatcher;
pub use echo::EchoTool;
pub use registry::{Tool, ToolError, ToolRegistry};
pub use schema::{
    is_memory_marker, memory_update_schema, parse_update_category, tool_schemas, UpdateType,
    UPDATE_MEMORY_TOOL,
};
