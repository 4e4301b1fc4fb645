//! 工具层：Tool trait 与注册表、执行器、三个文本算法（补丁、字面量替换、项目搜索）以及具体工具

pub mod apply_patch;
pub mod delegate_tasks;
pub mod executor;
pub mod filesystem;
pub mod language;
pub mod literal_replace;
pub mod move_files;
pub mod multi_model_query;
pub mod patch_engine;
pub mod project_search;
pub mod registry;
pub mod rename_files;
pub mod request_files;
pub mod result;
pub mod rewrite_file;
pub mod run_command;
pub mod schema;
pub mod search_and_replace;
pub mod search_project;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::BbaiError;

pub use apply_patch::ApplyPatchTool;
pub use delegate_tasks::DelegateTasksTool;
pub use executor::ToolExecutor;
pub use filesystem::SafeFs;
pub use move_files::MoveFilesTool;
pub use multi_model_query::MultiModelQueryTool;
pub use patch_engine::{unified_diff, PatchEngine, PatchOutcome};
pub use project_search::{ProjectSearchEngine, SearchCriteria, SearchResult};
pub use registry::{Tool, ToolCapability, ToolDefinition, ToolRegistry};
pub use rename_files::RenameFilesTool;
pub use request_files::RequestFilesTool;
pub use result::{BbaiResponse, ChangeKind, FileChange, FinalizeCallback, ToolResult};
pub use rewrite_file::RewriteFileTool;
pub use run_command::RunCommandTool;
pub use schema::tool_call_schema_json;
pub use search_and_replace::SearchAndReplaceTool;
pub use search_project::SearchProjectTool;

/// 把已通过 schema 校验的输入反序列化为工具自己的参数结构
pub(crate) fn parse_input<T: DeserializeOwned>(tool: &str, input: &Value) -> Result<T, BbaiError> {
    serde_json::from_value(input.clone())
        .map_err(|e| BbaiError::tool(tool, format!("Invalid input: {}", e)))
}

/// 按字符数截断，追加标记
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("\n...[truncated]");
    out
}
