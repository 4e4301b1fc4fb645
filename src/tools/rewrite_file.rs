//! rewrite_file：用完整内容覆盖（或新建）一个文件

use async_trait::async_trait;
use crossterm::style::Stylize;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::conversation::{ConversationInteraction, ToolUse};
use crate::core::{BbaiError, FileOperation};
use crate::project::ProjectContext;
use crate::tools::filesystem::write_atomic;
use crate::tools::{
    parse_input, unified_diff, BbaiResponse, ChangeKind, FileChange, Tool, ToolCapability, ToolResult,
};

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteFileInput {
    file_path: String,
    content: String,
    #[serde(default = "default_true")]
    create_if_missing: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RewriteFileTool;

impl RewriteFileTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for RewriteFileTool {
    fn name(&self) -> &str {
        "rewrite_file"
    }

    fn description(&self) -> String {
        "Replace the entire content of a project file, creating it when createIfMissing is true. \
         Always send the complete file; partial content truncates the file."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filePath": { "type": "string" },
                "content": { "type": "string", "description": "Complete new file content" },
                "createIfMissing": { "type": "boolean" }
            },
            "required": ["filePath", "content"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::WriteProject
    }

    fn render_use_console(&self, input: &Value) -> String {
        let path = input["filePath"].as_str().unwrap_or("?");
        let lines = input["content"].as_str().map_or(0, |c| c.lines().count());
        format!("{} {} ({} lines)", "Rewriting".bold(), path.cyan(), lines)
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let input: RewriteFileInput = parse_input(self.name(), &tool_use.input)?;
        let path = project.resolve(&input.file_path)?;
        let rel = project.relative(&path);
        if input.content.trim().is_empty() {
            return Err(BbaiError::file(
                &rel,
                FileOperation::Rewrite,
                "new content is empty; refusing to blank the file",
            ));
        }
        let _guards = project.lock_paths(std::slice::from_ref(&path)).await;

        let original = match fs::read_to_string(&path).await {
            Ok(c) => Some(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(BbaiError::from_io(&rel, FileOperation::Read, e)),
        };
        if original.is_none() && !input.create_if_missing {
            return Err(BbaiError::file(
                &rel,
                FileOperation::Rewrite,
                "file does not exist and createIfMissing is false",
            ));
        }

        write_atomic(&path, input.content.as_bytes()).await?;

        let old = original.as_deref().unwrap_or("");
        let (kind, verb) = if original.is_some() {
            (ChangeKind::Modified, "Rewrote")
        } else {
            (ChangeKind::Created, "Created")
        };
        let change = FileChange::new(&rel, kind, format!("{} {}", verb, rel))
            .with_patch(unified_diff(&rel, old, &input.content, 3));
        Ok(ToolResult::success(
            format!("{} {} ({} bytes)", verb, rel, input.content.len()),
            BbaiResponse::data(json!({
                "filePath": rel,
                "created": original.is_none(),
                "bytes": input.content.len(),
            })),
        )
        .with_changes(vec![change]))
    }
}
