//! rename_files：按 source → destination 对逐个重命名，规则与 move_files 相同

use std::path::PathBuf;

use async_trait::async_trait;
use crossterm::style::Stylize;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::conversation::{ConversationInteraction, ToolUse};
use crate::core::BbaiError;
use crate::project::ProjectContext;
use crate::tools::move_files::{execute_moves, report_to_result, PlannedMove};
use crate::tools::{parse_input, Tool, ToolCapability, ToolResult};

#[derive(Debug, Deserialize)]
struct RenameOperation {
    source: String,
    destination: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameFilesInput {
    operations: Vec<RenameOperation>,
    #[serde(default)]
    overwrite: bool,
    #[serde(default)]
    create_missing_directories: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RenameFilesTool;

impl RenameFilesTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for RenameFilesTool {
    fn name(&self) -> &str {
        "rename_files"
    }

    fn description(&self) -> String {
        "Rename project files. Each operation gives a source path and its full new path. \
         Existing destinations are kept unless overwrite is true."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operations": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "source": { "type": "string" },
                            "destination": { "type": "string" }
                        },
                        "required": ["source", "destination"],
                        "additionalProperties": false
                    }
                },
                "overwrite": { "type": "boolean" },
                "createMissingDirectories": { "type": "boolean" }
            },
            "required": ["operations"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::WriteProject
    }

    fn render_use_console(&self, input: &Value) -> String {
        let mut out = format!("{}\n", "Renaming files".bold());
        for op in input["operations"].as_array().into_iter().flatten() {
            out.push_str(&format!(
                "  {} {} {}\n",
                op["source"].as_str().unwrap_or("?").cyan(),
                "->".dim(),
                op["destination"].as_str().unwrap_or("?").green()
            ));
        }
        out
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let input: RenameFilesInput = parse_input(self.name(), &tool_use.input)?;
        let moves = input
            .operations
            .iter()
            .map(|op| {
                Ok(PlannedMove {
                    source: project.resolve(&op.source)?,
                    destination: project.resolve(&op.destination)?,
                })
            })
            .collect::<Result<Vec<_>, BbaiError>>()?;

        let locked: Vec<PathBuf> = moves
            .iter()
            .flat_map(|m| [m.source.clone(), m.destination.clone()])
            .collect();
        let _guards = project.lock_paths(&locked).await;
        let report = execute_moves(
            project,
            &moves,
            input.overwrite,
            input.create_missing_directories,
        )
        .await;
        Ok(report_to_result("Renamed", report))
    }
}
