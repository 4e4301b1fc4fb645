//! apply_patch：用统一 diff 修改或新建项目文件
//!
//! 路径在任何 I/O 之前全部校验；随后锁住所有目标路径，逐文件应用。
//! 前面的文件已写入而后面的文件失败时，结果仍记录已写入的文件，并标记失败。

use async_trait::async_trait;
use crossterm::style::Stylize;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::conversation::{ConversationInteraction, ToolUse};
use crate::core::BbaiError;
use crate::project::ProjectContext;
use crate::tools::patch_engine::PatchOutcome;
use crate::tools::{
    parse_input, BbaiResponse, ChangeKind, FileChange, PatchEngine, Tool, ToolCapability, ToolResult,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyPatchInput {
    #[serde(default)]
    file_path: Option<String>,
    patch: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyPatchTool;

impl ApplyPatchTool {
    pub fn new() -> Self {
        Self
    }
}

fn summary(outcome: &PatchOutcome) -> String {
    let mut parts = Vec::new();
    if !outcome.modified_files.is_empty() {
        parts.push(format!("Modified files: {}", outcome.modified_files.join(", ")));
    }
    if !outcome.new_files.is_empty() {
        parts.push(format!("New files: {}", outcome.new_files.join(", ")));
    }
    parts.join(". ")
}

fn changes(outcome: &PatchOutcome, patch: &str) -> Vec<FileChange> {
    let modified = outcome
        .modified_files
        .iter()
        .map(|p| FileChange::new(p, ChangeKind::Modified, "Applied patch").with_patch(patch));
    let created = outcome
        .new_files
        .iter()
        .map(|p| FileChange::new(p, ChangeKind::Created, "Created file from patch").with_patch(patch));
    modified.chain(created).collect()
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> String {
        "Apply a unified diff patch to one or more project files. Use `--- old` / `+++ new` headers \
         and `@@ -start,len +start,len @@` hunks; use /dev/null as the old path to create a file. \
         Context lines must match the current file exactly; if the file has drifted, use search_and_replace."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filePath": {
                    "type": "string",
                    "description": "Target file relative to the project root, used when the patch has no file headers"
                },
                "patch": { "type": "string", "description": "Unified diff text" }
            },
            "required": ["patch"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::WriteProject
    }

    fn render_use_console(&self, input: &Value) -> String {
        let target = input["filePath"].as_str().unwrap_or("(from patch headers)");
        let patch = input["patch"].as_str().unwrap_or("");
        let mut out = format!("{} {}\n", "Applying patch to".bold(), target.cyan());
        for line in patch.lines() {
            let styled = if line.starts_with('+') && !line.starts_with("+++") {
                line.green().to_string()
            } else if line.starts_with('-') && !line.starts_with("---") {
                line.red().to_string()
            } else {
                line.dim().to_string()
            };
            out.push_str(&styled);
            out.push('\n');
        }
        out
    }

    fn render_use_rich(&self, input: &Value) -> Value {
        json!({
            "title": "Apply Patch",
            "filePath": input["filePath"],
            "patch": input["patch"],
        })
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let input: ApplyPatchInput = parse_input(self.name(), &tool_use.input)?;
        let engine = PatchEngine::new(project.fs().clone());
        let planned = engine.plan(input.file_path.as_deref(), &input.patch)?;
        let paths: Vec<_> = planned.iter().map(|p| p.absolute_path.clone()).collect();
        let _guards = project.lock_paths(&paths).await;

        let mut outcome = PatchOutcome::default();
        for item in &planned {
            match engine.apply_planned(std::slice::from_ref(item)).await {
                Ok(one) => {
                    outcome.modified_files.extend(one.modified_files);
                    outcome.new_files.extend(one.new_files);
                }
                Err(err) if err.is_expected() && !(outcome.modified_files.is_empty() && outcome.new_files.is_empty()) => {
                    // 部分文件已写入：报告失败，同时保留已写入文件的改动记录
                    let written = summary(&outcome);
                    return Ok(ToolResult::failure(
                        format!("Error: {}. Files already written before the failure: {}", err, written),
                        BbaiResponse::data(json!({
                            "modifiedFiles": outcome.modified_files,
                            "newFiles": outcome.new_files,
                            "error": err.to_string(),
                        })),
                    )
                    .with_changes(changes(&outcome, &input.patch)));
                }
                Err(err) => return Err(err),
            }
        }

        Ok(ToolResult::success(
            format!("Patch applied successfully. {}", summary(&outcome)),
            BbaiResponse::data(json!({
                "modifiedFiles": outcome.modified_files,
                "newFiles": outcome.new_files,
            })),
        )
        .with_changes(changes(&outcome, &input.patch)))
    }
}
