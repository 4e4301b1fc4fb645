//! search_and_replace：按语言感知的字面量规则执行一组查找替换
//!
//! 所有操作在内存中依次执行，最后一次性原子写回；没有任何改动时不写文件。

use async_trait::async_trait;
use crossterm::style::Stylize;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::conversation::{ConversationInteraction, ToolUse};
use crate::core::{BbaiError, FileOperation};
use crate::project::ProjectContext;
use crate::tools::filesystem::write_atomic;
use crate::tools::language::detect_language;
use crate::tools::literal_replace;
use crate::tools::{
    parse_input, unified_diff, BbaiResponse, ChangeKind, FileChange, Tool, ToolCapability, ToolResult,
};

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplaceOperation {
    search: String,
    replace: String,
    #[serde(default)]
    replace_all: bool,
    #[serde(default = "default_true")]
    case_sensitive: bool,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchAndReplaceInput {
    file_path: String,
    operations: Vec<ReplaceOperation>,
    #[serde(default = "default_true")]
    create_if_missing: bool,
}

/// 单个操作的结果
#[derive(Debug, Clone, PartialEq, Eq)]
enum OpStatus {
    Applied(usize),
    NotFound,
    Skipped(String),
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct SearchAndReplaceTool {
    min_search_length: usize,
}

impl Default for SearchAndReplaceTool {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SearchAndReplaceTool {
    pub fn new(min_search_length: usize) -> Self {
        Self { min_search_length }
    }
}

#[async_trait]
impl Tool for SearchAndReplaceTool {
    fn name(&self) -> &str {
        "search_and_replace"
    }

    fn description(&self) -> String {
        format!(
            "Apply a list of literal search/replace operations to one file. Whitespace between code tokens \
             matches flexibly; text inside string literals and heredocs must match exactly. Search strings \
             shorter than {} characters are rejected for existing files. An empty search on a missing file \
             seeds it with the replacement text.",
            self.min_search_length
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filePath": { "type": "string", "description": "File relative to the project root" },
                "operations": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "search": { "type": "string" },
                            "replace": { "type": "string" },
                            "replaceAll": { "type": "boolean" },
                            "caseSensitive": { "type": "boolean" },
                            "language": { "type": "string", "description": "Override language detection" }
                        },
                        "required": ["search", "replace"]
                    }
                },
                "createIfMissing": { "type": "boolean" }
            },
            "required": ["filePath", "operations"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::WriteProject
    }

    fn render_use_console(&self, input: &Value) -> String {
        let path = input["filePath"].as_str().unwrap_or("?");
        let mut out = format!("{} {}\n", "Search and replace in".bold(), path.cyan());
        if let Some(ops) = input["operations"].as_array() {
            for (i, op) in ops.iter().enumerate() {
                out.push_str(&format!(
                    "  {} {} {} {}\n",
                    format!("#{}", i + 1).dim(),
                    op["search"].as_str().unwrap_or("").red(),
                    "=>".dim(),
                    op["replace"].as_str().unwrap_or("").green()
                ));
            }
        }
        out
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let input: SearchAndReplaceInput = parse_input(self.name(), &tool_use.input)?;
        let path = project.resolve(&input.file_path)?;
        let rel = project.relative(&path);
        let _guards = project.lock_paths(std::slice::from_ref(&path)).await;

        let (original, is_new) = match fs::read_to_string(&path).await {
            Ok(content) => (content, false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && input.create_if_missing => {
                (String::new(), true)
            }
            Err(e) => return Err(BbaiError::from_io(&rel, FileOperation::Read, e)),
        };

        let mut content = original.clone();
        let mut statuses = Vec::with_capacity(input.operations.len());
        for op in &input.operations {
            let status = if op.search == op.replace {
                OpStatus::Skipped("search and replace are identical".to_string())
            } else if is_new && content.is_empty() && op.search.is_empty() {
                content = op.replace.clone();
                OpStatus::Applied(1)
            } else if !is_new && op.search.chars().count() < self.min_search_length.max(1) {
                OpStatus::Rejected(format!(
                    "search string is shorter than {} characters",
                    self.min_search_length.max(1)
                ))
            } else if op.search.is_empty() {
                OpStatus::Rejected("empty search string".to_string())
            } else {
                let profile = detect_language(op.language.as_deref(), &path, &content);
                let outcome = literal_replace::replace(
                    &content,
                    &op.search,
                    &op.replace,
                    op.replace_all,
                    op.case_sensitive,
                    profile,
                )?;
                if outcome.replacements == 0 {
                    OpStatus::NotFound
                } else {
                    content = outcome.content;
                    OpStatus::Applied(outcome.replacements)
                }
            };
            statuses.push(status);
        }

        let lines: Vec<String> = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| match s {
                OpStatus::Applied(n) => format!("Operation {}: applied ({} replacement(s))", i + 1, n),
                OpStatus::NotFound => format!("Operation {}: search text not found", i + 1),
                OpStatus::Skipped(why) => format!("Operation {}: skipped ({})", i + 1, why),
                OpStatus::Rejected(why) => format!("Operation {}: rejected ({})", i + 1, why),
            })
            .collect();
        let applied = statuses.iter().filter(|s| matches!(s, OpStatus::Applied(_))).count();
        let skipped = statuses.iter().filter(|s| matches!(s, OpStatus::Skipped(_))).count();
        let failed = statuses.len() - applied - skipped;
        let data = json!({
            "filePath": rel,
            "applied": applied,
            "skipped": skipped,
            "failed": failed,
            "operations": lines,
        });

        if applied == 0 || (content == original && !is_new) {
            let detail = lines.join("\n");
            let reason = if applied > 0 {
                format!("{} applied operation(s) left the content unchanged", applied)
            } else if failed > 0 {
                "no operation applied".to_string()
            } else {
                "all operations were skipped".to_string()
            };
            let text = format!("No changes made to {}: {}.\n{}", rel, reason, detail);
            if failed > 0 {
                return Ok(ToolResult::failure(text, BbaiResponse::data(data)));
            }
            return Ok(ToolResult::success(text, BbaiResponse::data(data)));
        }

        write_atomic(&path, content.as_bytes()).await?;
        tracing::debug!(file = %rel, applied, skipped, failed, "search_and_replace written");

        let (kind, verb) = if is_new {
            (ChangeKind::Created, "Created")
        } else {
            (ChangeKind::Modified, "Modified")
        };
        let change = FileChange::new(
            &rel,
            kind,
            format!("{} {} with {} search/replace operation(s)", verb, rel, applied),
        )
        .with_patch(unified_diff(&rel, &original, &content, 3));

        let summary = format!(
            "{} {}: {} of {} operation(s) applied.\n{}",
            verb,
            rel,
            applied,
            statuses.len(),
            lines.join("\n")
        );
        let result = if failed > 0 {
            ToolResult::failure(summary, BbaiResponse::data(data))
        } else {
            ToolResult::success(summary, BbaiResponse::data(data))
        };
        Ok(result.with_changes(vec![change]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ModelSettings;

    fn call(input: Value) -> ToolUse {
        ToolUse {
            id: "tu-sr".into(),
            name: "search_and_replace".into(),
            input,
            validation: None,
        }
    }

    async fn run(tool: &SearchAndReplaceTool, dir: &std::path::Path, input: Value) -> ToolResult {
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        tool.run(&ia, &call(input), &ProjectContext::new(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn test_replaces_and_records_diff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {\n    let  x = 1;\n}\n").unwrap();
        let result = run(
            &SearchAndReplaceTool::default(),
            dir.path(),
            json!({"filePath": "main.rs", "operations": [{"search": "let x = 1;", "replace": "let x = 2;"}]}),
        )
        .await;
        assert!(!result.is_error);
        let content = std::fs::read_to_string(dir.path().join("main.rs")).unwrap();
        assert_eq!(content, "fn main() {\n    let x = 2;\n}\n");
        assert_eq!(result.changes.len(), 1);
        assert!(result.changes[0].patch.as_deref().unwrap().contains("+    let x = 2;"));
    }

    #[tokio::test]
    async fn test_identical_search_is_skipped_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "keep me").unwrap();
        let result = run(
            &SearchAndReplaceTool::default(),
            dir.path(),
            json!({"filePath": "a.txt", "operations": [{"search": "keep", "replace": "keep"}]}),
        )
        .await;
        assert!(!result.is_error);
        assert!(result.changes.is_empty());
        assert!(result.tool_response.contains("skipped"));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "keep me");
    }

    #[tokio::test]
    async fn test_applied_without_change_is_not_reported_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "let x = 1;\n").unwrap();
        let result = run(
            &SearchAndReplaceTool::default(),
            dir.path(),
            json!({"filePath": "lib.rs", "operations": [{"search": "let  x = 1;", "replace": "let x = 1;"}]}),
        )
        .await;
        assert!(!result.is_error);
        assert!(result.changes.is_empty());
        assert!(result.tool_response.contains("left the content unchanged"));
        assert!(!result.tool_response.contains("skipped"));
        match &result.bbai_response {
            BbaiResponse::Data { data } => assert_eq!(data["applied"], 1),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_search_rejected_for_existing_but_seeds_new_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "abc").unwrap();
        let tool = SearchAndReplaceTool::new(3);
        let rejected = run(
            &tool,
            dir.path(),
            json!({"filePath": "a.txt", "operations": [{"search": "b", "replace": "x"}]}),
        )
        .await;
        assert!(rejected.is_error);
        assert!(rejected.tool_response.contains("No changes"));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "abc");

        let seeded = run(
            &tool,
            dir.path(),
            json!({"filePath": "new/b.txt", "operations": [{"search": "", "replace": "hello\n"}]}),
        )
        .await;
        assert!(!seeded.is_error);
        assert_eq!(seeded.changes[0].kind, ChangeKind::Created);
        assert_eq!(std::fs::read_to_string(dir.path().join("new/b.txt")).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_traversal_is_denied_without_write() {
        let dir = tempfile::tempdir().unwrap();
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let err = SearchAndReplaceTool::default()
            .run(
                &ia,
                &call(json!({"filePath": "../escape.txt", "operations": [{"search": "", "replace": "x"}]})),
                &ProjectContext::new(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BbaiError::AccessDenied { .. }));
    }
}
