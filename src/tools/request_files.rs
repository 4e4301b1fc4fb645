//! request_files：把项目文件内容附加到工具结果中
//!
//! 文件内容以文本片段附加；Tool 消息持久化后，finalize 回调为每个附加文件写入 files/*.meta。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossterm::style::Stylize;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::conversation::{
    ContentPart, ConversationInteraction, ConversationPersistence, FileMetadata, ToolUse,
};
use crate::core::BbaiError;
use crate::project::ProjectContext;
use crate::tools::{parse_input, BbaiResponse, Tool, ToolCapability, ToolResult};

pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestFilesInput {
    file_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RequestFilesTool {
    max_file_bytes: u64,
}

impl Default for RequestFilesTool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_BYTES)
    }
}

impl RequestFilesTool {
    pub fn new(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }
}

struct Attached {
    path: String,
    size: u64,
    modified: Option<DateTime<Utc>>,
    content: String,
}

#[async_trait]
impl Tool for RequestFilesTool {
    fn name(&self) -> &str {
        "request_files"
    }

    fn description(&self) -> String {
        format!(
            "Add the contents of project text files to the conversation. Files larger than {} bytes \
             or not valid UTF-8 are refused; use search_project to locate files first.",
            self.max_file_bytes
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fileNames": { "type": "array", "items": { "type": "string" }, "minItems": 1 }
            },
            "required": ["fileNames"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::ReadProject
    }

    fn render_use_console(&self, input: &Value) -> String {
        let names: Vec<&str> = input["fileNames"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        format!("{} {}", "Requesting files".bold(), names.join(", ").cyan())
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let input: RequestFilesInput = parse_input(self.name(), &tool_use.input)?;
        let mut attached = Vec::new();
        let mut errors = Vec::new();

        for name in &input.file_names {
            let path = match project.resolve(name) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(format!("{}: {}", name, e));
                    continue;
                }
            };
            let rel = project.relative(&path);
            let meta = match fs::metadata(&path).await {
                Ok(m) if m.is_file() => m,
                Ok(_) => {
                    errors.push(format!("{}: not a regular file", rel));
                    continue;
                }
                Err(_) => {
                    errors.push(format!("{}: No such file or directory", rel));
                    continue;
                }
            };
            if meta.len() > self.max_file_bytes {
                errors.push(format!("{}: {} bytes exceeds the {} byte limit", rel, meta.len(), self.max_file_bytes));
                continue;
            }
            let bytes = fs::read(&path).await?;
            match String::from_utf8(bytes) {
                Ok(content) => attached.push(Attached {
                    path: rel,
                    size: meta.len(),
                    modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    content,
                }),
                Err(_) => errors.push(format!("{}: not a UTF-8 text file", rel)),
            }
        }

        let parts: Vec<ContentPart> = attached
            .iter()
            .map(|f| {
                ContentPart::text(format!(
                    "<file path=\"{}\" size=\"{}\">\n{}\n</file>",
                    f.path, f.size, f.content
                ))
            })
            .collect();
        let added: Vec<String> = attached.iter().map(|f| f.path.clone()).collect();
        let mut text = if added.is_empty() {
            "No files added.".to_string()
        } else {
            format!("Added {} file(s): {}", added.len(), added.join(", "))
        };
        if !errors.is_empty() {
            text.push_str(&format!("\nErrors:\n{}", errors.join("\n")));
        }
        let data = BbaiResponse::data(json!({ "filesAdded": added, "errors": errors }));

        if attached.is_empty() {
            return Ok(ToolResult::failure(text, data));
        }

        let tool_use_id = tool_use.id.clone();
        let metas: Vec<(String, u64, Option<DateTime<Utc>>)> =
            attached.into_iter().map(|f| (f.path, f.size, f.modified)).collect();
        Ok(ToolResult::success(text, data)
            .with_tool_results(parts)
            .with_finalize(Box::new(move |persistence: ConversationPersistence, message_id: String| {
                async move {
                    for (file_path, size, last_modified) in metas {
                        persistence
                            .save_file_metadata(&FileMetadata {
                                file_path,
                                size,
                                last_modified,
                                message_id: message_id.clone(),
                                tool_use_id: tool_use_id.clone(),
                            })
                            .await?;
                    }
                    Ok::<(), BbaiError>(())
                }
                .boxed()
            })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ModelSettings;

    fn call(input: Value) -> ToolUse {
        ToolUse {
            id: "tu-rf".into(),
            name: "request_files".into(),
            input,
            validation: None,
        }
    }

    #[tokio::test]
    async fn test_attaches_and_finalizes_metadata() {
        let project_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(project_dir.path().join("src")).unwrap();
        std::fs::write(project_dir.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();

        let ia = ConversationInteraction::new("conv", ModelSettings::default());
        let mut result = RequestFilesTool::default()
            .run(
                &ia,
                &call(json!({"fileNames": ["src/lib.rs", "missing.rs"]})),
                &ProjectContext::new(project_dir.path()),
            )
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.tool_results.len(), 1);
        assert!(result.tool_response.contains("missing.rs: No such file or directory"));

        let finalize = result.take_finalize().unwrap();
        let persistence = ConversationPersistence::new(data_dir.path(), "conv");
        finalize(persistence.clone(), "msg-1".to_string()).await.unwrap();
        let meta_path = persistence.dir().join("files").join("src__lib.rs.meta");
        let meta: FileMetadata = serde_json::from_slice(&std::fs::read(meta_path).unwrap()).unwrap();
        assert_eq!(meta.message_id, "msg-1");
        assert_eq!(meta.tool_use_id, "tu-rf");
        assert_eq!(meta.size, 14);
    }

    #[tokio::test]
    async fn test_nothing_attached_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let result = RequestFilesTool::default()
            .run(&ia, &call(json!({"fileNames": ["../etc/passwd"]})), &ProjectContext::new(dir.path()))
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.finalize.is_none());
        assert!(result.tool_response.starts_with("No files added."));
    }
}
