//! move_files：把一组文件移动到项目内的目标目录
//!
//! 所有路径先统一校验（越界即整体拒绝，不做任何移动）；随后逐个移动，单个失败只记入 errors。
//! 目标目录不存在且 createMissingDirectories 为 false 时不会创建它。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use crossterm::style::Stylize;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::conversation::{ConversationInteraction, ToolUse};
use crate::core::BbaiError;
use crate::project::ProjectContext;
use crate::tools::{parse_input, BbaiResponse, ChangeKind, FileChange, Tool, ToolCapability, ToolResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveFilesInput {
    sources: Vec<String>,
    destination: String,
    #[serde(default)]
    overwrite: bool,
    #[serde(default)]
    create_missing_directories: bool,
}

/// 一次已解析的移动
#[derive(Debug, Clone)]
pub(crate) struct PlannedMove {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// 移动汇总
#[derive(Debug, Default)]
pub(crate) struct MoveReport {
    pub moved: Vec<(String, String)>,
    pub errors: Vec<String>,
}

/// 逐个执行移动；调用方负责路径校验与加锁
pub(crate) async fn execute_moves(
    project: &ProjectContext,
    moves: &[PlannedMove],
    overwrite: bool,
    create_missing_directories: bool,
) -> MoveReport {
    let mut report = MoveReport::default();
    for mv in moves {
        let src = project.relative(&mv.source);
        let dst = project.relative(&mv.destination);
        match move_one(project, mv, overwrite, create_missing_directories).await {
            Ok(()) => report.moved.push((src, dst)),
            Err(reason) => report.errors.push(format!("{} -> {}: {}", src, dst, reason)),
        }
    }
    report
}

async fn move_one(
    project: &ProjectContext,
    mv: &PlannedMove,
    overwrite: bool,
    create_missing_directories: bool,
) -> Result<(), String> {
    let display = |p: &Path| project.relative(p);
    if fs::metadata(&mv.source).await.is_err() {
        return Err(format!("No such file or directory: {}", display(&mv.source)));
    }
    if let Some(parent) = mv.destination.parent() {
        if fs::metadata(parent).await.is_err() {
            if !create_missing_directories {
                return Err(format!("No such file or directory: {}", display(parent)));
            }
            fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
    }
    if !overwrite && fs::metadata(&mv.destination).await.is_ok() {
        return Err(format!(
            "Destination already exists: {} (set overwrite to replace it)",
            display(&mv.destination)
        ));
    }
    fs::rename(&mv.source, &mv.destination)
        .await
        .map_err(|e| e.to_string())
}

/// 把移动汇总转为工具结果：零成功即失败，文本与数据使用同一组计数
pub(crate) fn report_to_result(verb: &str, report: MoveReport) -> ToolResult {
    let changes: Vec<FileChange> = report
        .moved
        .iter()
        .flat_map(|(src, dst)| {
            let description = format!("{} {} to {}", verb, src, dst);
            [
                FileChange::new(dst, ChangeKind::Moved, description.clone()),
                FileChange::new(src, ChangeKind::Removed, description),
            ]
        })
        .collect();
    let moved_list: Vec<String> = report
        .moved
        .iter()
        .map(|(src, dst)| format!("{} -> {}", src, dst))
        .collect();
    let data = BbaiResponse::data(json!({
        "movedFiles": moved_list,
        "errors": report.errors,
    }));

    let mut text = if report.moved.is_empty() {
        format!("No files {}.", past_tense(verb))
    } else {
        format!(
            "{} {} file(s):\n{}",
            capitalize(past_tense(verb)),
            report.moved.len(),
            moved_list.join("\n")
        )
    };
    if !report.errors.is_empty() {
        text.push_str(&format!("\nErrors:\n{}", report.errors.join("\n")));
    }

    let result = if report.moved.is_empty() {
        ToolResult::failure(text, data)
    } else {
        ToolResult::success(text, data)
    };
    result.with_changes(changes)
}

fn past_tense(verb: &str) -> &'static str {
    match verb {
        "Renamed" => "renamed",
        _ => "moved",
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MoveFilesTool;

impl MoveFilesTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for MoveFilesTool {
    fn name(&self) -> &str {
        "move_files"
    }

    fn description(&self) -> String {
        "Move one or more project files into a destination directory, keeping their file names. \
         Missing destination directories are only created when createMissingDirectories is true."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sources": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                "destination": { "type": "string", "description": "Destination directory" },
                "overwrite": { "type": "boolean" },
                "createMissingDirectories": { "type": "boolean" }
            },
            "required": ["sources", "destination"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::WriteProject
    }

    fn render_use_console(&self, input: &Value) -> String {
        let sources: Vec<&str> = input["sources"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        format!(
            "{} {} {} {}",
            "Moving".bold(),
            sources.join(", ").cyan(),
            "to".dim(),
            input["destination"].as_str().unwrap_or("?").cyan()
        )
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let input: MoveFilesInput = parse_input(self.name(), &tool_use.input)?;
        let dest_dir = project.resolve(&input.destination)?;
        let mut moves = Vec::with_capacity(input.sources.len());
        for raw in &input.sources {
            let source = project.resolve(raw)?;
            let Some(name) = source.file_name() else {
                return Err(BbaiError::tool(self.name(), format!("invalid source path: {}", raw)));
            };
            let destination = dest_dir.join(name);
            moves.push(PlannedMove { source, destination });
        }

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
        Ok(report_to_result("Moved", report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ModelSettings;

    fn call(input: Value) -> ToolUse {
        ToolUse {
            id: "tu-mv".into(),
            name: "move_files".into(),
            input,
            validation: None,
        }
    }

    #[tokio::test]
    async fn test_missing_destination_not_created() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("source.txt"), "data").unwrap();
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let r = MoveFilesTool
            .run(
                &ia,
                &call(json!({"sources": ["source.txt"], "destination": "destDir", "createMissingDirectories": false})),
                &ProjectContext::new(dir.path()),
            )
            .await
            .unwrap();
        assert!(r.is_error);
        assert!(r.tool_response.starts_with("No files moved"));
        let data = match &r.bbai_response {
            BbaiResponse::Data { data } => data.clone(),
            other => panic!("unexpected response {:?}", other),
        };
        assert_eq!(data["movedFiles"].as_array().unwrap().len(), 0);
        let errors = data["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].as_str().unwrap().contains("No such file or directory"));
        assert!(!dir.path().join("destDir").exists());
        assert!(dir.path().join("source.txt").exists());
    }

    #[tokio::test]
    async fn test_moves_and_creates_directory_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let r = MoveFilesTool
            .run(
                &ia,
                &call(json!({"sources": ["a.txt", "b.txt", "missing.txt"], "destination": "out", "createMissingDirectories": true})),
                &ProjectContext::new(dir.path()),
            )
            .await
            .unwrap();
        assert!(!r.is_error);
        assert!(r.tool_response.starts_with("Moved 2 file(s)"));
        // 每次移动记录目标与源两条改动
        assert_eq!(r.changes.len(), 4);
        assert_eq!(r.changes[0].kind, ChangeKind::Moved);
        assert_eq!(r.changes[0].path, "out/a.txt");
        assert_eq!(r.changes[1].kind, ChangeKind::Removed);
        assert_eq!(r.changes[1].path, "a.txt");
        assert!(dir.path().join("out/a.txt").exists());
        assert!(dir.path().join("out/b.txt").exists());
    }

    #[tokio::test]
    async fn test_traversal_rejects_whole_call() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let err = MoveFilesTool
            .run(
                &ia,
                &call(json!({"sources": ["a.txt"], "destination": "../outside"})),
                &ProjectContext::new(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BbaiError::AccessDenied { .. }));
        assert!(dir.path().join("a.txt").exists());
    }
}
