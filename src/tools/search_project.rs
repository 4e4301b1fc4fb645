//! search_project：ProjectSearchEngine 的工具外壳

use async_trait::async_trait;
use crossterm::style::Stylize;
use serde_json::{json, Value};

use crate::conversation::{ConversationInteraction, ToolUse};
use crate::core::BbaiError;
use crate::project::ProjectContext;
use crate::tools::project_search::format_search_result;
use crate::tools::{
    parse_input, BbaiResponse, ProjectSearchEngine, SearchCriteria, Tool, ToolCapability, ToolResult,
};

#[derive(Debug, Clone, Default)]
pub struct SearchProjectTool {
    engine: ProjectSearchEngine,
}

impl SearchProjectTool {
    pub fn new(engine: ProjectSearchEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for SearchProjectTool {
    fn name(&self) -> &str {
        "search_project"
    }

    fn description(&self) -> String {
        "Find project files by content regex and/or file metadata. All given criteria are combined with AND. \
         filePattern matches the file name (e.g. \"*.rs\"); patterns containing '/' match the relative path. \
         Dates are YYYY-MM-DD and inclusive; sizes are bytes and inclusive."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "contentPattern": { "type": "string", "description": "Regular expression matched against file content" },
                "caseSensitive": { "type": "boolean" },
                "filePattern": { "type": "string" },
                "dateAfter": { "type": "string" },
                "dateBefore": { "type": "string" },
                "sizeMin": { "type": "integer" },
                "sizeMax": { "type": "integer" }
            }
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::ReadProject
    }

    fn render_use_console(&self, input: &Value) -> String {
        match serde_json::from_value::<SearchCriteria>(input.clone()) {
            Ok(c) => format!("{} {}", "Searching project for".bold(), c.describe().cyan()),
            Err(_) => format!("{} {}", "Searching project".bold(), input),
        }
    }

    fn render_result_console(&self, result: &ToolResult) -> String {
        let files = match &result.bbai_response {
            BbaiResponse::Data { data } => data["files"].as_array().map_or(0, |f| f.len()),
            BbaiResponse::Text(_) => 0,
        };
        if result.is_error {
            result.tool_response.lines().next().unwrap_or("").red().to_string()
        } else {
            format!("{} {}", files.to_string().green(), "file(s) found")
        }
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let criteria: SearchCriteria = parse_input(self.name(), &tool_use.input)?;
        let result = self.engine.search(project.root(), &criteria).await;
        let text = format_search_result(&criteria, &result);
        let data = BbaiResponse::data(json!({
            "files": result.files,
            "errorMessage": result.error_message,
        }));
        Ok(if result.error_message.is_some() {
            ToolResult::failure(text, data)
        } else {
            ToolResult::success(text, data)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ModelSettings;

    fn call(input: Value) -> ToolUse {
        ToolUse {
            id: "tu-s".into(),
            name: "search_project".into(),
            input,
            validation: None,
        }
    }

    #[tokio::test]
    async fn test_invalid_regex_is_failure_result() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let r = SearchProjectTool::default()
            .run(&ia, &call(json!({"contentPattern": "(unclosed"})), &ProjectContext::new(dir.path()))
            .await
            .unwrap();
        assert!(r.is_error);
        assert!(r.tool_response.contains("<files>\n</files>"));
    }

    #[tokio::test]
    async fn test_content_search_lists_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn needle() {}").unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn hay() {}").unwrap();
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let r = SearchProjectTool::default()
            .run(
                &ia,
                &call(json!({"contentPattern": "NEEDLE", "filePattern": "*.rs"})),
                &ProjectContext::new(dir.path()),
            )
            .await
            .unwrap();
        assert!(!r.is_error);
        assert!(r.tool_response.starts_with("Found 1 file matching"));
        assert!(r.tool_response.contains("<files>\na.rs\n</files>"));
    }
}
