//! 工具注册表
//!
//! 所有工具实现 Tool trait（名称、描述、输入 schema、能力标签、两套渲染器、run），
//! 由 ToolRegistry 按名注册与查找。dispatch 先做 schema 校验，再调用工具体；
//! 预期错误在这里转成失败的 ToolResult，只有基础设施错误继续向上传播。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crossterm::style::Stylize;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{ConversationInteraction, ToolUse, ToolValidation};
use crate::core::BbaiError;
use crate::project::ProjectContext;
use crate::tools::schema;
use crate::tools::ToolResult;

/// 工具能力标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCapability {
    /// 只读项目文件
    ReadProject,
    /// 修改项目文件
    WriteProject,
    /// 执行子进程
    ExecuteCommand,
    /// 调用其他模型或外部资源
    External,
}

/// 发给 LLM 的工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub capability: ToolCapability,
}

/// 工具 trait：渲染器为纯函数（无 I/O），副作用只发生在 run 中
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（ToolUse 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能，可依配置生成）
    fn description(&self) -> String;

    /// 输入 JSON Schema
    fn input_schema(&self) -> Value;

    fn capability(&self) -> ToolCapability;

    /// 控制台（ANSI）渲染工具调用
    fn render_use_console(&self, input: &Value) -> String {
        format!("{} {}", self.name().bold().cyan(), input)
    }

    /// 结构化渲染工具调用
    fn render_use_rich(&self, input: &Value) -> Value {
        serde_json::json!({ "title": self.name(), "input": input })
    }

    /// 控制台（ANSI）渲染工具结果
    fn render_result_console(&self, result: &ToolResult) -> String {
        render_status_line(self.name(), result)
    }

    /// 结构化渲染工具结果
    fn render_result_rich(&self, result: &ToolResult) -> Value {
        serde_json::json!({
            "title": self.name(),
            "isError": result.is_error,
            "response": result.bbai_response,
        })
    }

    async fn run(
        &self,
        interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description(),
            input_schema: self.input_schema(),
            capability: self.capability(),
        }
    }
}

/// 结果状态行：✓/✗ + 工具名 + 展示文本
pub fn render_status_line(name: &str, result: &ToolResult) -> String {
    let text = result.bbai_text();
    if result.is_error {
        format!("{} {} {}", "✗".red().bold(), name.bold(), text.red())
    } else {
        format!("{} {} {}", "✓".green().bold(), name.bold(), text)
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!(tool = %name, "registering tool");
        self.tools.insert(name, tool);
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// 按名称排序，保证 prompt 与测试输出稳定
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tool_names()
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.definition())
            .collect()
    }

    /// 校验 ToolUse 输入；未知工具也视为校验失败
    pub fn validate(&self, tool_use: &ToolUse) -> ToolValidation {
        match self.tools.get(&tool_use.name) {
            Some(tool) => schema::validate(&tool.input_schema(), &tool_use.input),
            None => ToolValidation {
                valid: false,
                errors: vec![format!("Unknown tool: {}", tool_use.name)],
            },
        }
    }

    /// 校验并执行；预期失败折叠为失败结果，基础设施错误原样返回
    pub async fn dispatch(
        &self,
        interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let Some(tool) = self.get_tool(&tool_use.name) else {
            let available = self.tool_names().join(", ");
            return Ok(ToolResult::failure(
                format!("Unknown tool: {}. Available tools: {}", tool_use.name, available),
                format!("BBai does not know a tool named {}", tool_use.name),
            ));
        };

        let validation = schema::validate(&tool.input_schema(), &tool_use.input);
        if !validation.valid {
            let detail = validation.errors.join("; ");
            return Ok(ToolResult::failure(
                format!("Invalid input for {}: {}", tool_use.name, detail),
                format!("BBai rejected the {} input: {}", tool_use.name, detail),
            ));
        }

        match tool.run(interaction, tool_use, project).await {
            Ok(result) => Ok(result),
            Err(err) if err.is_expected() => {
                tracing::warn!(tool = %tool_use.name, kind = ?err.kind(), error = %err, "tool failed");
                Ok(ToolResult::from_error(&tool_use.name, &err))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ModelSettings;
    use crate::core::FileOperation;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> String {
            "Echo the text back".to_string()
        }

        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" }, "mode": { "type": "string" } },
                "required": ["text"]
            })
        }

        fn capability(&self) -> ToolCapability {
            ToolCapability::ReadProject
        }

        async fn run(
            &self,
            _interaction: &ConversationInteraction,
            tool_use: &ToolUse,
            _project: &ProjectContext,
        ) -> Result<ToolResult, BbaiError> {
            match tool_use.input["mode"].as_str() {
                Some("missing") => Err(BbaiError::file("x.txt", FileOperation::Read, "not found")),
                Some("disk") => Err(BbaiError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                ))),
                _ => {
                    let text = tool_use.input["text"].as_str().unwrap_or_default();
                    Ok(ToolResult::success(text, text))
                }
            }
        }
    }

    fn fixture() -> (ToolRegistry, ConversationInteraction, ProjectContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let interaction = ConversationInteraction::new("c", ModelSettings::default());
        let project = ProjectContext::new(dir.path());
        (registry, interaction, project, dir)
    }

    fn tool_use(name: &str, input: Value) -> ToolUse {
        ToolUse {
            id: "tu-1".into(),
            name: name.into(),
            input,
            validation: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let (registry, ia, project, _dir) = fixture();
        let result = registry
            .dispatch(&ia, &tool_use("echo", json!({"text": "hi"})), &project)
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.tool_response, "hi");
    }

    #[tokio::test]
    async fn test_schema_failure_short_circuits() {
        let (registry, ia, project, _dir) = fixture();
        let result = registry
            .dispatch(&ia, &tool_use("echo", json!({"mode": "disk"})), &project)
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.tool_response.contains("missing required property 'text'"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_failure_result() {
        let (registry, ia, project, _dir) = fixture();
        let result = registry
            .dispatch(&ia, &tool_use("nope", json!({})), &project)
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.tool_response.contains("Unknown tool: nope"));
        assert!(!registry.validate(&tool_use("nope", json!({}))).valid);
    }

    #[tokio::test]
    async fn test_expected_error_folded_infrastructure_propagated() {
        let (registry, ia, project, _dir) = fixture();
        let folded = registry
            .dispatch(&ia, &tool_use("echo", json!({"text": "a", "mode": "missing"})), &project)
            .await
            .unwrap();
        assert!(folded.is_error);

        let err = registry
            .dispatch(&ia, &tool_use("echo", json!({"text": "a", "mode": "disk"})), &project)
            .await
            .unwrap_err();
        assert!(!err.is_expected());
    }

    #[test]
    fn test_definitions_sorted() {
        let (registry, _, _, _dir) = fixture();
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].capability, ToolCapability::ReadProject);
    }
}
