//! delegate_tasks：把独立的子任务交给其他模型完成
//!
//! 每个任务先加载所需资源，再按能力标签路由到合适的模型；给出 requirements 时，
//! 子模型的回答必须是满足该 schema 的 JSON。任务经 TaskQueue 排队执行，失败处理由 ErrorHandler 策略决定。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossterm::style::Stylize;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::conversation::{ConversationInteraction, Message, ToolUse};
use crate::core::{
    BbaiError, DrainReport, ErrorHandler, ErrorStrategy, QueuedTask, TaskQueue, TaskRunner, TaskStatus,
};
use crate::llm::{LlmError, LlmRequest, ModelRegistry};
use crate::project::{ProjectContext, Resource, ResourceLoader};
use crate::tools::{parse_input, schema, BbaiResponse, Tool, ToolCapability, ToolResult};

const SUBTASK_SYSTEM_PROMPT: &str = "You are a focused assistant completing one delegated sub-task. \
Use only the background, resources and instructions provided. Answer with the result only.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskInput {
    title: String,
    #[serde(default)]
    background: String,
    instructions: String,
    #[serde(default)]
    resources: Vec<Resource>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    requirements: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StrategyName {
    FailFast,
    ContinueOnError,
    Retry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateTasksInput {
    tasks: Vec<TaskInput>,
    #[serde(default)]
    error_strategy: Option<StrategyName>,
    #[serde(default)]
    error_threshold: Option<usize>,
    #[serde(default)]
    max_retries: Option<u32>,
}

impl DelegateTasksInput {
    fn strategy(&self, default: ErrorStrategy) -> ErrorStrategy {
        match self.error_strategy {
            None => default,
            Some(StrategyName::FailFast) => ErrorStrategy::FailFast,
            Some(StrategyName::ContinueOnError) => ErrorStrategy::ContinueOnError {
                threshold: self.error_threshold.unwrap_or(self.tasks.len().max(1)),
            },
            Some(StrategyName::Retry) => ErrorStrategy::Retry {
                max_retries: self.max_retries.unwrap_or(2),
            },
        }
    }
}

/// 去掉 ```json 围栏
fn strip_code_fence(s: &str) -> &str {
    let t = s.trim();
    let Some(inner) = t.strip_prefix("```") else {
        return t;
    };
    let inner = inner.split_once('\n').map_or("", |(_, rest)| rest);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// 执行单个子任务：资源 → 路由 → 调用模型 → 校验
pub struct DelegateRunner {
    models: Arc<ModelRegistry>,
    loader: Arc<dyn ResourceLoader>,
    timeout: Duration,
    max_tokens: u32,
}

impl DelegateRunner {
    pub fn new(
        models: Arc<ModelRegistry>,
        loader: Arc<dyn ResourceLoader>,
        timeout_secs: u64,
        max_tokens: u32,
    ) -> Self {
        Self {
            models,
            loader,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            max_tokens,
        }
    }

    fn prompt(task: &QueuedTask, resources: &[(String, String)]) -> String {
        let mut prompt = format!("# Task: {}\n", task.title);
        if !task.background.trim().is_empty() {
            prompt.push_str(&format!("\n## Background\n{}\n", task.background));
        }
        for (uri, content) in resources {
            prompt.push_str(&format!("\n## Resource: {}\n{}\n", uri, content));
        }
        prompt.push_str(&format!("\n## Instructions\n{}\n", task.instructions));
        if let Some(req) = &task.requirements {
            prompt.push_str(&format!(
                "\nRespond with a single JSON value that satisfies this JSON Schema:\n{}\n",
                req
            ));
        }
        prompt
    }
}

#[async_trait]
impl TaskRunner for DelegateRunner {
    async fn run_task(&self, task: &QueuedTask) -> Result<String, BbaiError> {
        let mut loaded = Vec::with_capacity(task.resources.len());
        for res in &task.resources {
            let content = self.loader.load_resource(res).await?;
            loaded.push((format!("{} {}", res.resource_type, res.uri), content));
        }

        let (model_name, entry) = self.models.route(&task.capabilities)?;
        tracing::info!(task = %task.title, model = %model_name, "delegating task");
        let request = LlmRequest {
            model: entry.model.clone(),
            system: SUBTASK_SYSTEM_PROMPT.to_string(),
            messages: vec![Message::user(Self::prompt(task, &loaded))],
            tools: Vec::new(),
            temperature: 0.2,
            max_tokens: self.max_tokens,
        };
        let answer = tokio::time::timeout(self.timeout, entry.provider.speak_with_llm(&request))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout.as_secs()))??
            .answer();

        let Some(req) = &task.requirements else {
            return Ok(answer);
        };
        let value: Value = serde_json::from_str(strip_code_fence(&answer)).map_err(|e| {
            BbaiError::tool("delegate_tasks", format!("result for '{}' is not valid JSON: {}", task.title, e))
        })?;
        let validation = schema::validate(req, &value);
        if !validation.valid {
            return Err(BbaiError::tool(
                "delegate_tasks",
                format!(
                    "result for '{}' does not meet the requirements: {}",
                    task.title,
                    validation.errors.join("; ")
                ),
            ));
        }
        Ok(value.to_string())
    }
}

pub struct DelegateTasksTool {
    runner: Arc<DelegateRunner>,
    default_strategy: ErrorStrategy,
    retry_base_delay: Duration,
}

impl std::fmt::Debug for DelegateTasksTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateTasksTool")
            .field("models", &self.runner.models.names())
            .field("default_strategy", &self.default_strategy)
            .finish()
    }
}

impl DelegateTasksTool {
    pub fn new(runner: DelegateRunner, default_strategy: ErrorStrategy) -> Self {
        Self {
            runner: Arc::new(runner),
            default_strategy,
            retry_base_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn summarize(report: &DrainReport) -> (String, Value) {
        let mut lines = Vec::new();
        let mut entries = Vec::new();
        for t in &report.finished {
            match t.status {
                TaskStatus::Completed => {
                    lines.push(format!("## {} (completed)\n{}", t.title, t.result.as_deref().unwrap_or("")));
                }
                _ => {
                    lines.push(format!("## {} (failed)\nError: {}", t.title, t.error.as_deref().unwrap_or("")));
                }
            }
            entries.push(json!({
                "title": t.title,
                "status": t.status,
                "attempts": t.attempts,
                "result": t.result,
                "error": t.error,
            }));
        }
        for t in &report.remaining {
            lines.push(format!("## {} (not run)", t.title));
            entries.push(json!({ "title": t.title, "status": t.status }));
        }
        let header = format!(
            "Delegated {} task(s): {} completed, {} failed, {} not run.",
            report.finished.len() + report.remaining.len(),
            report.completed(),
            report.failed(),
            report.remaining.len()
        );
        (format!("{}\n\n{}", header, lines.join("\n\n")), json!({ "tasks": entries }))
    }
}

#[async_trait]
impl Tool for DelegateTasksTool {
    fn name(&self) -> &str {
        "delegate_tasks"
    }

    fn description(&self) -> String {
        format!(
            "Delegate independent sub-tasks to other models. Each task has a title, background, instructions, \
             optional resources (file, url, memory, api, database, vector_search), required capabilities used to \
             pick a model, and an optional JSON Schema the result must satisfy. Available models: {}.",
            self.runner.models.names().join(", ")
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": { "type": "string" },
                            "background": { "type": "string" },
                            "instructions": { "type": "string" },
                            "resources": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "type": {
                                            "type": "string",
                                            "enum": ["file", "url", "memory", "api", "database", "vector_search"]
                                        },
                                        "uri": { "type": "string" }
                                    },
                                    "required": ["type", "uri"]
                                }
                            },
                            "capabilities": { "type": "array", "items": { "type": "string" } },
                            "requirements": { "type": "object" }
                        },
                        "required": ["title", "instructions"]
                    }
                },
                "errorStrategy": { "type": "string", "enum": ["fail_fast", "continue_on_error", "retry"] },
                "errorThreshold": { "type": "integer" },
                "maxRetries": { "type": "integer" }
            },
            "required": ["tasks"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::External
    }

    fn render_use_console(&self, input: &Value) -> String {
        let mut out = format!("{}\n", "Delegating tasks".bold());
        for t in input["tasks"].as_array().into_iter().flatten() {
            out.push_str(&format!("  • {}\n", t["title"].as_str().unwrap_or("?").cyan()));
        }
        out
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        _project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let input: DelegateTasksInput = parse_input(self.name(), &tool_use.input)?;
        let strategy = input.strategy(self.default_strategy);
        let handler = ErrorHandler::new(strategy)
            .with_backoff(self.retry_base_delay, self.retry_base_delay.saturating_mul(16));
        let runner: Arc<dyn TaskRunner> = self.runner.clone();
        let queue = TaskQueue::new(runner, handler);

        for t in input.tasks {
            queue.enqueue(
                QueuedTask::new(t.title, t.background, t.instructions)
                    .with_resources(t.resources)
                    .with_capabilities(t.capabilities)
                    .with_requirements(t.requirements),
            );
        }
        let report = queue
            .drain()
            .await
            .ok_or_else(|| BbaiError::tool(self.name(), "task queue is already draining"))?;

        let (text, data) = Self::summarize(&report);
        let result = if report.completed() == 0 || report.stopped_early {
            ToolResult::failure(text, BbaiResponse::data(data))
        } else {
            ToolResult::success(text, BbaiResponse::data(data))
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ModelSettings, TokenUsage};
    use crate::llm::MockLlmClient;
    use crate::project::DefaultResourceLoader;
    use crate::tools::SafeFs;

    fn tool(dir: &std::path::Path, mock: MockLlmClient, strategy: ErrorStrategy) -> DelegateTasksTool {
        let mut models = ModelRegistry::new();
        models.register("coder", Arc::new(mock), "coder-1", vec!["code".into()]);
        let loader = Arc::new(DefaultResourceLoader::new(SafeFs::new(dir), 5, 10_000));
        DelegateTasksTool::new(DelegateRunner::new(Arc::new(models), loader, 5, 512), strategy)
            .with_retry_delay(Duration::from_millis(1))
    }

    fn call(input: Value) -> ToolUse {
        ToolUse {
            id: "tu-dt".into(),
            name: "delegate_tasks".into(),
            input,
            validation: None,
        }
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  [1] "), "[1]");
    }

    #[tokio::test]
    async fn test_resources_and_requirements() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "the answer is 7").unwrap();
        let mock = MockLlmClient::named("coder");
        mock.push_text("```json\n{\"value\": 7}\n```", TokenUsage::new(5, 5));
        let tool = tool(dir.path(), mock, ErrorStrategy::FailFast);
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let result = tool
            .run(
                &ia,
                &call(json!({"tasks": [{
                    "title": "extract",
                    "instructions": "Return the number",
                    "resources": [{"type": "file", "uri": "notes.md"}],
                    "capabilities": ["code"],
                    "requirements": {"type": "object", "required": ["value"]}
                }]})),
                &ProjectContext::new(dir.path()),
            )
            .await
            .unwrap();
        assert!(!result.is_error, "{}", result.tool_response);
        assert!(result.tool_response.contains("1 completed"));
        assert!(result.tool_response.contains("{\"value\":7}"));
    }

    #[tokio::test]
    async fn test_unroutable_capability_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path(), MockLlmClient::named("coder"), ErrorStrategy::FailFast);
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let result = tool
            .run(
                &ia,
                &call(json!({"tasks": [
                    {"title": "vision", "instructions": "look", "capabilities": ["vision"]},
                    {"title": "later", "instructions": "never runs"}
                ]})),
                &ProjectContext::new(dir.path()),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.tool_response.contains("0 completed, 1 failed, 1 not run"));
        assert!(result.tool_response.contains("Unsupported provider"));
    }
}
