//! multi_model_query：把同一个问题并发发给多个已注册模型
//!
//! 子请求并发执行，全部结束后汇总为一个 ToolResult；单个模型失败只记录在它自己的条目里。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossterm::style::Stylize;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::conversation::{ConversationInteraction, Message, ToolUse};
use crate::core::BbaiError;
use crate::llm::{LlmError, LlmRequest, ModelRegistry};
use crate::project::ProjectContext;
use crate::tools::{parse_input, BbaiResponse, Tool, ToolCapability, ToolResult};

#[derive(Debug, Deserialize)]
struct MultiModelQueryInput {
    query: String,
    models: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MultiModelQueryTool {
    models: Arc<ModelRegistry>,
    timeout: Duration,
    max_tokens: u32,
}

impl MultiModelQueryTool {
    pub fn new(models: Arc<ModelRegistry>, timeout_secs: u64, max_tokens: u32) -> Self {
        Self {
            models,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            max_tokens,
        }
    }

    async fn ask(&self, name: &str, query: &str) -> Result<String, BbaiError> {
        let entry = self.models.get(name)?;
        let request = LlmRequest {
            model: entry.model.clone(),
            system: String::new(),
            messages: vec![Message::user(query)],
            tools: Vec::new(),
            temperature: 0.2,
            max_tokens: self.max_tokens,
        };
        let answer = tokio::time::timeout(self.timeout, entry.provider.speak_with_llm(&request))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout.as_secs()))??;
        Ok(answer.answer())
    }
}

#[async_trait]
impl Tool for MultiModelQueryTool {
    fn name(&self) -> &str {
        "multi_model_query"
    }

    fn description(&self) -> String {
        format!(
            "Send one query to several models concurrently and collect every answer. Available models: {}.",
            self.models.names().join(", ")
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "models": {
                    "type": "array",
                    "minItems": 1,
                    "items": { "type": "string", "enum": self.models.names() }
                }
            },
            "required": ["query", "models"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::External
    }

    fn render_use_console(&self, input: &Value) -> String {
        let models: Vec<&str> = input["models"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        format!(
            "{} [{}] {}",
            "Querying models".bold(),
            models.join(", ").cyan(),
            input["query"].as_str().unwrap_or("").italic()
        )
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        _project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let input: MultiModelQueryInput = parse_input(self.name(), &tool_use.input)?;
        let answers = join_all(input.models.iter().map(|m| self.ask(m, &input.query))).await;

        let mut sections = Vec::with_capacity(answers.len());
        let mut entries = Vec::with_capacity(answers.len());
        let mut failed = 0usize;
        for (model, answer) in input.models.iter().zip(answers) {
            match answer {
                Ok(text) => {
                    sections.push(format!("Model: {}\n{}", model, text));
                    entries.push(json!({ "model": model, "answer": text }));
                }
                Err(err) => {
                    failed += 1;
                    tracing::warn!(model = %model, error = %err, "multi_model_query sub-request failed");
                    sections.push(format!("Model: {}\nError: {}", model, err));
                    entries.push(json!({ "model": model, "error": err.to_string() }));
                }
            }
        }

        let text = format!(
            "Queried {} model(s), {} answered:\n\n{}",
            entries.len(),
            entries.len() - failed,
            sections.join("\n\n")
        );
        let data = BbaiResponse::data(json!({ "responses": entries }));
        Ok(if failed == entries.len() {
            ToolResult::failure(text, data)
        } else {
            ToolResult::success(text, data)
        })
    }
}
