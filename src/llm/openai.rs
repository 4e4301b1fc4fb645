//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! 工具以 JSON 约定传递：system 中列出工具 schema，模型回复 `{"tool": "...", "args": {...}}` 即视为工具调用。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;

use crate::conversation::{ContentPart, Role, TokenUsage};
use crate::llm::{LlmAnswer, LlmError, LlmProvider, LlmRequest};
use crate::tools::tool_call_schema_json;

/// LLM 返回的工具调用（JSON 约定）
#[derive(Debug, Clone, Deserialize)]
struct ToolCallJson {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

/// 解析模型输出：含合法 `{"tool": ...}` JSON 时为工具调用，否则整段作为文本回答
fn parse_llm_output(output: &str) -> ContentPart {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            return ContentPart::text(trimmed);
        }
    } else {
        return ContentPart::text(trimmed);
    };

    match serde_json::from_str::<ToolCallJson>(json_str) {
        Ok(call) if !call.tool.is_empty() => ContentPart::ToolUse {
            id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
            name: call.tool,
            input: if call.args.is_null() {
                serde_json::json!({})
            } else {
                call.args
            },
        },
        _ => ContentPart::text(trimmed),
    }
}

/// 把内容片段展开为纯文本（工具调用写回 JSON，工具结果写成 Observation）
fn flatten_parts(parts: &[ContentPart]) -> String {
    let mut out = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => out.push(text.clone()),
            ContentPart::Image { source } => out.push(format!("[image: {}]", source.media_type)),
            ContentPart::ToolUse { name, input, .. } => {
                out.push(serde_json::json!({ "tool": name, "args": input }).to_string())
            }
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let label = if *is_error { "Error" } else { "Observation" };
                out.push(format!("{} for {}: {}", label, tool_use_id, flatten_parts(content)));
            }
        }
    }
    out.join("\n")
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    name: String,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            name: "openai".to_string(),
        }
    }

    fn system_prompt(request: &LlmRequest) -> String {
        if request.tools.is_empty() {
            return request.system.clone();
        }
        let tools = serde_json::to_string_pretty(&request.tools).unwrap_or_else(|_| "[]".to_string());
        format!(
            "{}\n\nAvailable tools:\n{}\n\nTo call a tool, reply with ONLY one JSON object matching this schema:\n{}",
            request.system,
            tools,
            tool_call_schema_json()
        )
    }

    fn to_openai_messages(request: &LlmRequest) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let build_err = |e: async_openai::error::OpenAIError| LlmError::InvalidResponse(e.to_string());
        let mut out = vec![ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(Self::system_prompt(request))
                .build()
                .map_err(build_err)?,
        )];
        for m in &request.messages {
            let text = flatten_parts(&m.content);
            let msg = match m.role {
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(text)
                        .build()
                        .map_err(build_err)?,
                ),
                Role::User | Role::Tool => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(text)
                        .build()
                        .map_err(build_err)?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn speak_with_llm(&self, request: &LlmRequest) -> Result<LlmAnswer, LlmError> {
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .messages(Self::to_openai_messages(request)?)
            .temperature(request.temperature)
            .max_completion_tokens(request.max_tokens)
            .build()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::InvalidResponse("empty completion".to_string()))?;

        let part = parse_llm_output(&content);
        let stop_reason = match part {
            ContentPart::ToolUse { .. } => "tool_use",
            _ => "end_turn",
        };
        Ok(LlmAnswer {
            content: vec![part],
            usage,
            stop_reason: Some(stop_reason.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_call_json() {
        let part = parse_llm_output(r#"{"tool": "search_project", "args": {"filePattern": "*.rs"}}"#);
        match part {
            ContentPart::ToolUse { name, input, id } => {
                assert_eq!(name, "search_project");
                assert_eq!(input["filePattern"], "*.rs");
                assert!(id.starts_with("toolu_"));
            }
            other => panic!("expected tool use, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_fenced_tool_call() {
        let output = "I'll search.\n```json\n{\"tool\": \"run_command\", \"args\": {\"command\": \"ls\"}}\n```";
        assert!(matches!(parse_llm_output(output), ContentPart::ToolUse { .. }));
    }

    #[test]
    fn test_plain_answer_with_braces_stays_text() {
        let output = "Use `fn main() { }` as the entry point.";
        assert!(matches!(parse_llm_output(output), ContentPart::Text { .. }));
    }

    #[test]
    fn test_flatten_tool_result() {
        let text = flatten_parts(&[ContentPart::ToolResult {
            tool_use_id: "t1".into(),
            content: vec![ContentPart::text("3 files")],
            is_error: false,
        }]);
        assert_eq!(text, "Observation for t1: 3 files");
    }
}
