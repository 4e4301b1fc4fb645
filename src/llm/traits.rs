//! LLM 后端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmProvider::speak_with_llm：输入完整请求，返回内容片段与用量。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::{ContentPart, Message, TokenUsage};
use crate::tools::ToolDefinition;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error: {0}")]
    Api(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// 发往后端的一次请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// 后端响应（messageResponse）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmAnswer {
    pub content: Vec<ContentPart>,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl LlmAnswer {
    pub fn text(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: vec![ContentPart::text(text)],
            usage,
            stop_reason: Some("end_turn".to_string()),
        }
    }

    /// 文本部分（answer）
    pub fn answer(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// LLM 后端 trait
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// 后端名称（用于路由与日志）
    fn name(&self) -> &str;

    async fn speak_with_llm(&self, request: &LlmRequest) -> Result<LlmAnswer, LlmError>;
}
