//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设响应；脚本用尽后回显最后一条 User 文本。记录收到的每次请求便于断言。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::conversation::{ContentPart, Role, TokenUsage};
use crate::llm::{LlmAnswer, LlmError, LlmProvider, LlmRequest};

/// 预设脚本的 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    name: String,
    script: Mutex<VecDeque<Result<LlmAnswer, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
    delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            ..Default::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_answer(&self, answer: LlmAnswer) -> &Self {
        self.lock_script().push_back(Ok(answer));
        self
    }

    pub fn push_text(&self, text: &str, usage: TokenUsage) -> &Self {
        self.push_answer(LlmAnswer::text(text, usage))
    }

    /// 预设一次工具调用响应
    pub fn push_tool_use(&self, id: &str, name: &str, input: serde_json::Value, usage: TokenUsage) -> &Self {
        self.push_answer(LlmAnswer {
            content: vec![ContentPart::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            usage,
            stop_reason: Some("tool_use".to_string()),
        })
    }

    pub fn push_error(&self, err: LlmError) -> &Self {
        self.lock_script().push_back(Err(err));
        self
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        match self.requests.lock() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<LlmAnswer, LlmError>>> {
        match self.script.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlmClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn speak_with_llm(&self, request: &LlmRequest) -> Result<LlmAnswer, LlmError> {
        match self.requests.lock() {
            Ok(mut r) => r.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(next) = self.lock_script().pop_front() {
            return next;
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "(no input)".to_string());
        Ok(LlmAnswer::text(
            format!("Echo from {}: {}", self.name, last_user),
            TokenUsage::new(1, 1),
        ))
    }
}
