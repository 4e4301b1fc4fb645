//! 对话交互：单个会话的消息历史、计数器与 Token 账本
//!
//! 所有可变的会话状态都归 ConversationInteraction 所有（不使用进程级全局状态）；
//! OrchestratorController 每轮通过它追加消息、更新计数、生成下一次 LLM 请求。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::conversation::{
    ContentPart, ConversationMetrics, Message, Role, TokenUsage, TokenUsageLedger, ToolUse,
};
use crate::core::{BbaiError, InteractionPhase};
use crate::llm::LlmRequest;
use crate::tools::ToolDefinition;

/// 会话 ID
pub type ConversationId = String;

/// 会话级模型设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSettings {
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are BBai, an assistant that inspects and modifies software projects using tools."
                .to_string(),
            temperature: 0.2,
            max_tokens: 8192,
        }
    }
}

/// 持久化元数据（metadata.json）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub id: ConversationId,
    pub title: String,
    #[serde(flatten)]
    pub settings: ModelSettings,
    pub metrics: ConversationMetrics,
    pub token_usage: TokenUsageLedger,
    pub tools: Vec<String>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 对话交互（Interaction）
#[derive(Debug)]
pub struct ConversationInteraction {
    id: ConversationId,
    title: String,
    settings: ModelSettings,
    messages: Vec<Message>,
    /// 已写入 messages.jsonl 的条数
    persisted: usize,
    metrics: ConversationMetrics,
    token_usage: TokenUsageLedger,
    tools: Vec<String>,
    phase: InteractionPhase,
    cancel_token: CancellationToken,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConversationInteraction {
    pub fn new(id: impl Into<ConversationId>, settings: ModelSettings) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            settings,
            messages: Vec::new(),
            persisted: 0,
            metrics: ConversationMetrics::default(),
            token_usage: TokenUsageLedger::default(),
            tools: Vec::new(),
            phase: InteractionPhase::Idle,
            cancel_token: CancellationToken::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 从持久化数据恢复；已回放的消息视为已持久化
    pub fn restore(metadata: ConversationMetadata, messages: Vec<Message>) -> Self {
        let persisted = messages.len();
        Self {
            id: metadata.id,
            title: metadata.title,
            settings: metadata.settings,
            messages,
            persisted,
            metrics: metadata.metrics,
            token_usage: metadata.token_usage,
            tools: metadata.tools,
            phase: InteractionPhase::Idle,
            cancel_token: CancellationToken::new(),
            created_at: metadata.created_at,
            updated_at: metadata.updated_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn metrics(&self) -> ConversationMetrics {
        self.metrics
    }

    pub fn token_usage(&self) -> &TokenUsageLedger {
        &self.token_usage
    }

    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    pub fn set_tools(&mut self, tools: Vec<String>) {
        self.tools = tools;
    }

    pub fn phase(&self) -> InteractionPhase {
        self.phase
    }

    pub fn set_phase(&mut self, to: InteractionPhase) -> Result<(), BbaiError> {
        self.phase = self.phase.transition(to)?;
        Ok(())
    }

    /// 出错或取消时强制回到 Idle
    pub fn reset_phase(&mut self) {
        self.phase = InteractionPhase::Idle;
    }

    /// 挂上本次 statement 的取消令牌（由 ConversationSupervisor 发放）
    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel_token = token;
    }

    /// 每一轮开始前检查
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 开始一个新 statement：重置 turn 计数，追加 User 消息
    pub fn begin_statement(&mut self, statement: &str) {
        if self.title.is_empty() {
            self.title = statement.chars().take(60).collect::<String>().trim().to_string();
        }
        self.metrics.statement_count += 1;
        self.metrics.statement_turn_count = 0;
        self.token_usage.begin_statement();
        self.push(Message::user(statement));
    }

    /// 追加模型响应：turn 计数与 token 统计各增加一次
    pub fn add_assistant_message(&mut self, content: Vec<ContentPart>, usage: TokenUsage) -> &Message {
        self.metrics.statement_turn_count += 1;
        self.metrics.conversation_turn_count += 1;
        self.token_usage.record_turn(usage);
        self.push(Message::assistant(content, usage));
        &self.messages[self.messages.len() - 1]
    }

    /// 追加一条 Tool 消息，包含本轮所有工具结果
    pub fn add_tool_results(&mut self, results: Vec<ContentPart>) -> &Message {
        let count = results
            .iter()
            .filter(|p| matches!(p, ContentPart::ToolResult { .. }))
            .count() as u64;
        self.metrics.tool_result_count += count;
        self.push(Message::tool(results));
        &self.messages[self.messages.len() - 1]
    }

    /// 最后一条 assistant 消息中尚未有结果的工具调用
    pub fn pending_tool_uses(&self) -> Vec<ToolUse> {
        let Some(last) = self.messages.last() else {
            return Vec::new();
        };
        if last.role != Role::Assistant {
            return Vec::new();
        }
        last.tool_uses()
    }

    /// 为进程中断时未完成的工具调用补写结果，保证历史结构完整
    pub fn repair_interrupted_tool_uses(&mut self) -> bool {
        let pending = self.pending_tool_uses();
        if pending.is_empty() {
            return false;
        }
        let results = pending
            .into_iter()
            .map(|tu| ContentPart::ToolResult {
                tool_use_id: tu.id,
                content: vec![ContentPart::text(format!(
                    "Tool {} was interrupted before it produced a result. Re-run it if it is still needed.",
                    tu.name
                ))],
                is_error: true,
            })
            .collect();
        self.add_tool_results(results);
        true
    }

    /// 清空内存中的消息（不删除磁盘历史，计数保留）
    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.persisted = 0;
        self.updated_at = Utc::now();
    }

    pub fn unpersisted_messages(&self) -> &[Message] {
        &self.messages[self.persisted.min(self.messages.len())..]
    }

    pub fn mark_persisted(&mut self) {
        self.persisted = self.messages.len();
    }

    pub fn build_request(&self, tools: Vec<ToolDefinition>) -> LlmRequest {
        LlmRequest {
            model: self.settings.model.clone(),
            system: self.settings.system_prompt.clone(),
            messages: self.messages.clone(),
            tools,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    pub fn metadata(&self) -> ConversationMetadata {
        ConversationMetadata {
            id: self.id.clone(),
            title: self.title.clone(),
            settings: self.settings.clone(),
            metrics: self.metrics,
            token_usage: self.token_usage.clone(),
            tools: self.tools.clone(),
            message_count: self.messages.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn push(&mut self, msg: Message) {
        self.updated_at = msg.timestamp;
        self.messages.push(msg);
    }
}
