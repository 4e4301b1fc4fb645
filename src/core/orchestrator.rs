//! OrchestratorController：statement 主循环
//!
//! 一次 statement：追加用户消息 → 循环「请求模型 → 执行工具 → 回填结果」直到模型不再调用工具、
//! 达到 turn 上限或被取消。每轮结束都落盘（messages.jsonl / metadata.json / 日志），
//! 工具造成的文件改动写入 patches.jsonl 并交给 CommitHook。
//!
//! 同一会话的 statement 由会话锁串行化，不同会话互不影响。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::conversation::{
    delete_conversation, list_conversations, ConversationInteraction, ConversationLogger,
    ConversationMetadata, ConversationMetrics, ConversationPersistence, ConversationSummary, LogEntry,
    LogEntryType, ModelSettings, PatchRecord, TokenUsageLedger, ToolUse,
};
use crate::core::{
    BbaiError, ConversationSupervisor, ErrorHandler, EventHub, InteractionPhase, ProgressEvent,
};
use crate::llm::{LlmAnswer, LlmError, LlmProvider, LlmRequest};
use crate::project::{CommitHook, ProjectContext};
use crate::tools::{FileChange, ToolExecutor, ToolResult};

/// statement 的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementOutcome {
    /// 模型给出了不含工具调用的回答
    Completed,
    /// 达到 turn 上限
    MaxTurns,
    /// 被取消
    Interrupted,
}

impl StatementOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementOutcome::Completed => "completed",
            StatementOutcome::MaxTurns => "max_turns",
            StatementOutcome::Interrupted => "interrupted",
        }
    }
}

/// 返回给调用方的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementResponse {
    pub conversation_id: String,
    pub answer: String,
    pub outcome: StatementOutcome,
    pub metrics: ConversationMetrics,
    pub token_usage: TokenUsageLedger,
}

type InteractionSlot = Arc<Mutex<ConversationInteraction>>;

/// 编排器：多会话共享，会话状态各自独立
pub struct OrchestratorController {
    provider: Arc<dyn LlmProvider>,
    settings: ModelSettings,
    executor: Arc<ToolExecutor>,
    project: ProjectContext,
    data_dir: PathBuf,
    commit_hook: Arc<dyn CommitHook>,
    supervisor: Arc<ConversationSupervisor>,
    events: EventHub,
    llm_retry: ErrorHandler,
    llm_timeout: Duration,
    max_turns: u64,
    conversations: Mutex<HashMap<String, InteractionSlot>>,
}

impl std::fmt::Debug for OrchestratorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorController")
            .field("provider", &self.provider.name())
            .field("model", &self.settings.model)
            .field("project", &self.project.root())
            .field("data_dir", &self.data_dir)
            .field("max_turns", &self.max_turns)
            .finish()
    }
}

impl OrchestratorController {
    /// 由 OrchestratorBuilder 调用
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        provider: Arc<dyn LlmProvider>,
        settings: ModelSettings,
        executor: Arc<ToolExecutor>,
        project: ProjectContext,
        data_dir: PathBuf,
        commit_hook: Arc<dyn CommitHook>,
        supervisor: Arc<ConversationSupervisor>,
        events: EventHub,
        llm_retry: ErrorHandler,
        llm_timeout: Duration,
        max_turns: u64,
    ) -> Self {
        Self {
            provider,
            settings,
            executor,
            project,
            data_dir,
            commit_hook,
            supervisor,
            events,
            llm_retry,
            llm_timeout,
            max_turns: max_turns.max(1),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// 新会话 ID
    pub fn new_conversation_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn project(&self) -> &ProjectContext {
        &self.project
    }

    pub fn supervisor(&self) -> &Arc<ConversationSupervisor> {
        &self.supervisor
    }

    /// 订阅会话进度事件
    pub fn subscribe(&self, conversation_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.events.subscribe(conversation_id)
    }

    /// 请求取消；下一轮开始前生效
    pub fn cancel(&self, conversation_id: &str) -> bool {
        self.supervisor.cancel(conversation_id)
    }

    /// 处理一条 statement；只有基础设施错误返回 Err
    pub async fn handle_statement(
        &self,
        conversation_id: &str,
        statement: &str,
    ) -> Result<StatementResponse, BbaiError> {
        let slot = self.interaction_slot(conversation_id).await?;
        let mut interaction = slot.lock().await;
        let persistence = ConversationPersistence::new(&self.data_dir, conversation_id);
        persistence.init().await?;
        let logger = ConversationLogger::new(persistence.dir());
        interaction.set_cancel_token(self.supervisor.begin(conversation_id));

        tracing::info!(conversation = %conversation_id, "statement started");
        let result = self
            .run_statement(&mut interaction, &persistence, &logger, statement)
            .await;
        self.supervisor.finish(conversation_id);
        interaction.reset_phase();

        match result {
            Ok(response) => {
                tracing::info!(
                    conversation = %conversation_id,
                    outcome = response.outcome.as_str(),
                    turns = response.metrics.statement_turn_count,
                    tokens = response.token_usage.statement.total_tokens,
                    "statement finished"
                );
                self.events.publish(ProgressEvent::StatementFinished {
                    conversation_id: conversation_id.to_string(),
                    outcome: response.outcome.as_str().to_string(),
                    metrics: response.metrics,
                });
                Ok(response)
            }
            Err(err) => {
                tracing::error!(conversation = %conversation_id, error = %err, "statement failed");
                if let Err(log_err) = logger
                    .log(&LogEntry::new(LogEntryType::Error, err.to_string()))
                    .await
                {
                    tracing::warn!(error = %log_err, "failed to write error log entry");
                }
                self.events.publish(ProgressEvent::Error {
                    conversation_id: conversation_id.to_string(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_statement(
        &self,
        interaction: &mut ConversationInteraction,
        persistence: &ConversationPersistence,
        logger: &ConversationLogger,
        statement: &str,
    ) -> Result<StatementResponse, BbaiError> {
        let conversation_id = interaction.id().to_string();
        // 上一个 statement 在工具执行中因基础设施错误退出时，先补齐工具结果
        if interaction.repair_interrupted_tool_uses() {
            tracing::warn!(conversation = %conversation_id, "repaired tool uses left without results");
            persistence.persist(interaction).await?;
        }
        interaction.set_tools(self.executor.registry().tool_names());
        interaction.begin_statement(statement);
        let user_message_id = interaction.last_message().map(|m| m.id.clone()).unwrap_or_default();
        persistence.persist(interaction).await?;
        logger
            .log(&LogEntry::new(LogEntryType::User, statement).with_message_id(user_message_id))
            .await?;
        self.events.publish(ProgressEvent::StatementStarted {
            conversation_id: conversation_id.clone(),
            statement: statement.to_string(),
        });

        let definitions = self.executor.registry().definitions();
        let mut answer = String::new();
        loop {
            if interaction.is_cancelled() {
                tracing::info!(conversation = %conversation_id, "statement interrupted");
                return Ok(self.response(interaction, answer, StatementOutcome::Interrupted));
            }
            let turn = interaction.metrics().statement_turn_count;
            if turn >= self.max_turns {
                tracing::warn!(conversation = %conversation_id, max_turns = self.max_turns, "turn limit reached");
                return Ok(self.response(interaction, answer, StatementOutcome::MaxTurns));
            }

            interaction.set_phase(InteractionPhase::AwaitingModel)?;
            self.events.publish(ProgressEvent::AwaitingModel {
                conversation_id: conversation_id.clone(),
                turn: turn + 1,
            });
            let request = interaction.build_request(definitions.clone());
            let reply = self.call_model(&request).await?;

            let text = reply.answer();
            let usage = reply.usage;
            let message_id = interaction.add_assistant_message(reply.content, usage).id.clone();
            persistence.persist(interaction).await?;
            logger
                .log(
                    &LogEntry::new(LogEntryType::Assistant, text.clone())
                        .with_message_id(message_id)
                        .with_metrics(interaction.metrics(), usage),
                )
                .await?;
            self.events.publish(ProgressEvent::AssistantMessage {
                conversation_id: conversation_id.clone(),
                text: text.clone(),
                usage,
            });
            if !text.trim().is_empty() {
                answer = text;
            }

            let tool_uses = interaction.pending_tool_uses();
            if tool_uses.is_empty() {
                interaction.set_phase(InteractionPhase::Idle)?;
                return Ok(self.response(interaction, answer, StatementOutcome::Completed));
            }
            interaction.set_phase(InteractionPhase::ToolDispatch)?;
            self.dispatch_tools(interaction, persistence, logger, tool_uses).await?;
        }
    }

    /// 带超时与重试的模型调用；进行中的请求不会被取消打断
    async fn call_model(&self, request: &LlmRequest) -> Result<LlmAnswer, BbaiError> {
        let provider = &self.provider;
        let limit = self.llm_timeout;
        self.llm_retry
            .run_with_retry(|attempt| async move {
                if attempt > 0 {
                    tracing::info!(attempt, provider = provider.name(), "retrying model request");
                }
                match tokio::time::timeout(limit, provider.speak_with_llm(request)).await {
                    Ok(answer) => answer.map_err(BbaiError::from),
                    Err(_) => Err(LlmError::Timeout(limit.as_secs()).into()),
                }
            })
            .await
    }

    /// 并发执行本轮全部工具调用，按调用顺序回填结果
    async fn dispatch_tools(
        &self,
        interaction: &mut ConversationInteraction,
        persistence: &ConversationPersistence,
        logger: &ConversationLogger,
        tool_uses: Vec<ToolUse>,
    ) -> Result<(), BbaiError> {
        let conversation_id = interaction.id().to_string();
        let registry = self.executor.registry();

        for tu in &tool_uses {
            let input = serde_json::to_string_pretty(&tu.input)?;
            logger
                .log(&LogEntry::new(LogEntryType::ToolUse, input).with_tool(&tu.name))
                .await?;
            if let Some(tool) = registry.get_tool(&tu.name) {
                self.events.publish(ProgressEvent::ToolUse {
                    conversation_id: conversation_id.clone(),
                    tool_use_id: tu.id.clone(),
                    tool: tu.name.clone(),
                    rendered: tool.render_use_console(&tu.input),
                    rich: tool.render_use_rich(&tu.input),
                });
            }
        }

        let shared: &ConversationInteraction = interaction;
        let outcomes = join_all(
            tool_uses
                .iter()
                .map(|tu| self.executor.execute(shared, tu, &self.project)),
        )
        .await;

        let mut parts = Vec::with_capacity(tool_uses.len());
        let mut finished: Vec<ToolResult> = Vec::with_capacity(tool_uses.len());
        for (tu, outcome) in tool_uses.iter().zip(outcomes) {
            let result = outcome?;
            logger
                .log(&LogEntry::new(LogEntryType::ToolResult, result.bbai_text()).with_tool(&tu.name))
                .await?;
            if let Some(tool) = registry.get_tool(&tu.name) {
                self.events.publish(ProgressEvent::ToolResult {
                    conversation_id: conversation_id.clone(),
                    tool_use_id: tu.id.clone(),
                    tool: tu.name.clone(),
                    is_error: result.is_error,
                    rendered: tool.render_result_console(&result),
                    rich: tool.render_result_rich(&result),
                });
            }
            parts.push(result.to_content_part(&tu.id));
            finished.push(result);
        }

        let message_id = interaction.add_tool_results(parts).id.clone();
        persistence.persist(interaction).await?;

        for mut result in finished {
            if let Some(finalize) = result.take_finalize() {
                finalize(persistence.clone(), message_id.clone()).await?;
            }
            for change in &result.changes {
                self.record_change(interaction, persistence, change).await?;
            }
        }
        Ok(())
    }

    /// 改动写入 patches.jsonl，再交给提交钩子；钩子失败只记录警告
    async fn record_change(
        &self,
        interaction: &ConversationInteraction,
        persistence: &ConversationPersistence,
        change: &FileChange,
    ) -> Result<(), BbaiError> {
        persistence
            .append_patch(&PatchRecord {
                timestamp: Utc::now(),
                file_path: change.path.clone(),
                description: change.description.clone(),
                patch: change.patch.clone(),
            })
            .await?;
        let hooked = match &change.patch {
            Some(patch) => {
                self.commit_hook
                    .log_patch_and_commit(interaction, &change.path, patch)
                    .await
            }
            None => {
                self.commit_hook
                    .log_change_and_commit(interaction, &change.path, &change.description)
                    .await
            }
        };
        if let Err(err) = hooked {
            tracing::warn!(path = %change.path, error = %err, "commit hook failed");
        }
        Ok(())
    }

    fn response(
        &self,
        interaction: &ConversationInteraction,
        answer: String,
        outcome: StatementOutcome,
    ) -> StatementResponse {
        StatementResponse {
            conversation_id: interaction.id().to_string(),
            answer,
            outcome,
            metrics: interaction.metrics(),
            token_usage: interaction.token_usage().clone(),
        }
    }

    /// 取得会话：内存中已有则复用，否则从磁盘恢复或新建
    async fn interaction_slot(&self, conversation_id: &str) -> Result<InteractionSlot, BbaiError> {
        let mut map = self.conversations.lock().await;
        if let Some(slot) = map.get(conversation_id) {
            return Ok(slot.clone());
        }
        let persistence = ConversationPersistence::new(&self.data_dir, conversation_id);
        let interaction = match persistence.load_interaction().await? {
            Some(restored) => {
                tracing::info!(conversation = %conversation_id, messages = restored.messages().len(), "conversation resumed");
                restored
            }
            None => ConversationInteraction::new(conversation_id, self.settings.clone()),
        };
        let slot = Arc::new(Mutex::new(interaction));
        map.insert(conversation_id.to_string(), slot.clone());
        Ok(slot)
    }

    /// 会话元数据；会话不存在时返回 None
    pub async fn load(&self, conversation_id: &str) -> Result<Option<ConversationMetadata>, BbaiError> {
        let cached = self.conversations.lock().await.get(conversation_id).cloned();
        if let Some(slot) = cached {
            return Ok(Some(slot.lock().await.metadata()));
        }
        let persistence = ConversationPersistence::new(&self.data_dir, conversation_id);
        if !persistence.exists().await {
            return Ok(None);
        }
        let slot = self.interaction_slot(conversation_id).await?;
        let metadata = slot.lock().await.metadata();
        Ok(Some(metadata))
    }

    /// 清空内存中的消息，磁盘历史保留
    pub async fn clear_messages(&self, conversation_id: &str) -> bool {
        let cached = self.conversations.lock().await.get(conversation_id).cloned();
        match cached {
            Some(slot) => {
                slot.lock().await.clear_messages();
                true
            }
            None => false,
        }
    }

    /// 删除会话：内存、事件通道与磁盘目录
    pub async fn delete(&self, conversation_id: &str) -> Result<bool, BbaiError> {
        self.supervisor.cancel(conversation_id);
        self.conversations.lock().await.remove(conversation_id);
        self.events.remove(conversation_id);
        delete_conversation(&self.data_dir, conversation_id).await
    }

    pub async fn list(&self) -> Result<Vec<ConversationSummary>, BbaiError> {
        list_conversations(&self.data_dir).await
    }
}
