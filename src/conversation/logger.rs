//! 对话日志
//!
//! 每次记录同时写两份：
//! - conversation.log：人类可读，每条以固定分隔符结尾，跟随进程可边读边渲染
//! - conversation.jsonl：结构化，每行一条 JSON

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::conversation::{ConversationMetrics, TokenUsage};
use crate::core::BbaiError;

pub const LOG_FILE: &str = "conversation.log";
pub const LOG_JSONL_FILE: &str = "conversation.jsonl";
/// 人类可读日志的条目分隔符
pub const ENTRY_SEPARATOR: &str = "<<<BBAI_LOG_ENTRY_SEPARATOR>>>";

/// 日志条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    User,
    Assistant,
    ToolUse,
    ToolResult,
    Auxiliary,
    Error,
}

impl LogEntryType {
    fn label(self) -> &'static str {
        match self {
            LogEntryType::User => "USER",
            LogEntryType::Assistant => "ASSISTANT",
            LogEntryType::ToolUse => "TOOL USE",
            LogEntryType::ToolResult => "TOOL RESULT",
            LogEntryType::Auxiliary => "AUXILIARY",
            LogEntryType::Error => "ERROR",
        }
    }
}

/// 一条日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub entry_type: LogEntryType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ConversationMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl LogEntry {
    pub fn new(entry_type: LogEntryType, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            entry_type,
            content: content.into(),
            message_id: None,
            tool_name: None,
            metrics: None,
            token_usage: None,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    pub fn with_metrics(mut self, metrics: ConversationMetrics, usage: TokenUsage) -> Self {
        self.metrics = Some(metrics);
        self.token_usage = Some(usage);
        self
    }

    /// 人类可读格式（含结尾分隔符）
    pub fn format(&self) -> String {
        let mut header = format!(
            "## {} [{}]",
            self.entry_type.label(),
            self.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(tool) = &self.tool_name {
            header.push_str(&format!(" {}", tool));
        }
        if let (Some(m), Some(u)) = (&self.metrics, &self.token_usage) {
            header.push_str(&format!(
                " (statement {}, turn {}, tokens {}/{})",
                m.statement_count, m.statement_turn_count, u.input_tokens, u.output_tokens
            ));
        }
        format!("{}\n{}\n\n{}\n", header, self.content.trim_end(), ENTRY_SEPARATOR)
    }
}

/// 会话日志写入器
#[derive(Debug, Clone)]
pub struct ConversationLogger {
    log_path: PathBuf,
    jsonl_path: PathBuf,
}

impl ConversationLogger {
    pub fn new(conversation_dir: impl AsRef<Path>) -> Self {
        let dir = conversation_dir.as_ref();
        Self {
            log_path: dir.join(LOG_FILE),
            jsonl_path: dir.join(LOG_JSONL_FILE),
        }
    }

    pub async fn log(&self, entry: &LogEntry) -> Result<(), BbaiError> {
        append(&self.log_path, &entry.format()).await?;
        let line = format!("{}\n", serde_json::to_string(entry)?);
        append(&self.jsonl_path, &line).await
    }

    /// 读取人类可读日志并按分隔符切分
    pub async fn read_entries(&self) -> Result<Vec<String>, BbaiError> {
        let data = match fs::read_to_string(&self.log_path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(split_entries(&data))
    }

    pub async fn read_structured(&self) -> Result<Vec<LogEntry>, BbaiError> {
        let data = match fs::read_to_string(&self.jsonl_path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            out.push(serde_json::from_str(line)?);
        }
        Ok(out)
    }
}

/// 按分隔符切分日志；最后一段若没有分隔符（写入中）则忽略
pub fn split_entries(data: &str) -> Vec<String> {
    let mut parts: Vec<&str> = data.split(ENTRY_SEPARATOR).collect();
    parts.pop();
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

async fn append(path: &Path, content: &str) -> Result<(), BbaiError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    Ok(())
}
