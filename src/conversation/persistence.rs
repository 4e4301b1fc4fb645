//! 对话持久化
//!
//! 每个会话一个目录：
//! - metadata.json：身份、模型、计数、Token 账本、工具列表（整体覆盖写，last-write-wins）
//! - messages.jsonl：消息日志，每行一条，只追加
//! - patches.jsonl：文件变更日志，每行一条，只追加
//! - files/*.meta：附加文件的元数据
//!
//! 数据目录下的 conversations.json 为会话索引（单进程读-改-写）。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::conversation::{ConversationInteraction, ConversationMetadata, Message};
use crate::core::BbaiError;
use crate::tools::filesystem::write_atomic;

pub const METADATA_FILE: &str = "metadata.json";
pub const MESSAGES_FILE: &str = "messages.jsonl";
pub const PATCHES_FILE: &str = "patches.jsonl";
pub const FILES_DIR: &str = "files";
pub const CONVERSATIONS_DIR: &str = "conversations";
pub const INDEX_FILE: &str = "conversations.json";

/// patches.jsonl 的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecord {
    pub timestamp: DateTime<Utc>,
    pub file_path: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

/// files/*.meta 的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub message_id: String,
    pub tool_use_id: String,
}

/// 会话索引条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub statement_count: u64,
    pub total_tokens: u64,
}

impl From<&ConversationMetadata> for ConversationSummary {
    fn from(m: &ConversationMetadata) -> Self {
        Self {
            id: m.id.clone(),
            title: m.title.clone(),
            created_at: m.created_at,
            updated_at: m.updated_at,
            statement_count: m.metrics.statement_count,
            total_tokens: m.token_usage.conversation.total_tokens,
        }
    }
}

/// 单个会话的磁盘存储
#[derive(Debug, Clone)]
pub struct ConversationPersistence {
    data_dir: PathBuf,
    dir: PathBuf,
}

impl ConversationPersistence {
    pub fn new(data_dir: impl AsRef<Path>, conversation_id: &str) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let dir = data_dir.join(CONVERSATIONS_DIR).join(conversation_id);
        Self { data_dir, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn init(&self) -> Result<(), BbaiError> {
        fs::create_dir_all(self.dir.join(FILES_DIR)).await?;
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(self.dir.join(METADATA_FILE)).await.is_ok()
    }

    /// 持久化一轮：先追加未写入的消息，再覆盖元数据与索引
    pub async fn persist(&self, interaction: &mut ConversationInteraction) -> Result<(), BbaiError> {
        self.init().await?;
        self.append_messages(interaction.unpersisted_messages()).await?;
        interaction.mark_persisted();
        self.save_metadata(&interaction.metadata()).await
    }

    pub async fn append_messages(&self, messages: &[Message]) -> Result<(), BbaiError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for m in messages {
            buf.push_str(&serde_json::to_string(m)?);
            buf.push('\n');
        }
        append(&self.dir.join(MESSAGES_FILE), &buf).await
    }

    pub async fn append_patch(&self, record: &PatchRecord) -> Result<(), BbaiError> {
        self.init().await?;
        let line = format!("{}\n", serde_json::to_string(record)?);
        append(&self.dir.join(PATCHES_FILE), &line).await
    }

    pub async fn save_file_metadata(&self, meta: &FileMetadata) -> Result<(), BbaiError> {
        self.init().await?;
        let name = format!("{}.meta", meta.file_path.replace(['/', '\\'], "__"));
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.dir.join(FILES_DIR).join(name), &json).await
    }

    pub async fn save_metadata(&self, metadata: &ConversationMetadata) -> Result<(), BbaiError> {
        let json = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&self.dir.join(METADATA_FILE), &json).await?;
        self.update_index(metadata).await
    }

    pub async fn load_metadata(&self) -> Result<Option<ConversationMetadata>, BbaiError> {
        match fs::read(self.dir.join(METADATA_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 按顺序回放 messages.jsonl
    pub async fn load_messages(&self) -> Result<Vec<Message>, BbaiError> {
        let data = match fs::read_to_string(self.dir.join(MESSAGES_FILE)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        data.lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    BbaiError::Persistence(format!("{} line {}: {}", MESSAGES_FILE, i + 1, e))
                })
            })
            .collect()
    }

    pub async fn load_patches(&self) -> Result<Vec<PatchRecord>, BbaiError> {
        let data = match fs::read_to_string(self.dir.join(PATCHES_FILE)).await {
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

    /// 恢复会话；若最后一条是未回复的工具调用（进程在工具执行中退出），补写中断结果并落盘
    pub async fn load_interaction(&self) -> Result<Option<ConversationInteraction>, BbaiError> {
        let Some(metadata) = self.load_metadata().await? else {
            return Ok(None);
        };
        let messages = self.load_messages().await?;
        let mut interaction = ConversationInteraction::restore(metadata, messages);
        if interaction.repair_interrupted_tool_uses() {
            tracing::warn!(
                conversation = %interaction.id(),
                "last tool use was interrupted, synthesized a tool result"
            );
            self.persist(&mut interaction).await?;
        }
        Ok(Some(interaction))
    }

    async fn update_index(&self, metadata: &ConversationMetadata) -> Result<(), BbaiError> {
        let mut index = list_conversations(&self.data_dir).await?;
        let summary = ConversationSummary::from(metadata);
        match index.iter_mut().find(|s| s.id == summary.id) {
            Some(existing) => *existing = summary,
            None => index.push(summary),
        }
        index.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        write_index(&self.data_dir, &index).await
    }
}

/// 读取会话索引（按最近更新排序）
pub async fn list_conversations(data_dir: &Path) -> Result<Vec<ConversationSummary>, BbaiError> {
    match fs::read(data_dir.join(INDEX_FILE)).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// 显式删除会话：目录与索引条目
pub async fn delete_conversation(data_dir: &Path, conversation_id: &str) -> Result<bool, BbaiError> {
    let dir = data_dir.join(CONVERSATIONS_DIR).join(conversation_id);
    let existed = match fs::remove_dir_all(&dir).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    let mut index = list_conversations(data_dir).await?;
    let before = index.len();
    index.retain(|s| s.id != conversation_id);
    if index.len() != before {
        write_index(data_dir, &index).await?;
    }
    Ok(existed || index.len() != before)
}

async fn write_index(data_dir: &Path, index: &[ConversationSummary]) -> Result<(), BbaiError> {
    let json = serde_json::to_vec_pretty(index)?;
    write_atomic(&data_dir.join(INDEX_FILE), &json).await
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
    file.flush().await?;
    Ok(())
}
