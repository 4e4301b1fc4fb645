//! 对话层：消息模型、计数与 Token 账本、交互状态、持久化与日志

pub mod interaction;
pub mod logger;
pub mod message;
pub mod metrics;
pub mod persistence;

pub use interaction::{ConversationId, ConversationInteraction, ConversationMetadata, ModelSettings};
pub use logger::{ConversationLogger, LogEntry, LogEntryType, ENTRY_SEPARATOR};
pub use message::{ContentPart, ImageSource, Message, Role, ToolUse, ToolValidation};
pub use metrics::{ConversationMetrics, TokenUsage, TokenUsageLedger};
pub use persistence::{
    delete_conversation, list_conversations, ConversationPersistence, ConversationSummary,
    FileMetadata, PatchRecord,
};
