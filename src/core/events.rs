//! 会话进度事件
//!
//! 每个会话一个有界 broadcast 通道；监听方按会话 ID 订阅，收到类型化事件。
//! 慢订阅者落后超过容量时丢失最旧的事件（Lagged），不会阻塞编排循环。

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::conversation::{ConversationMetrics, TokenUsage};

/// 进度事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StatementStarted {
        conversation_id: String,
        statement: String,
    },
    AwaitingModel {
        conversation_id: String,
        turn: u64,
    },
    AssistantMessage {
        conversation_id: String,
        text: String,
        usage: TokenUsage,
    },
    ToolUse {
        conversation_id: String,
        tool_use_id: String,
        tool: String,
        rendered: String,
        rich: Value,
    },
    ToolResult {
        conversation_id: String,
        tool_use_id: String,
        tool: String,
        is_error: bool,
        rendered: String,
        rich: Value,
    },
    StatementFinished {
        conversation_id: String,
        outcome: String,
        metrics: ConversationMetrics,
    },
    Error {
        conversation_id: String,
        message: String,
    },
}

impl ProgressEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            ProgressEvent::StatementStarted { conversation_id, .. }
            | ProgressEvent::AwaitingModel { conversation_id, .. }
            | ProgressEvent::AssistantMessage { conversation_id, .. }
            | ProgressEvent::ToolUse { conversation_id, .. }
            | ProgressEvent::ToolResult { conversation_id, .. }
            | ProgressEvent::StatementFinished { conversation_id, .. }
            | ProgressEvent::Error { conversation_id, .. } => conversation_id,
        }
    }
}

/// 按会话分发事件
#[derive(Debug)]
pub struct EventHub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, conversation_id: &str) -> Option<broadcast::Sender<ProgressEvent>> {
        let mut map = self.channels.lock().ok()?;
        Some(
            map.entry(conversation_id.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .clone(),
        )
    }

    pub fn subscribe(&self, conversation_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.sender(conversation_id).map(|tx| tx.subscribe())
    }

    /// 发布事件；没有订阅者时直接丢弃
    pub fn publish(&self, event: ProgressEvent) {
        let existing = self
            .channels
            .lock()
            .ok()
            .and_then(|map| map.get(event.conversation_id()).cloned());
        if let Some(tx) = existing {
            let _ = tx.send(event);
        }
    }

    /// 删除会话时移除通道
    pub fn remove(&self, conversation_id: &str) {
        if let Ok(mut map) = self.channels.lock() {
            map.remove(conversation_id);
        }
    }
}
