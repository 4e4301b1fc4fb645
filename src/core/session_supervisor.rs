//! 会话监管：每个会话一个取消令牌
//!
//! 取消是协作式的：OrchestratorController 在每一轮开始前检查令牌，进行中的模型调用不会被强行打断。
//! 进程级 Ctrl+C 通过 shutdown 令牌传播到所有会话的子令牌。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 会话级取消管理
#[derive(Debug, Default)]
pub struct ConversationSupervisor {
    shutdown: CancellationToken,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl ConversationSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新 statement 发放令牌（替换该会话之前的令牌）
    pub fn begin(&self, conversation_id: &str) -> CancellationToken {
        let token = self.shutdown.child_token();
        if let Ok(mut map) = self.tokens.lock() {
            map.insert(conversation_id.to_string(), token.clone());
        }
        token
    }

    /// statement 结束后移除令牌
    pub fn finish(&self, conversation_id: &str) {
        if let Ok(mut map) = self.tokens.lock() {
            map.remove(conversation_id);
        }
    }

    /// 请求取消；会话当前没有运行中的 statement 时返回 false
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let token = self
            .tokens
            .lock()
            .ok()
            .and_then(|map| map.get(conversation_id).cloned());
        match token {
            Some(t) => {
                tracing::info!(conversation = %conversation_id, "cancellation requested");
                t.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.tokens
            .lock()
            .map(|map| map.contains_key(conversation_id))
            .unwrap_or(false)
    }

    /// 取消全部会话
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 安装 Ctrl+C 处理：收到信号后取消所有会话
    pub fn install_signal_handler(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling running statements");
                supervisor.shutdown();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_only_running() {
        let sup = ConversationSupervisor::new();
        assert!(!sup.cancel("a"));
        let token = sup.begin("a");
        assert!(sup.is_running("a"));
        assert!(sup.cancel("a"));
        assert!(token.is_cancelled());
        sup.finish("a");
        assert!(!sup.is_running("a"));
    }

    #[test]
    fn test_shutdown_reaches_every_conversation() {
        let sup = ConversationSupervisor::new();
        let a = sup.begin("a");
        let b = sup.begin("b");
        sup.shutdown();
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[test]
    fn test_begin_replaces_previous_token() {
        let sup = ConversationSupervisor::new();
        let old = sup.begin("a");
        let new = sup.begin("a");
        sup.cancel("a");
        assert!(new.is_cancelled());
        assert!(!old.is_cancelled());
    }
}
