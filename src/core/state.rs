//! 对话交互阶段状态机
//!
//! Idle → AwaitingModel → (ToolDispatch → AwaitingModel)* → Idle。
//! 任意阶段出错或取消时回到 Idle。

use serde::{Deserialize, Serialize};

use crate::core::BbaiError;

/// 交互阶段
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionPhase {
    #[default]
    Idle,
    /// 请求已发往 LLM，等待响应
    AwaitingModel,
    /// 执行本轮响应中的工具调用
    ToolDispatch,
}

impl InteractionPhase {
    pub fn can_transition(self, to: InteractionPhase) -> bool {
        use InteractionPhase::*;
        matches!(
            (self, to),
            (Idle, AwaitingModel)
                | (AwaitingModel, ToolDispatch)
                | (AwaitingModel, Idle)
                | (ToolDispatch, AwaitingModel)
                | (ToolDispatch, Idle)
        )
    }

    pub fn transition(self, to: InteractionPhase) -> Result<InteractionPhase, BbaiError> {
        if self == to || self.can_transition(to) {
            Ok(to)
        } else {
            Err(BbaiError::Persistence(format!(
                "invalid interaction phase transition {:?} -> {:?}",
                self, to
            )))
        }
    }
}
