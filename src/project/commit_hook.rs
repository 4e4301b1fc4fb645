//! 提交钩子：工具改动文件后由编排器调用
//!
//! 版本控制集成不在引擎内实现，宿主通过实现 CommitHook 接入（例如提交到 git）。

use async_trait::async_trait;

use crate::conversation::ConversationInteraction;
use crate::core::BbaiError;

#[async_trait]
pub trait CommitHook: Send + Sync {
    /// 记录一次文件改动并提交
    async fn log_change_and_commit(
        &self,
        interaction: &ConversationInteraction,
        file_path: &str,
        change_description: &str,
    ) -> Result<(), BbaiError>;

    /// 记录补丁并提交；默认只记录改动描述
    async fn log_patch_and_commit(
        &self,
        interaction: &ConversationInteraction,
        file_path: &str,
        patch: &str,
    ) -> Result<(), BbaiError> {
        let description = format!("Applied patch ({} lines)", patch.lines().count());
        self.log_change_and_commit(interaction, file_path, &description)
            .await
    }
}

/// 不做任何提交，只输出调试日志
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCommitHook;

#[async_trait]
impl CommitHook for NoopCommitHook {
    async fn log_change_and_commit(
        &self,
        interaction: &ConversationInteraction,
        file_path: &str,
        change_description: &str,
    ) -> Result<(), BbaiError> {
        tracing::debug!(
            conversation = %interaction.id(),
            path = %file_path,
            description = %change_description,
            "commit hook skipped"
        );
        Ok(())
    }
}
