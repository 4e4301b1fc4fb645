//! 工具结果
//!
//! 每个 ToolUse 恰好产生一个 ToolResult（失败也一样）：
//! - tool_response：给模型看的简短文本
//! - bbai_response：给调用方展示的文本或结构化数据
//! - tool_results：附加内容片段（文件内容、图片等）
//! - changes：本次调用对项目文件的改动，编排器据此写 patches.jsonl 并触发提交钩子
//! - finalize：所属消息持久化之后执行一次的回调

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{ContentPart, ConversationPersistence};
use crate::core::BbaiError;

/// 展示层响应：纯文本或 `{ "data": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BbaiResponse {
    Text(String),
    Data { data: Value },
}

impl BbaiResponse {
    pub fn data(data: Value) -> Self {
        BbaiResponse::Data { data }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            BbaiResponse::Text(s) => Some(s),
            BbaiResponse::Data { .. } => None,
        }
    }
}

impl From<String> for BbaiResponse {
    fn from(s: String) -> Self {
        BbaiResponse::Text(s)
    }
}

impl From<&str> for BbaiResponse {
    fn from(s: &str) -> Self {
        BbaiResponse::Text(s.to_string())
    }
}

/// 文件改动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    /// 移动 / 重命名的目标路径
    Moved,
    /// 移动 / 重命名后不再存在的源路径
    Removed,
}

/// 一次文件改动
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub description: String,
    /// 统一 diff（若可得）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

impl FileChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind, description: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            description: description.into(),
            patch: None,
        }
    }

    pub fn with_patch(mut self, patch: impl Into<String>) -> Self {
        let patch = patch.into();
        if !patch.is_empty() {
            self.patch = Some(patch);
        }
        self
    }
}

/// 持久化后回调：参数为会话持久化句柄与所属 Tool 消息的 ID
pub type FinalizeCallback =
    Box<dyn FnOnce(ConversationPersistence, String) -> BoxFuture<'static, Result<(), BbaiError>> + Send>;

/// 工具执行结果
pub struct ToolResult {
    pub tool_response: String,
    pub bbai_response: BbaiResponse,
    pub tool_results: Vec<ContentPart>,
    pub is_error: bool,
    pub changes: Vec<FileChange>,
    pub finalize: Option<FinalizeCallback>,
}

impl std::fmt::Debug for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolResult")
            .field("tool_response", &self.tool_response)
            .field("bbai_response", &self.bbai_response)
            .field("tool_results", &self.tool_results)
            .field("is_error", &self.is_error)
            .field("changes", &self.changes)
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

impl ToolResult {
    pub fn success(tool_response: impl Into<String>, bbai_response: impl Into<BbaiResponse>) -> Self {
        Self {
            tool_response: tool_response.into(),
            bbai_response: bbai_response.into(),
            tool_results: Vec::new(),
            is_error: false,
            changes: Vec::new(),
            finalize: None,
        }
    }

    pub fn failure(tool_response: impl Into<String>, bbai_response: impl Into<BbaiResponse>) -> Self {
        Self {
            is_error: true,
            ..Self::success(tool_response, bbai_response)
        }
    }

    /// 预期错误转为失败结果；模型与展示两侧使用同一错误描述
    pub fn from_error(tool: &str, err: &BbaiError) -> Self {
        Self::failure(
            format!("Error: {}", err),
            format!("BBai could not run {}: {}", tool, err),
        )
    }

    pub fn with_tool_results(mut self, parts: Vec<ContentPart>) -> Self {
        self.tool_results = parts;
        self
    }

    pub fn with_changes(mut self, changes: Vec<FileChange>) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_finalize(mut self, callback: FinalizeCallback) -> Self {
        self.finalize = Some(callback);
        self
    }

    pub fn take_finalize(&mut self) -> Option<FinalizeCallback> {
        self.finalize.take()
    }

    /// 写回会话的 tool_result 片段：先放 tool_response，再附加 tool_results
    pub fn to_content_part(&self, tool_use_id: &str) -> ContentPart {
        let mut content = vec![ContentPart::text(self.tool_response.clone())];
        content.extend(self.tool_results.iter().cloned());
        ContentPart::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content,
            is_error: self.is_error,
        }
    }

    /// 展示用文本：Data 响应序列化为 JSON
    pub fn bbai_text(&self) -> String {
        match &self.bbai_response {
            BbaiResponse::Text(s) => s.clone(),
            BbaiResponse::Data { data } => data.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbai_response_shapes() {
        let text = serde_json::to_value(BbaiResponse::from("done")).unwrap();
        assert_eq!(text, serde_json::json!("done"));
        let data = serde_json::to_value(BbaiResponse::data(serde_json::json!({"n": 1}))).unwrap();
        assert_eq!(data, serde_json::json!({"data": {"n": 1}}));
    }

    #[test]
    fn test_content_part_carries_error_flag() {
        let result = ToolResult::failure("Error: nope", "nope")
            .with_tool_results(vec![ContentPart::text("detail")]);
        match result.to_content_part("tu-9") {
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "tu-9");
                assert_eq!(content.len(), 2);
                assert!(is_error);
            }
            other => panic!("unexpected part {:?}", other),
        }
    }

    #[test]
    fn test_from_error_messages_agree() {
        let err = BbaiError::AccessDenied {
            path: "../x".into(),
        };
        let result = ToolResult::from_error("rewrite_file", &err);
        assert!(result.is_error);
        assert!(result.tool_response.contains("Access denied"));
        assert!(result.bbai_text().contains("Access denied"));
    }
}
