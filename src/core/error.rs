//! 错误类型与分类
//!
//! BbaiError 覆盖工具边界内的「预期」失败（文件、命令、补丁不匹配、能力缺失）与基础设施失败（I/O、持久化、LLM）。
//! ToolRegistry 依据 `is_expected()` 决定把错误转成失败的 ToolResult，还是继续向 OrchestratorController 传播。

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 文件操作类型（用于错误信息）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Create,
    Move,
    Patch,
    Rewrite,
    Search,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileOperation::Read => "read",
            FileOperation::Write => "write",
            FileOperation::Create => "create",
            FileOperation::Move => "move",
            FileOperation::Patch => "patch",
            FileOperation::Rewrite => "rewrite",
            FileOperation::Search => "search",
        };
        f.write_str(s)
    }
}

/// 错误大类（对外展示与日志用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FileHandling,
    CommandExecution,
    ToolHandling,
    PatchMismatch,
    UnsupportedProvider,
    UnsupportedResourceType,
    Infrastructure,
}

/// 引擎运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum BbaiError {
    #[error("Failed to {operation} {path}: {message}")]
    FileHandling {
        path: String,
        operation: FileOperation,
        message: String,
    },

    #[error("Access denied: {path} is outside the project root")]
    AccessDenied { path: String },

    #[error("Command '{command}' failed: {message}")]
    CommandExecution { command: String, message: String },

    #[error("Tool {tool} failed: {message}")]
    ToolHandling { tool: String, message: String },

    #[error(
        "Patch does not apply to {path}: {message}. \
         If the file has changed, use the search_and_replace tool instead"
    )]
    PatchMismatch { path: String, message: String },

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Unsupported resource type: {0}")]
    UnsupportedResourceType(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BbaiError {
    pub fn file(path: impl Into<String>, operation: FileOperation, message: impl Into<String>) -> Self {
        BbaiError::FileHandling {
            path: path.into(),
            operation,
            message: message.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        BbaiError::ToolHandling {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// 将 io::Error 按种类映射：找不到、无权限、已存在等属于预期的文件错误，其余保留为基础设施错误
    pub fn from_io(path: impl Into<String>, operation: FileOperation, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::AlreadyExists
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData => BbaiError::file(path, operation, err.to_string()),
            _ => BbaiError::Io(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BbaiError::FileHandling { .. } | BbaiError::AccessDenied { .. } => ErrorKind::FileHandling,
            BbaiError::CommandExecution { .. } => ErrorKind::CommandExecution,
            BbaiError::ToolHandling { .. } => ErrorKind::ToolHandling,
            BbaiError::PatchMismatch { .. } => ErrorKind::PatchMismatch,
            BbaiError::UnsupportedProvider(_) => ErrorKind::UnsupportedProvider,
            BbaiError::UnsupportedResourceType(_) => ErrorKind::UnsupportedResourceType,
            BbaiError::Llm(_)
            | BbaiError::Persistence(_)
            | BbaiError::Config(_)
            | BbaiError::Cancelled
            | BbaiError::Io(_)
            | BbaiError::Json(_) => ErrorKind::Infrastructure,
        }
    }

    /// 预期失败：在工具边界内转换为 ToolResult，让对话继续
    pub fn is_expected(&self) -> bool {
        self.kind() != ErrorKind::Infrastructure
    }
}
