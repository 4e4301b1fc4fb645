//! BBai - LLM 驱动的代码助手引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **conversation**: 消息模型、计数与 Token 账本、会话交互、持久化与日志
//! - **core**: 错误分类、编排主循环、错误策略与任务队列、会话监管、进度事件
//! - **llm**: LLM 后端抽象与实现（OpenAI 兼容 / Mock）、多模型注册
//! - **observability**: tracing 初始化
//! - **project**: 项目上下文、提交钩子、资源加载
//! - **tools**: 工具 trait 与注册表、补丁 / 字面量替换 / 项目搜索算法、具体工具

pub mod config;
pub mod conversation;
pub mod core;
pub mod llm;
pub mod observability;
pub mod project;
pub mod tools;

pub use crate::core::{BbaiError, OrchestratorBuilder, OrchestratorController, StatementResponse};
