//! 项目侧协作者：沙箱上下文、提交钩子、资源加载

pub mod commit_hook;
pub mod context;
pub mod resource_loader;

pub use commit_hook::{CommitHook, NoopCommitHook};
pub use context::ProjectContext;
pub use resource_loader::{DefaultResourceLoader, Resource, ResourceLoader, ResourceType};
