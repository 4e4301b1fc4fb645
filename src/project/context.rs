//! 项目上下文：工具运行时看到的项目根目录与写入锁

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::{BbaiError, PathGuards, ToolScheduler};
use crate::tools::SafeFs;

/// 传给每次 Tool::run 的项目上下文（廉价克隆）
#[derive(Debug, Clone)]
pub struct ProjectContext {
    fs: SafeFs,
    scheduler: Arc<ToolScheduler>,
}

impl ProjectContext {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_scheduler(root, Arc::new(ToolScheduler::default()))
    }

    pub fn with_scheduler(root: impl AsRef<Path>, scheduler: Arc<ToolScheduler>) -> Self {
        Self {
            fs: SafeFs::new(root),
            scheduler,
        }
    }

    pub fn fs(&self) -> &SafeFs {
        &self.fs
    }

    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    pub fn scheduler(&self) -> &Arc<ToolScheduler> {
        &self.scheduler
    }

    pub fn resolve(&self, path: &str) -> Result<PathBuf, BbaiError> {
        self.fs.resolve(path)
    }

    pub fn relative(&self, abs: &Path) -> String {
        self.fs.relative(abs)
    }

    /// 写文件前锁住目标路径
    pub async fn lock_paths(&self, paths: &[PathBuf]) -> PathGuards {
        self.scheduler.lock_paths(paths).await
    }
}
