//! 工具调度：并发上限 + 按路径串行写入
//!
//! 同一轮模型响应中的多个工具调用可以并发执行；Semaphore 限制同时运行的工具数，
//! 写文件的工具在写之前锁住目标路径，保证同一路径不会被两个调用同时写。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::core::BbaiError;

/// 持有期间对应路径被独占
#[derive(Debug)]
pub struct PathGuards {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl PathGuards {
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// 工具调度器
#[derive(Debug)]
pub struct ToolScheduler {
    /// 工具并发限制（默认 3）
    tool_semaphore: Arc<Semaphore>,
    path_locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl ToolScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 获取工具执行许可
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, BbaiError> {
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BbaiError::Cancelled)
    }

    pub fn available_permits(&self) -> usize {
        self.tool_semaphore.available_permits()
    }

    /// 当前登记的路径锁数量
    pub fn tracked_paths(&self) -> usize {
        self.path_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.path_locks.lock().unwrap_or_else(|e| e.into_inner());
        // 只剩表内引用的锁没有持有者也没有等待者，可以回收
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// 锁住一组路径；先排序去重，避免两个调用交叉加锁死锁
    pub async fn lock_paths(&self, paths: &[PathBuf]) -> PathGuards {
        let mut sorted: Vec<&PathBuf> = paths.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for path in sorted {
            guards.push(self.lock_for(path).lock_owned().await);
        }
        PathGuards { guards }
    }
}

impl Default for ToolScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_path_is_serialized() {
        let scheduler = Arc::new(ToolScheduler::default());
        let path = PathBuf::from("/project/a.txt");
        let guards = scheduler.lock_paths(&[path.clone(), path.clone()]).await;
        assert_eq!(guards.len(), 1);

        let s2 = scheduler.clone();
        let p2 = path.clone();
        let waiter = tokio::spawn(async move {
            let _g = s2.lock_paths(&[p2]).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(guards);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_paths_do_not_block() {
        let scheduler = ToolScheduler::default();
        let _a = scheduler.lock_paths(&[PathBuf::from("a")]).await;
        let b = tokio::time::timeout(
            Duration::from_millis(200),
            scheduler.lock_paths(&[PathBuf::from("b")]),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_path_locks_are_reclaimed() {
        let scheduler = ToolScheduler::default();
        for name in ["a.txt", "b.txt", "c.txt"] {
            let _g = scheduler.lock_paths(&[PathBuf::from(name)]).await;
        }
        assert!(scheduler.tracked_paths() <= 1);

        let held = scheduler.lock_paths(&[PathBuf::from("d.txt")]).await;
        let _other = scheduler.lock_paths(&[PathBuf::from("e.txt")]).await;
        assert_eq!(scheduler.tracked_paths(), 2);
        drop(held);
        let _next = scheduler.lock_paths(&[PathBuf::from("f.txt")]).await;
        assert_eq!(scheduler.tracked_paths(), 2);
    }

    #[tokio::test]
    async fn test_permits_bounded() {
        let scheduler = ToolScheduler::new(2);
        let _p1 = scheduler.acquire_tool().await.unwrap();
        let _p2 = scheduler.acquire_tool().await.unwrap();
        assert_eq!(scheduler.available_permits(), 0);
    }
}
