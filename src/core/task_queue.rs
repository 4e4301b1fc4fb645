//! 委派任务队列
//!
//! FIFO 队列，单飞处理：`add_task` 在没有人排空时才触发排空，否则只入队。
//! 任务失败后交给 ErrorHandler 决定：重试、继续下一个、或停止排空（剩余任务保持排队）。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::{BbaiError, ErrorDecision, ErrorHandler, ErrorStrategy};
use crate::project::Resource;

/// 任务 ID
pub type TaskId = String;

/// 任务状态：Queued → Running → Completed / Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// 委派的子任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub id: TaskId,
    pub title: String,
    pub background: String,
    pub instructions: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 结果需满足的 JSON Schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Value>,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueuedTask {
    pub fn new(title: impl Into<String>, background: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            title: title.into(),
            background: background.into(),
            instructions: instructions.into(),
            resources: Vec::new(),
            capabilities: Vec::new(),
            requirements: None,
            status: TaskStatus::Queued,
            attempts: 0,
            result: None,
            error: None,
        }
    }

    pub fn with_resources(mut self, resources: Vec<Resource>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_requirements(mut self, requirements: Option<Value>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 任务结束通知
#[derive(Debug, Clone)]
pub struct TaskNotification {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// 执行单个任务
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: &QueuedTask) -> Result<String, BbaiError>;
}

/// 一次排空的结果
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// 本次排空中结束的任务（按执行顺序）
    pub finished: Vec<QueuedTask>,
    /// 因中止而仍在排队的任务
    pub remaining: Vec<QueuedTask>,
    /// 是否因 fail_fast 或阈值而提前停止
    pub stopped_early: bool,
}

impl DrainReport {
    pub fn completed(&self) -> usize {
        self.finished
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.finished.len() - self.completed()
    }
}

/// 任务队列
pub struct TaskQueue {
    pending: Mutex<VecDeque<QueuedTask>>,
    draining: AtomicBool,
    runner: Arc<dyn TaskRunner>,
    handler: ErrorHandler,
    notification_tx: Option<mpsc::UnboundedSender<TaskNotification>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .field("draining", &self.is_draining())
            .field("strategy", &self.handler.strategy())
            .finish()
    }
}

impl TaskQueue {
    pub fn new(runner: Arc<dyn TaskRunner>, handler: ErrorHandler) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            runner,
            handler,
            notification_tx: None,
        }
    }

    /// 附带完成通知通道
    pub fn with_notifications(mut self) -> (Self, mpsc::UnboundedReceiver<TaskNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notification_tx = Some(tx);
        (self, rx)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn handler(&self) -> &ErrorHandler {
        &self.handler
    }

    /// 只入队，不触发排空
    pub fn enqueue(&self, task: QueuedTask) {
        tracing::debug!(task_id = %task.id, title = %task.title, "task queued");
        if let Ok(mut q) = self.pending.lock() {
            q.push_back(task);
        }
    }

    fn pop(&self) -> Option<QueuedTask> {
        self.pending.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn snapshot(&self) -> Vec<QueuedTask> {
        self.pending
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 入队；若当前无人排空则由本次调用排空并返回报告
    pub async fn add_task(&self, task: QueuedTask) -> Option<DrainReport> {
        self.enqueue(task);
        self.drain().await
    }

    /// 排空队列；已有排空在进行时返回 None
    pub async fn drain(&self) -> Option<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let mut report = DrainReport::default();
        loop {
            let stop = self.drain_pending(&mut report).await;
            self.draining.store(false, Ordering::SeqCst);
            // 释放标记后仍有新任务且未停止时，重新获取排空权
            if stop || self.is_empty() {
                break;
            }
            if self
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                break;
            }
        }
        report.remaining = self.snapshot();
        Some(report)
    }

    /// 返回 true 表示提前停止
    async fn drain_pending(&self, report: &mut DrainReport) -> bool {
        while let Some(mut task) = self.pop() {
            task.status = TaskStatus::Running;
            tracing::info!(task_id = %task.id, title = %task.title, "task started");
            let decision = loop {
                match self.runner.run_task(&task).await {
                    Ok(result) => {
                        task.status = TaskStatus::Completed;
                        task.result = Some(result);
                        break None;
                    }
                    Err(err) => match self.handler.handle(&err, task.attempts) {
                        ErrorDecision::Retry { attempt, delay } => {
                            task.attempts = attempt;
                            tokio::time::sleep(delay).await;
                        }
                        other => {
                            tracing::warn!(task_id = %task.id, error = %err, decision = ?other, "task failed");
                            task.status = TaskStatus::Failed;
                            task.error = Some(err.to_string());
                            break Some(other);
                        }
                    },
                }
            };
            self.notify(&task);
            report.finished.push(task);
            match decision {
                None | Some(ErrorDecision::Continue) => {}
                // retry 用尽后继续处理其他任务
                Some(ErrorDecision::Propagate)
                    if matches!(self.handler.strategy(), ErrorStrategy::Retry { .. }) => {}
                Some(_) => {
                    report.stopped_early = true;
                    return true;
                }
            }
        }
        false
    }

    fn notify(&self, task: &QueuedTask) {
        if let Some(tx) = &self.notification_tx {
            let _ = tx.send(TaskNotification {
                task_id: task.id.clone(),
                title: task.title.clone(),
                status: task.status,
                result: task.result.clone(),
                error: task.error.clone(),
            });
        }
    }
}
