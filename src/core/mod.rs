//! 核心编排层：错误分类与处理策略、交互状态、会话监管、任务调度与队列、进度事件、主控循环

pub mod builder;
pub mod error;
pub mod error_handler;
pub mod events;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;
pub mod task_queue;
pub mod task_scheduler;

pub use builder::OrchestratorBuilder;
pub use error::{BbaiError, ErrorKind, FileOperation};
pub use error_handler::{ErrorDecision, ErrorHandler, ErrorStrategy};
pub use events::{EventHub, ProgressEvent};
pub use orchestrator::{OrchestratorController, StatementOutcome, StatementResponse};
pub use session_supervisor::ConversationSupervisor;
pub use state::InteractionPhase;
pub use task_queue::{DrainReport, QueuedTask, TaskNotification, TaskQueue, TaskRunner, TaskStatus};
pub use task_scheduler::{PathGuards, ToolScheduler};
