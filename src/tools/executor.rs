//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时：先取调度许可，再在超时内调用 registry.dispatch。
//! 超时折叠为失败的 ToolResult（不是进程错误）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::conversation::{ConversationInteraction, ToolUse};
use crate::core::BbaiError;
use crate::project::ProjectContext;
use crate::tools::{ToolRegistry, ToolResult};

/// 工具执行器：对每次调用施加超时与并发许可
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行一次 ToolUse；只有基础设施错误返回 Err
    pub async fn execute(
        &self,
        interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let _permit = project.scheduler().acquire_tool().await?;
        let start = Instant::now();
        let args_preview = args_preview(&tool_use.input);
        let result = timeout(
            self.timeout,
            self.registry.dispatch(interaction, tool_use, project),
        )
        .await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(r)) if !r.is_error => (true, "ok"),
            Ok(Ok(_)) => (false, "failed"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "conversation": interaction.id(),
            "tool": tool_use.name,
            "tool_use_id": tool_use.id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(inner) => inner,
            Err(_) => Ok(ToolResult::failure(
                format!(
                    "Error: tool {} timed out after {}s",
                    tool_use.name,
                    self.timeout.as_secs()
                ),
                format!("BBai stopped {}: it took longer than {}s", tool_use.name, self.timeout.as_secs()),
            )),
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ModelSettings;
    use crate::tools::{Tool, ToolCapability};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> String {
            "Sleeps".to_string()
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn capability(&self) -> ToolCapability {
            ToolCapability::ReadProject
        }

        async fn run(
            &self,
            _interaction: &ConversationInteraction,
            _tool_use: &ToolUse,
            _project: &ProjectContext,
        ) -> Result<ToolResult, BbaiError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolResult::success("done", "done"))
        }
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let mut executor = ToolExecutor::new(Arc::new(registry), 1);
        executor.timeout = Duration::from_millis(50);

        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let tu = ToolUse {
            id: "tu".into(),
            name: "slow".into(),
            input: json!({}),
            validation: None,
        };
        let result = executor
            .execute(&ia, &tu, &ProjectContext::new(dir.path()))
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.tool_response.contains("timed out"));
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"text": "x".repeat(500)});
        assert!(args_preview(&long).ends_with("..."));
        assert_eq!(args_preview(&json!({"a": 1})), "{\"a\":1}");
    }
}
