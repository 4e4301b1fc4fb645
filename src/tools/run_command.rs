//! run_command：在项目目录内执行白名单命令
//!
//! 只允许配置中的命令名（首词，如 ls、cargo、git）；禁止 rm -rf、wget、chmod 777 等子串。
//! 不经过 shell：命令名与参数直接交给子进程，带超时，超时后子进程被杀掉。

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use crossterm::style::Stylize;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::conversation::{ConversationInteraction, ToolUse};
use crate::core::BbaiError;
use crate::project::ProjectContext;
use crate::tools::{parse_input, truncate_chars, BbaiResponse, Tool, ToolCapability, ToolResult};

/// 禁止的子串（即使命令名在白名单中，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "grep", "find", "echo", "pwd", "git", "cargo", "rustc", "npm", "deno",
];

#[derive(Debug, Deserialize)]
struct RunCommandInput {
    command: String,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunCommandTool {
    allowed_commands: HashSet<String>,
    timeout_secs: u64,
    max_output_chars: usize,
}

impl Default for RunCommandTool {
    fn default() -> Self {
        Self::new(
            DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            60,
            20_000,
        )
    }
}

impl RunCommandTool {
    pub fn new(allowed_commands: Vec<String>, timeout_secs: u64, max_output_chars: usize) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            allowed_commands,
            timeout_secs: timeout_secs.max(1),
            max_output_chars,
        }
    }

    fn allowed_list(&self) -> String {
        let mut names: Vec<&str> = self.allowed_commands.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }

    /// 首词为命令名，其余为参数
    fn split(input: &RunCommandInput) -> (String, Vec<String>) {
        let mut words = input.command.split_whitespace().map(str::to_string);
        let program = words.next().unwrap_or_default();
        let mut args: Vec<String> = words.collect();
        if let Some(extra) = &input.args {
            args.extend(extra.iter().cloned());
        }
        (program, args)
    }

    fn check_allowed(&self, program: &str, full: &str) -> Result<(), BbaiError> {
        let lower = full.to_lowercase();
        if let Some(bad) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(**f)) {
            return Err(BbaiError::CommandExecution {
                command: full.to_string(),
                message: format!("forbidden pattern: {}", bad),
            });
        }
        if program.is_empty() {
            return Err(BbaiError::CommandExecution {
                command: full.to_string(),
                message: "empty command".to_string(),
            });
        }
        if !self.allowed_commands.contains(&program.to_lowercase()) {
            return Err(BbaiError::CommandExecution {
                command: full.to_string(),
                message: format!("'{}' is not in the allow-list ({})", program, self.allowed_list()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> String {
        format!(
            "Run an allow-listed command in the project directory (no shell: pipes, redirects and globbing \
             are not interpreted). Allowed commands: {}. Commands are killed after {}s.",
            self.allowed_list(),
            self.timeout_secs
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command name, optionally followed by arguments" },
                "args": { "type": "array", "items": { "type": "string" } },
                "cwd": { "type": "string", "description": "Working directory relative to the project root" }
            },
            "required": ["command"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::ExecuteCommand
    }

    fn render_use_console(&self, input: &Value) -> String {
        let mut line = input["command"].as_str().unwrap_or("").to_string();
        for a in input["args"].as_array().into_iter().flatten().filter_map(|v| v.as_str()) {
            line.push(' ');
            line.push_str(a);
        }
        format!("{} {}", "$".dim(), line.yellow())
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        tool_use: &ToolUse,
        project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        let input: RunCommandInput = parse_input(self.name(), &tool_use.input)?;
        let (program, args) = Self::split(&input);
        let full = std::iter::once(program.clone())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.check_allowed(&program, &full)?;
        let cwd = match &input.cwd {
            Some(dir) => project.resolve(dir)?,
            None => project.root().to_path_buf(),
        };

        tracing::info!(command = %full, cwd = %cwd.display(), "run_command execute");
        let child = Command::new(&program)
            .args(&args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BbaiError::CommandExecution {
                command: full.clone(),
                message: format!("failed to start: {}", e),
            })?;

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), child.wait_with_output())
            .await
            .map_err(|_| BbaiError::CommandExecution {
                command: full.clone(),
                message: format!("timed out after {}s", self.timeout_secs),
            })?
            .map_err(|e| BbaiError::CommandExecution {
                command: full.clone(),
                message: e.to_string(),
            })?;

        let stdout = truncate_chars(String::from_utf8_lossy(&output.stdout).trim_end(), self.max_output_chars);
        let stderr = truncate_chars(String::from_utf8_lossy(&output.stderr).trim_end(), self.max_output_chars);
        let code = output.status.code();
        let mut text = format!(
            "Command `{}` exited with {}",
            full,
            code.map_or_else(|| "a signal".to_string(), |c| format!("code {}", c))
        );
        if !stdout.is_empty() {
            text.push_str(&format!("\nstdout:\n{}", stdout));
        }
        if !stderr.is_empty() {
            text.push_str(&format!("\nstderr:\n{}", stderr));
        }
        let data = BbaiResponse::data(json!({
            "command": full,
            "exitCode": code,
            "stdout": stdout,
            "stderr": stderr,
        }));
        Ok(if output.status.success() {
            ToolResult::success(text, data)
        } else {
            ToolResult::failure(text, data)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ModelSettings;

    fn call(input: Value) -> ToolUse {
        ToolUse {
            id: "tu-cmd".into(),
            name: "run_command".into(),
            input,
            validation: None,
        }
    }

    #[test]
    fn test_allow_list_and_forbidden_patterns() {
        let tool = RunCommandTool::new(vec!["ls".into(), "rm".into()], 5, 100);
        assert!(tool.check_allowed("ls", "ls -la").is_ok());
        assert!(tool.check_allowed("LS", "LS").is_ok());
        assert!(tool.check_allowed("rm", "rm -rf /").is_err());
        let err = tool.check_allowed("curl", "curl x").unwrap_err();
        assert!(matches!(err, BbaiError::CommandExecution { .. }));
        assert!(err.to_string().contains("allow-list"));
    }

    #[test]
    fn test_split_merges_inline_and_explicit_args() {
        let input = RunCommandInput {
            command: "git log".into(),
            args: Some(vec!["--oneline".into()]),
            cwd: None,
        };
        let (program, args) = RunCommandTool::split(&input);
        assert_eq!(program, "git");
        assert_eq!(args, vec!["log", "--oneline"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_project_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let result = RunCommandTool::default()
            .run(&ia, &call(json!({"command": "ls"})), &ProjectContext::new(dir.path()))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.tool_response.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_disallowed_command_is_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let ia = ConversationInteraction::new("c", ModelSettings::default());
        let err = RunCommandTool::default()
            .run(&ia, &call(json!({"command": "shutdown now"})), &ProjectContext::new(dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_expected());
    }
}
