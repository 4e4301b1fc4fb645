//! BBai 命令行入口
//!
//! 用法：`bbai [--config <file>] [--conversation <id>] <statement...>`，`bbai --list` 列出已有会话。
//! 执行一个 statement，工具调用与结果实时输出到 stderr，最终回答与 token 统计输出到 stdout。

use std::path::PathBuf;

use anyhow::{bail, Context};
use bbai::config::load_config;
use bbai::core::{OrchestratorBuilder, OrchestratorController, ProgressEvent};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    conversation: Option<String>,
    list: bool,
    statement: Vec<String>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = CliArgs::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                args.config = Some(iter.next().context("--config needs a path")?.into());
            }
            "--conversation" => {
                args.conversation = Some(iter.next().context("--conversation needs an id")?);
            }
            "--list" => args.list = true,
            _ => args.statement.push(arg),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bbai::observability::init();
    let args = parse_args()?;

    let cfg = load_config(args.config.as_deref()).context("Failed to load config")?;
    let orchestrator = OrchestratorBuilder::new(cfg)
        .with_system_prompt_from_file()
        .build()
        .context("Failed to build orchestrator")?;

    if args.list {
        for summary in orchestrator.list().await? {
            println!(
                "{}  {}  {} statement(s)  {} tokens  {}",
                summary.id,
                summary.updated_at.format("%Y-%m-%d %H:%M"),
                summary.statement_count,
                summary.total_tokens,
                summary.title
            );
        }
        return Ok(());
    }

    if args.statement.is_empty() {
        bail!("usage: bbai [--config <file>] [--conversation <id>] <statement...>");
    }
    let statement = args.statement.join(" ");
    let conversation_id = args
        .conversation
        .unwrap_or_else(OrchestratorController::new_conversation_id);

    orchestrator.supervisor().install_signal_handler();
    if let Some(mut events) = orchestrator.subscribe(&conversation_id) {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProgressEvent::ToolUse { rendered, .. })
                    | Ok(ProgressEvent::ToolResult { rendered, .. }) => eprintln!("{}", rendered),
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "progress events dropped"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let response = orchestrator
        .handle_statement(&conversation_id, &statement)
        .await
        .context("Statement failed")?;

    println!("{}", response.answer);
    println!(
        "\n[conversation {} | {} | turns {} | tokens {} (statement) / {} (conversation)]",
        response.conversation_id,
        response.outcome.as_str(),
        response.metrics.statement_turn_count,
        response.token_usage.statement.total_tokens,
        response.token_usage.conversation.total_tokens
    );
    Ok(())
}
