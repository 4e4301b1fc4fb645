//! 编排集成测试：statement 循环、持久化、恢复、取消与 Token 账本

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bbai::config::AppConfig;
use bbai::conversation::{
    ContentPart, ConversationInteraction, ConversationLogger, ConversationPersistence, ModelSettings,
    Role, TokenUsage,
};
use bbai::core::{BbaiError, OrchestratorBuilder, OrchestratorController, ProgressEvent, StatementOutcome};
use bbai::llm::{LlmError, MockLlmClient};
use bbai::conversation::ToolUse;
use bbai::project::{CommitHook, ProjectContext};
use bbai::tools::{Tool, ToolCapability, ToolResult};
use proptest::prelude::*;
use serde_json::{json, Value};

/// 记录每次提交调用
#[derive(Default)]
struct RecordingHook {
    commits: Mutex<Vec<(String, String)>>,
}

impl RecordingHook {
    fn commits(&self) -> Vec<(String, String)> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommitHook for RecordingHook {
    async fn log_change_and_commit(
        &self,
        _interaction: &ConversationInteraction,
        file_path: &str,
        change_description: &str,
    ) -> Result<(), BbaiError> {
        self.commits
            .lock()
            .unwrap()
            .push((file_path.to_string(), change_description.to_string()));
        Ok(())
    }
}

/// 总是返回磁盘写满的工具
struct DiskFullTool;

#[async_trait]
impl Tool for DiskFullTool {
    fn name(&self) -> &str {
        "disk_full"
    }

    fn description(&self) -> String {
        "Writes a scratch file".into()
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::WriteProject
    }

    async fn run(
        &self,
        _interaction: &ConversationInteraction,
        _tool_use: &ToolUse,
        _project: &ProjectContext,
    ) -> Result<ToolResult, BbaiError> {
        Err(BbaiError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "No space left on device",
        )))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    project: std::path::PathBuf,
    data: std::path::PathBuf,
    mock: Arc<MockLlmClient>,
    hook: Arc<RecordingHook>,
    orchestrator: Arc<OrchestratorController>,
}

fn harness_with(mock: MockLlmClient, configure: impl FnOnce(&mut AppConfig)) -> Harness {
    harness_with_tools(mock, configure, Vec::new())
}

fn harness_with_tools(
    mock: MockLlmClient,
    configure: impl FnOnce(&mut AppConfig),
    tools: Vec<Arc<dyn Tool>>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    let data = dir.path().join("data");
    std::fs::create_dir_all(&project).unwrap();

    let mut config = AppConfig::default();
    configure(&mut config);
    let mock = Arc::new(mock);
    let hook = Arc::new(RecordingHook::default());
    let mut builder = OrchestratorBuilder::new(config)
        .with_project_root(&project)
        .with_data_dir(&data)
        .with_provider(mock.clone())
        .with_commit_hook(hook.clone());
    for tool in tools {
        builder = builder.with_tool(tool);
    }
    let orchestrator = builder.build().unwrap();
    Harness {
        _dir: dir,
        project,
        data,
        mock,
        hook,
        orchestrator: Arc::new(orchestrator),
    }
}

fn harness(mock: MockLlmClient) -> Harness {
    harness_with(mock, |_| {})
}

fn conversation_dir(data: &Path, id: &str) -> std::path::PathBuf {
    data.join("conversations").join(id)
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_tool_turn_then_answer() {
    let mock = MockLlmClient::new();
    mock.push_tool_use(
        "tu-1",
        "rewrite_file",
        json!({ "filePath": "notes/todo.md", "content": "- ship it\n" }),
        TokenUsage::new(100, 20),
    );
    mock.push_text("Created notes/todo.md.", TokenUsage::new(150, 10));
    let h = harness(mock);

    let response = h
        .orchestrator
        .handle_statement("conv-a", "Write a todo file")
        .await
        .unwrap();

    assert_eq!(response.outcome, StatementOutcome::Completed);
    assert_eq!(response.answer, "Created notes/todo.md.");
    assert_eq!(response.metrics.statement_turn_count, 2);
    assert_eq!(response.metrics.tool_result_count, 1);
    assert_eq!(response.token_usage.statement.total_tokens, 280);
    assert_eq!(
        std::fs::read_to_string(h.project.join("notes/todo.md")).unwrap(),
        "- ship it\n"
    );

    // 第二次请求带上了工具结果
    let requests = h.mock.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert!(matches!(
        &last.content[0],
        ContentPart::ToolResult { tool_use_id, is_error: false, .. } if tool_use_id == "tu-1"
    ));

    let dir = conversation_dir(&h.data, "conv-a");
    assert!(dir.join("metadata.json").exists());
    assert_eq!(line_count(&dir.join("messages.jsonl")), 4);
    assert_eq!(line_count(&dir.join("patches.jsonl")), 1);
    assert_eq!(line_count(&dir.join("conversation.jsonl")), 5);

    let commits = h.hook.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0, "notes/todo.md");

    let listed = h.orchestrator.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "conv-a");
    assert_eq!(listed[0].total_tokens, 280);
}

#[tokio::test]
async fn test_tool_failure_keeps_conversation_going() {
    let mock = MockLlmClient::new();
    mock.push_tool_use(
        "tu-1",
        "move_files",
        json!({ "sources": ["missing.txt"], "destination": "out" }),
        TokenUsage::new(10, 5),
    );
    mock.push_text("The file does not exist.", TokenUsage::new(10, 5));
    let h = harness(mock);

    let response = h.orchestrator.handle_statement("conv-b", "Move it").await.unwrap();
    assert_eq!(response.outcome, StatementOutcome::Completed);
    let requests = h.mock.requests();
    let tool_msg = requests[1].messages.last().unwrap();
    assert!(matches!(&tool_msg.content[0], ContentPart::ToolResult { is_error: true, .. }));
    assert!(h.hook.commits().is_empty());
}

#[tokio::test]
async fn test_turn_ceiling_ends_statement() {
    let mock = MockLlmClient::new();
    for i in 0..5 {
        mock.push_tool_use(
            &format!("tu-{}", i),
            "search_project",
            json!({ "filePattern": "*.rs" }),
            TokenUsage::new(5, 5),
        );
    }
    let h = harness_with(mock, |cfg| cfg.orchestrator.max_turns = 2);

    let response = h.orchestrator.handle_statement("conv-c", "Loop").await.unwrap();
    assert_eq!(response.outcome, StatementOutcome::MaxTurns);
    assert_eq!(response.metrics.statement_turn_count, 2);
    assert_eq!(h.mock.requests().len(), 2);
}

#[tokio::test]
async fn test_cancellation_is_observed_between_turns() {
    let mock = MockLlmClient::new().with_delay(Duration::from_millis(200));
    mock.push_tool_use("tu-1", "search_project", json!({ "filePattern": "*" }), TokenUsage::new(5, 5));
    mock.push_text("never sent", TokenUsage::new(5, 5));
    let h = harness(mock);
    let mut events = h.orchestrator.subscribe("conv-d").unwrap();

    let orchestrator = h.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.handle_statement("conv-d", "Search").await });

    loop {
        if let ProgressEvent::AwaitingModel { .. } = events.recv().await.unwrap() {
            break;
        }
    }
    assert!(h.orchestrator.cancel("conv-d"));

    let response = task.await.unwrap().unwrap();
    assert_eq!(response.outcome, StatementOutcome::Interrupted);
    // 进行中的请求正常完成，之后不再开始新的一轮
    assert_eq!(h.mock.requests().len(), 1);
    assert_eq!(response.metrics.tool_result_count, 1);
}

#[tokio::test]
async fn test_resume_repairs_interrupted_tool_use() {
    let mock = MockLlmClient::new();
    mock.push_text("Resumed.", TokenUsage::new(1, 1));
    let h = harness(mock);

    // 模拟进程在工具执行中退出：最后一条是未回复的工具调用
    let persistence = ConversationPersistence::new(&h.data, "conv-e");
    let mut interaction = ConversationInteraction::new("conv-e", ModelSettings::default());
    interaction.begin_statement("Run the tests");
    interaction.add_assistant_message(
        vec![ContentPart::ToolUse {
            id: "tu-lost".into(),
            name: "run_command".into(),
            input: json!({ "command": "cargo test" }),
        }],
        TokenUsage::new(3, 3),
    );
    persistence.persist(&mut interaction).await.unwrap();

    let response = h.orchestrator.handle_statement("conv-e", "Continue").await.unwrap();
    assert_eq!(response.answer, "Resumed.");
    assert_eq!(response.metrics.statement_count, 2);

    let request = &h.mock.requests()[0];
    let repaired = request
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .any(|p| matches!(p, ContentPart::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "tu-lost"));
    assert!(repaired);
    assert_eq!(request.messages.last().unwrap().text(), "Continue");
}

#[tokio::test]
async fn test_model_retry_then_success() {
    let mock = MockLlmClient::new();
    mock.push_error(LlmError::RateLimited { retry_after_ms: 1 });
    mock.push_text("ok", TokenUsage::new(2, 2));
    let h = harness(mock);

    let response = h.orchestrator.handle_statement("conv-f", "Hi").await.unwrap();
    assert_eq!(response.answer, "ok");
    assert_eq!(h.mock.requests().len(), 2);
    assert_eq!(response.metrics.statement_turn_count, 1);
}

#[tokio::test]
async fn test_infrastructure_failure_ends_statement_with_error_entry() {
    let mock = MockLlmClient::new();
    mock.push_error(LlmError::Api("backend down".into()));
    let h = harness_with(mock, |cfg| cfg.llm.max_retries = 0);
    let mut events = h.orchestrator.subscribe("conv-g").unwrap();

    let err = h.orchestrator.handle_statement("conv-g", "Hi").await.unwrap_err();
    assert!(matches!(err, BbaiError::Llm(LlmError::Api(_))));

    let logger = ConversationLogger::new(conversation_dir(&h.data, "conv-g"));
    let entries = logger.read_entries().await.unwrap();
    assert!(entries.last().unwrap().contains("backend down"));

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        saw_error |= matches!(event, ProgressEvent::Error { .. });
    }
    assert!(saw_error);

    // 用户消息已落盘，可以从这里恢复
    let dir = conversation_dir(&h.data, "conv-g");
    assert_eq!(line_count(&dir.join("messages.jsonl")), 1);
}

#[tokio::test]
async fn test_next_statement_after_tool_infrastructure_failure_is_well_formed() {
    let mock = MockLlmClient::new();
    mock.push_tool_use("tu-1", "disk_full", json!({}), TokenUsage::new(4, 4));
    mock.push_text("Recovered.", TokenUsage::new(2, 2));
    let h = harness_with_tools(mock, |_| {}, vec![Arc::new(DiskFullTool) as Arc<dyn Tool>]);

    let err = h.orchestrator.handle_statement("conv-k", "Write scratch").await.unwrap_err();
    assert!(matches!(err, BbaiError::Io(_)));

    let response = h.orchestrator.handle_statement("conv-k", "Try again").await.unwrap();
    assert_eq!(response.answer, "Recovered.");

    let request = &h.mock.requests()[1];
    let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::User]);
    assert!(matches!(
        &request.messages[2].content[0],
        ContentPart::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "tu-1"
    ));

    // 补齐的结果也已落盘
    let dir = conversation_dir(&h.data, "conv-k");
    assert_eq!(line_count(&dir.join("messages.jsonl")), 5);
}

#[tokio::test]
async fn test_events_follow_statement_order() {
    let mock = MockLlmClient::new();
    mock.push_tool_use("tu-1", "search_project", json!({ "filePattern": "*.md" }), TokenUsage::new(1, 1));
    mock.push_text("done", TokenUsage::new(1, 1));
    let h = harness(mock);
    let mut events = h.orchestrator.subscribe("conv-h").unwrap();

    h.orchestrator.handle_statement("conv-h", "Find docs").await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
    }
    assert_eq!(
        kinds,
        vec![
            "statement_started",
            "awaiting_model",
            "assistant_message",
            "tool_use",
            "tool_result",
            "awaiting_model",
            "assistant_message",
            "statement_finished",
        ]
    );
}

#[tokio::test]
async fn test_clear_and_delete_conversation() {
    let h = harness(MockLlmClient::new());
    h.orchestrator.handle_statement("conv-i", "echo me").await.unwrap();

    assert!(h.orchestrator.clear_messages("conv-i").await);
    let metadata = h.orchestrator.load("conv-i").await.unwrap().unwrap();
    assert_eq!(metadata.message_count, 0);
    assert_eq!(metadata.metrics.statement_count, 1);
    assert_eq!(line_count(&conversation_dir(&h.data, "conv-i").join("messages.jsonl")), 2);

    assert!(h.orchestrator.delete("conv-i").await.unwrap());
    assert!(!conversation_dir(&h.data, "conv-i").exists());
    assert!(h.orchestrator.list().await.unwrap().is_empty());
    assert!(h.orchestrator.load("conv-i").await.unwrap().is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_conversation_tokens_equal_sum_of_statements(
        usages in prop::collection::vec(
            prop::collection::vec((0u64..500, 0u64..500), 1..3),
            1..4,
        )
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mock = MockLlmClient::new();
        let mut expected = 0u64;
        for statement in &usages {
            let (last, tools) = statement.split_last().unwrap();
            for (i, (input, output)) in tools.iter().enumerate() {
                mock.push_tool_use(
                    &format!("tu-{}", i),
                    "search_project",
                    json!({ "filePattern": "*.none" }),
                    TokenUsage::new(*input, *output),
                );
                expected += input + output;
            }
            mock.push_text("done", TokenUsage::new(last.0, last.1));
            expected += last.0 + last.1;
        }
        let h = harness(mock);

        let ledger = rt.block_on(async {
            let mut ledger = None;
            for i in 0..usages.len() {
                let response = h
                    .orchestrator
                    .handle_statement("conv-p", &format!("statement {}", i))
                    .await
                    .unwrap();
                ledger = Some(response.token_usage);
            }
            ledger.unwrap()
        });

        prop_assert_eq!(ledger.statements.len(), usages.len());
        prop_assert_eq!(ledger.conversation.total_tokens, expected);
        prop_assert_eq!(
            ledger.statements.iter().map(|s| s.total_tokens).sum::<u64>(),
            ledger.conversation.total_tokens
        );
        prop_assert!(ledger.is_consistent());
    }
}
