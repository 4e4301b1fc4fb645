//! 编排器构建器：统一的初始化逻辑
//!
//! 从 AppConfig 创建模型注册表、工具注册表、执行器与项目上下文，组装 OrchestratorController。
//! 测试可以注入自己的 LlmProvider / CommitHook / ResourceLoader。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::conversation::ModelSettings;
use crate::core::{
    BbaiError, ConversationSupervisor, ErrorHandler, ErrorStrategy, EventHub, OrchestratorController,
    ToolScheduler,
};
use crate::llm::{LlmProvider, ModelRegistry, OpenAiClient};
use crate::project::{CommitHook, DefaultResourceLoader, NoopCommitHook, ProjectContext, ResourceLoader};
use crate::tools::delegate_tasks::DelegateRunner;
use crate::tools::{
    ApplyPatchTool, DelegateTasksTool, MoveFilesTool, MultiModelQueryTool, ProjectSearchEngine,
    RenameFilesTool, RequestFilesTool, RewriteFileTool, RunCommandTool, SafeFs, SearchAndReplaceTool,
    SearchProjectTool, Tool, ToolExecutor, ToolRegistry,
};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are BBai, an assistant that inspects and modifies software projects using tools.";

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    project_root: PathBuf,
    data_dir: PathBuf,
    system_prompt: String,
    provider: Option<Arc<dyn LlmProvider>>,
    models: Option<ModelRegistry>,
    commit_hook: Arc<dyn CommitHook>,
    resource_loader: Option<Arc<dyn ResourceLoader>>,
    extra_tools: Vec<Arc<dyn Tool>>,
    supervisor: Option<Arc<ConversationSupervisor>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        let project_root = config.app.project_root();
        let data_dir = config.app.data_dir(&project_root);
        Self {
            config,
            project_root,
            data_dir,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            provider: None,
            models: None,
            commit_hook: Arc::new(NoopCommitHook),
            resource_loader: None,
            extra_tools: Vec::new(),
            supervisor: None,
        }
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        if self.config.app.data_dir.is_none() {
            self.data_dir = self.config.app.data_dir(&self.project_root);
        }
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// 从配置路径或默认位置加载 system prompt；都找不到时保留当前值
    pub fn with_system_prompt_from_file(mut self) -> Self {
        let configured = self.config.app.system_prompt_path.clone();
        let found = configured
            .into_iter()
            .chain(
                ["config/prompts/system.md", "../config/prompts/system.md"]
                    .into_iter()
                    .map(PathBuf::from),
            )
            .find_map(|p| std::fs::read_to_string(p).ok());
        if let Some(prompt) = found {
            self.system_prompt = prompt;
        }
        self
    }

    /// 主对话使用的后端（不设置时按 [llm] 段创建 OpenAI 兼容客户端）
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// multi_model_query / delegate_tasks 使用的模型（不设置时按 [[llm.models]] 创建）
    pub fn with_models(mut self, models: ModelRegistry) -> Self {
        self.models = Some(models);
        self
    }

    pub fn with_commit_hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.commit_hook = hook;
        self
    }

    pub fn with_resource_loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.resource_loader = Some(loader);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<ConversationSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn api_key(env_name: &str) -> Option<String> {
        std::env::var(env_name).ok().filter(|k| !k.trim().is_empty())
    }

    /// 按 [llm] 段创建主后端
    pub fn build_provider(&self) -> Arc<dyn LlmProvider> {
        let llm = &self.config.llm;
        tracing::info!(provider = %llm.provider, model = %llm.model, "using LLM backend");
        if Self::api_key(&llm.api_key_env).is_none() {
            tracing::warn!(env = %llm.api_key_env, "API key not set, model requests will fail");
        }
        Arc::new(OpenAiClient::new(
            llm.base_url.as_deref(),
            Self::api_key(&llm.api_key_env).as_deref(),
        ))
    }

    /// 按 [[llm.models]] 创建模型注册表；未配置时只注册主模型
    pub fn build_models(&self, primary: &Arc<dyn LlmProvider>) -> ModelRegistry {
        let mut models = ModelRegistry::new();
        let llm = &self.config.llm;
        for entry in &llm.models {
            let base_url = entry.base_url.as_deref().or(llm.base_url.as_deref());
            let key_env = entry.api_key_env.as_deref().unwrap_or(&llm.api_key_env);
            let provider: Arc<dyn LlmProvider> =
                Arc::new(OpenAiClient::new(base_url, Self::api_key(key_env).as_deref()));
            models.register(entry.name.clone(), provider, entry.model.clone(), entry.capabilities.clone());
        }
        if models.is_empty() {
            models.register(llm.model.clone(), primary.clone(), llm.model.clone(), Vec::new());
        }
        models
    }

    /// 构建工具注册表（所有入口共享同一套工具）
    pub fn build_tool_registry(
        &self,
        models: Arc<ModelRegistry>,
        loader: Arc<dyn ResourceLoader>,
    ) -> ToolRegistry {
        let tools_cfg = &self.config.tools;
        let mut tools = ToolRegistry::new();

        tools.register(ApplyPatchTool::new());
        tools.register(SearchAndReplaceTool::new(tools_cfg.search_and_replace.min_search_length));
        tools.register(RewriteFileTool::new());
        tools.register(SearchProjectTool::new(
            ProjectSearchEngine::new()
                .with_buffer(tools_cfg.project_search.chunk_size, tools_cfg.project_search.overlap)
                .with_excludes(tools_cfg.project_search.exclude_dirs.clone()),
        ));
        tools.register(MoveFilesTool::new());
        tools.register(RenameFilesTool::new());
        tools.register(RequestFilesTool::new(tools_cfg.request_files.max_file_bytes));
        tools.register(RunCommandTool::new(
            tools_cfg.run_command.allowed_commands.clone(),
            tools_cfg.run_command.timeout_secs,
            tools_cfg.run_command.max_output_chars,
        ));
        tools.register(MultiModelQueryTool::new(
            models.clone(),
            tools_cfg.multi_model_query.timeout_secs,
            tools_cfg.multi_model_query.max_tokens,
        ));
        tools.register(DelegateTasksTool::new(
            DelegateRunner::new(
                models,
                loader,
                tools_cfg.delegate.timeout_secs,
                tools_cfg.delegate.max_tokens,
            ),
            tools_cfg.delegate.strategy(),
        ));

        for tool in &self.extra_tools {
            tools.register_arc(tool.clone());
        }
        tools
    }

    /// 组装编排器
    pub fn build(self) -> Result<OrchestratorController, BbaiError> {
        std::fs::create_dir_all(&self.data_dir).map_err(BbaiError::Io)?;
        let project_root = self
            .project_root
            .canonicalize()
            .map_err(|e| BbaiError::Config(format!("project root {}: {}", self.project_root.display(), e)))?;

        let provider = self.provider.clone().unwrap_or_else(|| self.build_provider());
        let models = Arc::new(match &self.models {
            Some(models) => models.clone(),
            None => self.build_models(&provider),
        });
        let loader = self.resource_loader.clone().unwrap_or_else(|| {
            Arc::new(DefaultResourceLoader::new(
                SafeFs::new(&project_root),
                self.config.tools.delegate.resource_timeout_secs,
                self.config.tools.delegate.resource_max_chars,
            ))
        });

        let registry = self.build_tool_registry(models, loader);
        tracing::info!(tools = ?registry.tool_names(), "tools registered");
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            self.config.tools.tool_timeout_secs,
        ));
        let scheduler = Arc::new(ToolScheduler::new(self.config.tools.max_concurrent_tools));
        let project = ProjectContext::with_scheduler(&project_root, scheduler);

        let llm = &self.config.llm;
        let settings = ModelSettings {
            provider: llm.provider.clone(),
            model: llm.model.clone(),
            system_prompt: self.system_prompt.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
        };
        let llm_retry = ErrorHandler::new(ErrorStrategy::Retry {
            max_retries: llm.max_retries,
        });

        Ok(OrchestratorController::new(
            provider,
            settings,
            executor,
            project,
            self.data_dir.clone(),
            self.commit_hook.clone(),
            self.supervisor.clone().unwrap_or_default(),
            EventHub::new(self.config.orchestrator.event_capacity),
            llm_retry,
            Duration::from_secs(llm.request_timeout_secs.max(1)),
            self.config.orchestrator.max_turns,
        ))
    }
}
