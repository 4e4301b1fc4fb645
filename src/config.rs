//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BBAI__*` 覆盖（双下划线表示嵌套，如 `BBAI__LLM__MODEL=gpt-4o`）。
//! 加载结果是不可变的 AppConfig，经构造函数向下传递。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::ErrorStrategy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub tools: ToolsSection,
}

/// [app] 段：项目根目录与会话数据目录
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 项目根目录，未设置时用当前目录
    pub project_root: Option<PathBuf>,
    /// 会话数据目录，未设置时用 `<project_root>/.bbai/data`
    pub data_dir: Option<PathBuf>,
    /// system prompt 文件，未设置时按默认路径查找
    pub system_prompt_path: Option<PathBuf>,
}

impl AppSection {
    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn data_dir(&self, project_root: &Path) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| project_root.join(".bbai").join("data"))
    }
}

/// [llm] 段：主模型与可供 multi_model_query / delegate_tasks 使用的模型列表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// 模型调用失败时的重试次数
    pub max_retries: u32,
    pub models: Vec<ModelConfig>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
            max_tokens: 8192,
            request_timeout_secs: 120,
            max_retries: 3,
            models: Vec::new(),
        }
    }
}

/// [[llm.models]]：具名模型及其能力标签
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 单个 statement 的 turn 上限
    pub max_turns: u64,
    /// 每个会话事件通道的容量
    pub event_capacity: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_turns: 25,
            event_capacity: 256,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub max_concurrent_tools: usize,
    pub run_command: RunCommandSection,
    pub search_and_replace: SearchAndReplaceSection,
    pub project_search: ProjectSearchSection,
    pub request_files: RequestFilesSection,
    pub multi_model_query: MultiModelQuerySection,
    pub delegate: DelegateSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 300,
            max_concurrent_tools: 4,
            run_command: RunCommandSection::default(),
            search_and_replace: SearchAndReplaceSection::default(),
            project_search: ProjectSearchSection::default(),
            request_files: RequestFilesSection::default(),
            multi_model_query: MultiModelQuerySection::default(),
            delegate: DelegateSection::default(),
        }
    }
}

/// [tools.run_command] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunCommandSection {
    pub allowed_commands: Vec<String>,
    pub timeout_secs: u64,
    pub max_output_chars: usize,
}

impl Default for RunCommandSection {
    fn default() -> Self {
        Self {
            allowed_commands: crate::tools::run_command::DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 60,
            max_output_chars: 20_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchAndReplaceSection {
    /// 对已有文件生效的最短搜索串长度
    pub min_search_length: usize,
}

impl Default for SearchAndReplaceSection {
    fn default() -> Self {
        Self { min_search_length: 1 }
    }
}

/// [tools.project_search] 段：读缓冲、重叠区与排除目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectSearchSection {
    pub chunk_size: usize,
    pub overlap: usize,
    pub exclude_dirs: Vec<String>,
}

impl Default for ProjectSearchSection {
    fn default() -> Self {
        Self {
            chunk_size: crate::tools::project_search::DEFAULT_CHUNK_SIZE,
            overlap: crate::tools::project_search::DEFAULT_OVERLAP,
            exclude_dirs: vec![".git".into(), ".bbai".into(), "node_modules".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestFilesSection {
    pub max_file_bytes: u64,
}

impl Default for RequestFilesSection {
    fn default() -> Self {
        Self {
            max_file_bytes: crate::tools::request_files::DEFAULT_MAX_FILE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiModelQuerySection {
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for MultiModelQuerySection {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_tokens: 4096,
        }
    }
}

/// [tools.delegate] 段：子任务超时、资源加载与默认错误策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DelegateSection {
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub resource_timeout_secs: u64,
    pub resource_max_chars: usize,
    /// fail_fast / continue_on_error / retry
    pub error_strategy: String,
    pub error_threshold: usize,
    pub max_retries: u32,
}

impl Default for DelegateSection {
    fn default() -> Self {
        Self {
            timeout_secs: 180,
            max_tokens: 4096,
            resource_timeout_secs: 15,
            resource_max_chars: 20_000,
            error_strategy: "fail_fast".to_string(),
            error_threshold: 3,
            max_retries: 2,
        }
    }
}

impl DelegateSection {
    /// 未知策略名按 fail_fast 处理
    pub fn strategy(&self) -> ErrorStrategy {
        match self.error_strategy.trim().to_lowercase().as_str() {
            "continue_on_error" => ErrorStrategy::ContinueOnError {
                threshold: self.error_threshold,
            },
            "retry" => ErrorStrategy::Retry {
                max_retries: self.max_retries,
            },
            "fail_fast" => ErrorStrategy::FailFast,
            other => {
                tracing::warn!(strategy = %other, "unknown delegate error strategy, using fail_fast");
                ErrorStrategy::FailFast
            }
        }
    }
}

/// 从 config 目录加载配置，环境变量 BBAI__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 BBAI__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BBAI")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
