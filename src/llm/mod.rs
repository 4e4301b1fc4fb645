//! LLM 层：后端抽象与实现（OpenAI 兼容 / Mock）与多模型注册

pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use router::{ModelEntry, ModelRegistry};
pub use traits::{LlmAnswer, LlmError, LlmProvider, LlmRequest};
