//! 多模型注册与能力路由
//!
//! ModelRegistry 按名称保存后端及其能力标签：
//! - multi_model_query 按名称查找，未注册时报 UnsupportedProvider
//! - delegate_tasks 按所需能力选择第一个满足的后端

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::BbaiError;
use crate::llm::LlmProvider;

/// 单个模型条目：后端 + 模型名 + 能力
#[derive(Clone)]
pub struct ModelEntry {
    pub provider: Arc<dyn LlmProvider>,
    /// 发送给后端的模型 ID
    pub model: String,
    pub capabilities: Vec<String>,
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl ModelEntry {
    pub fn supports_all(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|cap| self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(cap)))
    }
}

/// 模型注册表（BTreeMap 保证列举顺序稳定）
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelEntry>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        capabilities: Vec<String>,
    ) {
        let name = name.into();
        tracing::debug!(model = %name, "registering model");
        self.models.insert(
            name,
            ModelEntry {
                provider,
                model: model.into(),
                capabilities,
            },
        );
    }

    pub fn get(&self, name: &str) -> Result<&ModelEntry, BbaiError> {
        self.models
            .get(name)
            .ok_or_else(|| BbaiError::UnsupportedProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// 选择满足全部能力要求的第一个模型（按名称排序）
    pub fn route(&self, required: &[String]) -> Result<(&str, &ModelEntry), BbaiError> {
        self.models
            .iter()
            .find(|(_, entry)| entry.supports_all(required))
            .map(|(name, entry)| (name.as_str(), entry))
            .ok_or_else(|| {
                BbaiError::UnsupportedProvider(format!(
                    "no model supports capabilities [{}]",
                    required.join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn registry() -> ModelRegistry {
        let mut reg = ModelRegistry::new();
        reg.register(
            "fast",
            Arc::new(MockLlmClient::named("fast")),
            "fast-model",
            vec!["chat".into()],
        );
        reg.register(
            "smart",
            Arc::new(MockLlmClient::named("smart")),
            "smart-model",
            vec!["chat".into(), "code".into(), "vision".into()],
        );
        reg
    }

    #[test]
    fn test_route_by_capability() {
        let reg = registry();
        let (name, entry) = reg.route(&["code".to_string()]).unwrap();
        assert_eq!(name, "smart");
        assert_eq!(entry.model, "smart-model");

        let (name, _) = reg.route(&[]).unwrap();
        assert_eq!(name, "fast");
    }

    #[test]
    fn test_unknown_model_is_unsupported_provider() {
        let reg = registry();
        assert!(matches!(
            reg.get("nope"),
            Err(BbaiError::UnsupportedProvider(_))
        ));
        assert!(matches!(
            reg.route(&["audio".to_string()]),
            Err(BbaiError::UnsupportedProvider(_))
        ));
    }
}
