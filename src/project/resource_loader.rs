//! 资源加载：为委派任务附加 file / url 等资源的文本内容
//!
//! DefaultResourceLoader 支持项目内文件与 http(s) URL（HTML 经 html2text 转为可读文本）；
//! memory / api / database / vector_search 需要宿主提供实现，默认报 UnsupportedResourceType。

use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::{BbaiError, FileOperation};
use crate::tools::{truncate_chars, SafeFs};

/// 资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    File,
    Url,
    Memory,
    Api,
    Database,
    VectorSearch,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceType::File => "file",
            ResourceType::Url => "url",
            ResourceType::Memory => "memory",
            ResourceType::Api => "api",
            ResourceType::Database => "database",
            ResourceType::VectorSearch => "vector_search",
        };
        f.write_str(s)
    }
}

/// 任务所需的一个资源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub uri: String,
}

#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load_resource(&self, resource: &Resource) -> Result<String, BbaiError>;
}

/// 默认加载器：项目内文件 + http(s) URL
#[derive(Debug, Clone)]
pub struct DefaultResourceLoader {
    fs: SafeFs,
    client: Client,
    max_chars: usize,
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!") || s.starts_with("<html") || s.starts_with("<HTML")
}

impl DefaultResourceLoader {
    pub fn new(fs: SafeFs, timeout_secs: u64, max_chars: usize) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("bbai/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            fs,
            client,
            max_chars,
        }
    }

    async fn load_file(&self, uri: &str) -> Result<String, BbaiError> {
        let path = self.fs.resolve(uri)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BbaiError::from_io(uri, FileOperation::Read, e))?;
        Ok(content)
    }

    async fn load_url(&self, uri: &str) -> Result<String, BbaiError> {
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            return Err(BbaiError::tool("load_resource", format!("Invalid URL: {}", uri)));
        }
        let resp = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| BbaiError::tool("load_resource", format!("Request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(BbaiError::tool(
                "load_resource",
                format!("HTTP {} for {}", resp.status(), uri),
            ));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| BbaiError::tool("load_resource", format!("Read body failed: {}", e)))?;
        if looks_like_html(&body) {
            if let Ok(text) = from_read(body.as_bytes(), 100) {
                return Ok(text);
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl ResourceLoader for DefaultResourceLoader {
    async fn load_resource(&self, resource: &Resource) -> Result<String, BbaiError> {
        tracing::debug!(kind = %resource.resource_type, uri = %resource.uri, "loading resource");
        let content = match resource.resource_type {
            ResourceType::File => self.load_file(&resource.uri).await?,
            ResourceType::Url => self.load_url(&resource.uri).await?,
            other => return Err(BbaiError::UnsupportedResourceType(other.to_string())),
        };
        Ok(truncate_chars(&content, self.max_chars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(dir: &std::path::Path) -> DefaultResourceLoader {
        DefaultResourceLoader::new(SafeFs::new(dir), 5, 16)
    }

    #[tokio::test]
    async fn test_file_resource_loaded_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "short").unwrap();
        std::fs::write(dir.path().join("long.md"), "x".repeat(40)).unwrap();
        let l = loader(dir.path());
        let res = |uri: &str| Resource {
            resource_type: ResourceType::File,
            uri: uri.to_string(),
        };
        assert_eq!(l.load_resource(&res("notes.md")).await.unwrap(), "short");
        assert!(l.load_resource(&res("long.md")).await.unwrap().ends_with("...[truncated]"));
        assert!(matches!(
            l.load_resource(&res("../etc/passwd")).await,
            Err(BbaiError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_types() {
        let dir = tempfile::tempdir().unwrap();
        let err = loader(dir.path())
            .load_resource(&Resource {
                resource_type: ResourceType::VectorSearch,
                uri: "embeddings://x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BbaiError::UnsupportedResourceType(ref t) if t == "vector_search"));
    }

    #[test]
    fn test_resource_wire_shape() {
        let r: Resource = serde_json::from_str(r#"{"type":"url","uri":"https://docs.rs"}"#).unwrap();
        assert_eq!(r.resource_type, ResourceType::Url);
    }
}
