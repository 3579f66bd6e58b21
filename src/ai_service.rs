use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ModelError, RunError};
use crate::models::ProviderConfig;
use crate::prompt_builder::SYSTEM_PROMPT;

const QWEN_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
const THINK_SUFFIX: &str = "\n\n/think";

/// A language-model endpoint. One call per invocation, no retries.
#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    async fn invoke(&self, prompt: &str, provider: &ProviderConfig) -> Result<String, ModelError>;
}

/// Model family, chosen from the provider id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    Qwen,
    DeepSeek,
}

impl ProviderFamily {
    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.to_ascii_lowercase();
        if id.starts_with("qwen") || id.starts_with("dashscope") {
            Some(ProviderFamily::Qwen)
        } else if id.starts_with("deepseek") {
            Some(ProviderFamily::DeepSeek)
        } else {
            None
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            ProviderFamily::Qwen => QWEN_BASE_URL,
            ProviderFamily::DeepSeek => DEEPSEEK_BASE_URL,
        }
    }
}

fn completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{}/chat/completions", base)
    }
}

fn chat_payload(model: &str, prompt: &str) -> Value {
    json!({
        "model": model,
        "messages": [
            {
                "role": "system",
                "content": SYSTEM_PROMPT
            },
            {
                "role": "user",
                "content": prompt
            }
        ],
        "stream": false
    })
}

/// Message content of an OpenAI-compatible chat completion.
fn completion_content(response: &Value) -> Option<&str> {
    response
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .and_then(|v| v.get("content"))
        .or_else(|| response.get("output").and_then(|v| v.get("text")))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Shared HTTP plumbing of the OpenAI-compatible adapters.
#[derive(Debug, Clone)]
struct ChatClient {
    client: Client,
}

impl ChatClient {
    fn new() -> Self {
        Self {
            client: Client::builder().build().unwrap_or_default(),
        }
    }

    async fn chat_completion(
        &self,
        family: ProviderFamily,
        provider: &ProviderConfig,
        prompt: &str,
    ) -> Result<String, ModelError> {
        let key = provider
            .api_key
            .as_ref()
            .filter(|k| k.is_usable())
            .ok_or_else(|| ModelError::MissingCredential {
                provider: provider.id.clone(),
            })?;

        let base = provider
            .base_url
            .as_deref()
            .unwrap_or(family.default_base_url());
        let url = completions_url(base);
        let payload = chat_payload(&provider.model, prompt);

        log::debug!(
            "{} -> {} ({} prompt chars)",
            provider.id,
            url,
            prompt.chars().count()
        );

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(provider.timeout_secs))
            .bearer_auth(key.expose())
            .json(&payload)
            .send()
            .await
            .map_err(|e| ModelError::Transport {
                provider: provider.id.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                provider: provider.id.clone(),
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let response_json: Value = response.json().await.map_err(|e| ModelError::Transport {
            provider: provider.id.clone(),
            message: format!("Failed to parse response: {}", e),
        })?;

        completion_content(&response_json)
            .map(str::to_string)
            .ok_or_else(|| ModelError::EmptyResponse {
                provider: provider.id.clone(),
            })
    }
}

/// DashScope compatible-mode endpoint. Reasoning mode appends `/think`.
#[derive(Debug, Clone)]
pub struct QwenBackend {
    http: ChatClient,
}

impl QwenBackend {
    pub fn new() -> Self {
        Self {
            http: ChatClient::new(),
        }
    }

    pub fn render_prompt(prompt: &str, provider: &ProviderConfig) -> String {
        if provider.reasoning_mode {
            format!("{}{}", prompt, THINK_SUFFIX)
        } else {
            prompt.to_string()
        }
    }
}

impl Default for QwenBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ModelBackend for QwenBackend {
    async fn invoke(&self, prompt: &str, provider: &ProviderConfig) -> Result<String, ModelError> {
        let prompt = Self::render_prompt(prompt, provider);
        self.http
            .chat_completion(ProviderFamily::Qwen, provider, &prompt)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct DeepSeekBackend {
    http: ChatClient,
}

impl DeepSeekBackend {
    pub fn new() -> Self {
        Self {
            http: ChatClient::new(),
        }
    }
}

impl Default for DeepSeekBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ModelBackend for DeepSeekBackend {
    async fn invoke(&self, prompt: &str, provider: &ProviderConfig) -> Result<String, ModelError> {
        self.http
            .chat_completion(ProviderFamily::DeepSeek, provider, prompt)
            .await
    }
}

/// Picks the backend for a provider once, before its sequence starts.
pub trait BackendFactory: Send + Sync {
    fn backend_for(&self, provider: &ProviderConfig) -> Result<Arc<dyn ModelBackend>, RunError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpBackendFactory;

impl BackendFactory for HttpBackendFactory {
    fn backend_for(&self, provider: &ProviderConfig) -> Result<Arc<dyn ModelBackend>, RunError> {
        match ProviderFamily::from_id(&provider.id) {
            Some(ProviderFamily::Qwen) => Ok(Arc::new(QwenBackend::new())),
            Some(ProviderFamily::DeepSeek) => Ok(Arc::new(DeepSeekBackend::new())),
            None => Err(RunError::UnsupportedProvider {
                provider: provider.id.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_id() {
        assert_eq!(ProviderFamily::from_id("qwen"), Some(ProviderFamily::Qwen));
        assert_eq!(ProviderFamily::from_id("Qwen-Max"), Some(ProviderFamily::Qwen));
        assert_eq!(
            ProviderFamily::from_id("deepseek"),
            Some(ProviderFamily::DeepSeek)
        );
        assert_eq!(ProviderFamily::from_id("openai"), None);
    }

    #[test]
    fn test_completions_url() {
        assert_eq!(
            completions_url("https://api.deepseek.com/"),
            "https://api.deepseek.com/chat/completions"
        );
        assert_eq!(
            completions_url("http://localhost:8000/v1/chat/completions"),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[test]
    fn test_payload_carries_system_prompt() {
        let payload = chat_payload("deepseek-chat", "分析600030");
        assert_eq!(payload["model"], "deepseek-chat");
        assert_eq!(payload["messages"][0]["content"], SYSTEM_PROMPT);
        assert_eq!(payload["messages"][1]["content"], "分析600030");
    }

    #[test]
    fn test_completion_content_formats() {
        let openai = json!({"choices": [{"message": {"content": "回答"}}]});
        assert_eq!(completion_content(&openai), Some("回答"));

        let dashscope = json!({"output": {"text": "回答"}});
        assert_eq!(completion_content(&dashscope), Some("回答"));

        let empty = json!({"choices": [{"message": {"content": "  "}}]});
        assert_eq!(completion_content(&empty), None);
    }

    #[test]
    fn test_reasoning_mode_appends_think() {
        let mut provider = ProviderConfig::new("qwen", "qwen3-235b-a22b");
        assert_eq!(QwenBackend::render_prompt("p", &provider), "p");
        provider.reasoning_mode = true;
        assert_eq!(QwenBackend::render_prompt("p", &provider), "p\n\n/think");
    }

    #[test]
    fn test_factory_rejects_unknown_provider() {
        let factory = HttpBackendFactory;
        assert!(factory
            .backend_for(&ProviderConfig::new("qwen", "qwen-plus"))
            .is_ok());
        assert!(matches!(
            factory.backend_for(&ProviderConfig::new("kimi", "kimi-8k")),
            Err(RunError::UnsupportedProvider { .. })
        ));
    }

    #[tokio::test]
    async fn test_invoke_without_credential_fails_before_network() {
        let backend = DeepSeekBackend::new();
        let provider = ProviderConfig::new("deepseek", "deepseek-chat").with_credential("sk-请填入");
        let err = backend.invoke("hi", &provider).await.unwrap_err();
        assert!(matches!(err, ModelError::MissingCredential { .. }));
    }
}
