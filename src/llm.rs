//! LLM Provider Abstraction (C10) — hides provider-specific differences
//! behind one interface, per §4.10.
//!
//! Two concrete providers are implemented: a single-concurrency local-daemon
//! provider (Ollama-compatible HTTP, serialized behind a queue, grounded in
//! the teacher's own `reqwest`-based retry/backoff style in the embedding
//! module) and a batched OpenAI-wire-compatible provider (`async-openai`,
//! used for a vLLM-style high-throughput server). A process-wide
//! [`ProviderFactory`] singleton selects the configured variant at startup
//! and caches the instance, per §9's "interface/capability set with a
//! factory" redesign guidance.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::LlmConfig;
use crate::error::{RagError, Result};

/// Options accepted by [`LlmProvider::generate`] / [`LlmProvider::generate_stream`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub top_p: Option<f32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model_id: "default".to_string(),
            temperature: 0.7,
            max_tokens: None,
            stop_sequences: Vec::new(),
            top_p: None,
        }
    }
}

/// Liveness of a configured provider, per §4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

/// A lazy, cancellable sequence of text fragments, per §9's "single
/// streaming contract" redesign note. Implementations must observe
/// `cancellation_token` between fragments.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Provider-agnostic capability set every backend implements, per §4.10.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Non-streaming completion, used internally by the Query Expander and
    /// Corrective Gate.
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String>;

    /// Lazy, cancellable streaming completion relayed token-by-token to the
    /// Session Bus by the Chat Orchestrator.
    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancellation_token: CancellationToken,
    ) -> Result<TokenStream>;

    async fn list_models(&self) -> Result<Vec<String>>;

    async fn health_check(&self) -> HealthStatus;

    fn name(&self) -> &'static str;
}

/// Single-concurrency local daemon provider (Ollama-compatible). One
/// request in flight at a time per model; concurrent callers serialize
/// behind a `tokio::sync::Mutex` queue, matching §4.10's "local daemon"
/// variant and §5's mutation discipline for a serialized provider.
pub struct OllamaProvider {
    endpoint: String,
    client: reqwest::Client,
    timeout: std::time::Duration,
    queue: Arc<Mutex<()>>,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::model_unavailable(e.to_string()))?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            client,
            timeout: std::time::Duration::from_secs(config.timeout_secs),
            queue: Arc::new(Mutex::new(())),
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let _permit = self.queue.lock().await;
        let body = serde_json::json!({
            "model": options.model_id,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "top_p": options.top_p,
                "stop": options.stop_sequences,
            },
        });

        let resp = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Provider {
                provider: "ollama".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RagError::Provider {
                provider: "ollama".to_string(),
                message: format!("http {status}: {text}"),
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| RagError::Provider {
            provider: "ollama".to_string(),
            message: e.to_string(),
        })?;
        Ok(json.get("response").and_then(|v| v.as_str()).unwrap_or_default().to_string())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancellation_token: CancellationToken,
    ) -> Result<TokenStream> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let queue = self.queue.clone();
        let body = serde_json::json!({
            "model": options.model_id,
            "prompt": prompt,
            "stream": true,
            "options": {
                "temperature": options.temperature,
                "top_p": options.top_p,
                "stop": options.stop_sequences,
            },
        });
        let timeout = self.timeout;

        // The local daemon is serialized: the queue permit is acquired here
        // and held inside the generator for the stream's entire lifetime, so
        // a second caller blocks until this stream completes or is dropped.
        let stream = async_stream::stream! {
            let _permit = queue.lock_owned().await;

            let resp = match tokio::time::timeout(
                timeout,
                client.post(format!("{endpoint}/api/generate")).json(&body).send(),
            )
            .await
            {
                Err(_) => {
                    yield Err(RagError::Timeout {
                        operation: "ollama generate_stream connect".to_string(),
                        elapsed_ms: timeout.as_millis() as u64,
                    });
                    return;
                }
                Ok(Err(e)) => {
                    yield Err(RagError::Provider { provider: "ollama".to_string(), message: e.to_string() });
                    return;
                }
                Ok(Ok(resp)) => resp,
            };

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                yield Err(RagError::Provider {
                    provider: "ollama".to_string(),
                    message: format!("http {status}: {text}"),
                });
                return;
            }

            let byte_stream = resp.bytes_stream();
            let inner = ndjson_token_stream(byte_stream, cancellation_token, "response", "done");
            tokio::pin!(inner);
            while let Some(item) = inner.next().await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.endpoint))
            .send()
            .await
            .map_err(|e| RagError::Provider {
                provider: "ollama".to_string(),
                message: e.to_string(),
            })?;
        let json: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        let models = json
            .get("models")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn health_check(&self) -> HealthStatus {
        match self.client.get(format!("{}/api/tags", self.endpoint)).send().await {
            Ok(resp) if resp.status().is_success() => HealthStatus::Healthy,
            Ok(_) => HealthStatus::Degraded,
            Err(_) => HealthStatus::Down,
        }
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

/// Turns a newline-delimited-JSON byte stream (Ollama's `/api/generate`
/// streaming wire format) into a [`TokenStream`], stopping at `done_key` or
/// on cancellation.
fn ndjson_token_stream(
    byte_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
    cancellation_token: CancellationToken,
    text_key: &'static str,
    done_key: &'static str,
) -> impl futures_util::Stream<Item = Result<String>> + Send + 'static {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buf = Vec::new();
        loop {
            if cancellation_token.is_cancelled() {
                yield Err(RagError::Cancelled { correlation_id: "stream".to_string() });
                return;
            }
            let chunk = tokio::select! {
                _ = cancellation_token.cancelled() => {
                    yield Err(RagError::Cancelled { correlation_id: "stream".to_string() });
                    return;
                }
                next = byte_stream.next() => next,
            };
            let Some(chunk) = chunk else { return };
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield Err(RagError::Provider { provider: "ollama".to_string(), message: e.to_string() });
                    return;
                }
            };
            buf.extend_from_slice(&bytes);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = &line[..line.len().saturating_sub(1)];
                if line.is_empty() {
                    continue;
                }
                let Ok(json) = serde_json::from_slice::<serde_json::Value>(line) else { continue };
                if let Some(text) = json.get(text_key).and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        yield Ok(text.to_string());
                    }
                }
                if json.get(done_key).and_then(|v| v.as_bool()).unwrap_or(false) {
                    return;
                }
            }
        }
    }
}

/// Batched, high-throughput OpenAI-wire-compatible provider (vLLM or any
/// server exposing `/v1/chat/completions`). Supports concurrent streams via
/// continuous batching server-side; this crate does not serialize calls to
/// it, per §5's "callers must not assume either [concurrency discipline]".
pub struct OpenAiCompatProvider {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
}

impl OpenAiCompatProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let mut oa_config = async_openai::config::OpenAIConfig::new().with_api_base(&config.endpoint);
        if let Some(key) = &config.api_key {
            oa_config = oa_config.with_api_key(key);
        }
        let client = async_openai::Client::with_config(oa_config);
        Ok(Self { client })
    }

    fn request(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        stream: bool,
    ) -> async_openai::types::CreateChatCompletionRequest {
        use async_openai::types::{
            ChatCompletionRequestMessage, ChatCompletionRequestUserMessage,
            ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
        };

        let message = ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
            content: ChatCompletionRequestUserMessageContent::Text(prompt.to_string()),
            name: None,
        });

        CreateChatCompletionRequest {
            model: options.model_id.clone(),
            messages: vec![message],
            temperature: Some(options.temperature).filter(|&t| t != 0.0),
            max_completion_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: (!options.stop_sequences.is_empty())
                .then(|| async_openai::types::Stop::StringArray(options.stop_sequences.clone())),
            stream: stream.then_some(true),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let request = self.request(prompt, options, false);
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| RagError::Provider {
                provider: "openai-compat".to_string(),
                message: e.to_string(),
            })?;
        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancellation_token: CancellationToken,
    ) -> Result<TokenStream> {
        let request = self.request(prompt, options, true);
        let inner = self.client.chat().create_stream(request).await.map_err(|e| RagError::Provider {
            provider: "openai-compat".to_string(),
            message: e.to_string(),
        })?;

        let stream = async_stream::stream! {
            tokio::pin!(inner);
            loop {
                let next = tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        yield Err(RagError::Cancelled { correlation_id: "stream".to_string() });
                        return;
                    }
                    next = inner.next() => next,
                };
                let Some(item) = next else { return };
                match item {
                    Ok(resp) => {
                        if let Some(choice) = resp.choices.first() {
                            if let Some(text) = &choice.delta.content {
                                if !text.is_empty() {
                                    yield Ok(text.clone());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(RagError::Provider { provider: "openai-compat".to_string(), message: e.to_string() });
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let models = self.client.models().list().await.map_err(|e| RagError::Provider {
            provider: "openai-compat".to_string(),
            message: e.to_string(),
        })?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.client.models().list().await {
            Ok(_) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Down,
        }
    }

    fn name(&self) -> &'static str {
        "openai-compat"
    }
}

/// A provider that always fails, used when no LLM backend is configured
/// (e.g. retrieval-only test fixtures).
pub struct DisabledLlmProvider;

#[async_trait]
impl LlmProvider for DisabledLlmProvider {
    async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
        Err(RagError::model_unavailable("no llm provider configured"))
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _options: &GenerateOptions,
        _cancellation_token: CancellationToken,
    ) -> Result<TokenStream> {
        Err(RagError::model_unavailable("no llm provider configured"))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Down
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

fn build_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "vllm" | "openai" => Ok(Arc::new(OpenAiCompatProvider::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledLlmProvider)),
        other => Err(RagError::invalid(format!("unknown llm provider: '{other}'"))),
    }
}

static FACTORY_INSTANCE: OnceLock<Mutex<Option<Arc<dyn LlmProvider>>>> = OnceLock::new();

/// Process-wide singleton selecting the provider at startup from
/// configuration and caching the instance, per §4.10. `reset()` clears the
/// cache (used by tests so each test configures its own provider).
pub struct ProviderFactory;

impl ProviderFactory {
    /// Returns the cached provider, constructing it from `config` on first
    /// call. Subsequent calls ignore `config` and return the cached
    /// instance until [`Self::reset`] is called.
    pub async fn get_service(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
        let cell = FACTORY_INSTANCE.get_or_init(|| Mutex::new(None));
        let mut guard = cell.lock().await;
        if guard.is_none() {
            *guard = Some(build_provider(config)?);
        }
        Ok(guard.as_ref().expect("just populated").clone())
    }

    /// Clears the cached provider. Used by tests to force a fresh provider
    /// for a different configuration.
    pub async fn reset() {
        if let Some(cell) = FACTORY_INSTANCE.get() {
            *cell.lock().await = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_provider_surfaces_model_unavailable() {
        let provider = DisabledLlmProvider;
        let err = provider.generate("hi", &GenerateOptions::default()).await.unwrap_err();
        assert!(matches!(err, RagError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn disabled_provider_is_down() {
        let provider = DisabledLlmProvider;
        assert_eq!(provider.health_check().await, HealthStatus::Down);
    }

    #[tokio::test]
    async fn factory_caches_instance_across_calls() {
        ProviderFactory::reset().await;
        let cfg = LlmConfig { provider: "disabled".to_string(), ..LlmConfig::default() };
        let a = ProviderFactory::get_service(&cfg).await.unwrap();
        let b = ProviderFactory::get_service(&cfg).await.unwrap();
        assert_eq!(a.name(), b.name());
        ProviderFactory::reset().await;
    }
}
