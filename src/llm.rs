//! Local language-model collaborator.
//!
//! Defines the [`LanguageModel`] trait and its backends:
//! - **[`DisabledModel`]** always reports [`ModelError::Unavailable`]; the
//!   pipeline then runs in degraded mode (conversion only).
//! - **[`OllamaModel`]** calls `POST /api/generate` on a local Ollama host.
//! - **[`OpenAiCompatibleModel`]** calls `POST /v1/chat/completions` on any
//!   OpenAI-compatible server (llama.cpp, LM Studio, vLLM, ...).
//!
//! Every call from the stages goes through a [`ModelGate`], which bounds
//! concurrency to the host's capacity, applies the per-call timeout, and
//! retries per-document failures with exponential backoff (1s, 2s, 4s, ...).
//! `Unavailable` is never retried: it ends the stage.
//!
//! # Error mapping
//!
//! - connection refused / DNS failure, HTTP 404 (model not pulled),
//!   401/403 and 503 → `Unavailable`
//! - client-side timeout → `Timeout`
//! - HTTP 429 / other 5xx, unparseable or empty body → `MalformedResponse`

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::models::UNCATEGORIZED;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OPENAI_URL: &str = "http://localhost:8080";

const BRIEF_INSTRUCTION: &str = "You summarize documents for a personal archive. \
Write a concise brief of at most 150 words: what the document is, who it concerns, \
and its key facts or conclusions. Plain prose, no preamble.";

/// What the model is being asked to do with the prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Free-form brief of the prompt text.
    Brief,
    /// Pick exactly one category from the given label space.
    Choose { categories: Vec<String> },
}

impl Instruction {
    /// System prompt sent alongside the user prompt.
    pub fn system_prompt(&self) -> String {
        match self {
            Instruction::Brief => BRIEF_INSTRUCTION.to_string(),
            Instruction::Choose { categories } => {
                let mut options = categories.clone();
                options.push(UNCATEGORIZED.to_string());
                format!(
                    "You classify documents. Answer with exactly one category from this list: {}. \
                     Reply with the category name only. If none fits, reply {}.",
                    options.join(", "),
                    UNCATEGORIZED
                )
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub prompt: String,
    pub instruction: Instruction,
}

/// A stateless text-completion backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

pub fn create_model(config: &ModelConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "ollama" => Ok(Arc::new(OllamaModel::new(config)?)),
        "openai-compatible" => Ok(Arc::new(OpenAiCompatibleModel::new(config)?)),
        other => bail!("Unknown model provider: {}", other),
    }
}

// ============ Disabled ============

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &ModelRequest) -> Result<String, ModelError> {
        Err(ModelError::Unavailable(
            "model provider is disabled".to_string(),
        ))
    }
}

// ============ HTTP helpers ============

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn map_send_error(e: reqwest::Error, url: &str, timeout: Duration) -> ModelError {
    if e.is_timeout() {
        ModelError::Timeout(timeout)
    } else if e.is_connect() {
        ModelError::Unavailable(format!("cannot connect to {}: {}", url, e))
    } else {
        ModelError::MalformedResponse(e.to_string())
    }
}

async fn map_status(response: reqwest::Response, backend: &str) -> Result<serde_json::Value, ModelError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ModelError::MalformedResponse(format!("{} returned invalid JSON: {}", backend, e)));
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} error {}: {}", backend, status, body.trim());
    match status.as_u16() {
        401 | 403 | 404 | 503 => Err(ModelError::Unavailable(detail)),
        _ => Err(ModelError::MalformedResponse(detail)),
    }
}

fn non_empty(text: Option<&str>, backend: &str) -> Result<String, ModelError> {
    match text.map(str::trim) {
        Some(t) if !t.is_empty() => Ok(t.to_string()),
        Some(_) => Err(ModelError::MalformedResponse(format!(
            "{} returned an empty response",
            backend
        ))),
        None => Err(ModelError::MalformedResponse(format!(
            "{} response has no text field",
            backend
        ))),
    }
}

// ============ Ollama ============

pub struct OllamaModel {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OllamaModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        let timeout = Duration::from_secs(config.timeout_secs);

        Ok(Self {
            client: http_client(timeout)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            temperature: config.temperature,
            timeout,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let endpoint = format!("{}/api/generate", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "system": request.instruction.system_prompt(),
            "prompt": request.prompt,
            "stream": false,
            "options": { "temperature": self.temperature },
        });

        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(e, &self.url, self.timeout))?;
        let json = map_status(response, "Ollama").await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<String, ModelError> {
    non_empty(json.get("response").and_then(|r| r.as_str()), "Ollama")
}

// ============ OpenAI-compatible ============

/// Chat-completions backend. Sends `Authorization: Bearer $OPENAI_API_KEY`
/// when the variable is set; local servers usually need none.
pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiCompatibleModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            anyhow::anyhow!("model.model required for openai-compatible provider")
        })?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        let timeout = Duration::from_secs(config.timeout_secs);

        Ok(Self {
            client: http_client(timeout)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            temperature: config.temperature,
            timeout,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let endpoint = format!("{}/v1/chat/completions", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": request.instruction.system_prompt() },
                { "role": "user", "content": request.prompt },
            ],
        });

        let mut req = self.client.post(&endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| map_send_error(e, &self.url, self.timeout))?;
        let json = map_status(response, "Chat completions").await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String, ModelError> {
    let content = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str());
    non_empty(content, "Chat completions")
}

// ============ Gate ============

/// Serializes access to the shared model host and applies the bounded
/// retry policy.
pub struct ModelGate {
    model: Arc<dyn LanguageModel>,
    permits: Semaphore,
    max_attempts: u32,
    timeout: Duration,
    retry_delay: Duration,
}

impl ModelGate {
    pub fn new(model: Arc<dyn LanguageModel>, config: &ModelConfig) -> Self {
        Self {
            model,
            permits: Semaphore::new(config.max_concurrent.max(1)),
            max_attempts: config.max_attempts.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Overrides the base backoff delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Runs `request`, retrying timeouts and malformed responses up to
    /// `max_attempts` times in total.
    pub async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let mut last_err = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = self.retry_delay * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| ModelError::Unavailable("model gate closed".to_string()))?;
                match tokio::time::timeout(self.timeout, self.model.complete(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ModelError::Timeout(self.timeout)),
                }
            };

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_systemic() => return Err(e),
                Err(e) => {
                    tracing::debug!(attempt = attempt + 1, error = %e, "model call failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ModelError::MalformedResponse("model call failed after retries".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<String, ModelError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<String, ModelError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _request: &ModelRequest) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ModelError::MalformedResponse("script exhausted".into())))
        }
    }

    fn gate(model: Arc<dyn LanguageModel>, attempts: u32) -> ModelGate {
        let config = ModelConfig {
            max_attempts: attempts,
            ..ModelConfig::default()
        };
        ModelGate::new(model, &config).with_retry_delay(Duration::ZERO)
    }

    fn brief() -> ModelRequest {
        ModelRequest {
            prompt: "text".into(),
            instruction: Instruction::Brief,
        }
    }

    #[tokio::test]
    async fn retries_per_document_failures_then_succeeds() {
        let model = Arc::new(Scripted::new(vec![
            Err(ModelError::Timeout(Duration::from_secs(1))),
            Err(ModelError::MalformedResponse("junk".into())),
            Ok("a brief".into()),
        ]));
        let gate = gate(model.clone(), 3);
        assert_eq!(gate.complete(&brief()).await.unwrap(), "a brief");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let model = Arc::new(Scripted::new(vec![
            Err(ModelError::MalformedResponse("1".into())),
            Err(ModelError::MalformedResponse("2".into())),
            Ok("too late".into()),
        ]));
        let gate = gate(model.clone(), 2);
        let err = gate.complete(&brief()).await.unwrap_err();
        assert_eq!(err, ModelError::MalformedResponse("2".into()));
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unavailable_is_not_retried() {
        let model = Arc::new(Scripted::new(vec![
            Err(ModelError::Unavailable("down".into())),
            Ok("never".into()),
        ]));
        let gate = gate(model.clone(), 3);
        assert!(gate.complete(&brief()).await.unwrap_err().is_systemic());
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_model_is_unavailable() {
        let err = DisabledModel.complete(&brief()).await.unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(_)));
    }

    #[test]
    fn choose_prompt_lists_categories_and_fallback() {
        let prompt = Instruction::Choose {
            categories: vec!["finance".into(), "legal".into()],
        }
        .system_prompt();
        assert!(prompt.contains("finance, legal, uncategorized"));
    }

    #[test]
    fn parses_backend_payloads() {
        let ollama = serde_json::json!({ "response": "  hello " });
        assert_eq!(parse_ollama_response(&ollama).unwrap(), "hello");

        let chat = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "finance" } }]
        });
        assert_eq!(parse_chat_response(&chat).unwrap(), "finance");

        let empty = serde_json::json!({ "response": "" });
        assert!(matches!(
            parse_ollama_response(&empty),
            Err(ModelError::MalformedResponse(_))
        ));
        assert!(parse_chat_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn create_model_dispatches_on_provider() {
        let disabled = create_model(&ModelConfig::default()).unwrap();
        assert_eq!(disabled.name(), "disabled");

        let ollama = ModelConfig {
            provider: "ollama".into(),
            model: Some("qwen2.5:7b".into()),
            ..ModelConfig::default()
        };
        assert_eq!(create_model(&ollama).unwrap().name(), "qwen2.5:7b");

        let unknown = ModelConfig {
            provider: "mystery".into(),
            ..ModelConfig::default()
        };
        assert!(create_model(&unknown).is_err());
    }
}
