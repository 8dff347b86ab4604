//! Text generation seam and the production Claude adapter.
//!
//! Stage execution talks to a [`GenerationClient`]; the trait keeps the
//! pipeline testable against scripted mocks and keeps upstream error
//! details (status bodies and the like) out of pipeline errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use claude::{Claude, Message, Request};

/// A single generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// System prompt; empty means none.
    pub system: String,
    /// User-turn prompt.
    pub prompt: String,
    /// Model override; `None` uses the client default.
    pub model: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
    /// Upper bound for this call; the executor also enforces it.
    pub timeout: Duration,
}

/// Token counts for one generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// The text produced by one generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    /// Model that actually served the call.
    pub model: String,
    pub usage: TokenUsage,
    /// True when generation stopped because `max_tokens` was reached.
    pub truncated: bool,
}

/// Errors from a generation backend.
///
/// Messages carry a failure class, never a raw upstream response body.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("generation request timed out after {0:?}")]
    Timeout(Duration),

    /// Transient upstream failure worth retrying (rate limit, overload,
    /// server error, transport failure).
    #[error("upstream service error ({0})")]
    Upstream(String),

    /// The request itself was rejected; retrying cannot help.
    #[error("generation request rejected ({0})")]
    Rejected(String),
}

impl GenerationError {
    /// Whether a request that failed with this error may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::Timeout(_) | GenerationError::Upstream(_)
        )
    }
}

/// Something that can turn a prompt into text.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: GenerationRequest)
        -> Result<GenerationOutput, GenerationError>;

    /// Name of the default model this client generates with.
    fn model_name(&self) -> &str;
}

/// Production [`GenerationClient`] backed by the Claude Messages API.
pub struct ClaudeGenerator {
    client: Claude,
}

impl ClaudeGenerator {
    pub fn new(client: Claude) -> Self {
        Self { client }
    }

    /// Create from the ANTHROPIC_API_KEY environment variable.
    pub fn from_env() -> Result<Self, claude::Error> {
        Ok(Self::new(Claude::from_env()?))
    }
}

#[async_trait]
impl GenerationClient for ClaudeGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationOutput, GenerationError> {
        let mut api_request = Request::new(vec![Message::user(&request.prompt)])
            .with_max_tokens(request.max_tokens)
            .with_temperature(request.temperature)
            .with_timeout(request.timeout);

        if !request.system.is_empty() {
            api_request = api_request.with_system(&request.system);
        }
        if let Some(model) = &request.model {
            api_request = api_request.with_model(model);
        }

        let response = self
            .client
            .complete(api_request)
            .await
            .map_err(map_claude_error)?;

        Ok(GenerationOutput {
            text: response.text,
            model: response.model,
            usage: TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
            truncated: response.stop_reason == claude::StopReason::MaxTokens,
        })
    }

    fn model_name(&self) -> &str {
        self.client.model()
    }
}

/// Map a client error into the pipeline's failure classes.
///
/// API error bodies are logged here and deliberately dropped from the
/// returned error.
fn map_claude_error(e: claude::Error) -> GenerationError {
    let retryable = e.is_retryable();
    let class = match &e {
        claude::Error::Timeout(d) => return GenerationError::Timeout(*d),
        claude::Error::Api { status, message } => {
            debug!(status, body = %message, "upstream API error");
            format!("API status {status}")
        }
        claude::Error::Network(msg) => format!("network error: {msg}"),
        claude::Error::Parse(_) => "malformed API response".to_string(),
        claude::Error::NoApiKey => "API key not configured".to_string(),
        claude::Error::Config(msg) => format!("invalid configuration: {msg}"),
    };

    if retryable {
        GenerationError::Upstream(class)
    } else {
        GenerationError::Rejected(class)
    }
}
