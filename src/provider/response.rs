//! Provider response and error types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure class used by the robustness controller to decide on retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    RateLimit,
    Transient,
    Terminal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Transient => "transient",
            ErrorClass::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// Error types for provider operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Provider error: {0}")]
    Terminal(String),
}

impl ProviderError {
    /// Classify this error for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Timeout(_) => ErrorClass::Timeout,
            ProviderError::RateLimited(_) => ErrorClass::RateLimit,
            ProviderError::Transient(_) => ErrorClass::Transient,
            ProviderError::Terminal(_) => ErrorClass::Terminal,
        }
    }
}

/// Response from a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Raw text content returned by the backend
    pub content: String,

    /// Structured output; recorded as the step result
    pub output: Value,

    /// Token usage information (if available)
    pub usage: Option<TokenUsage>,
}

impl ProviderResponse {
    /// Build a response from plain text.
    ///
    /// Text that parses as a JSON object or array becomes structured output,
    /// anything else is kept as a string.
    pub fn from_text(content: impl Into<String>) -> Self {
        let content = content.into();
        let output = match serde_json::from_str::<Value>(content.trim()) {
            Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
            _ => Value::String(content.clone()),
        };
        Self {
            content,
            output,
            usage: None,
        }
    }

    /// Build a response carrying a structured value
    pub fn structured(output: Value) -> Self {
        let content = match &output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            content,
            output,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
