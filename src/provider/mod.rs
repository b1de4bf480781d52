//! LLM provider abstraction used by provider, session, robust and batch steps

pub mod client;
pub mod response;
pub mod subprocess_client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use client::ProviderClientConfig;
pub use response::{ErrorClass, ProviderError, ProviderResponse, TokenUsage};
pub use subprocess_client::SubprocessClient;

/// Per-call options forwarded to the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOptions {
    /// Model identifier understood by the backend
    #[serde(default)]
    pub model: Option<String>,

    /// System prompt, may contain templates
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Conversation session, filled in by session steps
    #[serde(default)]
    pub session_id: Option<String>,

    /// Timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Backend-specific settings passed through untouched
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Trait for provider execution - allows for different backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Execute a fully resolved prompt
    async fn execute(
        &self,
        prompt: &str,
        options: &ProviderOptions,
    ) -> Result<ProviderResponse, ProviderError>;
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for std::sync::Arc<P> {
    async fn execute(
        &self,
        prompt: &str,
        options: &ProviderOptions,
    ) -> Result<ProviderResponse, ProviderError> {
        (**self).execute(prompt, options).await
    }
}

/// Provider that shells out to a CLI backend
#[derive(Debug, Clone)]
pub struct CommandProvider {
    client: SubprocessClient,
}

impl CommandProvider {
    pub fn new(config: ProviderClientConfig) -> Self {
        Self {
            client: SubprocessClient::new(config.command, config.args, config.timeout_secs),
        }
    }

    pub fn command(&self) -> &str {
        self.client.command()
    }
}

#[async_trait]
impl Provider for CommandProvider {
    async fn execute(
        &self,
        prompt: &str,
        options: &ProviderOptions,
    ) -> Result<ProviderResponse, ProviderError> {
        let full_prompt = match &options.system_prompt {
            Some(system) => format!("{}\n\n{}", system, prompt),
            None => prompt.to_string(),
        };
        let content = self.client.execute(&full_prompt, options.timeout_secs).await?;
        Ok(ProviderResponse::from_text(content))
    }
}
