//! Low-latency, low-cost [`Provider`] implementation used for the common tactical step.

use super::http::{build_client, complete};
use crate::error::OrchestratorError;
use crate::provider::{FunctionSchema, Message, Provider, ProviderConfig, ProviderResponse};
use async_trait::async_trait;

/// Tactical provider: cheap, fast model suited to most agent loop iterations.
pub struct FastProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl FastProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Provider for FastProvider {
    async fn complete(
        &self,
        messages: &[Message],
        available_functions: &[FunctionSchema],
        config: &ProviderConfig,
    ) -> Result<ProviderResponse, OrchestratorError> {
        complete(
            &self.client,
            &self.base_url,
            &self.api_key,
            &self.model,
            messages,
            available_functions,
            config,
        )
        .await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
