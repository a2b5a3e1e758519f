//! Higher-capability, higher-cost [`Provider`] implementation used for escalations and the
//! final scan summarization step.

use super::http::{build_client, complete};
use crate::error::OrchestratorError;
use crate::provider::{FunctionSchema, Message, Provider, ProviderConfig, ProviderResponse};
use async_trait::async_trait;

/// Strategic provider: slower and more expensive, reserved for escalated steps.
pub struct DeepProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl DeepProvider {
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
impl Provider for DeepProvider {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_name_reflects_constructor_argument() {
        let p = DeepProvider::new("https://api.example.test/v1", "sk-test", "deep-tier-large");
        assert_eq!(p.model_name(), "deep-tier-large");
    }
}
