//! Abstraction over any function-calling-capable LLM backend (§4.4).
//!
//! `Provider` is the trait every backing LLM implementation satisfies; `ProviderResponse` is
//! the tagged result the Agent Loop dispatches on. Two implementations are required by the
//! spec (see [`crate::providers::fast`] and [`crate::providers::deep`]); a third against a
//! locally-hosted model is equally valid, the loop is indifferent to which.

use crate::error::{OrchestratorError, ProviderErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single chat message exchanged with a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A function schema exposed to the provider's function-calling API, derived from a
/// `ToolDescriptor` (see [`crate::toolbox`]).
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Per-call tuning knobs. `force_function_call` asks the provider to always answer with a
/// `FunctionCall`, used for the agent loop's fix-up retry after malformed arguments.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub force_function_call: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2048,
            stop_sequences: Vec::new(),
            force_function_call: false,
        }
    }
}

/// Token accounting for a single provider call, threaded into the agent loop's running
/// budget totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// The result of one provider call. `arguments_json` inside `FunctionCall` may be malformed;
/// the agent loop is required to tolerate a parse failure rather than trust it.
#[derive(Debug, Clone)]
pub enum ProviderResponse {
    TextOnly { text: String, usage: TokenUsage },
    FunctionCall {
        name: String,
        arguments_json: String,
        usage: TokenUsage,
    },
    Empty,
}

/// Which tier of model answered a given agent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Fast,
    Deep,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Fast => write!(f, "fast"),
            Mode::Deep => write!(f, "deep"),
        }
    }
}

/// Trait-driven abstraction for a concrete LLM backend. Implementations must be `Send + Sync`
/// so they can be shared across scan tasks via `Arc`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send `messages` plus the available function schemas and return the provider's decision.
    async fn complete(
        &self,
        messages: &[Message],
        available_functions: &[FunctionSchema],
        config: &ProviderConfig,
    ) -> Result<ProviderResponse, OrchestratorError>;

    /// Identifier surfaced in logs and in `model_selected` events, e.g. `"gpt-4.1-nano"`.
    fn model_name(&self) -> &str;
}

/// Maps a transport-level failure (HTTP status, connection error, JSON decode error) onto the
/// provider error taxonomy. Shared by both shipped implementations so status-code handling
/// stays consistent.
pub fn classify_http_error(status: Option<u16>, body_snippet: &str) -> OrchestratorError {
    let kind = match status {
        Some(401) | Some(403) => ProviderErrorKind::InvalidCredential,
        Some(429) => ProviderErrorKind::Quota,
        Some(s) if s >= 500 => ProviderErrorKind::Network,
        None => ProviderErrorKind::Network,
        _ => ProviderErrorKind::Malformed,
    };
    OrchestratorError::provider(kind, body_snippet.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_sums_both_fields() {
        let u = TokenUsage {
            input_tokens: 100,
            output_tokens: 40,
        };
        assert_eq!(u.total(), 140);
    }

    #[test]
    fn classify_http_error_maps_status_codes() {
        assert!(matches!(
            classify_http_error(Some(401), "unauthorized"),
            OrchestratorError::Provider {
                kind: ProviderErrorKind::InvalidCredential,
                ..
            }
        ));
        assert!(matches!(
            classify_http_error(Some(429), "rate limited"),
            OrchestratorError::Provider {
                kind: ProviderErrorKind::Quota,
                ..
            }
        ));
        assert!(matches!(
            classify_http_error(Some(503), "down"),
            OrchestratorError::Provider {
                kind: ProviderErrorKind::Network,
                ..
            }
        ));
        assert!(matches!(
            classify_http_error(Some(400), "bad json"),
            OrchestratorError::Provider {
                kind: ProviderErrorKind::Malformed,
                ..
            }
        ));
    }

    #[test]
    fn mode_display_is_lowercase() {
        assert_eq!(Mode::Fast.to_string(), "fast");
        assert_eq!(Mode::Deep.to_string(), "deep");
    }
}
