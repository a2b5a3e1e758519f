//! Wire format and transport helpers shared by the fast and deep providers.

use crate::error::OrchestratorError;
use crate::provider::{classify_http_error, FunctionSchema, Message, ProviderConfig, ProviderResponse, Role, TokenUsage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub(crate) fn build_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(120))
        .build()
        .expect("failed to build reqwest client")
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize)]
pub(crate) struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    functions: Vec<WireFunction<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    function_call: &'static str,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
    function_call: Option<ChatFunctionCall>,
}

#[derive(Deserialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Issue a chat-completions-style request to `base_url` with model `model`, returning a
/// [`ProviderResponse`]. Shared by both shipped `Provider` implementations.
pub(crate) async fn complete(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    messages: &[Message],
    available_functions: &[FunctionSchema],
    config: &ProviderConfig,
) -> Result<ProviderResponse, OrchestratorError> {
    let wire_messages: Vec<WireMessage> = messages
        .iter()
        .map(|m| WireMessage {
            role: role_str(m.role),
            content: &m.content,
        })
        .collect();
    let wire_functions: Vec<WireFunction> = available_functions
        .iter()
        .map(|f| WireFunction {
            name: &f.name,
            description: &f.description,
            parameters: &f.parameters_schema,
        })
        .collect();

    let request = ChatRequest {
        model,
        messages: wire_messages,
        functions: wire_functions,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        stop: config.stop_sequences.clone(),
        function_call: if config.force_function_call { "required" } else { "auto" },
    };

    let response = client
        .post(format!("{}/chat/completions", base_url))
        .bearer_auth(api_key)
        .json(&request)
        .send()
        .await
        .map_err(|e| classify_http_error(e.status().map(|s| s.as_u16()), &e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_http_error(Some(status.as_u16()), &body));
    }

    let body: ChatResponse = response
        .json()
        .await
        .map_err(|e| classify_http_error(None, &e.to_string()))?;

    let usage = body
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    let Some(choice) = body.choices.into_iter().next() else {
        return Ok(ProviderResponse::Empty);
    };

    if let Some(call) = choice.message.function_call {
        return Ok(ProviderResponse::FunctionCall {
            name: call.name,
            arguments_json: call.arguments,
            usage,
        });
    }

    match choice.message.content {
        Some(text) if !text.is_empty() => Ok(ProviderResponse::TextOnly { text, usage }),
        _ => Ok(ProviderResponse::Empty),
    }
}
