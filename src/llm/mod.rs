use std::{env, fmt};

use anyhow::{Context, Result, anyhow, bail};
use reqwest::Client;
use serde::Deserialize;

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Enumerates the supported LLM backends behind the shared utility.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LlmProvider {
    Gemini,
    OpenRouter,
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::Gemini => write!(f, "gemini"),
            LlmProvider::OpenRouter => write!(f, "openrouter"),
        }
    }
}

/// Defines the shape of a chat-style interaction with an LLM.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
        }
    }
}

/// Individual chat message, compatible with OpenAI compliant providers.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub text: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Supported chat roles passed to providers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageRole {
    System,
    User,
}

impl MessageRole {
    fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
        }
    }
}

/// Captures basic token usage metrics associated with a call.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub response_tokens: usize,
    pub total_tokens: usize,
}

/// Full response surface returned to callers.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub token_usage: TokenUsage,
    pub provider: LlmProvider,
    pub model: String,
}

/// Main entry point for invoking providers.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

#[derive(Clone, Default)]
struct LlmConfig {
    gemini_api_key: Option<String>,
    openrouter_api_key: Option<String>,
    openrouter_referer: Option<String>,
    openrouter_title: Option<String>,
}

impl LlmClient {
    /// Build a client using environment variables. Blank keys count as absent.
    pub fn from_env() -> Result<Self> {
        let read = |name: &str| {
            env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Ok(Self {
            http: Client::new(),
            config: LlmConfig {
                gemini_api_key: read("GEMINI_API_KEY"),
                openrouter_api_key: read("OPENROUTER_API_KEY"),
                openrouter_referer: read("OPENROUTER_HTTP_REFERER"),
                openrouter_title: read("OPENROUTER_X_TITLE"),
            },
        })
    }

    /// A client with no credentials; every provider reports as unconfigured.
    pub fn disabled() -> Self {
        Self {
            http: Client::new(),
            config: LlmConfig::default(),
        }
    }

    /// Whether a credential exists for the provider encoded in `model`.
    pub fn is_configured_for(&self, model: &str) -> bool {
        match parse_model_provider(model) {
            Ok((LlmProvider::Gemini, _)) => self.config.gemini_api_key.is_some(),
            Ok((LlmProvider::OpenRouter, _)) => self.config.openrouter_api_key.is_some(),
            Err(_) => false,
        }
    }

    /// Execute a request against the provider encoded in the model name.
    pub async fn execute(&self, request: LlmRequest) -> Result<LlmResponse> {
        let model = request.model.clone();
        let (provider, provider_model) = parse_model_provider(&model)?;

        match provider {
            LlmProvider::Gemini => self.execute_gemini(provider_model, request).await,
            LlmProvider::OpenRouter => self.execute_openrouter(provider_model, request).await,
        }
    }

    async fn execute_gemini(&self, model: &str, request: LlmRequest) -> Result<LlmResponse> {
        let Some(api_key) = self.config.gemini_api_key.as_ref() else {
            bail!("GEMINI_API_KEY is not configured but required for Gemini requests");
        };

        let payload = build_gemini_payload(&request.messages);
        let response = self
            .http
            .post(format!("{GEMINI_ENDPOINT}/{model}:generateContent"))
            .header("x-goog-api-key", api_key)
            .json(&payload)
            .send()
            .await?;

        let body = read_json_body(response, LlmProvider::Gemini).await?;
        let (text, usage) = extract_gemini_text_and_usage(&body)
            .ok_or_else(|| anyhow!("unexpected Gemini response payload: {}", body))?;

        Ok(LlmResponse {
            token_usage: finalize_usage(usage, &request.messages, &text),
            text,
            provider: LlmProvider::Gemini,
            model: model.to_string(),
        })
    }

    async fn execute_openrouter(&self, model: &str, request: LlmRequest) -> Result<LlmResponse> {
        let Some(api_key) = self.config.openrouter_api_key.as_ref() else {
            bail!("OPENROUTER_API_KEY is not configured but required for OpenRouter requests");
        };

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role.as_str(),
                    "content": msg.text,
                })
            })
            .collect();

        let payload = serde_json::json!({
            "model": model,
            "messages": messages,
        });

        let mut req_builder = self
            .http
            .post(OPENROUTER_ENDPOINT)
            .bearer_auth(api_key)
            .json(&payload);

        if let Some(referer) = &self.config.openrouter_referer {
            req_builder = req_builder.header("HTTP-Referer", referer);
        }

        if let Some(title) = &self.config.openrouter_title {
            req_builder = req_builder.header("X-Title", title);
        }

        let response = req_builder.send().await?;
        let body = read_json_body(response, LlmProvider::OpenRouter).await?;
        let (text, usage) = extract_chat_text_and_usage(&body)
            .ok_or_else(|| anyhow!("unexpected OpenRouter response payload: {}", body))?;

        Ok(LlmResponse {
            token_usage: finalize_usage(usage, &request.messages, &text),
            text,
            provider: LlmProvider::OpenRouter,
            model: model.to_string(),
        })
    }
}

async fn read_json_body(
    response: reqwest::Response,
    provider: LlmProvider,
) -> Result<serde_json::Value> {
    let status = response.status();
    let response_text = response.text().await.context("failed to read response body")?;
    let body: serde_json::Value = serde_json::from_str(&response_text).with_context(|| {
        let preview: String = response_text.chars().take(500).collect();
        format!("failed to parse {provider} response as JSON. Response body: {preview}")
    })?;
    if !status.is_success() {
        bail!("{provider} call failed with status {status}: {body}");
    }
    Ok(body)
}

/// System messages become Gemini's `systemInstruction`; the rest map to `contents`.
fn build_gemini_payload(messages: &[ChatMessage]) -> serde_json::Value {
    let system_text = messages
        .iter()
        .filter(|msg| msg.role == MessageRole::System)
        .map(|msg| msg.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let contents: Vec<serde_json::Value> = messages
        .iter()
        .filter(|msg| msg.role != MessageRole::System)
        .map(|msg| {
            serde_json::json!({
                "role": "user",
                "parts": [{ "text": msg.text }],
            })
        })
        .collect();

    let mut payload = serde_json::json!({ "contents": contents });
    if !system_text.is_empty() {
        payload["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system_text }] });
    }
    payload
}

fn finalize_usage(usage: Option<TokenUsage>, messages: &[ChatMessage], text: &str) -> TokenUsage {
    let prompt_tokens = approximate_token_count(
        &messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    );

    let mut token_usage = usage.unwrap_or_default();
    if token_usage.prompt_tokens == 0 {
        token_usage.prompt_tokens = prompt_tokens;
    }
    if token_usage.response_tokens == 0 {
        token_usage.response_tokens = approximate_token_count(text);
    }
    token_usage.total_tokens = token_usage.prompt_tokens + token_usage.response_tokens;
    token_usage
}

fn extract_gemini_text_and_usage(
    value: &serde_json::Value,
) -> Option<(String, Option<TokenUsage>)> {
    let payload = serde_json::from_value::<GeminiPayload>(value.clone()).ok()?;
    let candidate = payload.candidates.into_iter().next()?;
    let text = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default();

    let usage = payload.usage_metadata.map(|usage| TokenUsage {
        prompt_tokens: usage.prompt_token_count.unwrap_or_default(),
        response_tokens: usage.candidates_token_count.unwrap_or_default(),
        total_tokens: usage.total_token_count.unwrap_or_default(),
    });

    Some((text, usage))
}

/// Extract assistant text and optional usage metrics from a Chat Completions payload.
fn extract_chat_text_and_usage(value: &serde_json::Value) -> Option<(String, Option<TokenUsage>)> {
    let chat = serde_json::from_value::<OpenAiChatCompletionPayload>(value.clone()).ok()?;
    if chat.choices.is_empty() {
        return None;
    }
    let text = chat
        .choices
        .into_iter()
        .find_map(|choice| choice.message.content)
        .unwrap_or_default();

    let usage = chat.usage.map(|usage| TokenUsage {
        prompt_tokens: usage.prompt_tokens.unwrap_or_default(),
        response_tokens: usage.completion_tokens.unwrap_or_default(),
        total_tokens: usage.total_tokens.unwrap_or_default(),
    });

    Some((text, usage))
}

pub fn parse_model_provider(model: &str) -> Result<(LlmProvider, &str)> {
    let (provider, name) = model.split_once('/').ok_or_else(|| {
        anyhow!("model must be prefixed with provider, e.g. 'gemini/gemini-2.0-flash'")
    })?;

    if name.trim().is_empty() {
        bail!("model name is required after provider prefix");
    }

    match provider {
        "gemini" => Ok((LlmProvider::Gemini, name)),
        "openrouter" => Ok((LlmProvider::OpenRouter, name)),
        other => bail!("unsupported provider prefix: {other}"),
    }
}

fn approximate_token_count(input: &str) -> usize {
    input.split_whitespace().count()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPayload {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: Option<usize>,
    #[serde(default)]
    candidates_token_count: Option<usize>,
    #[serde(default)]
    total_token_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatCompletionPayload {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
    #[serde(default)]
    total_tokens: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_prefix_is_required() {
        assert_eq!(
            parse_model_provider("gemini/gemini-2.0-flash").unwrap(),
            (LlmProvider::Gemini, "gemini-2.0-flash")
        );
        assert_eq!(
            parse_model_provider("openrouter/openai/gpt-4o").unwrap(),
            (LlmProvider::OpenRouter, "openai/gpt-4o")
        );
        assert!(parse_model_provider("gpt-4o").is_err());
        assert!(parse_model_provider("gemini/ ").is_err());
        assert!(parse_model_provider("poe/claude").is_err());
    }

    #[test]
    fn disabled_client_is_not_configured_for_any_model() {
        let client = LlmClient::disabled();
        assert!(!client.is_configured_for("gemini/gemini-2.0-flash"));
        assert!(!client.is_configured_for("openrouter/openai/gpt-4o"));
        assert!(!client.is_configured_for("not-a-model"));
    }

    #[tokio::test]
    async fn disabled_client_fails_without_network() {
        let client = LlmClient::disabled();
        let request = LlmRequest::new(
            "gemini/gemini-2.0-flash",
            vec![ChatMessage::new(MessageRole::User, "hello")],
        );
        let err = client.execute(request).await.unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn gemini_payload_splits_system_instruction() {
        let payload = build_gemini_payload(&[
            ChatMessage::new(MessageRole::System, "grade fairly"),
            ChatMessage::new(MessageRole::User, "essay"),
        ]);
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "grade fairly");
        assert_eq!(payload["contents"][0]["role"], "user");
        assert_eq!(payload["contents"][0]["parts"][0]["text"], "essay");
        assert_eq!(payload["contents"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn gemini_response_text_and_usage_are_extracted() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"score\": " }, { "text": "80}" }] }
            }],
            "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 4, "totalTokenCount": 16 }
        });
        let (text, usage) = extract_gemini_text_and_usage(&body).unwrap();
        assert_eq!(text, "{\"score\": 80}");
        assert_eq!(
            usage,
            Some(TokenUsage {
                prompt_tokens: 12,
                response_tokens: 4,
                total_tokens: 16
            })
        );
    }

    #[test]
    fn gemini_response_without_candidates_is_rejected() {
        assert!(extract_gemini_text_and_usage(&json!({ "candidates": [] })).is_none());
    }

    #[test]
    fn chat_completion_text_is_extracted() {
        let body = json!({
            "choices": [{ "message": { "content": "hi there" } }],
        });
        let (text, usage) = extract_chat_text_and_usage(&body).unwrap();
        assert_eq!(text, "hi there");
        assert!(usage.is_none());

        let usage = finalize_usage(usage, &[ChatMessage::new(MessageRole::User, "a b c")], &text);
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.response_tokens, 2);
        assert_eq!(usage.total_tokens, 5);
    }
}
