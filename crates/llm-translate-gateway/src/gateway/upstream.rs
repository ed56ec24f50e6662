//! OpenAI-compatible chat-completion client.
//!
//! One call per invocation; retry policy belongs to the request handler.

use std::{fmt, time::Duration};

use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::prompt::ChatMessage;

const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {source}")]
    Transport {
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream call timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("upstream returned status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("upstream response is not valid JSON: {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
    },

    #[error("upstream response carried no message content")]
    NoContent,
}

impl UpstreamError {
    fn from_transport(source: reqwest::Error, timeout: Duration) -> Self {
        if source.is_timeout() {
            UpstreamError::Timeout { elapsed: timeout }
        } else {
            UpstreamError::Transport { source }
        }
    }

    /// Coarse classification used when reporting key checks.
    pub fn kind(&self) -> FailureKind {
        match self {
            UpstreamError::Status { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN =>
            {
                FailureKind::InvalidKey
            }
            UpstreamError::Status { status, .. } if *status == StatusCode::NOT_FOUND => {
                FailureKind::UnknownModel
            }
            UpstreamError::Timeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidKey,
    UnknownModel,
    Timeout,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::InvalidKey => "invalid API key",
            FailureKind::UnknownModel => "model not found",
            FailureKind::Timeout => "request timed out",
            FailureKind::Other => "request failed",
        };
        f.write_str(label)
    }
}

/// Token counts reported by the upstream, when present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct Completion {
    /// Raw content of the first choice, before any post-processing.
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Clone, Default)]
pub struct TranslationClient {
    http: Client,
}

impl TranslationClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one chat completion and return the first choice's content.
    pub async fn translate(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        timeout: Duration,
    ) -> Result<Completion, UpstreamError> {
        let url = endpoint(base_url, "chat/completions");
        debug!(%url, model, messages = messages.len(), "sending chat completion");

        let body = ChatRequest { model, messages, temperature };
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| UpstreamError::from_transport(err, timeout))?;

        let bytes = read_success_body(response, timeout).await?;
        let parsed: ChatResponse =
            serde_json::from_slice(&bytes).map_err(|source| UpstreamError::Malformed { source })?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(UpstreamError::NoContent)?;
        Ok(Completion { text, usage: parsed.usage })
    }

    /// List model ids exposed by the upstream (`GET {base}/models`).
    pub async fn list_models(
        &self,
        base_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, UpstreamError> {
        let response = self
            .http
            .get(endpoint(base_url, "models"))
            .bearer_auth(api_key)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| UpstreamError::from_transport(err, timeout))?;

        let bytes = read_success_body(response, timeout).await?;
        let parsed: ModelList =
            serde_json::from_slice(&bytes).map_err(|source| UpstreamError::Malformed { source })?;
        let mut ids: Vec<String> = parsed.data.into_iter().map(|model| model.id).collect();
        ids.sort();
        Ok(ids)
    }
}

async fn read_success_body(
    response: reqwest::Response,
    timeout: Duration,
) -> Result<Vec<u8>, UpstreamError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(UpstreamError::Status {
            status,
            body: body.chars().take(ERROR_BODY_LIMIT).collect(),
        });
    }
    let bytes =
        response.bytes().await.map_err(|err| UpstreamError::from_transport(err, timeout))?;
    Ok(bytes.to_vec())
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim().trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_endpoint_without_double_slash() {
        assert_eq!(
            endpoint("https://api.openai.com/v1/", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(endpoint("http://127.0.0.1:1234/v1", "models"), "http://127.0.0.1:1234/v1/models");
    }

    #[test]
    fn parses_first_choice_and_usage() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "你好"}}, {"message": {"content": "x"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("你好"));
        assert_eq!(parsed.usage, Some(TokenUsage { prompt_tokens: 12, completion_tokens: 3 }));
    }

    #[test]
    fn classifies_failures() {
        let status = |status| UpstreamError::Status { status, body: String::new() };
        assert_eq!(status(StatusCode::UNAUTHORIZED).kind(), FailureKind::InvalidKey);
        assert_eq!(status(StatusCode::NOT_FOUND).kind(), FailureKind::UnknownModel);
        assert_eq!(status(StatusCode::BAD_GATEWAY).kind(), FailureKind::Other);
        assert_eq!(
            UpstreamError::Timeout { elapsed: Duration::from_secs(15) }.kind(),
            FailureKind::Timeout
        );
        assert_eq!(UpstreamError::NoContent.kind(), FailureKind::Other);
    }

    #[test]
    fn serialises_request_body() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let body = ChatRequest { model: "m", messages: &messages, temperature: 0.5 };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["temperature"], 0.5);
    }
}
