// src/classify/openai.rs
//! OpenAI chat-completions backend.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{ClassificationBackend, ClassifyError, RawClassification};
use crate::error::truncate_for_log;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ClassifyError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sustainability-ingest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifyError::Transient(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ClassificationsBody {
    classifications: Vec<RawClassification>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

pub fn system_prompt(labels: &[&'static str]) -> String {
    let mut s = String::from(
        "You classify sustainability news articles. Assign the article to one or more of the \
         categories below, using the category names exactly as written. Respond with JSON only: \
         {\"classifications\":[{\"category\":\"<name>\",\"confidence\":<0..1>,\"explanation\":\"<one sentence>\"}]}. \
         Return an empty list when no category applies.\nCategories:\n",
    );
    for l in labels {
        s.push_str("- ");
        s.push_str(l);
        s.push('\n');
    }
    s
}

#[async_trait]
impl ClassificationBackend for OpenAiBackend {
    async fn classify_raw(
        &self,
        content: &str,
        labels: &[&'static str],
    ) -> Result<Vec<RawClassification>, ClassifyError> {
        let sys = system_prompt(labels);
        let req = ChatRequest {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &sys,
                },
                Msg {
                    role: "user",
                    content,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(map_error_status(status, &body, retry_after));
        }
        parse_chat_body(&body)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

fn transport_error(e: reqwest::Error) -> ClassifyError {
    if e.is_timeout() {
        ClassifyError::Transient("request timed out".into())
    } else {
        ClassifyError::Transient(e.to_string())
    }
}

/// Map a non-2xx response to the failure taxonomy, using the error envelope's
/// `type`/`code` when present.
pub fn map_error_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> ClassifyError {
    let env: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let code = env.error.code.as_deref().unwrap_or_default();
    let kind = env.error.kind.as_deref().unwrap_or_default();
    let message = if env.error.message.is_empty() {
        truncate_for_log(body, 200)
    } else {
        env.error.message.clone()
    };

    if status == StatusCode::TOO_MANY_REQUESTS
        || code.starts_with("rate_limit")
        || kind.starts_with("rate_limit")
    {
        return ClassifyError::RateLimited { retry_after };
    }
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) || code == "invalid_api_key" {
        return ClassifyError::Auth { message };
    }
    if status.is_server_error() {
        return ClassifyError::Transient(format!("HTTP {}: {message}", status.as_u16()));
    }
    ClassifyError::Rejected {
        status: status.as_u16(),
        message,
    }
}

/// Extract raw classifications from a chat-completions body. A bare
/// `{"classifications": [...]}` body is accepted as well.
pub fn parse_chat_body(body: &str) -> Result<Vec<RawClassification>, ClassifyError> {
    if let Ok(chat) = serde_json::from_str::<ChatResponse>(body) {
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ClassifyError::Malformed {
                reason: "response has no message content".into(),
                raw: body.to_string(),
            })?;
        return parse_classifications(&content);
    }
    parse_classifications(body)
}

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("static regex"));

/// Parse the model's JSON payload, tolerating a surrounding markdown fence.
pub fn parse_classifications(text: &str) -> Result<Vec<RawClassification>, ClassifyError> {
    let inner = RE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);
    serde_json::from_str::<ClassificationsBody>(inner)
        .map(|b| b.classifications)
        .map_err(|e| ClassifyError::Malformed {
            reason: e.to_string(),
            raw: text.to_string(),
        })
}
