use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::codec::{ChatMessage, VisionQuery};
use crate::error::{Result, VisionError};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4-turbo";

/// Sampling temperature for every query. Zero keeps answers reproducible.
pub const TEMPERATURE: f32 = 0.0;

/// Where and how to reach the chat-completions endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// `None` waits for the remote indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            timeout: None,
        }
    }
}

/// `{base}/chat/completions`; a base URL without a path is assumed to mean `/v1`.
pub fn completions_endpoint(base_url: &str) -> String {
    let mut base = base_url.trim().trim_end_matches('/').to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    format!("{}/chat/completions", base.trim_end_matches('/'))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(model: &str, query: &VisionQuery) -> Self {
        Self {
            model: model.to_string(),
            messages: query.messages(),
            temperature: TEMPERATURE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub refusal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// The model's answer, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisionAnswer {
    pub text: String,
    pub usage: Option<Usage>,
}

impl fmt::Display for VisionAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// One request/response exchange with the remote model.
pub trait Transport {
    fn send(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// Blocking HTTP transport speaking the chat-completions protocol.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: HttpClient,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| {
                VisionError::RemoteUnavailable(format!(
                    "failed to build HTTP client: {}",
                    error_chain(&err)
                ))
            })?;
        Ok(Self::from_client(client, config))
    }

    /// Use a preconfigured client (proxies, TLS roots, ...). `config.timeout` is ignored.
    pub fn from_client(client: HttpClient, config: &ClientConfig) -> Self {
        Self {
            client,
            endpoint: completions_endpoint(&config.base_url),
            api_key: config.api_key.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .map_err(|err| VisionError::RemoteUnavailable(error_chain(&err)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_else(|err| {
                format!("failed to read error body: {}", error_chain(&err))
            });
            return Err(VisionError::RemoteRejected {
                status: Some(status.as_u16()),
                message,
            });
        }

        let body = response
            .text()
            .map_err(|err| VisionError::RemoteUnavailable(error_chain(&err)))?;
        serde_json::from_str(&body).map_err(|err| VisionError::RemoteRejected {
            status: Some(status.as_u16()),
            message: format!("unreadable completion response: {err}"),
        })
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Sends one query per call to a fixed model. No retries.
#[derive(Debug, Clone)]
pub struct VisionClient<T = HttpTransport> {
    transport: T,
    model: String,
}

impl VisionClient<HttpTransport> {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self::with_transport(
            HttpTransport::new(config)?,
            config.model.clone(),
        ))
    }
}

impl<T: Transport> VisionClient<T> {
    pub fn with_transport(transport: T, model: impl Into<String>) -> Self {
        Self {
            transport,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The exact request `execute` would send for `query`.
    pub fn request_for(&self, query: &VisionQuery) -> ChatRequest {
        ChatRequest::new(&self.model, query)
    }

    pub fn execute(&self, query: VisionQuery) -> Result<VisionAnswer> {
        let request = self.request_for(&query);
        let started = Instant::now();
        info!(
            model = %self.model,
            question_len = query.question().len(),
            image_payload_len = query.image().payload().len(),
            "sending vision query"
        );

        let response = self.transport.send(&request).map_err(|err| {
            warn!(
                model = %self.model,
                elapsed_ms = started.elapsed().as_millis() as u64,
                err = %err,
                "vision query failed"
            );
            err
        })?;
        let answer = first_answer(response)?;

        info!(
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            answer_len = answer.text.len(),
            prompt_tokens = answer.usage.map(|u| u.prompt_tokens),
            completion_tokens = answer.usage.map(|u| u.completion_tokens),
            "vision query answered"
        );
        Ok(answer)
    }
}

fn first_answer(response: ChatResponse) -> Result<VisionAnswer> {
    let usage = response.usage;
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(VisionError::RemoteRejected {
            status: None,
            message: "response contained no choices".to_string(),
        });
    };

    match choice.message.content {
        Some(text) => Ok(VisionAnswer { text, usage }),
        None => Err(VisionError::RemoteRejected {
            status: None,
            message: choice
                .message
                .refusal
                .unwrap_or_else(|| "first choice has no content".to_string()),
        }),
    }
}
