//! HTTP client for the conversational-AI backend.
//!
//! The backend exposes a blocking chat endpoint: one request with the
//! query and an optional conversation id, one response with the answer
//! and the (possibly new) conversation id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// One chat call to the backend.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub query: String,
    /// Opaque per-user label the backend uses to scope conversations.
    pub user: String,
    /// Continuation token from an earlier reply, empty for a fresh start.
    pub conversation_token: String,
}

/// Backend reply.
#[derive(Debug, Clone)]
pub struct AiReply {
    pub answer: String,
    pub conversation_token: String,
}

#[derive(Debug)]
pub enum AiError {
    Http(String),
    Api { status: u16, body: String },
    Parse(String),
}

impl AiError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            AiError::Http(_) => true,
            AiError::Api { status, .. } => *status >= 500,
            AiError::Parse(_) => false,
        }
    }
}

impl fmt::Display for AiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AiError::Http(e) => write!(f, "HTTP error: {e}"),
            AiError::Api { status, body } => write!(f, "API error {status}: {body}"),
            AiError::Parse(e) => write!(f, "Parse error: {e}"),
        }
    }
}

impl std::error::Error for AiError {}

/// Seam for the AI backend so tests can inject a scripted double.
pub trait AiBackend: Send + Sync + 'static {
    fn chat(&self, request: AiRequest) -> impl Future<Output = Result<AiReply, AiError>> + Send;
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    query: &'a str,
    user: &'a str,
    conversation_id: &'a str,
    response_mode: &'static str,
}

#[derive(Deserialize)]
struct ApiResponse {
    answer: String,
    #[serde(default)]
    conversation_id: String,
}

/// Production client over HTTP.
pub struct AiClient {
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
}

impl AiClient {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::new(),
        }
    }
}

impl AiBackend for AiClient {
    fn chat(&self, request: AiRequest) -> impl Future<Output = Result<AiReply, AiError>> + Send {
        async move {
            let body = ApiRequest {
                query: &request.query,
                user: &request.user,
                conversation_id: &request.conversation_token,
                response_mode: "blocking",
            };

            let response = self
                .http
                .post(format!("{}/chat-messages", self.endpoint))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| AiError::Http(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(AiError::Api { status, body });
            }

            let api_response: ApiResponse = response
                .json()
                .await
                .map_err(|e| AiError::Parse(e.to_string()))?;

            Ok(AiReply {
                answer: api_response.answer,
                conversation_token: api_response.conversation_id,
            })
        }
    }
}
