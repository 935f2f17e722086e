//! HTTP clients for the request/response surfaces of the chat service.
//!
//! - `auth`: registration, login, token refresh and logout.
//! - `chat`: chat session creation, chat listing, message history and the
//!   user directory.

/// Account authentication.
pub mod auth;
/// Chat sessions and the user directory.
pub mod chat;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{ApiClientOptions, Endpoint};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Shared HTTP transport for the unary service calls.
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: Client,
    endpoint: Endpoint,
    options: ApiClientOptions,
}

impl ApiClient {
    pub fn new(endpoint: Endpoint) -> Result<Self, reqwest::Error> {
        Self::with_options(endpoint, ApiClientOptions::default())
    }

    pub fn with_options(
        endpoint: Endpoint,
        options: ApiClientOptions,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint,
            options,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(self.endpoint.http_url(path))
            .timeout(self.options.request_timeout)
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(self.endpoint.http_url(path))
            .timeout(self.options.request_timeout)
    }

    pub(crate) async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ApiFailure> {
        let response = request.send().await.map_err(ApiFailure::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiFailure::Transport)?;

        if !status.is_success() {
            return Err(ApiFailure::Status {
                status,
                detail: summarize_error_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|err| ApiFailure::Parse(err.to_string()))
    }
}

/// Cursor paging for list calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    /// Return items after this id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_id: Option<u64>,
}

impl PageRequest {
    pub fn first(page_size: u32) -> Self {
        Self {
            page_size: Some(page_size),
            last_id: None,
        }
    }

    pub fn after(mut self, last_id: u64) -> Self {
        self.last_id = Some(last_id);
        self
    }
}

/// Raw outcome of a failed HTTP call, before a surface classifies it.
#[derive(Debug)]
pub(crate) enum ApiFailure {
    Transport(reqwest::Error),
    Status { status: StatusCode, detail: String },
    Parse(String),
}

impl ApiFailure {
    /// Transport failures, throttling and server errors.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Transport(err) => format!("request failed: {err}"),
            Self::Status { status, detail } => format!("http status {status}: {detail}"),
            Self::Parse(detail) => format!("failed to parse response: {detail}"),
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.detail) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
