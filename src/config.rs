//! Endpoint and tuning options shared by the SDK clients.
//!
//! Every bound the session lifecycle relies on lives here as a default that
//! callers can override.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Host used when no endpoint is configured.
pub const DEFAULT_HOST: &str = "localhost";
/// Port used when no endpoint is configured.
pub const DEFAULT_PORT: u16 = 5000;
/// Path of the bidirectional chat stream.
pub const STREAM_PATH: &str = "/v1/chat/stream";

/// Default values for client and session options.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    /// Bound on waiting for a terminal stream state after half-close.
    pub const AWAIT_TERMINAL_TIMEOUT: Duration = Duration::from_secs(60);
    /// Bound on a forced shutdown after close was requested.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
    pub const AUTH_MAX_ATTEMPTS: usize = 3;
    pub const AUTH_BACKOFF: Duration = Duration::from_millis(200);
    pub const AUTH_MAX_BACKOFF: Duration = Duration::from_secs(2);
    pub const AUTH_JITTER: Duration = Duration::from_millis(50);
}

/// Location of the chat service.
///
/// One host/port pair serves both the HTTP calls and the stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Use `https`/`wss` instead of plaintext transport.
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().trim().to_string(),
            port,
            secure: false,
        }
    }

    pub fn local() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }

    pub fn with_tls(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Full URL for an HTTP path on this endpoint.
    pub fn http_url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }

    /// Full URL for a WebSocket path on this endpoint.
    pub fn ws_url(&self, path: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::local()
    }
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SessionDefaults::CONNECT_TIMEOUT,
            request_timeout: SessionDefaults::REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Bound on connecting and receiving the server greeting.
    pub handshake_timeout: Duration,
    /// Maximum number of queued outbound messages.
    ///
    /// `None` keeps the queue unbounded so `send` never waits; with a bound,
    /// `send` waits for room in the queue.
    pub outbound_capacity: Option<usize>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: SessionDefaults::HANDSHAKE_TIMEOUT,
            outbound_capacity: None,
        }
    }
}

/// Configuration for a [`crate::session::SessionOrchestrator`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub api: ApiClientOptions,
    pub stream: StreamOptions,
    pub await_terminal_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Retry policy for auth calls that fail with a transient error.
    pub auth_retry: RetryPolicy,
}

impl SessionConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    pub fn with_await_terminal_timeout(mut self, timeout: Duration) -> Self {
        self.await_terminal_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_stream_options(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_auth_retry(mut self, policy: RetryPolicy) -> Self {
        self.auth_retry = policy;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            api: ApiClientOptions::default(),
            stream: StreamOptions::default(),
            await_terminal_timeout: SessionDefaults::AWAIT_TERMINAL_TIMEOUT,
            shutdown_grace: SessionDefaults::SHUTDOWN_GRACE,
            auth_retry: RetryPolicy {
                max_attempts: SessionDefaults::AUTH_MAX_ATTEMPTS,
                initial_backoff: SessionDefaults::AUTH_BACKOFF,
                max_backoff: SessionDefaults::AUTH_MAX_BACKOFF,
                jitter: SessionDefaults::AUTH_JITTER,
            },
        }
    }
}
