//! Client SDK for the secure chat service.
//!
//! Message contents and key material are encrypted by the caller; this crate
//! moves opaque blobs and never inspects them. It is organized by transport
//! surface:
//! - `api`: HTTP clients for authentication and chat sessions.
//! - `credentials`: the shared bearer credential and per-call injection.
//! - `stream`: the bidirectional message stream and its lifecycle.
//! - `session`: orchestration of the full conversation flow.
//! - `config` and `retry`: shared options, defaults, retry and timeouts.

/// Authentication and chat session clients.
pub mod api;
/// Endpoint and timeout configuration.
pub mod config;
/// Bearer credential store.
pub mod credentials;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Conversation orchestration.
pub mod session;
/// Realtime chat stream client, protocol types, and lifecycle state.
pub mod stream;

pub use api::auth::{AuthError, AuthSessionManager, Identity};
pub use api::chat::{ChatError, ChatSession, ChatSessionClient};
pub use api::{ApiClient, PageRequest};
pub use config::{Endpoint, SessionConfig};
pub use credentials::{Credential, CredentialStore, CredentialValidity};
pub use session::{
    ConversationPlan, ConversationReport, FailureKind, SessionError, SessionOrchestrator,
    SignInFlow,
};
pub use stream::client::{
    Inbound, InboundMessage, OutboundMessage, StreamClient, StreamError, StreamingChannel,
};
pub use stream::proto::{ChatId, MessageId, UserId};
pub use stream::state::StreamState;
