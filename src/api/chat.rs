//! Chat session creation and the authenticated read endpoints.
//!
//! Every call here carries the bearer token from the [`CredentialStore`].
//! A 401 from the service marks that token rejected, so later calls fail
//! fast with [`ChatError::NoCredential`] instead of repeating the request.

use std::sync::Arc;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::auth::AuthError;
use crate::api::{ApiClient, ApiFailure, PageRequest};
use crate::credentials::CredentialStore;
use crate::stream::proto::{base64_bytes, ChatId, MessageId, UserId};

#[derive(Debug, Error)]
pub enum ChatError {
    /// The service rejected the credential; it is now marked rejected.
    #[error("credential rejected by the chat service")]
    Unauthorized,

    #[error("no valid credential; sign in first")]
    NoCredential,

    #[error("invalid receiver: {0}")]
    InvalidReceiver(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("chat service unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected chat response: {0}")]
    Protocol(String),
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<AuthError> for ChatError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::NoCredential | AuthError::InvalidCredentials => Self::NoCredential,
            AuthError::InvalidInput(detail) => Self::InvalidInput(detail),
            AuthError::Unavailable(detail) => Self::Unavailable(detail),
            AuthError::AlreadyExists(detail) | AuthError::Protocol(detail) => {
                Self::Protocol(detail)
            }
        }
    }
}

/// A chat between the signed-in user and one counterpart, with both
/// parties' encrypted copies of the symmetric key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: ChatId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(with = "base64_bytes")]
    pub sender_encrypted_aes_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub receiver_encrypted_aes_key: Vec<u8>,
}

/// A message as persisted by the service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    #[serde(with = "base64_bytes")]
    pub aes_encrypted_content: Vec<u8>,
}

/// Directory entry for a registered user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
}

#[derive(Serialize)]
struct CreateChatRequest<'a> {
    receiver_id: UserId,
    #[serde(serialize_with = "base64_bytes::serialize")]
    sender_encrypted_aes_key: &'a [u8],
    #[serde(serialize_with = "base64_bytes::serialize")]
    receiver_encrypted_aes_key: &'a [u8],
}

#[derive(Deserialize)]
struct ChatsPage {
    chats: Vec<ChatSession>,
}

#[derive(Deserialize)]
struct MessagesPage {
    messages: Vec<StoredMessage>,
}

#[derive(Deserialize)]
struct UsersPage {
    users: Vec<UserProfile>,
}

#[derive(Clone, Copy)]
enum ChatCall {
    Create,
    Read,
}

/// Client for chat session endpoints.
///
/// Sessions are returned to the caller and never cached here.
#[derive(Clone, Debug)]
pub struct ChatSessionClient {
    api: ApiClient,
    credentials: Arc<CredentialStore>,
}

impl ChatSessionClient {
    pub fn new(api: ApiClient, credentials: Arc<CredentialStore>) -> Self {
        Self { api, credentials }
    }

    /// Creates a chat with `receiver_id` using pre-exchanged key material.
    ///
    /// The receiver is validated by the service, the key blobs only locally
    /// for being non-empty.
    pub async fn create_chat(
        &self,
        receiver_id: UserId,
        sender_encrypted_key: &[u8],
        receiver_encrypted_key: &[u8],
    ) -> Result<ChatSession, ChatError> {
        if sender_encrypted_key.is_empty() || receiver_encrypted_key.is_empty() {
            return Err(ChatError::InvalidInput(
                "encrypted key blobs must not be empty".to_string(),
            ));
        }

        let body = CreateChatRequest {
            receiver_id,
            sender_encrypted_aes_key: sender_encrypted_key,
            receiver_encrypted_aes_key: receiver_encrypted_key,
        };
        let chat: ChatSession = self
            .send(ChatCall::Create, self.api.post("/v1/chats").json(&body))
            .await?;
        debug!(event = "chat_created", chat_id = chat.id.0, receiver_id = receiver_id.0);
        Ok(chat)
    }

    /// Lists chats the signed-in user takes part in.
    pub async fn list_chats(&self, page: PageRequest) -> Result<Vec<ChatSession>, ChatError> {
        let request = self.api.get("/v1/chats").query(&page);
        let page: ChatsPage = self.send(ChatCall::Read, request).await?;
        Ok(page.chats)
    }

    /// Fetches stored messages of one chat, oldest first.
    pub async fn message_history(
        &self,
        chat_id: ChatId,
        page: PageRequest,
    ) -> Result<Vec<StoredMessage>, ChatError> {
        let path = format!("/v1/chats/{chat_id}/messages");
        let request = self.api.get(&path).query(&page);
        let page: MessagesPage = self.send(ChatCall::Read, request).await?;
        Ok(page.messages)
    }

    /// Lists registered users with their public keys.
    pub async fn list_users(&self, page: PageRequest) -> Result<Vec<UserProfile>, ChatError> {
        let request = self.api.get("/v1/users").query(&page);
        let page: UsersPage = self.send(ChatCall::Read, request).await?;
        Ok(page.users)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        call: ChatCall,
        request: RequestBuilder,
    ) -> Result<T, ChatError> {
        let authorized = self.credentials.attach_to(request)?;
        match self.api.execute(authorized.call).await {
            Ok(value) => Ok(value),
            Err(failure) => {
                let error = classify(call, failure);
                if matches!(error, ChatError::Unauthorized) {
                    self.credentials.reject(&authorized.credential);
                    warn!(event = "chat_call_unauthorized");
                }
                Err(error)
            }
        }
    }
}

fn classify(call: ChatCall, failure: ApiFailure) -> ChatError {
    if failure.is_transient() {
        return ChatError::Unavailable(failure.describe());
    }

    let (status, detail) = match failure {
        ApiFailure::Status { status, detail } => (status, detail),
        other => return ChatError::Protocol(other.describe()),
    };

    match (call, status) {
        (_, StatusCode::UNAUTHORIZED) => ChatError::Unauthorized,
        (ChatCall::Create, StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY) => {
            ChatError::InvalidReceiver(detail)
        }
        (_, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY) => {
            ChatError::InvalidInput(detail)
        }
        (_, status) => ChatError::Protocol(format!("http status {status}: {detail}")),
    }
}
