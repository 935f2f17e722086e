//! End-to-end conversation flow.
//!
//! [`SessionOrchestrator`] wires the clients to one shared
//! [`CredentialStore`] and sequences them: authenticate, create a chat, open
//! the stream, send, half-close, wait for the terminal state within a bound
//! and tear down. It owns the lifecycle timeouts and the auth retry policy;
//! the clients underneath never retry on their own.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::auth::{AuthError, AuthSessionManager, Identity};
use crate::api::chat::{ChatError, ChatSession, ChatSessionClient};
use crate::api::ApiClient;
use crate::config::SessionConfig;
use crate::credentials::{Credential, CredentialStore};
use crate::retry::{retry_async, with_timeout};
use crate::stream::client::{
    InboundMessage, OutboundMessage, StreamClient, StreamError, StreamingChannel,
};
use crate::stream::proto::UserId;
use crate::stream::state::StreamState;

/// Coarse classification of a session failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// The credential is missing, wrong or was rejected.
    Credentials,
    /// The service could not be reached; safe to retry with backoff.
    Network,
    Cancelled,
    /// A lifecycle bound elapsed and the stream was shut down.
    TimedOut,
    InvalidInput,
    Protocol,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("client setup failed: {0}")]
    Setup(String),
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Auth(error) => match error {
                AuthError::InvalidCredentials | AuthError::NoCredential => FailureKind::Credentials,
                AuthError::InvalidInput(_) | AuthError::AlreadyExists(_) => {
                    FailureKind::InvalidInput
                }
                AuthError::Unavailable(_) => FailureKind::Network,
                AuthError::Protocol(_) => FailureKind::Protocol,
            },
            Self::Chat(error) => match error {
                ChatError::Unauthorized | ChatError::NoCredential => FailureKind::Credentials,
                ChatError::InvalidReceiver(_) | ChatError::InvalidInput(_) => {
                    FailureKind::InvalidInput
                }
                ChatError::Unavailable(_) => FailureKind::Network,
                ChatError::Protocol(_) => FailureKind::Protocol,
            },
            Self::Stream(error) => match error {
                StreamError::NoCredential | StreamError::Unauthorized(_) => {
                    FailureKind::Credentials
                }
                StreamError::Cancelled => FailureKind::Cancelled,
                StreamError::ForcedShutdown => FailureKind::TimedOut,
                StreamError::Unavailable(_) => FailureKind::Network,
                StreamError::NotOpen(_) | StreamError::AlreadyOpen | StreamError::Protocol(_) => {
                    FailureKind::Protocol
                }
            },
            Self::Setup(_) => FailureKind::InvalidInput,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Network
    }
}

/// How [`SessionOrchestrator::sign_in`] obtains a credential.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignInFlow {
    Register,
    Login,
    /// Register, then log in. An existing account is not an error.
    RegisterThenLogin,
}

/// Inputs for one full conversation run.
#[derive(Clone, Debug)]
pub struct ConversationPlan {
    pub identity: Identity,
    pub flow: SignInFlow,
    pub receiver_id: UserId,
    pub sender_encrypted_key: Vec<u8>,
    pub receiver_encrypted_key: Vec<u8>,
    /// Ciphertexts sent in order on the stream.
    pub messages: Vec<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct ConversationReport {
    pub chat: ChatSession,
    /// Messages handed to the stream before half-close.
    pub sent: usize,
    /// Terminal state the stream ended in.
    pub state: StreamState,
}

/// Entry point for the whole chat flow.
#[derive(Debug)]
pub struct SessionOrchestrator {
    credentials: Arc<CredentialStore>,
    auth: AuthSessionManager,
    chats: ChatSessionClient,
    streams: StreamClient,
    config: SessionConfig,
}

impl SessionOrchestrator {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let api = ApiClient::with_options(config.endpoint.clone(), config.api.clone())
            .map_err(|err| SessionError::Setup(err.to_string()))?;
        let credentials = Arc::new(CredentialStore::new());
        let streams = StreamClient::new(config.endpoint.clone(), Arc::clone(&credentials))
            .with_options(config.stream.clone());

        Ok(Self {
            auth: AuthSessionManager::new(api.clone()),
            chats: ChatSessionClient::new(api, Arc::clone(&credentials)),
            streams,
            credentials,
            config,
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn auth(&self) -> &AuthSessionManager {
        &self.auth
    }

    pub fn chats(&self) -> &ChatSessionClient {
        &self.chats
    }

    pub fn streams(&self) -> &StreamClient {
        &self.streams
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Obtains a credential and installs it in the store.
    ///
    /// Only [`AuthError::Unavailable`] is retried, per the configured
    /// policy. On failure the store is left as it was.
    pub async fn sign_in(
        &self,
        identity: &Identity,
        flow: SignInFlow,
    ) -> Result<Credential, SessionError> {
        let credential = match flow {
            SignInFlow::Register => self.register(identity).await?,
            SignInFlow::Login => self.login(identity).await?,
            SignInFlow::RegisterThenLogin => {
                match self.register(identity).await {
                    Ok(_) => {}
                    Err(AuthError::AlreadyExists(detail)) => {
                        debug!(event = "account_exists", name = %identity.name, detail = %detail);
                    }
                    Err(err) => return Err(err.into()),
                }
                self.login(identity).await?
            }
        };

        self.credentials.set(credential.clone());
        info!(event = "signed_in", name = %identity.name, flow = ?flow);
        Ok(credential)
    }

    /// Exchanges the stored refresh token for a new credential.
    ///
    /// Works on a rejected access token too. An [`AuthError::InvalidCredentials`]
    /// answer clears the store.
    pub async fn refresh(&self) -> Result<Credential, SessionError> {
        let current = self.credentials.stored().ok_or(AuthError::NoCredential)?;
        match self.auth.refresh(&current).await {
            Ok(credential) => {
                self.credentials.set(credential.clone());
                info!(event = "credential_refreshed");
                Ok(credential)
            }
            Err(AuthError::InvalidCredentials) => {
                self.credentials.clear();
                Err(AuthError::InvalidCredentials.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Revokes the stored refresh token and clears the store.
    ///
    /// The store is cleared even when the service call fails.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let Some(current) = self.credentials.stored() else {
            return Ok(());
        };
        let revoked = match current.refresh_token() {
            Some(_) => self.auth.logout(&current).await,
            None => Ok(()),
        };
        self.credentials.clear();
        info!(event = "signed_out");
        revoked.map_err(SessionError::from)
    }

    pub async fn create_chat(
        &self,
        receiver_id: UserId,
        sender_encrypted_key: &[u8],
        receiver_encrypted_key: &[u8],
    ) -> Result<ChatSession, SessionError> {
        let chat = self
            .chats
            .create_chat(receiver_id, sender_encrypted_key, receiver_encrypted_key)
            .await?;
        Ok(chat)
    }

    /// Opens a stream bound to the current credential.
    pub async fn open_stream(&self) -> Result<StreamingChannel, SessionError> {
        Ok(self.streams.open().await?)
    }

    /// Half-closes `channel` if it is still open and waits for its terminal
    /// state. The half-close and the wait share one bound; if it elapses
    /// the stream is shut down with [`StreamError::ForcedShutdown`]. The
    /// transport is torn down in every case before this returns.
    pub async fn finish_stream(&self, channel: &mut StreamingChannel) -> Result<(), SessionError> {
        let bound = self.config.await_terminal_timeout;
        let grace = self.config.shutdown_grace;

        let view: &StreamingChannel = channel;
        let waited = with_timeout(bound, async move {
            if view.state() == StreamState::Open {
                if let Err(err) = view.half_close().await {
                    debug!(event = "half_close_skipped", error = %err);
                }
            }
            view.wait_terminal().await
        })
        .await;
        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    event = "stream_terminal_wait_elapsed",
                    timeout_ms = bound.as_millis() as u64
                );
                channel.force_shutdown(grace).await
            }
        };

        // Terminal by now, so this only joins the transport tasks.
        let _ = channel.close(grace).await;
        outcome.map_err(SessionError::from)
    }

    /// Runs one conversation from sign-in to teardown.
    ///
    /// `handler` receives every inbound message in arrival order on a
    /// blocking-pool thread, so it may block.
    pub async fn run<F>(
        &self,
        plan: ConversationPlan,
        handler: F,
    ) -> Result<ConversationReport, SessionError>
    where
        F: FnMut(InboundMessage) + Send + 'static,
    {
        self.sign_in(&plan.identity, plan.flow).await?;
        let chat = self
            .create_chat(
                plan.receiver_id,
                &plan.sender_encrypted_key,
                &plan.receiver_encrypted_key,
            )
            .await?;

        let mut channel = self.open_stream().await?;
        let mut delivery = channel.take_inbound().map(|inbound| inbound.dispatch(handler));

        let mut sent = 0;
        for content in plan.messages {
            if let Err(err) = channel.send(OutboundMessage::new(chat.id, content)).await {
                let cause = match channel.close(self.config.shutdown_grace).await {
                    Err(cause) => cause,
                    Ok(()) => err,
                };
                return Err(cause.into());
            }
            sent += 1;
        }

        let outcome = self.finish_stream(&mut channel).await;
        if let Some(task) = delivery.as_mut() {
            if with_timeout(self.config.shutdown_grace, &mut *task).await.is_err() {
                task.abort();
            }
        }
        outcome?;

        info!(event = "conversation_finished", chat_id = chat.id.0, sent);
        Ok(ConversationReport {
            chat,
            sent,
            state: channel.state(),
        })
    }

    async fn register(&self, identity: &Identity) -> Result<Credential, AuthError> {
        retry_async(
            &self.config.auth_retry,
            |_| {
                self.auth
                    .register(&identity.name, &identity.password, &identity.public_key)
            },
            AuthError::is_retryable,
        )
        .await
    }

    async fn login(&self, identity: &Identity) -> Result<Credential, AuthError> {
        retry_async(
            &self.config.auth_retry,
            |_| self.auth.login(&identity.name, &identity.password),
            AuthError::is_retryable,
        )
        .await
    }
}
