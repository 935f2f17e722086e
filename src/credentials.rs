//! Bearer credential storage and per-call injection.
//!
//! [`CredentialStore`] is the only state shared between concurrent
//! activities. Every authenticated call is built through
//! [`CredentialStore::attach_to`], which refuses to attach a token that is
//! absent or already rejected by the service.

use std::sync::{PoisonError, RwLock};

use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::tungstenite::handshake::client::Request as StreamRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tracing::warn;

use crate::api::auth::AuthError;

/// Access token issued by the service, plus the refresh token when one was
/// issued alongside it.
#[derive(Clone, Debug)]
pub struct Credential {
    access_token: SecretString,
    refresh_token: Option<SecretString>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::new(refresh_token.into()));
        self
    }

    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&SecretString> {
        self.refresh_token.as_ref()
    }

    fn same_access_token(&self, other: &Credential) -> bool {
        self.access_token.expose_secret() == other.access_token.expose_secret()
    }
}

/// Validity of the credential currently held by a [`CredentialStore`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialValidity {
    Absent,
    Valid,
    Rejected,
}

/// An outgoing call that can carry a bearer token.
pub trait BearerCall: Sized {
    fn with_bearer(self, token: &SecretString) -> Result<Self, AuthError>;
}

impl BearerCall for reqwest::RequestBuilder {
    fn with_bearer(self, token: &SecretString) -> Result<Self, AuthError> {
        Ok(self.bearer_auth(token.expose_secret()))
    }
}

impl BearerCall for StreamRequest {
    fn with_bearer(mut self, token: &SecretString) -> Result<Self, AuthError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|_| {
                AuthError::InvalidInput("access token is not a valid header value".to_string())
            })?;
        value.set_sensitive(true);
        self.headers_mut().insert(AUTHORIZATION, value);
        Ok(self)
    }
}

/// A call with the bearer token attached, and the credential it carries.
///
/// Keeping the credential lets the caller reject exactly that token if the
/// service refuses it.
#[derive(Debug)]
pub struct Authorized<C> {
    pub call: C,
    pub credential: Credential,
}

#[derive(Debug)]
struct Slot {
    credential: Option<Credential>,
    validity: CredentialValidity,
}

/// Process-wide holder of the current access token.
#[derive(Debug)]
pub struct CredentialStore {
    slot: RwLock<Slot>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(Slot {
                credential: None,
                validity: CredentialValidity::Absent,
            }),
        }
    }

    /// Replaces the current credential and marks it valid.
    pub fn set(&self, credential: Credential) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.credential = Some(credential);
        slot.validity = CredentialValidity::Valid;
    }

    /// Drops the current credential.
    pub fn clear(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.credential = None;
        slot.validity = CredentialValidity::Absent;
    }

    pub fn validity(&self) -> CredentialValidity {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .validity
    }

    /// Returns the current credential if it is usable.
    pub fn current(&self) -> Result<Credential, AuthError> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        match (&slot.credential, slot.validity) {
            (Some(credential), CredentialValidity::Valid) => Ok(credential.clone()),
            _ => Err(AuthError::NoCredential),
        }
    }

    /// Returns the stored credential whatever its validity. A rejected access
    /// token may still carry a usable refresh token.
    pub fn stored(&self) -> Option<Credential> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .credential
            .clone()
    }

    /// Attaches the current credential to `call` as a bearer token.
    ///
    /// Fails with [`AuthError::NoCredential`] when nothing is set or the
    /// stored token was rejected, so the call is never sent.
    pub fn attach_to<C: BearerCall>(&self, call: C) -> Result<Authorized<C>, AuthError> {
        let credential = self.current()?;
        let call = call.with_bearer(credential.access_token())?;
        Ok(Authorized { call, credential })
    }

    /// Marks the current credential as rejected by the service.
    pub fn mark_rejected(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.credential.is_some() {
            slot.validity = CredentialValidity::Rejected;
            warn!(event = "credential_rejected");
        }
    }

    /// Marks `credential` rejected if it is still the current one.
    ///
    /// A rejection observed for a token that has since been replaced leaves
    /// the newer token untouched. Returns whether the store changed.
    pub fn reject(&self, credential: &Credential) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let is_current = slot
            .credential
            .as_ref()
            .is_some_and(|current| current.same_access_token(credential));
        if is_current && slot.validity == CredentialValidity::Valid {
            slot.validity = CredentialValidity::Rejected;
            warn!(event = "credential_rejected");
            return true;
        }
        false
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
