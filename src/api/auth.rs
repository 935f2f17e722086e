//! Registration, login, token refresh and logout.
//!
//! [`AuthSessionManager`] never writes to the credential store; the caller
//! decides whether to adopt a returned [`Credential`]. It never retries
//! either. Transient failures surface as [`AuthError::Unavailable`] and
//! the retry policy belongs to the caller.

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::api::{ApiClient, ApiFailure};
use crate::credentials::Credential;
use crate::stream::proto::base64_bytes;

/// User-chosen account details used to register or sign in.
#[derive(Clone, Debug)]
pub struct Identity {
    pub name: String,
    pub password: SecretString,
    /// Opaque public key blob published with the account.
    pub public_key: Vec<u8>,
}

impl Identity {
    pub fn new(
        name: impl Into<String>,
        password: impl Into<String>,
        public_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            password: SecretString::new(password.into()),
            public_key: public_key.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("user already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    /// No usable credential is stored, or the stored one was rejected.
    #[error("no valid credential; sign in first")]
    NoCredential,

    #[error("auth service unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected auth response: {0}")]
    Protocol(String),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    password: &'a str,
    #[serde(serialize_with = "base64_bytes::serialize")]
    public_key: &'a [u8],
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshTokenRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogoutResponse {
    #[serde(default)]
    message: Option<String>,
}

impl AuthResponse {
    fn into_credential(self) -> Result<Credential, AuthError> {
        if self.access_token.trim().is_empty() {
            return Err(AuthError::Protocol("response carried an empty access token".to_string()));
        }
        let credential = Credential::new(self.access_token);
        Ok(match self.refresh_token {
            Some(refresh) if !refresh.is_empty() => credential.with_refresh_token(refresh),
            _ => credential,
        })
    }
}

#[derive(Clone, Copy)]
enum AuthCall {
    Register,
    Login,
    Refresh,
    Logout,
}

/// Client for the account endpoints.
#[derive(Clone, Debug)]
pub struct AuthSessionManager {
    api: ApiClient,
}

impl AuthSessionManager {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Registers a new account and returns its first credential.
    pub async fn register(
        &self,
        name: &str,
        password: &SecretString,
        public_key: &[u8],
    ) -> Result<Credential, AuthError> {
        validate_name_and_password(name, password)?;
        if public_key.is_empty() {
            return Err(AuthError::InvalidInput("public key must not be empty".to_string()));
        }

        let body = RegisterRequest {
            name,
            password: password.expose_secret(),
            public_key,
        };
        let request = self.api.post("/v1/auth/register").json(&body);
        let response: AuthResponse = self
            .api
            .execute(request)
            .await
            .map_err(|failure| classify(AuthCall::Register, failure))?;
        debug!(event = "registered", name);
        response.into_credential()
    }

    /// Signs in and returns a fresh credential.
    ///
    /// Each successful call may return a distinct token.
    pub async fn login(&self, name: &str, password: &SecretString) -> Result<Credential, AuthError> {
        validate_name_and_password(name, password)?;

        let body = LoginRequest {
            name,
            password: password.expose_secret(),
        };
        let request = self.api.post("/v1/auth/login").json(&body);
        let response: AuthResponse = self
            .api
            .execute(request)
            .await
            .map_err(|failure| classify(AuthCall::Login, failure))?;
        debug!(event = "logged_in", name);
        response.into_credential()
    }

    /// Trades the refresh token carried by `credential` for a new credential.
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
        let refresh_token = credential.refresh_token().ok_or(AuthError::NoCredential)?;
        let body = RefreshTokenRequest {
            refresh_token: refresh_token.expose_secret(),
        };
        let request = self.api.post("/v1/auth/refresh").json(&body);
        let response: AuthResponse = self
            .api
            .execute(request)
            .await
            .map_err(|failure| classify(AuthCall::Refresh, failure))?;
        response.into_credential()
    }

    /// Revokes the refresh token carried by `credential`.
    pub async fn logout(&self, credential: &Credential) -> Result<(), AuthError> {
        let refresh_token = credential.refresh_token().ok_or(AuthError::NoCredential)?;
        let body = RefreshTokenRequest {
            refresh_token: refresh_token.expose_secret(),
        };
        let request = self.api.post("/v1/auth/logout").json(&body);
        let response: LogoutResponse = self
            .api
            .execute(request)
            .await
            .map_err(|failure| classify(AuthCall::Logout, failure))?;
        debug!(event = "logged_out", detail = response.message.as_deref().unwrap_or(""));
        Ok(())
    }
}

fn validate_name_and_password(name: &str, password: &SecretString) -> Result<(), AuthError> {
    if name.trim().is_empty() {
        return Err(AuthError::InvalidInput("name must not be empty".to_string()));
    }
    if password.expose_secret().is_empty() {
        return Err(AuthError::InvalidInput("password must not be empty".to_string()));
    }
    Ok(())
}

fn classify(call: AuthCall, failure: ApiFailure) -> AuthError {
    if failure.is_transient() {
        return AuthError::Unavailable(failure.describe());
    }

    let (status, detail) = match failure {
        ApiFailure::Status { status, detail } => (status, detail),
        other => return AuthError::Protocol(other.describe()),
    };

    match (call, status) {
        (AuthCall::Register, StatusCode::CONFLICT) => AuthError::AlreadyExists(detail),
        (_, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY) => {
            AuthError::InvalidInput(detail)
        }
        (AuthCall::Login | AuthCall::Refresh | AuthCall::Logout, StatusCode::UNAUTHORIZED)
        | (AuthCall::Login | AuthCall::Refresh, StatusCode::NOT_FOUND) => {
            AuthError::InvalidCredentials
        }
        (_, status) => AuthError::Protocol(format!("http status {status}: {detail}")),
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{classify, AuthCall, AuthError, AuthResponse, RegisterRequest};
    use crate::api::ApiFailure;

    fn status(status: StatusCode) -> ApiFailure {
        ApiFailure::Status {
            status,
            detail: "detail".to_string(),
        }
    }

    #[test]
    fn register_conflict_means_name_taken() {
        assert!(matches!(
            classify(AuthCall::Register, status(StatusCode::CONFLICT)),
            AuthError::AlreadyExists(_)
        ));
    }

    #[test]
    fn login_unauthorized_and_unknown_user_are_invalid_credentials() {
        assert!(matches!(
            classify(AuthCall::Login, status(StatusCode::UNAUTHORIZED)),
            AuthError::InvalidCredentials
        ));
        assert!(matches!(
            classify(AuthCall::Login, status(StatusCode::NOT_FOUND)),
            AuthError::InvalidCredentials
        ));
    }

    #[test]
    fn server_errors_are_unavailable_and_retryable() {
        let error = classify(AuthCall::Login, status(StatusCode::BAD_GATEWAY));
        assert!(matches!(error, AuthError::Unavailable(_)));
        assert!(error.is_retryable());
        assert!(!AuthError::InvalidCredentials.is_retryable());
        assert!(!AuthError::InvalidInput("x".to_string()).is_retryable());
    }

    #[test]
    fn unexpected_status_is_a_protocol_error() {
        assert!(matches!(
            classify(AuthCall::Register, status(StatusCode::IM_A_TEAPOT)),
            AuthError::Protocol(_)
        ));
    }

    #[test]
    fn register_request_carries_public_key_as_base64() {
        let body = RegisterRequest {
            name: "alice",
            password: "pw",
            public_key: b"pk",
        };
        assert_eq!(
            serde_json::to_value(&body).expect("encode"),
            json!({"name": "alice", "password": "pw", "public_key": "cGs="})
        );
    }

    #[test]
    fn empty_access_token_is_rejected() {
        let response = AuthResponse {
            access_token: " ".to_string(),
            refresh_token: None,
        };
        assert!(matches!(response.into_credential(), Err(AuthError::Protocol(_))));
    }
}
