//! Identity providers
//!
//! The identity service is reached through [`IdentityProvider`]. The HTTP
//! implementation talks to the control plane's sign-in endpoint:
//!
//! ```http
//! POST {base}/v1/auth/sign-in HTTP/1.1
//! Content-Type: application/json
//!
//! { "username": "ada", "password": "..." }
//! ```
//!
//! ```json
//! { "principal_id": "u-42", "identity_token": "eyJ...", "expires_at": "2026-01-01T00:00:00Z" }
//! ```

use crate::shared::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// An authenticated principal
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub principal_id: String,
    /// Bearer token presented to the control plane
    pub identity_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("principal_id", &self.principal_id)
            .field("identity_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Sign-in credentials
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticates principals
#[async_trait]
pub trait IdentityProvider: Send + Sync + fmt::Debug {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError>;
}

/// Identity provider reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
}

impl HttpIdentityProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let url = format!("{}/v1/auth/sign-in", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(credentials)
            .send()
            .await
            .map_err(|e| AuthError::unavailable(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!("[Auth] Sign-in for {} refused with {}", credentials.username, status);
            return Err(classify_status(status));
        }

        response
            .json::<Session>()
            .await
            .map_err(|e| AuthError::unavailable(format!("Failed to parse response: {}", e)))
    }
}

/// Map a non-success sign-in status
pub fn classify_status(status: StatusCode) -> AuthError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => AuthError::InvalidCredentials,
        StatusCode::FORBIDDEN | StatusCode::LOCKED => AuthError::AccountDisabled,
        other => AuthError::unavailable(format!("identity provider answered {}", other)),
    }
}
