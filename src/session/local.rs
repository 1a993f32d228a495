//! Local identity provider
//!
//! In-process accounts for development and tests. Passwords are stored as
//! bcrypt hashes and sessions carry HS256 JWT identity tokens signed with a
//! local secret.

use super::provider::{Credentials, IdentityProvider, Session};
use crate::shared::AuthError;
use async_trait::async_trait;
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// JWT claims carried by local identity tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at time (Unix timestamp)
    pub iat: i64,
}

#[derive(Debug, Clone)]
struct Account {
    principal_id: String,
    password_hash: String,
    disabled: bool,
}

/// Identity provider backed by an in-memory account table
pub struct LocalIdentityProvider {
    accounts: RwLock<HashMap<String, Account>>,
    secret: Vec<u8>,
    cost: u32,
    token_ttl: chrono::Duration,
}

impl std::fmt::Debug for LocalIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentityProvider")
            .field("accounts", &self.read().len())
            .field("cost", &self.cost)
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

impl LocalIdentityProvider {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            secret: secret.as_ref().to_vec(),
            cost: DEFAULT_COST,
            token_ttl: chrono::Duration::hours(12),
        }
    }

    /// bcrypt cost for newly added accounts
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_token_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Add (or replace) an account
    pub fn add_account(&self, username: &str, principal_id: &str, password: &str) -> Result<(), AuthError> {
        let password_hash =
            hash(password, self.cost).map_err(|e| AuthError::unavailable(format!("Failed to hash password: {}", e)))?;
        self.write().insert(
            username.to_string(),
            Account {
                principal_id: principal_id.to_string(),
                password_hash,
                disabled: false,
            },
        );
        Ok(())
    }

    /// Enable or disable an account; `false` if it does not exist
    pub fn set_disabled(&self, username: &str, disabled: bool) -> bool {
        match self.write().get_mut(username) {
            Some(account) => {
                account.disabled = disabled;
                true
            }
            None => false,
        }
    }

    /// Check an identity token issued by this provider
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let key = DecodingKey::from_secret(&self.secret);
        decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("[Auth] Rejected identity token: {}", e);
                AuthError::InvalidCredentials
            })
    }

    fn issue(&self, principal_id: &str) -> Result<Session, AuthError> {
        let now = Utc::now();
        let expires_at = now + self.token_ttl;
        let claims = Claims {
            sub: principal_id.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };
        let key = EncodingKey::from_secret(&self.secret);
        let identity_token = encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|e| AuthError::unavailable(format!("Failed to sign token: {}", e)))?;
        Ok(Session {
            principal_id: principal_id.to_string(),
            identity_token,
            expires_at,
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Account>> {
        self.accounts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Account>> {
        self.accounts.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let account = self
            .read()
            .get(&credentials.username)
            .cloned()
            .ok_or(AuthError::InvalidCredentials)?;

        let valid = verify(&credentials.password, &account.password_hash)
            .map_err(|e| AuthError::unavailable(format!("Failed to verify password: {}", e)))?;
        if !valid {
            return Err(AuthError::InvalidCredentials);
        }
        // Checked after the password so disabled accounts are not enumerable.
        if account.disabled {
            return Err(AuthError::AccountDisabled);
        }

        tracing::info!("[Auth] Signed in {}", account.principal_id);
        self.issue(&account.principal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> LocalIdentityProvider {
        let provider = LocalIdentityProvider::new("test-secret").with_cost(4);
        provider.add_account("ada", "u-1", "password123").unwrap();
        provider
    }

    #[tokio::test]
    async fn test_sign_in_issues_verifiable_token() {
        let provider = provider();
        let session = provider
            .authenticate(&Credentials::new("ada", "password123"))
            .await
            .unwrap();
        assert_eq!(session.principal_id, "u-1");
        assert!(!session.is_expired());

        let claims = provider.verify_token(&session.identity_token).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.exp, session.expires_at.timestamp());
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_user() {
        let provider = provider();
        assert_eq!(
            provider.authenticate(&Credentials::new("ada", "nope")).await,
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            provider.authenticate(&Credentials::new("bob", "password123")).await,
            Err(AuthError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_disabled_account() {
        let provider = provider();
        assert!(provider.set_disabled("ada", true));
        assert!(!provider.set_disabled("bob", true));
        assert_eq!(
            provider.authenticate(&Credentials::new("ada", "password123")).await,
            Err(AuthError::AccountDisabled)
        );
    }

    #[test]
    fn test_foreign_token_is_rejected() {
        let other = LocalIdentityProvider::new("other-secret").with_cost(4);
        other.add_account("ada", "u-1", "pw").unwrap();
        let session = other.issue("u-1").unwrap();
        assert_eq!(
            provider().verify_token(&session.identity_token),
            Err(AuthError::InvalidCredentials)
        );
    }
}
