//! Error Types
//!
//! One `thiserror` enum per concern of the layer. The split mirrors how
//! errors propagate:
//!
//! - `AuthError` and `ConnectError` surface to the caller immediately
//! - `ResolveError::Incomplete` is an error, while an unprovisioned
//!   principal is not (see `tenant::Resolution`)
//! - `StoreError` classifies remote failures as transient or permanent
//! - `SyncError` is recovered inside the reconciler; only dead letters
//!   surface, and only in aggregate
//! - `AccessError::NoTenantConnection` always surfaces
//!
//! All error types are `Send + Sync`.

use crate::tenant::TenantId;
use thiserror::Error;
use uuid::Uuid;

/// Identity provider failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown principal or wrong secret
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The principal exists but may not sign in
    #[error("account disabled")]
    AccountDisabled,

    /// Provider could not be reached or answered with a server error
    #[error("identity provider unavailable: {message}")]
    ProviderUnavailable {
        /// Human-readable error message
        message: String,
    },

    /// A sign-out landed while the sign-in was still in progress
    #[error("sign-in cancelled by sign-out")]
    Cancelled,
}

impl AuthError {
    /// Create a new provider-unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            message: message.into(),
        }
    }
}

/// Failures reported by a document store (either plane)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network failure or server-side error
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Human-readable error message
        message: String,
    },

    /// Request did not complete in time
    #[error("store request timed out")]
    Timeout,

    /// Target record does not exist
    #[error("record {collection}/{id} not found")]
    NotFound { collection: String, id: String },

    /// A create targeted an id that already exists
    #[error("record {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },

    /// Request was understood and refused
    #[error("store rejected request: {message}")]
    Rejected {
        /// Human-readable error message
        message: String,
    },

    /// Response could not be decoded
    #[error("store protocol error: {message}")]
    Protocol {
        /// Human-readable error message
        message: String,
    },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn not_found(collection: &str, id: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn already_exists(collection: &str, id: &str) -> Self {
        Self::AlreadyExists {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(format!("JSON error: {}", err))
    }
}

/// Tenant descriptor resolution failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The profile carries a descriptor with mandatory fields missing
    #[error("tenant descriptor incomplete, missing: {}", missing.join(", "))]
    Incomplete {
        /// Names of the missing fields
        missing: Vec<String>,
    },

    /// The profile record could not be decoded
    #[error("malformed profile record: {message}")]
    Malformed {
        /// Human-readable error message
        message: String,
    },

    /// The control plane could not be read
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Data-plane connection failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Descriptor failed validation before any network traffic
    #[error("invalid tenant descriptor: {message}")]
    DescriptorInvalid {
        /// Human-readable error message
        message: String,
    },

    /// Handshake exceeded the configured timeout
    #[error("handshake with tenant {tenant} timed out")]
    HandshakeTimeout { tenant: TenantId },

    /// A transition toward a different tenant is still in progress
    #[error("tenant switch in progress (requested {requested}, in flight {in_flight})")]
    TenantSwitchInProgress {
        requested: TenantId,
        in_flight: TenantId,
    },

    /// The backend refused or failed the handshake
    #[error("handshake failed: {0}")]
    Handshake(#[from] StoreError),

    /// The connection was invalidated (e.g. sign-out) while opening
    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Local durable storage failures
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("local database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("local serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be interpreted
    #[error("corrupt local record: {message}")]
    Corrupt {
        /// Human-readable error message
        message: String,
    },

    #[error("local storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BufferError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}

/// Entity access failures seen by callers of the gateway
#[derive(Debug, Error)]
pub enum AccessError {
    /// Data plane requested but no tenant connection is active.
    ///
    /// Indicates a caller that bypassed the configuration flow.
    #[error("no active tenant connection")]
    NoTenantConnection,

    /// The handle used was revoked by a close or tenant switch
    #[error("connection handle for tenant {tenant} was revoked")]
    HandleRevoked { tenant: TenantId },

    /// The request was in flight when its handle closed
    #[error("request cancelled by connection close")]
    Cancelled,

    /// Offline and nothing usable is cached for the collection
    #[error("offline and no cached data for collection {collection}")]
    Offline { collection: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl AccessError {
    /// Whether the failure came from a transient remote condition
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_transient())
    }
}

/// Reconciliation failures
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or timeout failure, retried on a later pass
    #[error("transient sync failure: {message}")]
    Transient {
        /// Human-readable error message
        message: String,
    },

    /// The write can never succeed as recorded
    #[error("permanent sync failure: {message}")]
    Permanent {
        /// Human-readable error message
        message: String,
    },

    /// The write failed more often than the retry ceiling allows
    #[error("write {local_id} exceeded the retry ceiling after {attempts} attempts")]
    RetryCeilingExceeded { local_id: Uuid, attempts: u32 },

    /// Reconciliation requires an active tenant connection
    #[error("no active tenant connection")]
    NoTenantConnection,

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl SyncError {
    /// Classify a store failure for the retry loop
    pub fn classify(err: &StoreError) -> Self {
        if err.is_transient() {
            Self::Transient {
                message: err.to_string(),
            }
        } else {
            Self::Permanent {
                message: err.to_string(),
            }
        }
    }
}
