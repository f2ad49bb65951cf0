//! Error taxonomy for the sync engine (spec ref: §7 Error Handling Design).
//!
//! Most call sites still propagate through `anyhow::Result` for ergonomic
//! `?` composition, but the variants here let the few places that need to
//! branch on *kind* (retry vs. re-auth vs. terminal) match on a concrete
//! type instead of sniffing strings everywhere.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("api error [{code}]: {reason}")]
    Api { code: String, reason: String },

    #[error("iCloud Photo Library not finished indexing")]
    ServiceNotActivated,

    #[error("Apple insists on using {domain_to_use} for your request; use --domain")]
    DomainMismatch { domain_to_use: String },

    #[error("invalid username/password combination")]
    FailedLogin,

    #[error("two-factor authentication is required")]
    MfaRequired,

    #[error("two-factor authentication code was rejected")]
    MfaFailed,

    #[error("timed out waiting for a two-factor authentication code")]
    MfaTimeout,

    #[error("I/O error downloading file: {0}")]
    DownloadIo(#[source] std::io::Error),

    #[error("unexpected field in asset envelope: {0}")]
    UnexpectedField(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("timed out")]
    Timeout,
}

impl SyncError {
    /// Mirrors the original's string-sniffing of "Invalid global session" —
    /// the server never returns a structured code for this, so this check
    /// is preserved verbatim as documented vendor-observed behavior.
    pub fn is_session_expired(&self) -> bool {
        match self {
            SyncError::Api { reason, .. } => reason.contains("Invalid global session"),
            _ => false,
        }
    }

    pub fn is_internal_error(&self) -> bool {
        match self {
            SyncError::Api { reason, code, .. } => {
                reason.contains("INTERNAL_ERROR") || code == "INTERNAL_ERROR"
            }
            _ => false,
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, SyncError::Api { code, .. } if code == "ACCESS_DENIED")
    }
}

/// Classifies an arbitrary anyhow error using the same substring rules the
/// original applies, for call sites that received an opaque error from a
/// layer that hasn't been converted to `SyncError` yet (e.g. reqwest I/O).
pub fn message_is_session_expired(message: &str) -> bool {
    message.contains("Invalid global session")
}

pub fn message_is_internal_error(message: &str) -> bool {
    message.contains("INTERNAL_ERROR")
}
