use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// The error type crossing the engine boundary. Failures of authentication
/// itself are never errors - they are logical rejects - so a caller holding
/// one of these knows the request could not be processed at all.
///
/// Per-token failures (for example corrupt key material) are caught at the
/// orchestrator boundary and demoted to "no match" for that token; only
/// request level malformation propagates to the caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Error, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    /// A required request field is missing or malformed. Rejected before any
    /// cryptographic work or state mutation happens.
    #[error("invalid parameter - {0}")]
    Parameter(String),
    /// The action is disallowed by an externally resolved policy value.
    #[error("denied by policy - {0}")]
    Policy(String),
    /// The operation was attempted in the wrong lifecycle state, e.g. push
    /// enrollment step two outside of clientwait.
    #[error("invalid state - {0}")]
    State(String),
    /// Push delivery to the transport failed. Recoverable - the protocol
    /// falls back to polling unless polling is also denied.
    #[error("push transport unreachable - {0}")]
    Transport(String),
    /// Stored key material could not be loaded or used. Fatal for the token
    /// it belongs to, not for the whole authentication attempt.
    #[error("cryptographic operation failed")]
    Crypto,
    /// A signed request carried a timestamp outside the permitted window, or
    /// one that would not parse. Checked before any signature work.
    #[error("request timestamp outside the permitted window")]
    Timestamp,
    #[error("no matching entries")]
    NotFound,
    #[error("token is not in a state to authenticate")]
    InvalidTokenState,
    #[error("audit queue disconnected")]
    QueueDisconnected,
}
