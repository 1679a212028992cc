//! Typed error hierarchy for the connection orchestrator.
//!
//! Three top-level enums cover the three seams:
//! - `ConnectError`: coordinator-facing taxonomy surfaced to the UI
//! - `BackendError`: REST collaborator failures
//! - `ChannelError`: external authorization window failures

use thiserror::Error;

use crate::session::SessionState;

/// Which of the two finalization writes failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeStage {
    /// Creating (or updating) the webhook account.
    Account,
    /// Creating (or updating) the routing mapping.
    Mapping,
}

impl std::fmt::Display for FinalizeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalizeStage::Account => write!(f, "account"),
            FinalizeStage::Mapping => write!(f, "mapping"),
        }
    }
}

/// Errors surfaced by the orchestration coordinator.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Could not start authorization: {0}")]
    InitializationFailure(String),

    #[error("Authorization timed out after {timeout_secs}s")]
    AuthorizationTimeout { timeout_secs: u64 },

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("No eligible pages or channels were returned by the provider")]
    NoEligibleResources,

    #[error("Finalization failed at {stage} write: {message}")]
    FinalizationFailure {
        stage: FinalizeStage,
        /// Set when the account row exists but the mapping write failed.
        account_id: Option<i64>,
        message: String,
    },

    #[error("Stale transition: expected {expected}, session is {actual}")]
    StaleTransition {
        expected: &'static str,
        actual: SessionState,
    },

    #[error("Resource {0} is not part of the current session")]
    ResourceNotFound(String),

    #[error("Webhook account {id} not found")]
    AccountNotFound { id: i64 },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ConnectError {
    /// Errors that are logged but never shown to the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, ConnectError::StaleTransition { .. })
    }

    /// The account was created but its mapping was not; the UI reports this
    /// as a success that will self-heal on the next reconnection scan.
    pub fn is_partial_success(&self) -> bool {
        matches!(
            self,
            ConnectError::FinalizationFailure {
                stage: FinalizeStage::Mapping,
                account_id: Some(_),
                ..
            }
        )
    }

    /// Short machine-readable kind, used in UI events.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::InitializationFailure(_) => "initialization_failure",
            ConnectError::AuthorizationTimeout { .. } => "authorization_timeout",
            ConnectError::AuthorizationDenied(_) => "authorization_denied",
            ConnectError::NoEligibleResources => "no_eligible_resources",
            ConnectError::FinalizationFailure { .. } => "finalization_failure",
            ConnectError::StaleTransition { .. } => "stale_transition",
            ConnectError::ResourceNotFound(_) => "resource_not_found",
            ConnectError::AccountNotFound { .. } => "account_not_found",
            ConnectError::Backend(_) => "backend",
        }
    }
}

/// Errors from the REST collaborator.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Resource not found")]
    NotFound,

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode backend response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound)
    }
}

/// Errors from the external authorization window.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Authorization window could not be opened for {url}: {reason}")]
    PopupBlocked { url: String, reason: String },

    #[error("Authorization channel server error: {0}")]
    Server(#[source] std::io::Error),
}
