//! Error types for the billing engine.

/// Convenience alias used throughout the crate.
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// User-correctable input problem (bad username, unknown plan).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced payment or key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create was attempted where an active record already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An external collaborator (messaging, credentials, provider API) failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Webhook authentication failed. Logged as a security-relevant event.
    #[error("webhook signature invalid")]
    Signature,

    /// Required secret or credential is missing. Fails fast, never silently
    /// disables authentication.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BillingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}

impl From<keygate_shared::plans::UnknownPlan> for BillingError {
    fn from(err: keygate_shared::plans::UnknownPlan) -> Self {
        Self::Validation(err.to_string())
    }
}
