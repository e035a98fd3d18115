use thiserror::Error;

/// Crate-wide error type.
///
/// Policy violations are the only variant a caller is expected to branch
/// on: they mean the guarded action must not proceed. Everything else is
/// plumbing that the trace layer logs and swallows.
#[derive(Error, Debug)]
pub enum CarapaceError {
    /// A hook vetoed the in-flight action. The message is shown to
    /// operators as the failure reason for the blocked tool call or send.
    #[error("blocked by hook: {0}")]
    PolicyViolation(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Escape hatch for third-party hooks; propagates through the
    /// pipeline exactly like the built-in guard's errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CarapaceError {
    /// True when the error represents a deliberate policy block rather
    /// than an operational failure.
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, CarapaceError::PolicyViolation(_))
    }
}
