//! Memory store errors.

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors raised by the memory store and sweeper.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The priming turns for a new session could not be produced.
    #[error("Session creation failed for {user_id}: {reason}")]
    SessionCreation { user_id: String, reason: String },

    /// An exchange was appended for a user without a live session.
    #[error("No session for {0}")]
    NoSession(String),

    /// The user's record stayed locked longer than the allowed wait.
    #[error("Timed out waiting for {user_id} after {waited_ms}ms")]
    LockTimeout { user_id: String, waited_ms: u64 },
}

impl MemoryError {
    /// The user the error refers to.
    pub fn user_id(&self) -> &str {
        match self {
            Self::SessionCreation { user_id, .. } | Self::LockTimeout { user_id, .. } => user_id,
            Self::NoSession(user_id) => user_id,
        }
    }
}
