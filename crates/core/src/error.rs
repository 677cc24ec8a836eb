use thiserror::Error;

pub type OutreachResult<T> = Result<T, OutreachError>;

#[derive(Error, Debug)]
pub enum OutreachError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    Transition(String),

    #[error("Rate limit exceeded. Try again in {retry_after_secs} seconds.")]
    RateLimited { retry_after_secs: u64 },

    #[error("Channel transport error: {0}")]
    Transport(String),

    #[error("Message rejected by provider: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OutreachError {
    /// Transient failures are worth re-running through the outer task
    /// retry; validation and permanent provider rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OutreachError::Transport(_) | OutreachError::RateLimited { .. }
        )
    }
}
