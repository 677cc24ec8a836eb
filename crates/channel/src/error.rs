use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Rate limit exceeded. Try again in {retry_after_secs} seconds.")]
    RateLimited { retry_after_secs: u64 },

    #[error("Channel request timed out after {0}s")]
    Timeout(u64),

    #[error("Channel transport error: {0}")]
    Transport(String),

    #[error("Message rejected by provider: {0}")]
    Rejected(String),
}

impl ChannelError {
    /// Timeouts and connection failures are worth another attempt;
    /// rejections and rate-limit denials are not retried by the client.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Timeout(_) | ChannelError::Transport(_))
    }
}

impl From<ChannelError> for outreach_core::OutreachError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::RateLimited { retry_after_secs } => {
                outreach_core::OutreachError::RateLimited { retry_after_secs }
            }
            ChannelError::Timeout(secs) => {
                outreach_core::OutreachError::Transport(format!("timed out after {secs}s"))
            }
            ChannelError::Transport(msg) => outreach_core::OutreachError::Transport(msg),
            ChannelError::Rejected(msg) => outreach_core::OutreachError::Rejected(msg),
        }
    }
}
