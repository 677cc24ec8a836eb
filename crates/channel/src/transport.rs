//! Transport seam to the channel provider's send API.
//!
//! The wire format is the provider's business; engines only depend on
//! this contract. `LoopbackTransport` serves development and tests.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Provider acknowledgment of an accepted send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection-level failure — eligible for the client's retry schedule.
    #[error("connection error: {0}")]
    Connection(String),

    /// The provider refused the request; retrying the same payload cannot
    /// succeed.
    #[error("rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send_text(
        &self,
        session: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<SendReceipt, TransportError>;

    async fn send_image(
        &self,
        session: &str,
        chat_id: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, TransportError>;

    async fn check_exists(&self, session: &str, chat_id: &str) -> Result<bool, TransportError>;
}

/// Logs every request and fabricates receipts. Development mode and the
/// default test double.
pub struct LoopbackTransport;

#[async_trait]
impl ChannelTransport for LoopbackTransport {
    async fn send_text(
        &self,
        session: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<SendReceipt, TransportError> {
        info!(
            session = session,
            chat_id = chat_id,
            text_len = text.len(),
            "Sending text message"
        );
        Ok(SendReceipt {
            message_id: Uuid::new_v4().to_string(),
        })
    }

    async fn send_image(
        &self,
        session: &str,
        chat_id: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, TransportError> {
        info!(
            session = session,
            chat_id = chat_id,
            media_url = media_url,
            caption_len = caption.map(str::len).unwrap_or(0),
            "Sending image message"
        );
        Ok(SendReceipt {
            message_id: Uuid::new_v4().to_string(),
        })
    }

    async fn check_exists(&self, session: &str, chat_id: &str) -> Result<bool, TransportError> {
        info!(session = session, chat_id = chat_id, "Checking number exists");
        Ok(true)
    }
}
