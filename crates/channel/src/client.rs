//! Rate-limited channel client — the single path every outbound message
//! takes to the provider.

use std::sync::Arc;
use std::time::Duration;

use outreach_core::config::AppConfig;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::addressing::chat_id;
use crate::error::ChannelError;
use crate::limiter::SendGate;
use crate::transport::{ChannelTransport, SendReceipt, TransportError};

#[derive(Debug, Clone)]
pub struct ChannelClientConfig {
    /// Minimum spacing before every send, paid even when under budget.
    pub message_delay: Duration,
    /// Per-attempt transport timeout.
    pub request_timeout: Duration,
    /// Total transport attempts for transient failures.
    pub max_attempts: u32,
    /// Backoff before retry k is `backoff[k - 1]`.
    pub backoff: Vec<Duration>,
}

impl ChannelClientConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            message_delay: Duration::from_secs(config.rate_limits.message_delay_secs),
            request_timeout: Duration::from_secs(config.channel.request_timeout_secs),
            max_attempts: config.retry.max_attempts.max(1),
            backoff: config
                .retry
                .backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

impl Default for ChannelClientConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

pub struct ChannelClient {
    transport: Arc<dyn ChannelTransport>,
    gate: Arc<SendGate>,
    config: ChannelClientConfig,
}

impl ChannelClient {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        gate: Arc<SendGate>,
        config: ChannelClientConfig,
    ) -> Self {
        Self {
            transport,
            gate,
            config,
        }
    }

    /// Send one message and return the provider's message id.
    ///
    /// Fails fast with `RateLimited` when the shared budget is exhausted;
    /// admitted sends still pay the fixed inter-message spacing. Transient
    /// transport failures are retried on the fixed schedule; rejections
    /// are surfaced immediately — whether to re-attempt those is the
    /// caller's decision.
    pub async fn send(
        &self,
        session: &str,
        phone: &str,
        text: &str,
        media_url: Option<&str>,
    ) -> Result<String, ChannelError> {
        if let Err(retry_after_secs) = self.gate.try_acquire() {
            metrics::counter!("channel.rate_limited").increment(1);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        tokio::time::sleep(self.config.message_delay).await;

        let to = chat_id(phone);
        let mut last_err = ChannelError::Transport("no attempt made".to_string());

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff_for(attempt)).await;
            }

            let call = async {
                match media_url {
                    Some(url) => self.transport.send_image(session, &to, url, Some(text)).await,
                    None => self.transport.send_text(session, &to, text).await,
                }
            };

            match timeout(self.config.request_timeout, call).await {
                Ok(Ok(SendReceipt { message_id })) => {
                    metrics::counter!("channel.sent").increment(1);
                    debug!(chat_id = %to, message_id = %message_id, attempt, "Message accepted");
                    return Ok(message_id);
                }
                Ok(Err(TransportError::Rejected(msg))) => {
                    metrics::counter!("channel.rejected").increment(1);
                    warn!(chat_id = %to, error = %msg, "Provider rejected message");
                    return Err(ChannelError::Rejected(msg));
                }
                Ok(Err(TransportError::Connection(msg))) => {
                    warn!(chat_id = %to, attempt, error = %msg, "Transport failure");
                    last_err = ChannelError::Transport(msg);
                }
                Err(_) => {
                    let secs = self.config.request_timeout.as_secs();
                    warn!(chat_id = %to, attempt, timeout_secs = secs, "Transport timed out");
                    last_err = ChannelError::Timeout(secs);
                }
            }
        }

        metrics::counter!("channel.send_exhausted").increment(1);
        Err(last_err)
    }

    /// Whether a number is reachable on the channel. Uses the same
    /// normalization as sends; not counted against the send budget.
    pub async fn check_number_exists(
        &self,
        session: &str,
        phone: &str,
    ) -> Result<bool, ChannelError> {
        let to = chat_id(phone);
        match timeout(
            self.config.request_timeout,
            self.transport.check_exists(session, &to),
        )
        .await
        {
            Ok(Ok(exists)) => Ok(exists),
            Ok(Err(TransportError::Rejected(msg))) => Err(ChannelError::Rejected(msg)),
            Ok(Err(TransportError::Connection(msg))) => Err(ChannelError::Transport(msg)),
            Err(_) => Err(ChannelError::Timeout(self.config.request_timeout.as_secs())),
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt - 2) as usize;
        self.config
            .backoff
            .get(idx)
            .or_else(|| self.config.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use outreach_core::clock::manual_clock;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls with a connection error, then
    /// succeeds. Rejects everything when `reject` is set.
    struct FlakyTransport {
        calls: AtomicU32,
        failures: u32,
        reject: bool,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                reject: false,
            }
        }

        fn rejecting() -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures: 0,
                reject: true,
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn attempt(&self) -> Result<SendReceipt, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(TransportError::Rejected("invalid chat id".to_string()));
            }
            if call < self.failures {
                return Err(TransportError::Connection("connection reset".to_string()));
            }
            Ok(SendReceipt {
                message_id: format!("ext-{call}"),
            })
        }
    }

    #[async_trait]
    impl ChannelTransport for FlakyTransport {
        async fn send_text(
            &self,
            _session: &str,
            _chat_id: &str,
            _text: &str,
        ) -> Result<SendReceipt, TransportError> {
            self.attempt()
        }

        async fn send_image(
            &self,
            _session: &str,
            _chat_id: &str,
            _media_url: &str,
            _caption: Option<&str>,
        ) -> Result<SendReceipt, TransportError> {
            self.attempt()
        }

        async fn check_exists(
            &self,
            _session: &str,
            _chat_id: &str,
        ) -> Result<bool, TransportError> {
            Ok(true)
        }
    }

    fn client_with(transport: Arc<FlakyTransport>, per_minute: u64) -> ChannelClient {
        let gate = Arc::new(SendGate::new(manual_clock(Utc::now()), per_minute, 10_000));
        ChannelClient::new(transport, gate, ChannelClientConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_transient_failures() {
        let transport = Arc::new(FlakyTransport::new(2));
        let client = client_with(transport.clone(), 100);

        let id = client
            .send("default", "08123456789", "Halo", None)
            .await
            .unwrap();
        assert_eq!(id, "ext-2");
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_exhausts_retry_schedule() {
        let transport = Arc::new(FlakyTransport::new(10));
        let client = client_with(transport.clone(), 100);

        let err = client
            .send("default", "08123456789", "Halo", None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let transport = Arc::new(FlakyTransport::rejecting());
        let client = client_with(transport.clone(), 100);

        let err = client
            .send("default", "08123456789", "Halo", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Rejected(_)));
        assert!(!err.is_transient());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_fails_fast_without_transport_call() {
        let transport = Arc::new(FlakyTransport::new(0));
        let client = client_with(transport.clone(), 1);

        client
            .send("default", "08123456789", "Halo", None)
            .await
            .unwrap();

        let err = client
            .send("default", "08123456789", "Halo lagi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::RateLimited { .. }));
        assert_eq!(transport.call_count(), 1);
    }
}
