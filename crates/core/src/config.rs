use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `OUTREACH__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Connection settings for the external channel provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_session")]
    pub default_session: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Caps imposed by the provider, shared by every worker in the process.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub messages_per_minute: u64,
    #[serde(default = "default_per_hour")]
    pub messages_per_hour: u64,
    /// Minimum spacing between sends, paid even when under budget.
    #[serde(default = "default_message_delay_secs")]
    pub message_delay_secs: u64,
}

/// Transport-level retry schedule for transient failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
}

/// Outer task-queue retry policy and worker pool size.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
}

// Default functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_session() -> String {
    "default".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_per_minute() -> u64 {
    30
}
fn default_per_hour() -> u64 {
    500
}
fn default_message_delay_secs() -> u64 {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_secs() -> Vec<u64> {
    vec![5, 30, 120]
}
fn default_workers() -> usize {
    4
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            default_session: default_session(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: default_per_minute(),
            messages_per_hour: default_per_hour(),
            message_delay_secs: default_message_delay_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            channel: ChannelConfig::default(),
            rate_limits: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("OUTREACH")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_provider_guidance() {
        let config = AppConfig::default();
        assert_eq!(config.rate_limits.messages_per_minute, 30);
        assert_eq!(config.rate_limits.messages_per_hour, 500);
        assert_eq!(config.rate_limits.message_delay_secs, 2);
        assert_eq!(config.retry.backoff_secs, vec![5, 30, 120]);
        assert_eq!(config.channel.request_timeout_secs, 30);
    }
}
