//! Client configuration.

use std::time::Duration;

/// Credentials applied to every connection the dispatcher opens: SASL
/// PLAIN auth, then an optional bucket selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub bucket: Option<String>,
}

/// Errors from [`ConfigBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("queue_capacity must be non-zero")]
    ZeroQueueCapacity,

    #[error("wait_timeout must be non-zero")]
    ZeroWaitTimeout,

    #[error("nmv_retry_limit must be non-zero")]
    ZeroRetryLimit,
}

/// Dispatcher and connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Capacity of the dispatch queue. Enqueueing into a full queue fails
    /// immediately with `QueueFull` rather than blocking the caller.
    pub queue_capacity: usize,
    /// How long a caller waits for its result before giving up with
    /// `WaitTimeout`.
    pub wait_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Upper bound on consecutive "not my vbucket" retries for one
    /// operation. Each retry refreshes the topology first.
    pub nmv_retry_limit: u32,
    /// Enable TCP_NODELAY on connections.
    pub tcp_nodelay: bool,
    /// Optional SASL credentials and bucket to select on connect.
    pub credentials: Option<Credentials>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            wait_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(1),
            nmv_retry_limit: 8,
            tcp_nodelay: true,
            credentials: None,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn nmv_retry_limit(mut self, limit: u32) -> Self {
        self.config.nmv_retry_limit = limit;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = Some(credentials);
        self
    }

    /// Validate and produce the config.
    pub fn build(self) -> Result<Config, ConfigError> {
        if self.config.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.config.wait_timeout.is_zero() {
            return Err(ConfigError::ZeroWaitTimeout);
        }
        if self.config.nmv_retry_limit == 0 {
            return Err(ConfigError::ZeroRetryLimit);
        }
        Ok(self.config)
    }
}
