//! Bridge configuration.

use std::time::Duration;

use clap::Parser;
use rtbridge_proto::CONTROL_CHANNEL;

/// Default heartbeat period in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default upper bound for heartbeat jitter in seconds.
pub const DEFAULT_HEARTBEAT_JITTER_SECS: u64 = 5;

/// Default channel liveness TTL in seconds.
pub const DEFAULT_CHANNEL_TTL_SECS: u64 = 40;

/// Default delay before retrying after a transient failure, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Default size of the database connection pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default outbound buffer of a channel-backed local client.
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Postgres connection string (only used by the Postgres backend).
    pub database_url: Option<String>,

    /// Name of the shared broadcast channel.
    pub control_channel: String,

    /// Nominal time between heartbeats.
    pub heartbeat_interval: Duration,

    /// Upper bound of the random amount shaved off each heartbeat sleep.
    pub heartbeat_jitter: Duration,

    /// How long a heartbeat keeps this channel alive.
    pub channel_ttl: Duration,

    /// Fixed backoff after a transient bus or store failure.
    pub retry_delay: Duration,

    /// Maximum pooled connections.
    pub max_connections: u32,

    /// Log every inbound payload at debug level.
    pub log_payloads: bool,

    /// Treat a relay delivered to a remote proxy as fatal instead of dropping it.
    pub strict_routing: bool,

    /// Outbound buffer of channel-backed local clients.
    pub client_buffer: usize,
}

impl BridgeConfig {
    /// Create a configuration with defaults and no database URL.
    pub fn new() -> Self {
        Self {
            database_url: None,
            control_channel: CONTROL_CHANNEL.to_string(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_jitter: Duration::from_secs(DEFAULT_HEARTBEAT_JITTER_SECS),
            channel_ttl: Duration::from_secs(DEFAULT_CHANNEL_TTL_SECS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            log_payloads: false,
            strict_routing: false,
            client_buffer: DEFAULT_CLIENT_BUFFER,
        }
    }

    /// Set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Set the control channel name.
    pub fn with_control_channel(mut self, name: impl Into<String>) -> Self {
        self.control_channel = name.into();
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat jitter bound.
    pub fn with_heartbeat_jitter(mut self, jitter: Duration) -> Self {
        self.heartbeat_jitter = jitter;
        self
    }

    /// Set the channel TTL.
    pub fn with_channel_ttl(mut self, ttl: Duration) -> Self {
        self.channel_ttl = ttl;
        self
    }

    /// Set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the connection pool size.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Enable payload logging.
    pub fn with_payload_logging(mut self) -> Self {
        self.log_payloads = true;
        self
    }

    /// Make misrouted relays fatal.
    pub fn with_strict_routing(mut self) -> Self {
        self.strict_routing = true;
        self
    }

    /// Set the local client buffer size.
    pub fn with_client_buffer(mut self, size: usize) -> Self {
        self.client_buffer = size.max(1);
        self
    }

    /// Check that the timings can keep a channel alive.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.heartbeat_interval.is_zero() {
            return Err(crate::Error::Config(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_jitter > self.heartbeat_interval {
            return Err(crate::Error::Config(format!(
                "heartbeat jitter {:?} exceeds interval {:?}",
                self.heartbeat_jitter, self.heartbeat_interval
            )));
        }
        if self.channel_ttl <= self.heartbeat_interval {
            return Err(crate::Error::Config(format!(
                "channel ttl {:?} must exceed heartbeat interval {:?}",
                self.channel_ttl, self.heartbeat_interval
            )));
        }
        if self.control_channel.is_empty() {
            return Err(crate::Error::Config("control channel name is empty".to_string()));
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Command-line arguments for the bridge node.
#[derive(Parser, Debug)]
#[command(name = "rtbridge")]
#[command(version, about = "Realtime subscription bridge node", long_about = None)]
pub struct Args {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    pub heartbeat_interval: u64,

    /// Maximum heartbeat jitter in seconds.
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_JITTER_SECS)]
    pub heartbeat_jitter: u64,

    /// Channel liveness TTL in seconds.
    #[arg(long, default_value_t = DEFAULT_CHANNEL_TTL_SECS)]
    pub channel_ttl: u64,

    /// Retry delay after transient failures, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS)]
    pub retry_delay_ms: u64,

    /// Maximum database connections.
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: u32,

    /// Log every inbound bus payload.
    #[arg(long)]
    pub log_payloads: bool,

    /// Exit when a relay reaches a client owned by another instance.
    #[arg(long)]
    pub strict_routing: bool,
}

impl Args {
    /// Convert command-line arguments to bridge configuration.
    pub fn into_config(self) -> BridgeConfig {
        BridgeConfig {
            database_url: Some(self.database_url),
            control_channel: CONTROL_CHANNEL.to_string(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            heartbeat_jitter: Duration::from_secs(self.heartbeat_jitter),
            channel_ttl: Duration::from_secs(self.channel_ttl),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_connections: self.max_connections.max(1),
            log_payloads: self.log_payloads,
            strict_routing: self.strict_routing,
            client_buffer: DEFAULT_CLIENT_BUFFER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.database_url.is_none());
        assert_eq!(config.control_channel, CONTROL_CHANNEL);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_jitter, Duration::from_secs(5));
        assert_eq!(config.channel_ttl, Duration::from_secs(40));
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert!(!config.log_payloads);
        assert!(!config.strict_routing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfig::new()
            .with_database_url("postgres://localhost/app")
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_heartbeat_jitter(Duration::from_secs(2))
            .with_channel_ttl(Duration::from_secs(15))
            .with_max_connections(0)
            .with_payload_logging();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/app"));
        assert_eq!(config.max_connections, 1);
        assert!(config.log_payloads);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_must_exceed_interval() {
        let config = BridgeConfig::new().with_channel_ttl(Duration::from_secs(30));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_must_fit_interval() {
        let config = BridgeConfig::new()
            .with_heartbeat_interval(Duration::from_secs(2))
            .with_heartbeat_jitter(Duration::from_secs(5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "rtbridge",
            "--database-url",
            "postgres://db/app",
            "--heartbeat-interval",
            "20",
            "--log-payloads",
        ]);
        let config = args.into_config();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.channel_ttl, Duration::from_secs(40));
        assert!(config.log_payloads);
        assert!(config.validate().is_ok());
    }
}
