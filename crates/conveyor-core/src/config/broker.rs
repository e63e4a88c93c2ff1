use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broker backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Shared PostgreSQL database.
    #[default]
    Postgres,
    /// Process-local broker, for tests and single-process setups.
    Memory,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,

    /// Connection URL. Required for postgres.
    #[serde(default)]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Pool checkout timeout in seconds.
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_secs: u64,

    /// Prefix of the LISTEN/NOTIFY channels.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Seconds a delivered but unacknowledged record stays claimed.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            url: String::new(),
            pool_size: default_pool_size(),
            pool_timeout_secs: default_pool_timeout(),
            channel_prefix: default_channel_prefix(),
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

impl BrokerConfig {
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

fn default_pool_size() -> u32 {
    10
}

fn default_pool_timeout() -> u64 {
    30
}

fn default_channel_prefix() -> String {
    "conveyor".to_string()
}

fn default_visibility_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_broker_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.kind, BrokerKind::Postgres);
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.channel_prefix, "conveyor");
        assert_eq!(config.visibility_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_memory_broker() {
        let config: BrokerConfig = toml::from_str(r#"kind = "memory""#).unwrap();
        assert_eq!(config.kind, BrokerKind::Memory);
        assert!(config.url.is_empty());
    }
}
