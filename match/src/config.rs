use log::warn;
use serde_derive::Deserialize;
use std::time::Duration;

/// Knobs of the matching core itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Replays of one operation after a retryable storage failure.
    pub max_retries: u32,
    /// First backoff step, doubled per retry.
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        RuntimeConfig::new().engine()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub metrics_addr: String,
    /// Books covered by the scheduled batch pass.
    pub symbols: Vec<String>,
    /// Period of the scheduled batch pass; 0 disables it.
    pub batch_interval_ms: u64,
    pub lock_wait_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            database_url: "mysql://root@127.0.0.1:3306/exchange".to_string(),
            max_connections: 10,
            metrics_addr: "0.0.0.0:4010".to_string(),
            symbols: vec!["BTC/USDT".to_string()],
            batch_interval_ms: 1000,
            lock_wait_timeout_ms: 2000,
            max_retries: 5,
            retry_backoff_ms: 20,
        }
    }

    /// Loads `path`, falling back to the defaults when the file is missing or
    /// malformed.
    pub fn from_toml(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file {}, {:?}",
                    path, e
                );
                RuntimeConfig::new()
            }
        }
    }

    pub fn parse(contents: &str) -> Self {
        match toml::from_str(contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong parsing the runtime config file, {:?}",
                    e
                );
                RuntimeConfig::new()
            }
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Row lock wait of the in-process ledger.
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    /// `None` when the scheduled batch pass is disabled.
    pub fn batch_interval(&self) -> Option<Duration> {
        match self.batch_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config = RuntimeConfig::parse(
            r#"
            symbols = ["ETH/USDT", "BTC/USDT"]
            batch_interval_ms = 0
            "#,
        );
        assert_eq!(config.symbols.len(), 2);
        assert_eq!(config.batch_interval(), None);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.engine().retry_backoff, Duration::from_millis(20));
    }

    #[test]
    fn lock_wait_comes_from_the_file() {
        let config = RuntimeConfig::parse("lock_wait_timeout_ms = 75");
        assert_eq!(config.lock_wait(), Duration::from_millis(75));
        assert_eq!(RuntimeConfig::new().lock_wait(), Duration::from_secs(2));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        assert_eq!(RuntimeConfig::parse("max_retries = \"many\""), RuntimeConfig::new());
        assert_eq!(
            RuntimeConfig::from_toml("/nonexistent/spot-match.toml"),
            RuntimeConfig::new()
        );
    }
}
