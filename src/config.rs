use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::manager::ManagerSettings;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub heartbeat_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub stale_timeout_secs: u64,
    pub rate_limit_max_messages: usize,
    pub rate_limit_window_secs: u64,
    pub max_connections_per_conversion: usize,
    pub history_size: usize,
}

impl Config {
    /// Loads the TOML file at `path` (if it exists) with `HUB_*` environment
    /// overrides on top. Missing keys fall back to the built-in defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();
        let builder = config::Config::builder()
            .set_default("listen_addr", "0.0.0.0:8080")?
            .set_default("heartbeat_interval_secs", 30)?
            .set_default("cleanup_interval_secs", 60)?
            .set_default("stale_timeout_secs", 300)?
            .set_default("rate_limit_max_messages", 60)?
            .set_default("rate_limit_window_secs", 60)?
            .set_default("max_connections_per_conversion", 50)?
            .set_default("history_size", 20)?
            .add_source(config::File::from(config_path).required(false))
            .add_source(config::Environment::with_prefix("HUB"));

        let settings = builder
            .build()
            .with_context(|| {
                format!("Failed to build configuration from path: {:?}", config_path)
            })?;

        let config: Config = settings
            .try_deserialize()
            .with_context(|| {
                format!("Failed to deserialize configuration from path: {:?}", config_path)
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be greater than zero");
        }
        if self.cleanup_interval_secs == 0 {
            bail!("cleanup_interval_secs must be greater than zero");
        }
        if self.rate_limit_window_secs == 0 {
            bail!("rate_limit_window_secs must be greater than zero");
        }
        if self.rate_limit_max_messages == 0 {
            bail!("rate_limit_max_messages must be greater than zero");
        }
        if self.stale_timeout_secs < self.heartbeat_interval_secs {
            bail!(
                "stale_timeout_secs ({}) must not be shorter than heartbeat_interval_secs ({})",
                self.stale_timeout_secs,
                self.heartbeat_interval_secs
            );
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("Invalid listen_addr format in config: {}", self.listen_addr))
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            stale_timeout: Duration::from_secs(self.stale_timeout_secs),
            rate_limit_max_messages: self.rate_limit_max_messages,
            rate_limit_window: Duration::from_secs(self.rate_limit_window_secs),
            max_connections_per_conversion: self.max_connections_per_conversion,
            history_size: self.history_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            listen_addr: "127.0.0.1:9000".to_string(),
            heartbeat_interval_secs: 30,
            cleanup_interval_secs: 60,
            stale_timeout_secs: 300,
            rate_limit_max_messages: 60,
            rate_limit_window_secs: 60,
            max_connections_per_conversion: 50,
            history_size: 20,
        }
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load("does/not/exist.toml").unwrap();
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.cleanup_interval_secs, 60);
        assert_eq!(config.max_connections_per_conversion, 50);
    }

    #[test]
    fn rejects_stale_timeout_below_heartbeat() {
        let mut config = base();
        config.stale_timeout_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_rate_limit() {
        let mut config = base();
        config.rate_limit_max_messages = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let mut config = base();
        config.listen_addr = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn converts_to_manager_settings() {
        let settings = base().manager_settings();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.stale_timeout, Duration::from_secs(300));
        assert_eq!(settings.rate_limit_window, Duration::from_secs(60));
    }
}
