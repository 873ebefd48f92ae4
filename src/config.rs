//! Layered configuration.
//!
//! Sources, lowest to highest precedence: built-in defaults,
//! `/etc/runwatch/config.toml`, `./runwatch.toml`, `RUNWATCH_*` environment
//! variables (`__` separates nested keys, e.g. `RUNWATCH_POLLING__BASE_INTERVAL_MS`)
//! and finally command-line flags.

use anyhow::{Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const SYSTEM_CONFIG_PATH: &str = "/etc/runwatch/config.toml";
pub const LOCAL_CONFIG_PATH: &str = "runwatch.toml";
pub const ENV_PREFIX: &str = "RUNWATCH_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    /// Fixed wait after a transport or parse failure.
    pub retry_interval_ms: u64,
    pub cache_ttl_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1000,
            max_interval_ms: 5000,
            backoff_multiplier: 1.5,
            retry_interval_ms: 5000,
            cache_ttl_ms: 2000,
        }
    }
}

impl PollingConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the execution service.
    pub service_url: String,
    /// Address the JSON-RPC server listens on.
    pub rpc_bind: String,
    pub data_directory: PathBuf,
    /// Use the in-process simulated execution service.
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    /// Poll every job from creation rather than only while expanded.
    pub auto_poll: bool,
    pub request_timeout_secs: u64,
    pub correlation_grace_secs: u64,
    pub cancel_grace_secs: u64,
    pub snapshot_interval_secs: u64,
    pub fan_out_spacing_ms: u64,
    pub polling: PollingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_url: "http://127.0.0.1:5000".to_string(),
            rpc_bind: "127.0.0.1:9847".to_string(),
            data_directory: PathBuf::from("/var/lib/runwatch"),
            simulation: false,
            verbose: false,
            json_logs: false,
            auto_poll: true,
            request_timeout_secs: 10,
            correlation_grace_secs: 30,
            cancel_grace_secs: 30,
            snapshot_interval_secs: 10,
            fan_out_spacing_ms: 1000,
            polling: PollingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources, with `overrides` (usually the
    /// parsed CLI flags) applied last.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::from_figment(Self::figment(), overrides)
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(LOCAL_CONFIG_PATH))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn from_figment<T: Serialize>(mut figment: Figment, overrides: Option<&T>) -> Result<Self> {
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let polling = &self.polling;
        if polling.base_interval_ms == 0 {
            bail!("polling.base_interval_ms must be greater than zero");
        }
        if !(polling.backoff_multiplier >= 1.0) {
            bail!("polling.backoff_multiplier must be at least 1.0");
        }
        if polling.max_interval_ms < polling.base_interval_ms {
            bail!("polling.max_interval_ms must not be below polling.base_interval_ms");
        }
        if polling.retry_interval_ms == 0 {
            bail!("polling.retry_interval_ms must be greater than zero");
        }
        if self.snapshot_interval_secs == 0 {
            bail!("snapshot_interval_secs must be greater than zero");
        }
        if self.service_url.trim().is_empty() && !self.simulation {
            bail!("service_url is required unless simulation is enabled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Flags {
        #[serde(skip_serializing_if = "Option::is_none")]
        simulation: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rpc_bind: Option<String>,
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.polling.base_interval(), Duration::from_secs(1));
        assert_eq!(config.polling.max_interval(), Duration::from_secs(5));
        assert_eq!(config.correlation_grace_secs, 30);
    }

    #[test]
    fn layers_apply_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "runwatch.toml",
                r#"
                    service_url = "http://automation:5000"
                    rpc_bind = "127.0.0.1:1111"

                    [polling]
                    base_interval_ms = 500
                "#,
            )?;
            jail.set_env("RUNWATCH_POLLING__MAX_INTERVAL_MS", "8000");
            jail.set_env("RUNWATCH_RPC_BIND", "127.0.0.1:2222");

            let flags = Flags {
                simulation: Some(true),
                rpc_bind: None,
            };
            let config = AppConfig::from_figment(
                Figment::from(Serialized::defaults(AppConfig::default()))
                    .merge(Toml::file("runwatch.toml"))
                    .merge(Env::prefixed(ENV_PREFIX).split("__")),
                Some(&flags),
            )
            .map_err(|e| e.to_string())?;

            assert_eq!(config.service_url, "http://automation:5000");
            assert_eq!(config.rpc_bind, "127.0.0.1:2222");
            assert_eq!(config.polling.base_interval_ms, 500);
            assert_eq!(config.polling.max_interval_ms, 8000);
            assert_eq!(config.polling.backoff_multiplier, 1.5);
            assert!(config.simulation);
            Ok(())
        });
    }

    #[test]
    fn rejects_bad_polling_settings() {
        let mut config = AppConfig::default();
        config.polling.base_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.polling.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.polling.max_interval_ms = 100;
        assert!(config.validate().is_err());
    }
}
