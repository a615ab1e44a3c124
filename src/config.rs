use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::poll::PollSettings;

/// Environment prefix for every harness setting, e.g. `TESTAPP_NODE_IP`
pub const ENV_PREFIX: &str = "TESTAPP";

/// Fallback directory for captured container logs
pub const DEFAULT_CONTAINER_LOG_PATH: &str = "./container_logs";

#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    /// Node address to use when the cluster has no real load balancer
    /// (minikube, kind). Set it to the output of `minikube ip`.
    #[serde(default)]
    pub node_ip: Option<String>,

    #[serde(default = "default_container_log_path")]
    pub container_log_path: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_container_log_path() -> String {
    DEFAULT_CONTAINER_LOG_PATH.to_string()
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_poll_timeout_secs() -> u64 {
    600
}

impl HarnessConfig {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make every wait spin
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(config::ConfigError::Message(format!(
                "{}_POLL_INTERVAL_SECS must be at least 1",
                ENV_PREFIX
            ))
            .into());
        }
        Ok(())
    }

    /// Node address override, ignoring an empty value
    pub fn node_ip(&self) -> Option<&str> {
        self.node_ip.as_deref().filter(|ip| !ip.is_empty())
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            timeout: Duration::from_secs(self.poll_timeout_secs),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            node_ip: None,
            container_log_path: default_container_log_path(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}
