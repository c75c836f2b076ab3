use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoordError, Result};
use crate::retry::RetryConfig;
use crate::role::{ClusterRole, ConfigServerRole, Role, ShardRole};
use crate::upgrade::UpgradeSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub role: Role,
    pub unit_id: u32,
    /// Application name. A shard registers under this name.
    pub app_name: String,
    /// Hosts running the router; for a config-server these are its own units.
    pub router_hosts: Vec<String>,
    pub shard_port: u16,
    pub operator_username: String,
    pub target_version: String,
    pub drain_poll_interval_secs: u64,
    pub step_down_attempts: u32,
    pub step_down_wait_secs: u64,
    pub post_upgrade_attempts: u32,
    pub post_upgrade_wait_secs: u64,
    pub password_attempts: u32,
    pub password_wait_secs: u64,
    pub probe_token_len: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            role: Role::Replication,
            unit_id: 0,
            app_name: String::from("mongodb"),
            router_hosts: Vec::new(),
            shard_port: 27017,
            operator_username: String::from("operator"),
            target_version: String::new(),
            drain_poll_interval_secs: 10,
            step_down_attempts: 30,
            step_down_wait_secs: 1,
            post_upgrade_attempts: 20,
            post_upgrade_wait_secs: 1,
            password_attempts: 20,
            password_wait_secs: 3,
            probe_token_len: 16,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CoordinatorConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let attempts = [
            ("step_down_attempts", self.step_down_attempts),
            ("post_upgrade_attempts", self.post_upgrade_attempts),
            ("password_attempts", self.password_attempts),
        ];
        if let Some((name, _)) = attempts.iter().find(|(_, n)| *n == 0) {
            return Err(CoordError::Config(format!("{} must be at least 1", name)));
        }
        if self.probe_token_len == 0 {
            return Err(CoordError::Config("probe_token_len must be at least 1".into()));
        }
        if self.drain_poll_interval_secs == 0 {
            return Err(CoordError::Config(
                "drain_poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.role == Role::ConfigServer && self.router_hosts.is_empty() {
            return Err(CoordError::Config(
                "a config-server needs at least one router host".into(),
            ));
        }
        Ok(())
    }

    pub fn cluster_role(&self) -> ClusterRole {
        match self.role {
            Role::Replication => ClusterRole::Replication,
            Role::ConfigServer => ClusterRole::ConfigServer(ConfigServerRole {
                router_hosts: self.router_hosts.iter().cloned().collect(),
                shard_port: self.shard_port,
            }),
            Role::Shard => ClusterRole::Shard(ShardRole {
                shard_name: self.app_name.clone(),
            }),
        }
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_secs(self.drain_poll_interval_secs)
    }

    pub fn step_down_retry(&self) -> RetryConfig {
        RetryConfig::new(self.step_down_attempts, Duration::from_secs(self.step_down_wait_secs))
    }

    pub fn post_upgrade_retry(&self) -> RetryConfig {
        RetryConfig::new(
            self.post_upgrade_attempts,
            Duration::from_secs(self.post_upgrade_wait_secs),
        )
    }

    pub fn password_retry(&self) -> RetryConfig {
        RetryConfig::new(self.password_attempts, Duration::from_secs(self.password_wait_secs))
    }

    pub fn upgrade_settings(&self) -> UpgradeSettings {
        UpgradeSettings {
            target_version: self.target_version.clone(),
            step_down: self.step_down_retry(),
            post_upgrade: self.post_upgrade_retry(),
            probe_token_len: self.probe_token_len,
        }
    }
}
