use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_DATABASE_NAME: &str = "agentic_os";

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub mongo_uri: String,
    #[serde(default = "default_database_name")]
    pub mongo_db_name: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_server_selection_timeout_secs")]
    pub server_selection_timeout_secs: u64,
    #[serde(default)]
    pub direct_connection: Option<bool>,
    #[serde(default)]
    pub skip_replica_set_init: bool,
    #[serde(default = "default_replica_set_name")]
    pub replica_set_name: String,
    #[serde(default)]
    pub replica_set_member_host: Option<String>,
    #[serde(default = "default_primary_wait_timeout_secs")]
    pub primary_wait_timeout_secs: u64,
    #[serde(default)]
    pub wait_for_indexes: bool,
    #[serde(default = "default_index_poll_interval_secs")]
    pub index_poll_interval_secs: u64,
    #[serde(default = "default_index_wait_timeout_secs")]
    pub index_wait_timeout_secs: u64,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_database_name() -> String {
    DEFAULT_DATABASE_NAME.to_string()
}

fn default_app_name() -> String {
    "mongo-init".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_server_selection_timeout_secs() -> u64 {
    30
}

fn default_replica_set_name() -> String {
    "rs0".to_string()
}

fn default_primary_wait_timeout_secs() -> u64 {
    30
}

fn default_index_poll_interval_secs() -> u64 {
    2
}

fn default_index_wait_timeout_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_secs(self.server_selection_timeout_secs)
    }

    pub fn primary_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.primary_wait_timeout_secs)
    }

    pub fn index_poll_interval(&self) -> Duration {
        Duration::from_secs(self.index_poll_interval_secs.max(1))
    }

    pub fn index_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.index_wait_timeout_secs)
    }
}

/// Load config from an optional `config` file in the working directory, overridden by
/// environment variables (`MONGO_URI` -> `mongo_uri`).
pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

/// Same layering as [`get_config`] with an explicit file, which must exist.
pub fn get_config_from_file(path: &Path) -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
