use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use crate::rpc::SchedulerSettings;

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./fleet.db")
}

/// MQTT broker every node connects to.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keep_alive_secs: default_keep_alive(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

fn default_broker_host() -> String {
    String::from("localhost")
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_topic_prefix() -> String {
    String::from("fleet")
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,
    #[serde(default = "default_max_offset")]
    pub max_offset_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_after_secs: default_retry_after(),
            max_offset_secs: default_max_offset(),
        }
    }
}

impl SchedulerConfig {
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            retry_after: Duration::from_secs(self.retry_after_secs),
            max_offset: Duration::from_secs(self.max_offset_secs),
        }
    }
}

fn default_retry_after() -> u64 {
    10
}

fn default_max_offset() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    Webhook(Webhook),
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Webhook {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Address of the controller node
    #[serde(default = "default_controller")]
    pub controller: String,

    /// Segment whose jobs get rebalanced between pollers
    #[serde(default = "default_segment")]
    pub default_segment: String,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Storage configuration (optional - defaults to SQLite)
    pub storage: Option<StorageConfig>,

    /// Where aggregators deliver evaluation notifications
    pub alert: Option<Alert>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            controller: default_controller(),
            default_segment: default_segment(),
            scheduler: SchedulerConfig::default(),
            storage: None,
            alert: None,
        }
    }
}

fn default_controller() -> String {
    String::from("controller")
}

pub fn default_segment() -> String {
    String::from("default")
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
