use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Missing value for '{0}' option")]
    MissingValue(String),
    #[error("Invalid value '{value}' for '{option}' option")]
    InvalidValue { option: String, value: String },
    #[error("Result topic '{0}' must differ from the task topic")]
    TopicLoop(String),
}

/// Worker settings, loaded from a TOML file.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Topic that task messages are published to.
    #[serde(default = "default_task_topic")]
    pub task_topic: String,

    /// Topic that indicator results are published to.
    #[serde(default = "default_result_topic")]
    pub result_topic: String,

    /// Subscription on the task topic this worker consumes.
    #[serde(default = "default_subscription")]
    pub subscription: String,

    /// Upper bound on concurrently running handlers; 0 means unbounded.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub emulator: EmulatorConfig,
}

/// Settings for the in-process broker the binary runs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Deliveries before a nacked message is dead-lettered; 0 retries forever.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    /// Subscription on the result topic that the binary prints to stdout.
    #[serde(default = "default_result_subscription")]
    pub result_subscription: String,
}

impl WorkerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (option, value) in [
            ("task_topic", &self.task_topic),
            ("result_topic", &self.result_topic),
            ("subscription", &self.subscription),
            ("emulator.result_subscription", &self.emulator.result_subscription),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingValue(option.to_string()));
            }
        }

        if self.task_topic == self.result_topic {
            return Err(ConfigError::TopicLoop(self.result_topic.clone()));
        }

        if self.subscription == self.emulator.result_subscription {
            return Err(ConfigError::InvalidValue {
                option: "emulator.result_subscription".to_string(),
                value: self.emulator.result_subscription.clone(),
            });
        }

        self.level()?;
        Ok(())
    }

    pub fn level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidValue {
                option: "log_level".to_string(),
                value: self.log_level.clone(),
            })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_topic: default_task_topic(),
            result_topic: default_result_topic(),
            subscription: default_subscription(),
            max_in_flight: default_max_in_flight(),
            log_level: default_log_level(),
            emulator: EmulatorConfig::default(),
        }
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: default_max_delivery_attempts(),
            result_subscription: default_result_subscription(),
        }
    }
}

fn default_task_topic() -> String {
    "stock-calculation-tasks".to_string()
}

fn default_result_topic() -> String {
    "stock-calculation-results".to_string()
}

fn default_subscription() -> String {
    "indicator-worker-subscription".to_string()
}

fn default_max_in_flight() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_result_subscription() -> String {
    "indicator-result-tap".to_string()
}
