//! Pipeline configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{Escalation, RetryPolicy, DEFAULT_MAX_RETRIES};

/// Error returned while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config.{0} must be a valid object")]
    MissingSection(&'static str),

    #[error("config.{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("pipeline is missing its {0}")]
    MissingComponent(&'static str),
}

/// Configuration shared by source and sink pipelines.
///
/// Keys are camelCase:
///
/// ```yaml
/// queue: { brokers: "localhost:9092" }
/// topic: orders
/// partitions: 30
/// maxTasks: 1
/// connector: { table: orders }
/// pollInterval: 500
/// maxRetries: 3
/// awaitRetry: 10
/// waitOnError: false
/// haltOnError: false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Queue connection settings, passed through to the queue client.
    #[serde(default, alias = "kafka")]
    pub queue: Option<serde_json::Value>,
    /// Topic to publish to or consume from.
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub partitions: Option<u32>,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: u32,
    /// Connector properties, passed to `Connector::start`.
    #[serde(default)]
    pub connector: Option<serde_json::Value>,
    /// Poll interval in milliseconds (source only).
    #[serde(default)]
    pub poll_interval: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between write attempts in milliseconds.
    #[serde(default = "default_await_retry")]
    pub await_retry: u64,
    #[serde(default)]
    pub wait_on_error: bool,
    #[serde(default)]
    pub halt_on_error: bool,
}

fn default_max_tasks() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_await_retry() -> u64 {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue: None,
            topic: String::new(),
            partitions: None,
            max_tasks: default_max_tasks(),
            connector: None,
            poll_interval: None,
            max_retries: default_max_retries(),
            await_retry: default_await_retry(),
            wait_on_error: false,
            halt_on_error: false,
        }
    }
}

impl PipelineConfig {
    /// Parse from a JSON value.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Parse from a JSON document.
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Parse from a YAML document.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    /// Set the queue settings.
    pub fn with_queue(mut self, queue: serde_json::Value) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the connector properties.
    pub fn with_connector(mut self, connector: serde_json::Value) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Check the shape shared by both pipeline kinds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.queue, Some(serde_json::Value::Object(_))) {
            return Err(ConfigError::MissingSection("queue"));
        }

        if !matches!(self.connector, Some(serde_json::Value::Object(_))) {
            return Err(ConfigError::MissingSection("connector"));
        }

        if self.max_tasks == 0 {
            return Err(ConfigError::Invalid {
                field: "maxTasks",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.poll_interval == Some(0) {
            return Err(ConfigError::Invalid {
                field: "pollInterval",
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Check the shape required by a source pipeline.
    pub fn validate_source(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.topic.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "topic",
                reason: "a source needs a topic to publish to".to_string(),
            });
        }

        Ok(())
    }

    /// Connector properties, or `null` when absent.
    pub fn connector_properties(&self) -> serde_json::Value {
        self.connector.clone().unwrap_or(serde_json::Value::Null)
    }

    /// Retry policy for sink writes.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, Duration::from_millis(self.await_retry))
    }

    /// What to do once a record's retries are spent.
    pub fn escalation(&self) -> Escalation {
        Escalation::from_flags(self.halt_on_error, self.wait_on_error)
    }

    /// Configured poll interval, if any.
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval.map(Duration::from_millis)
    }
}
