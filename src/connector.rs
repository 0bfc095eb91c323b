//! Connector and task capability traits.

use async_trait::async_trait;
use thiserror::Error;

use crate::record::Record;

/// Configuration handed from a connector to the task it splits work into.
pub type TaskConfig = serde_json::Value;

/// Error raised by a connector or task implementation.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Transient failure - worth retrying.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure - won't succeed on retry.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),

    /// The implementation panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// The connector produced no task configuration.
    #[error("connector returned no task configuration")]
    NoTaskConfig,
}

impl ConnectorError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Build from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Owns the connection-level lifecycle to the external system.
///
/// A fresh instance is created for every run and stopped when the run ends.
#[async_trait]
pub trait Connector: Send {
    /// Connect using the `connector` section of the configuration.
    async fn start(&mut self, properties: &serde_json::Value) -> Result<(), ConnectorError>;

    /// Split the work into at most `max_tasks` task configurations.
    async fn task_configs(&mut self, max_tasks: u32) -> Result<Vec<TaskConfig>, ConnectorError>;

    /// Release connection-level resources.
    fn stop(&mut self);
}

/// Reads new records from the external system.
#[async_trait]
pub trait SourceTask: Send {
    async fn start(&mut self, config: &TaskConfig) -> Result<(), ConnectorError>;

    /// Return the next batch.
    ///
    /// `None` entries are holes in the batch and are skipped by the runtime.
    async fn poll(&mut self) -> Result<Vec<Option<Record>>, ConnectorError>;

    fn stop(&mut self);
}

/// Writes records to the external system.
#[async_trait]
pub trait SinkTask: Send {
    async fn start(&mut self, config: &TaskConfig) -> Result<(), ConnectorError>;

    /// Durably write a batch.
    ///
    /// Both an `Err` and a panic count as a failed attempt and are retried
    /// according to the pipeline's retry policy.
    async fn put(&mut self, records: &[Record]) -> Result<(), ConnectorError>;

    fn stop(&mut self);
}

pub(crate) type ConnectorFactory = Box<dyn Fn() -> Box<dyn Connector> + Send + Sync>;
pub(crate) type SourceTaskFactory = Box<dyn Fn() -> Box<dyn SourceTask> + Send + Sync>;
pub(crate) type SinkTaskFactory = Box<dyn Fn() -> Box<dyn SinkTask> + Send + Sync>;
