//! Recording interface for record delivery history.

use async_trait::async_trait;

/// Unique identifier for a recorded delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryId(pub i64);

/// Final status of a record's delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Written to the external system or published to the queue.
    Delivered,
    /// Given up on; the pipeline moved past it.
    Dropped { error: String },
    /// Retries spent and the pipeline was stopped.
    Halted { error: String },
    /// Retries spent and the pipeline is waiting for an operator.
    Suspended { error: String },
}

impl DeliveryStatus {
    /// Status label and error message, as stored by recorders.
    pub fn as_parts(&self) -> (&'static str, Option<&str>) {
        match self {
            Self::Delivered => ("delivered", None),
            Self::Dropped { error } => ("dropped", Some(error)),
            Self::Halted { error } => ("halted", Some(error)),
            Self::Suspended { error } => ("suspended", Some(error)),
        }
    }
}

/// Outcome of a single write or publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
    Succeeded,
    Failed { error: String },
}

/// Records delivery attempts for observability.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Record that a pipeline began delivering a record.
    async fn start_delivery(&self, pipeline_name: &str, entity_id: &str) -> anyhow::Result<DeliveryId>;

    /// Record one attempt (1-indexed).
    async fn record_attempt(
        &self,
        delivery_id: DeliveryId,
        attempt: u32,
        status: AttemptStatus,
    ) -> anyhow::Result<()>;

    /// Record the final outcome.
    async fn complete_delivery(&self, delivery_id: DeliveryId, status: DeliveryStatus) -> anyhow::Result<()>;
}

/// A no-op recorder that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopRecorder;

impl NoopRecorder {
    /// Create a new no-op recorder.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Recorder for NoopRecorder {
    async fn start_delivery(&self, _pipeline_name: &str, _entity_id: &str) -> anyhow::Result<DeliveryId> {
        Ok(DeliveryId(0))
    }

    async fn record_attempt(
        &self,
        _delivery_id: DeliveryId,
        _attempt: u32,
        _status: AttemptStatus,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn complete_delivery(&self, _delivery_id: DeliveryId, _status: DeliveryStatus) -> anyhow::Result<()> {
        Ok(())
    }
}
