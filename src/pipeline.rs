//! Pipeline base: error taxonomy, events, state, and the running handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainBuilder, ChainError, ConverterChain};
use crate::config::{ConfigError, PipelineConfig};
use crate::connector::{Connector, ConnectorError, TaskConfig};
use crate::converter::{ContractError, ConvertError, Converter};
use crate::queue::QueueError;
use crate::record::{OutboundMessage, Payload, QueueMessage, Record};
use crate::recorder::{AttemptStatus, DeliveryId, DeliveryStatus, NoopRecorder, Recorder};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Error reported by a pipeline, synchronously from `build`/`run` or on the
/// event channel while running.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing or malformed configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A converter does not satisfy the converter contract.
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),

    /// A converter stage failed; the record was dropped.
    #[error("conversion of {entity} failed: {source}")]
    Conversion {
        entity: String,
        #[source]
        source: ChainError,
    },

    /// The converted payload could not be resolved into a record or message.
    #[error("envelope of {entity} is invalid: {source}")]
    Envelope {
        entity: String,
        #[source]
        source: ConvertError,
    },

    /// A write attempt failed.
    #[error("put of {entity} failed on attempt {attempt}: {source}")]
    Write {
        entity: String,
        attempt: u32,
        #[source]
        source: ConnectorError,
    },

    /// The connector or task failed to start.
    #[error("startup failed in {stage}: {source}")]
    Startup {
        stage: &'static str,
        #[source]
        source: ConnectorError,
    },

    /// The source task failed to poll.
    #[error("poll failed: {0}")]
    Poll(#[source] ConnectorError),

    /// Publishing a record to the queue failed.
    #[error("publish of {entity} failed: {source}")]
    Publish {
        entity: String,
        #[source]
        source: QueueError,
    },

    /// The queue client failed outside of a publish.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The delivery recorder failed.
    #[error("recorder error: {0}")]
    Recorder(#[source] anyhow::Error),

    /// Retries were spent and the pipeline stopped itself.
    #[error("halting because of retry error: {entity} failed after {attempts} attempts")]
    Halted { entity: String, attempts: u32 },

    /// Retries were spent and the pipeline is holding the message.
    #[error("waiting because of retry error: {entity} failed after {attempts} attempts")]
    Suspended { entity: String, attempts: u32 },
}

/// Event published by a running pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Non-fatal failure; the pipeline keeps going.
    Error(Arc<PipelineError>),
    /// Failure that stopped or suspended the pipeline.
    Terminal(Arc<PipelineError>),
}

impl PipelineEvent {
    /// The error carried by this event.
    pub fn error(&self) -> &PipelineError {
        match self {
            Self::Error(e) | Self::Terminal(e) => e,
        }
    }

    /// Returns true for a terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Created,
    ConnectorStarted,
    TaskConfigured,
    TaskStarted,
    /// Source drive loop is running.
    Polling,
    /// Sink drive loop is running.
    Consuming,
    /// Sink is holding a failed message until it is stopped.
    Halted,
    Stopped,
}

impl PipelineState {
    /// Returns true once the drive loop is running or has ended.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Polling | Self::Consuming | Self::Halted)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::ConnectorStarted => "connector_started",
            Self::TaskConfigured => "task_configured",
            Self::TaskStarted => "task_started",
            Self::Polling => "polling",
            Self::Consuming => "consuming",
            Self::Halted => "halted",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Publishes state transitions.
pub(crate) struct StateTracker {
    pipeline: String,
    tx: watch::Sender<PipelineState>,
}

impl StateTracker {
    pub(crate) fn new(pipeline: &str) -> (Self, watch::Receiver<PipelineState>) {
        let (tx, rx) = watch::channel(PipelineState::Created);
        let tracker = Self {
            pipeline: pipeline.to_string(),
            tx,
        };
        (tracker, rx)
    }

    pub(crate) fn set(&self, state: PipelineState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            info!(
                pipeline = %self.pipeline,
                from = %previous,
                to = %state,
                "Pipeline state changed"
            );
        }
    }
}

/// Parts shared by the source and sink builders.
pub(crate) struct PipelineParts {
    pub(crate) name: String,
    pub(crate) config: PipelineConfig,
    pub(crate) chain: ChainBuilder,
    pub(crate) recorder: Arc<dyn Recorder>,
}

impl PipelineParts {
    pub(crate) fn new(name: &str, config: PipelineConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            chain: ChainBuilder::new(),
            recorder: Arc::new(NoopRecorder),
        }
    }

    pub(crate) fn converter<C: Converter + 'static>(&mut self, converter: C) {
        self.chain = std::mem::take(&mut self.chain).then(converter);
    }

    pub(crate) fn converter_shared(&mut self, converter: Arc<dyn Converter>) {
        self.chain = std::mem::take(&mut self.chain).then_shared(converter);
    }

    /// Validate the converters and assemble the core.
    pub(crate) fn build(self) -> Result<PipelineCore, PipelineError> {
        let chain = self.chain.build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        debug!(
            pipeline = %self.name,
            converters = ?chain.stage_names(),
            "Converter chain validated"
        );

        Ok(PipelineCore {
            name: self.name,
            config: self.config,
            chain,
            recorder: self.recorder,
            events,
        })
    }
}

/// The validated plugin set and configuration of one pipeline.
pub(crate) struct PipelineCore {
    pub(crate) name: String,
    pub(crate) config: PipelineConfig,
    pub(crate) chain: ConverterChain,
    pub(crate) recorder: Arc<dyn Recorder>,
    pub(crate) events: broadcast::Sender<PipelineEvent>,
}

impl PipelineCore {
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Report a non-fatal error.
    pub(crate) fn emit_error(&self, err: PipelineError) {
        warn!(pipeline = %self.name, error = %err, "Pipeline error");
        // No subscribers is fine.
        let _ = self.events.send(PipelineEvent::Error(Arc::new(err)));
    }

    /// Report an error that ends or suspends the pipeline.
    pub(crate) fn emit_terminal(&self, err: PipelineError) {
        error!(pipeline = %self.name, error = %err, "Pipeline terminal error");
        let _ = self.events.send(PipelineEvent::Terminal(Arc::new(err)));
    }

    /// Convert a consumed message into a canonical record.
    pub(crate) async fn convert_to(&self, message: QueueMessage) -> Result<Record, PipelineError> {
        let entity = format!("{}/{}@{}", message.topic, message.partition, message.offset);
        let topic = message.topic.clone();
        let (partition, offset) = (message.partition, message.offset);
        let key = message.key.clone();

        let payload = self
            .chain
            .convert_to(Payload::Message(message))
            .await
            .map_err(|source| PipelineError::Conversion {
                entity: entity.clone(),
                source,
            })?;

        let mut record = payload
            .into_record()
            .map_err(|source| PipelineError::Envelope { entity, source })?;

        // A converter may build a fresh record; a sink record is always positioned.
        record.topic.get_or_insert(topic);
        record.partition.get_or_insert(partition);
        record.offset.get_or_insert(offset);
        if record.key.is_none() {
            record.key = key;
        }

        Ok(record)
    }

    /// Convert a polled record into a message for the configured topic.
    pub(crate) async fn convert_from(&self, record: Record) -> Result<OutboundMessage, PipelineError> {
        let entity = record.entity_id();

        let payload = self
            .chain
            .convert_from(Payload::Record(record))
            .await
            .map_err(|source| PipelineError::Conversion {
                entity: entity.clone(),
                source,
            })?;

        payload
            .into_outbound(&self.config.topic)
            .map_err(|source| PipelineError::Envelope { entity, source })
    }

    /// Start the connector and derive the task configuration.
    pub(crate) async fn start_connector(
        &self,
        connector: &mut dyn Connector,
        state: &StateTracker,
    ) -> Result<TaskConfig, PipelineError> {
        connector
            .start(&self.config.connector_properties())
            .await
            .map_err(|source| PipelineError::Startup {
                stage: "connector start",
                source,
            })?;
        state.set(PipelineState::ConnectorStarted);

        let mut configs = connector
            .task_configs(self.config.max_tasks)
            .await
            .map_err(|source| PipelineError::Startup {
                stage: "task configs",
                source,
            })?;

        if configs.len() > 1 {
            warn!(
                pipeline = %self.name,
                returned = configs.len(),
                "Connector returned several task configs; running a single task on the first"
            );
        }

        if configs.is_empty() {
            return Err(PipelineError::Startup {
                stage: "task configs",
                source: ConnectorError::NoTaskConfig,
            });
        }

        let task_config = configs.swap_remove(0);
        state.set(PipelineState::TaskConfigured);
        Ok(task_config)
    }

    pub(crate) async fn start_delivery(&self, entity_id: &str) -> Option<DeliveryId> {
        match self.recorder.start_delivery(&self.name, entity_id).await {
            Ok(id) => Some(id),
            Err(e) => {
                self.emit_error(PipelineError::Recorder(e));
                None
            }
        }
    }

    pub(crate) async fn record_attempt(&self, id: Option<DeliveryId>, attempt: u32, status: AttemptStatus) {
        let Some(id) = id else { return };
        if let Err(e) = self.recorder.record_attempt(id, attempt, status).await {
            self.emit_error(PipelineError::Recorder(e));
        }
    }

    pub(crate) async fn complete_delivery(&self, id: Option<DeliveryId>, status: DeliveryStatus) {
        let Some(id) = id else { return };
        if let Err(e) = self.recorder.complete_delivery(id, status).await {
            self.emit_error(PipelineError::Recorder(e));
        }
    }
}

/// Handle to a running pipeline.
///
/// Dropping the handle does not stop the pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    name: String,
    shutdown: CancellationToken,
    commit_on_stop: Arc<AtomicBool>,
    state: watch::Receiver<PipelineState>,
    events: broadcast::Sender<PipelineEvent>,
    worker: JoinHandle<()>,
}

/// Stop signal shared between a handle and its worker.
#[derive(Clone)]
pub(crate) struct StopSignal {
    pub(crate) shutdown: CancellationToken,
    commit_on_stop: Arc<AtomicBool>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            commit_on_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn commit_on_stop(&self) -> bool {
        self.commit_on_stop.load(Ordering::SeqCst)
    }
}

impl PipelineHandle {
    pub(crate) fn new(
        name: String,
        stop: StopSignal,
        state: watch::Receiver<PipelineState>,
        events: broadcast::Sender<PipelineEvent>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            shutdown: stop.shutdown,
            commit_on_stop: stop.commit_on_stop,
            state,
            events,
            worker,
        }
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `predicate`, returning that state.
    ///
    /// Returns the last known state if the pipeline ends without reaching it.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> PipelineState
    where
        F: FnMut(&PipelineState) -> bool,
    {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| predicate(s)).await.map(|s| *s);
        reached.unwrap_or_else(|_| *self.state.borrow())
    }

    /// Subscribe to pipeline events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Returns true once the drive loop has exited and torn down.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Ask the pipeline to stop without waiting for teardown.
    pub fn request_stop(&self) {
        self.shutdown.cancel();
    }

    /// Stop without committing offsets and wait for teardown.
    pub async fn stop(self) {
        self.finish(false).await;
    }

    /// Stop, committing acknowledged offsets, and wait for teardown.
    pub async fn stop_and_commit(self) {
        self.finish(true).await;
    }

    /// Wait for the pipeline to end on its own (halt or closed queue).
    pub async fn join(self) {
        if let Err(e) = self.worker.await {
            error!(pipeline = %self.name, error = %e, "Pipeline worker panicked");
        }
    }

    async fn finish(self, commit: bool) {
        self.commit_on_stop.store(commit, Ordering::SeqCst);
        self.shutdown.cancel();
        self.join().await;
    }
}
