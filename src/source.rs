//! Source pipeline: poll an external system, convert, publish to a queue topic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::connector::{Connector, ConnectorFactory, SourceTask, SourceTaskFactory};
use crate::converter::Converter;
use crate::pipeline::{
    PipelineCore, PipelineError, PipelineEvent, PipelineHandle, PipelineParts, PipelineState,
    StateTracker, StopSignal,
};
use crate::queue::QueueProducer;
use crate::record::Record;
use crate::recorder::{AttemptStatus, DeliveryStatus, Recorder};

/// Poll interval used when neither the configuration nor the caller sets one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for a [`SourcePipeline`].
pub struct SourcePipelineBuilder {
    parts: PipelineParts,
    connector: Option<ConnectorFactory>,
    task: Option<SourceTaskFactory>,
    producer: Option<Box<dyn QueueProducer>>,
    default_poll_interval: Duration,
}

impl SourcePipelineBuilder {
    /// Factory for the connector; called once per run.
    pub fn connector<C, F>(mut self, factory: F) -> Self
    where
        C: Connector + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.connector = Some(Box::new(move || Box::new(factory()) as Box<dyn Connector>));
        self
    }

    /// Factory for the source task; called once per run.
    pub fn task<T, F>(mut self, factory: F) -> Self
    where
        T: SourceTask + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.task = Some(Box::new(move || Box::new(factory()) as Box<dyn SourceTask>));
        self
    }

    /// Append a converter to the chain.
    pub fn converter<C: Converter + 'static>(mut self, converter: C) -> Self {
        self.parts.converter(converter);
        self
    }

    /// Append a shared converter to the chain.
    pub fn converter_shared(mut self, converter: Arc<dyn Converter>) -> Self {
        self.parts.converter_shared(converter);
        self
    }

    /// Queue client to publish to.
    pub fn producer<P: QueueProducer + 'static>(mut self, producer: P) -> Self {
        self.producer = Some(Box::new(producer));
        self
    }

    /// Poll interval used when the configuration has no `pollInterval`.
    pub fn default_poll_interval(mut self, interval: Duration) -> Self {
        self.default_poll_interval = interval;
        self
    }

    /// Set the delivery recorder.
    pub fn with_recorder<R: Recorder + 'static>(mut self, recorder: R) -> Self {
        self.parts.recorder = Arc::new(recorder);
        self
    }

    /// Validate the converter chain and assemble the pipeline.
    pub fn build(self) -> Result<SourcePipeline, PipelineError> {
        let core = self.parts.build()?;
        let connector = self.connector.ok_or(ConfigError::MissingComponent("connector"))?;
        let task = self.task.ok_or(ConfigError::MissingComponent("source task"))?;
        let producer = self.producer.ok_or(ConfigError::MissingComponent("queue producer"))?;

        Ok(SourcePipeline {
            core,
            connector,
            task,
            producer,
            default_poll_interval: self.default_poll_interval,
        })
    }
}

/// A validated source pipeline, ready to run.
pub struct SourcePipeline {
    core: PipelineCore,
    connector: ConnectorFactory,
    task: SourceTaskFactory,
    producer: Box<dyn QueueProducer>,
    default_poll_interval: Duration,
}

impl SourcePipeline {
    /// Start building a source pipeline.
    pub fn builder(name: &str, config: PipelineConfig) -> SourcePipelineBuilder {
        SourcePipelineBuilder {
            parts: PipelineParts::new(name, config),
            connector: None,
            task: None,
            producer: None,
            default_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Subscribe to pipeline events, including those raised during startup.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.core.subscribe()
    }

    /// Validate configuration, start the connector and task, and begin polling.
    pub async fn run(self) -> Result<PipelineHandle, PipelineError> {
        let SourcePipeline {
            core,
            connector,
            task,
            mut producer,
            default_poll_interval,
        } = self;

        core.config.validate_source()?;
        let poll_interval = core.config.poll_interval().unwrap_or(default_poll_interval);

        let (state, state_rx) = StateTracker::new(&core.name);
        info!(
            pipeline = %core.name,
            topic = %core.config.topic,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Source pipeline starting"
        );

        producer.connect().await?;

        let mut connector = connector();
        let task_config = match core.start_connector(connector.as_mut(), &state).await {
            Ok(config) => config,
            Err(e) => {
                connector.stop();
                producer.close(false).await;
                return Err(e);
            }
        };

        let mut task = task();
        if let Err(source) = task.start(&task_config).await {
            task.stop();
            connector.stop();
            producer.close(false).await;
            return Err(PipelineError::Startup {
                stage: "task start",
                source,
            });
        }
        state.set(PipelineState::TaskStarted);

        let stop = StopSignal::new();
        let name = core.name.clone();
        let events = core.events.clone();

        let worker = SourceWorker {
            core,
            connector,
            task,
            producer,
            state,
            stop: stop.clone(),
            poll_interval,
        };

        worker.state.set(PipelineState::Polling);
        let handle = tokio::spawn(worker.run());

        Ok(PipelineHandle::new(name, stop, state_rx, events, handle))
    }
}

/// Owns the connector, task, and producer for the lifetime of one run.
struct SourceWorker {
    core: PipelineCore,
    connector: Box<dyn Connector>,
    task: Box<dyn SourceTask>,
    producer: Box<dyn QueueProducer>,
    state: StateTracker,
    stop: StopSignal,
    poll_interval: Duration,
}

/// Result of publishing one polled record.
enum Outcome {
    Sent,
    Failed,
    /// Shutdown interrupted the send.
    Cancelled,
}

impl SourceWorker {
    async fn run(mut self) {
        let mut ticker = interval(self.poll_interval);
        // A slow batch delays the next poll instead of stacking polls up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Consume immediate first tick

        let shutdown = self.stop.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.poll_once().await {
                break;
            }
        }

        self.teardown().await;
    }

    /// Poll one batch and drain it fully before returning.
    ///
    /// Returns false once shutdown was requested.
    async fn poll_once(&mut self) -> bool {
        let polled = tokio::select! {
            biased;
            _ = self.stop.shutdown.cancelled() => return false,
            polled = self.task.poll() => polled,
        };

        let batch = match polled {
            Ok(batch) => batch,
            Err(e) => {
                self.core.emit_error(PipelineError::Poll(e));
                return true;
            }
        };

        let polled = batch.len();
        let mut records = batch.into_iter().flatten();
        let mut published = 0usize;

        while let Some(record) = records.next() {
            if self.stop.shutdown.is_cancelled() {
                self.abandon(1 + records.count());
                return false;
            }

            match self.publish(record).await {
                Outcome::Sent => published += 1,
                Outcome::Failed => {}
                Outcome::Cancelled => {
                    self.abandon(1 + records.count());
                    return false;
                }
            }
        }

        if polled > 0 {
            debug!(pipeline = %self.core.name, polled, published, "Poll batch drained");
        }
        true
    }

    fn abandon(&self, abandoned: usize) {
        warn!(
            pipeline = %self.core.name,
            abandoned,
            "Shutdown requested, abandoning rest of poll batch"
        );
    }

    async fn publish(&mut self, record: Record) -> Outcome {
        let entity = record.entity_id();
        let delivery = self.core.start_delivery(&entity).await;

        let message = match self.core.convert_from(record).await {
            Ok(message) => message,
            Err(e) => {
                self.core
                    .complete_delivery(delivery, DeliveryStatus::Dropped { error: e.to_string() })
                    .await;
                self.core.emit_error(e);
                return Outcome::Failed;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = self.stop.shutdown.cancelled() => None,
            sent = self.producer.send(message) => Some(sent),
        };

        match sent {
            Some(Ok(receipt)) => {
                self.core
                    .record_attempt(delivery, 1, AttemptStatus::Succeeded)
                    .await;
                self.core
                    .complete_delivery(delivery, DeliveryStatus::Delivered)
                    .await;
                debug!(
                    pipeline = %self.core.name,
                    entity = %entity,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    "Record published"
                );
                Outcome::Sent
            }
            Some(Err(source)) => {
                let error = source.to_string();
                self.core
                    .record_attempt(delivery, 1, AttemptStatus::Failed { error: error.clone() })
                    .await;
                self.core
                    .complete_delivery(delivery, DeliveryStatus::Dropped { error })
                    .await;
                self.core.emit_error(PipelineError::Publish { entity, source });
                Outcome::Failed
            }
            None => {
                self.core
                    .complete_delivery(
                        delivery,
                        DeliveryStatus::Dropped {
                            error: "pipeline stopped during publish".to_string(),
                        },
                    )
                    .await;
                Outcome::Cancelled
            }
        }
    }

    async fn teardown(mut self) {
        let commit = self.stop.commit_on_stop();
        self.producer.close(commit).await;
        self.task.stop();
        self.connector.stop();
        self.state.set(PipelineState::Stopped);
        info!(pipeline = %self.core.name, "Source pipeline stopped");
    }
}
