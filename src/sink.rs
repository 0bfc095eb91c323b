//! Sink pipeline: consume from a queue topic, convert, write to an external system.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::connector::{Connector, ConnectorError, ConnectorFactory, SinkTask, SinkTaskFactory};
use crate::converter::Converter;
use crate::pipeline::{
    PipelineCore, PipelineError, PipelineEvent, PipelineHandle, PipelineParts, PipelineState,
    StateTracker, StopSignal,
};
use crate::queue::{Acknowledgement, Acknowledger, Delivery, QueueConsumer};
use crate::record::Record;
use crate::recorder::{AttemptStatus, DeliveryId, DeliveryStatus, Recorder};
use crate::retry::{Escalation, RetryPolicy};

/// Builder for a [`SinkPipeline`].
pub struct SinkPipelineBuilder {
    parts: PipelineParts,
    connector: Option<ConnectorFactory>,
    task: Option<SinkTaskFactory>,
    consumer: Option<Box<dyn QueueConsumer>>,
}

impl SinkPipelineBuilder {
    /// Factory for the connector; called once per run.
    pub fn connector<C, F>(mut self, factory: F) -> Self
    where
        C: Connector + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.connector = Some(Box::new(move || Box::new(factory()) as Box<dyn Connector>));
        self
    }

    /// Factory for the sink task; called once per run.
    pub fn task<T, F>(mut self, factory: F) -> Self
    where
        T: SinkTask + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.task = Some(Box::new(move || Box::new(factory()) as Box<dyn SinkTask>));
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

    /// Queue client to consume from.
    pub fn consumer<Q: QueueConsumer + 'static>(mut self, consumer: Q) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    /// Set the delivery recorder.
    pub fn with_recorder<R: Recorder + 'static>(mut self, recorder: R) -> Self {
        self.parts.recorder = Arc::new(recorder);
        self
    }

    /// Validate the converter chain and assemble the pipeline.
    pub fn build(self) -> Result<SinkPipeline, PipelineError> {
        let core = self.parts.build()?;
        let connector = self.connector.ok_or(ConfigError::MissingComponent("connector"))?;
        let task = self.task.ok_or(ConfigError::MissingComponent("sink task"))?;
        let consumer = self.consumer.ok_or(ConfigError::MissingComponent("queue consumer"))?;

        Ok(SinkPipeline {
            core,
            connector,
            task,
            consumer,
        })
    }
}

/// A validated sink pipeline, ready to run.
pub struct SinkPipeline {
    core: PipelineCore,
    connector: ConnectorFactory,
    task: SinkTaskFactory,
    consumer: Box<dyn QueueConsumer>,
}

impl SinkPipeline {
    /// Start building a sink pipeline.
    pub fn builder(name: &str, config: PipelineConfig) -> SinkPipelineBuilder {
        SinkPipelineBuilder {
            parts: PipelineParts::new(name, config),
            connector: None,
            task: None,
            consumer: None,
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

    /// Validate configuration, start the connector and task, and begin consuming.
    ///
    /// Returns once the consume loop is running. Startup failures are returned
    /// after whatever was already started has been stopped again.
    pub async fn run(self) -> Result<PipelineHandle, PipelineError> {
        let SinkPipeline {
            core,
            connector,
            task,
            mut consumer,
        } = self;

        core.config.validate()?;

        let (state, state_rx) = StateTracker::new(&core.name);
        info!(pipeline = %core.name, topic = %core.config.topic, "Sink pipeline starting");

        consumer.connect().await?;

        let mut connector = connector();
        let task_config = match core.start_connector(connector.as_mut(), &state).await {
            Ok(config) => config,
            Err(e) => {
                connector.stop();
                consumer.close(false).await;
                return Err(e);
            }
        };

        let mut task = task();
        if let Err(source) = task.start(&task_config).await {
            task.stop();
            connector.stop();
            consumer.close(false).await;
            return Err(PipelineError::Startup {
                stage: "task start",
                source,
            });
        }
        state.set(PipelineState::TaskStarted);

        let stop = StopSignal::new();
        let name = core.name.clone();
        let events = core.events.clone();

        let worker = SinkWorker {
            retry: core.config.retry_policy(),
            escalation: core.config.escalation(),
            core,
            connector,
            task,
            consumer,
            state,
            stop: stop.clone(),
        };

        worker.state.set(PipelineState::Consuming);
        let handle = tokio::spawn(worker.run());

        Ok(PipelineHandle::new(name, stop, state_rx, events, handle))
    }
}

/// Outcome of processing one delivery.
enum Flow {
    /// Acknowledged; take the next message.
    Continue,
    /// Stop the pipeline.
    Halt,
    /// Hold this acknowledgement until stopped.
    Suspend(Acknowledger),
    /// Shutdown was requested mid-delivery.
    Cancelled,
}

/// Owns the connector, task, and consumer for the lifetime of one run.
struct SinkWorker {
    core: PipelineCore,
    connector: Box<dyn Connector>,
    task: Box<dyn SinkTask>,
    consumer: Box<dyn QueueConsumer>,
    state: StateTracker,
    stop: StopSignal,
    retry: RetryPolicy,
    escalation: Escalation,
}

impl SinkWorker {
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.shutdown.cancelled() => break,
                next = self.consumer.next_delivery() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    info!(pipeline = %self.core.name, "Queue closed, sink stopping");
                    break;
                }
                Err(e) => {
                    self.core.emit_terminal(PipelineError::Queue(e));
                    break;
                }
            };

            match self.process(delivery).await {
                Flow::Continue => {}
                Flow::Cancelled | Flow::Halt => break,
                Flow::Suspend(ack) => {
                    self.state.set(PipelineState::Halted);
                    self.stop.shutdown.cancelled().await;
                    // Dropped unacknowledged.
                    drop(ack);
                    break;
                }
            }
        }

        self.teardown().await;
    }

    async fn process(&mut self, delivery: Delivery) -> Flow {
        let (message, ack) = delivery.into_parts();
        debug!(
            pipeline = %self.core.name,
            partition = message.partition,
            offset = message.offset,
            "Message received"
        );

        let record = match self.core.convert_to(message).await {
            Ok(record) => record,
            Err(e) => {
                ack.ack(Acknowledgement::Failed(e.to_string()));
                self.core.emit_error(e);
                return Flow::Continue;
            }
        };

        self.put_with_retry(record, ack).await
    }

    /// Write one record, retrying per the policy, and escalate once the budget is spent.
    async fn put_with_retry(&mut self, record: Record, ack: Acknowledger) -> Flow {
        let entity = record.entity_id();
        let delivery = self.core.start_delivery(&entity).await;
        let records = std::slice::from_ref(&record);

        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let put = AssertUnwindSafe(self.task.put(records)).catch_unwind();
            let outcome = tokio::select! {
                biased;
                _ = self.stop.shutdown.cancelled() => None,
                outcome = put => Some(outcome),
            };

            let Some(outcome) = outcome else {
                warn!(
                    pipeline = %self.core.name,
                    entity = %entity,
                    attempt = attempts,
                    "Put abandoned by shutdown"
                );
                self.core
                    .complete_delivery(
                        delivery,
                        DeliveryStatus::Dropped {
                            error: "pipeline stopped during put".to_string(),
                        },
                    )
                    .await;
                return Flow::Cancelled;
            };
            let result = outcome.unwrap_or_else(|panic| Err(ConnectorError::from_panic(panic)));

            let source = match result {
                Ok(()) => {
                    self.core
                        .record_attempt(delivery, attempts, AttemptStatus::Succeeded)
                        .await;
                    self.core
                        .complete_delivery(delivery, DeliveryStatus::Delivered)
                        .await;
                    debug!(pipeline = %self.core.name, entity = %entity, attempts, "Record written");
                    ack.ack(Acknowledgement::Written);
                    return Flow::Continue;
                }
                Err(source) => source,
            };

            let reason = source.to_string();
            self.core
                .record_attempt(
                    delivery,
                    attempts,
                    AttemptStatus::Failed {
                        error: reason.clone(),
                    },
                )
                .await;
            self.core.emit_error(PipelineError::Write {
                entity: entity.clone(),
                attempt: attempts,
                source,
            });

            match self.retry.delay_for_attempt(attempts) {
                Some(delay) => {
                    debug!(
                        pipeline = %self.core.name,
                        entity = %entity,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying put"
                    );
                    tokio::select! {
                        biased;
                        _ = self.stop.shutdown.cancelled() => {
                            self.core
                                .complete_delivery(delivery, DeliveryStatus::Dropped { error: reason })
                                .await;
                            return Flow::Cancelled;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    return self
                        .escalate(entity, attempts, reason, delivery, ack)
                        .await;
                }
            }
        }
    }

    async fn escalate(
        &mut self,
        entity: String,
        attempts: u32,
        reason: String,
        delivery: Option<DeliveryId>,
        ack: Acknowledger,
    ) -> Flow {
        match self.escalation {
            Escalation::Halt => {
                self.core
                    .complete_delivery(delivery, DeliveryStatus::Halted { error: reason })
                    .await;
                self.core
                    .emit_terminal(PipelineError::Halted { entity, attempts });
                Flow::Halt
            }
            Escalation::Wait => {
                self.core
                    .complete_delivery(delivery, DeliveryStatus::Suspended { error: reason })
                    .await;
                self.core
                    .emit_terminal(PipelineError::Suspended { entity, attempts });
                Flow::Suspend(ack)
            }
            Escalation::Propagate => {
                warn!(
                    pipeline = %self.core.name,
                    entity = %entity,
                    attempts,
                    "Retries exhausted, dropping record"
                );
                self.core
                    .complete_delivery(
                        delivery,
                        DeliveryStatus::Dropped {
                            error: reason.clone(),
                        },
                    )
                    .await;
                ack.ack(Acknowledgement::Failed(reason));
                Flow::Continue
            }
        }
    }

    async fn teardown(mut self) {
        let commit = self.stop.commit_on_stop();
        self.consumer.close(commit).await;
        self.task.stop();
        self.connector.stop();
        self.state.set(PipelineState::Stopped);
        info!(pipeline = %self.core.name, committed = commit, "Sink pipeline stopped");
    }
}
