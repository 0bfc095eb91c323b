//! Integration tests for the sink pipeline: retries, escalation, and lifecycle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use connectflow::{
    memory_queue, Acknowledgement, ConfigError, ConvertError, Connector, ConnectorError,
    Converter, JsonConverter, Payload, PipelineConfig, PipelineError, PipelineEvent,
    PipelineState, Record, SinkPipeline, SinkTask, TaskConfig,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn sink_config(max_retries: u32, await_retry: u64) -> PipelineConfig {
    PipelineConfig::from_json_value(json!({
        "queue": {"brokers": "memory"},
        "topic": "orders",
        "connector": {"table": "orders"},
        "maxRetries": max_retries,
        "awaitRetry": await_retry,
    }))
    .unwrap()
}

// Connector that hands out a fixed list of task configs
#[derive(Clone, Default)]
struct TestConnector {
    fail_start: bool,
    configs: Option<Vec<TaskConfig>>,
    started_with: Arc<Mutex<Option<serde_json::Value>>>,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for TestConnector {
    async fn start(&mut self, properties: &serde_json::Value) -> Result<(), ConnectorError> {
        if self.fail_start {
            return Err(ConnectorError::permanent(anyhow::anyhow!("bad credentials")));
        }
        *self.started_with.lock().unwrap() = Some(properties.clone());
        Ok(())
    }

    async fn task_configs(&mut self, _max_tasks: u32) -> Result<Vec<TaskConfig>, ConnectorError> {
        Ok(self
            .configs
            .clone()
            .unwrap_or_else(|| vec![json!({"shard": 0})]))
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug)]
enum Outcome {
    Ok,
    Fail,
    Panic,
}

// Sink task whose put results follow a script; `Ok` once the script runs out
#[derive(Clone, Default)]
struct ScriptedTask {
    script: Arc<Mutex<VecDeque<Outcome>>>,
    always_fail: bool,
    fail_start: bool,
    config: Arc<Mutex<Option<TaskConfig>>>,
    puts: Arc<Mutex<Vec<Record>>>,
    stopped: Arc<AtomicBool>,
}

impl ScriptedTask {
    fn with_script(outcomes: &[Outcome]) -> Self {
        Self {
            script: Arc::new(Mutex::new(outcomes.iter().copied().collect())),
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    fn put_count(&self) -> usize {
        self.puts.lock().unwrap().len()
    }
}

#[async_trait]
impl SinkTask for ScriptedTask {
    async fn start(&mut self, config: &TaskConfig) -> Result<(), ConnectorError> {
        if self.fail_start {
            return Err(ConnectorError::permanent(anyhow::anyhow!("table missing")));
        }
        *self.config.lock().unwrap() = Some(config.clone());
        Ok(())
    }

    async fn put(&mut self, records: &[Record]) -> Result<(), ConnectorError> {
        self.puts.lock().unwrap().extend(records.iter().cloned());

        let next = self.script.lock().unwrap().pop_front();
        let outcome = match next {
            Some(outcome) => outcome,
            None if self.always_fail => Outcome::Fail,
            None => Outcome::Ok,
        };

        match outcome {
            Outcome::Ok => Ok(()),
            Outcome::Fail => Err(ConnectorError::retryable(anyhow::anyhow!("store unavailable"))),
            Outcome::Panic => panic!("driver crashed"),
        }
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// Builds a fresh record from the raw body instead of decoding the message
struct Rebuild;

#[async_trait]
impl Converter for Rebuild {
    fn name(&self) -> &str {
        "rebuild"
    }

    async fn to_connect_data(&self, payload: Payload) -> Result<Payload, ConvertError> {
        match payload {
            Payload::Message(message) => Ok(Payload::Record(Record::new(json!({
                "size": message.value.len(),
            })))),
            other => Ok(other),
        }
    }

    async fn from_connect_data(&self, payload: Payload) -> Result<Payload, ConvertError> {
        Ok(payload)
    }
}

// Sink task whose put never completes
#[derive(Clone, Default)]
struct StalledTask {
    calls: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl SinkTask for StalledTask {
    async fn start(&mut self, _config: &TaskConfig) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn put(&mut self, _records: &[Record]) -> Result<(), ConnectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn drain(events: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_recovers_within_retry_budget() {
    for failures in 0..3usize {
        let (consumer, queue) = memory_queue("orders");
        let task = ScriptedTask::with_script(&vec![Outcome::Fail; failures]);

        let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
            .connector(TestConnector::default)
            .task({
                let task = task.clone();
                move || task.clone()
            })
            .consumer(consumer)
            .build()
            .unwrap();
        let handle = sink.run().await.unwrap();

        let ack = queue.deliver_record(&Record::new(json!({"id": 1}))).unwrap();
        let ack = timeout(WAIT, ack).await.unwrap().unwrap();

        assert_eq!(ack, Acknowledgement::Written);
        assert_eq!(task.put_count(), failures + 1, "failures = {}", failures);
        handle.stop().await;
    }
}

#[tokio::test]
async fn test_panic_and_error_then_success() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::with_script(&[Outcome::Panic, Outcome::Fail, Outcome::Ok]);

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 5))
        .connector(TestConnector::default)
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .converter(JsonConverter::new())
        .consumer(consumer)
        .build()
        .unwrap();
    let mut events = sink.subscribe();
    let handle = sink.run().await.unwrap();

    let ack = queue
        .deliver_record(&Record::new(json!({"id": 42})).with_key("order-42"))
        .unwrap();
    let ack = timeout(WAIT, ack).await.unwrap().unwrap();
    assert!(ack.is_written());

    let puts = task.puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 3);
    assert!(puts.iter().all(|r| r.value == json!({"id": 42})));
    assert_eq!(puts[0].key.as_deref(), Some("order-42"));
    assert_eq!(puts[0].offset, Some(0));

    let events = drain(&mut events);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| !e.is_terminal()));
    assert!(matches!(
        events[0].error(),
        PipelineError::Write {
            attempt: 1,
            source: ConnectorError::Panicked(_),
            ..
        }
    ));
    assert!(matches!(
        events[1].error(),
        PipelineError::Write {
            attempt: 2,
            source: ConnectorError::Retryable(_),
            ..
        }
    ));

    assert_eq!(handle.state(), PipelineState::Consuming);
    handle.stop().await;
}

#[tokio::test]
async fn test_zero_retries_means_single_attempt() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::failing();

    let sink = SinkPipeline::builder("orders-sink", sink_config(0, 1))
        .connector(TestConnector::default)
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .consumer(consumer)
        .build()
        .unwrap();
    let handle = sink.run().await.unwrap();

    let ack = queue.deliver_record(&Record::new(json!(1))).unwrap();
    let ack = timeout(WAIT, ack).await.unwrap().unwrap();

    assert!(matches!(ack, Acknowledgement::Failed(_)));
    assert_eq!(task.put_count(), 1);
    handle.stop().await;
}

// =============================================================================
// Escalation
// =============================================================================

#[tokio::test]
async fn test_propagate_fails_ack_and_moves_on() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::with_script(&[Outcome::Fail, Outcome::Fail]);

    let sink = SinkPipeline::builder("orders-sink", sink_config(1, 1))
        .connector(TestConnector::default)
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .consumer(consumer)
        .build()
        .unwrap();
    let mut events = sink.subscribe();
    let handle = sink.run().await.unwrap();

    let first = queue.deliver_record(&Record::new(json!({"id": 1}))).unwrap();
    let second = queue.deliver_record(&Record::new(json!({"id": 2}))).unwrap();

    let first = timeout(WAIT, first).await.unwrap().unwrap();
    let second = timeout(WAIT, second).await.unwrap().unwrap();

    assert!(matches!(first, Acknowledgement::Failed(ref reason) if reason.contains("store unavailable")));
    assert_eq!(second, Acknowledgement::Written);
    assert_eq!(task.put_count(), 3);

    // Two write errors, no terminal event.
    let events = drain(&mut events);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| !e.is_terminal()));
    assert_eq!(handle.state(), PipelineState::Consuming);

    handle.stop().await;
}

#[tokio::test]
async fn test_halt_stops_pipeline_without_ack() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::failing();
    let connector = TestConnector::default();

    let mut config = sink_config(1, 1);
    config.halt_on_error = true;
    config.wait_on_error = true;

    let sink = SinkPipeline::builder("orders-sink", config)
        .connector({
            let connector = connector.clone();
            move || connector.clone()
        })
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .consumer(consumer)
        .build()
        .unwrap();
    let mut events = sink.subscribe();
    let handle = sink.run().await.unwrap();

    let ack = queue.deliver_record(&Record::new(json!({"id": 1}))).unwrap();
    let state = timeout(WAIT, handle.wait_for_state(|s| *s == PipelineState::Stopped))
        .await
        .unwrap();
    assert_eq!(state, PipelineState::Stopped);

    // Never acknowledged: the sender was dropped with the halted delivery.
    assert!(timeout(WAIT, ack).await.unwrap().is_err());
    assert_eq!(task.put_count(), 2);
    assert!(task.stopped.load(Ordering::SeqCst));
    assert!(connector.stopped.load(Ordering::SeqCst));
    assert_eq!(queue.committed_on_close(), Some(false));

    let events = drain(&mut events);
    let terminal = events.last().unwrap();
    assert!(terminal.is_terminal());
    assert!(matches!(terminal.error(), PipelineError::Halted { attempts: 2, .. }));
    assert!(terminal.error().to_string().contains("halting because of retry error"));

    handle.join().await;
}

#[tokio::test]
async fn test_wait_holds_message_until_stopped() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::failing();

    let mut config = sink_config(0, 1);
    config.wait_on_error = true;

    let sink = SinkPipeline::builder("orders-sink", config)
        .connector(TestConnector::default)
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .consumer(consumer)
        .build()
        .unwrap();
    let mut events = sink.subscribe();
    let handle = sink.run().await.unwrap();

    let mut held = queue.deliver_record(&Record::new(json!({"id": 1}))).unwrap();
    let state = timeout(WAIT, handle.wait_for_state(|s| *s == PipelineState::Halted))
        .await
        .unwrap();
    assert_eq!(state, PipelineState::Halted);

    // Nothing else is consumed while waiting.
    let mut next = queue.deliver_record(&Record::new(json!({"id": 2}))).unwrap();
    assert!(timeout(Duration::from_millis(50), &mut held).await.is_err());
    assert!(timeout(Duration::from_millis(50), &mut next).await.is_err());
    assert_eq!(task.put_count(), 1);

    let events = drain(&mut events);
    let terminal = events.last().unwrap();
    assert!(matches!(terminal.error(), PipelineError::Suspended { attempts: 1, .. }));
    assert!(terminal.error().to_string().contains("waiting because of retry error"));

    handle.stop().await;
    assert!(held.await.is_err());
    assert!(queue.is_closed());
    assert!(task.stopped.load(Ordering::SeqCst));
}

// =============================================================================
// Conversion
// =============================================================================

#[tokio::test]
async fn test_conversion_failure_drops_message() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::default();

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector(TestConnector::default)
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .converter(JsonConverter::new())
        .consumer(consumer)
        .build()
        .unwrap();
    let mut events = sink.subscribe();
    let handle = sink.run().await.unwrap();

    let bad = queue.deliver_bytes(b"not json".to_vec());
    let good = queue.deliver_record(&Record::new(json!({"id": 2}))).unwrap();

    let bad = timeout(WAIT, bad).await.unwrap().unwrap();
    let good = timeout(WAIT, good).await.unwrap().unwrap();

    assert!(matches!(bad, Acknowledgement::Failed(_)));
    assert_eq!(good, Acknowledgement::Written);
    assert_eq!(task.put_count(), 1);

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    match events[0].error() {
        PipelineError::Conversion { entity, source } => {
            assert_eq!(entity, "orders/0@0");
            assert_eq!(source.converter, "json");
        }
        other => panic!("unexpected event: {}", other),
    }

    handle.stop().await;
}

#[tokio::test]
async fn test_rebuilt_record_keeps_message_position() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::default();

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector(TestConnector::default)
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .converter(Rebuild)
        .consumer(consumer)
        .build()
        .unwrap();
    let handle = sink.run().await.unwrap();

    let first = queue.deliver_bytes(b"abc".to_vec());
    let second = queue.deliver_bytes(b"abcdef".to_vec());
    assert_eq!(timeout(WAIT, first).await.unwrap().unwrap(), Acknowledgement::Written);
    assert_eq!(timeout(WAIT, second).await.unwrap().unwrap(), Acknowledgement::Written);

    let puts = task.puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 2);
    assert_eq!(puts[0].value, json!({"size": 3}));
    for (offset, record) in puts.iter().enumerate() {
        assert_eq!(record.topic.as_deref(), Some("orders"));
        assert_eq!(record.partition, Some(0));
        assert_eq!(record.offset, Some(offset as i64));
        assert_eq!(record.entity_id(), format!("orders/0@{}", offset));
    }

    handle.stop().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_startup_hands_first_task_config_to_task() {
    let (consumer, _queue) = memory_queue("orders");
    let task = ScriptedTask::default();
    let connector = TestConnector {
        configs: Some(vec![json!({"shard": 0}), json!({"shard": 1})]),
        ..TestConnector::default()
    };

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector({
            let connector = connector.clone();
            move || connector.clone()
        })
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .consumer(consumer)
        .build()
        .unwrap();
    let handle = sink.run().await.unwrap();

    assert_eq!(handle.state(), PipelineState::Consuming);
    assert_eq!(
        *connector.started_with.lock().unwrap(),
        Some(json!({"table": "orders"}))
    );
    assert_eq!(*task.config.lock().unwrap(), Some(json!({"shard": 0})));

    handle.stop().await;
}

#[tokio::test]
async fn test_stop_and_commit_tears_down() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::default();
    let connector = TestConnector::default();

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector({
            let connector = connector.clone();
            move || connector.clone()
        })
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .consumer(consumer)
        .build()
        .unwrap();
    let handle = sink.run().await.unwrap();

    let ack = queue.deliver_record(&Record::new(json!(1))).unwrap();
    timeout(WAIT, ack).await.unwrap().unwrap();

    handle.stop_and_commit().await;
    assert_eq!(queue.committed_on_close(), Some(true));
    assert!(task.stopped.load(Ordering::SeqCst));
    assert!(connector.stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_stop_interrupts_retry_wait() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::failing();

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 60_000))
        .connector(TestConnector::default)
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .consumer(consumer)
        .build()
        .unwrap();
    let mut events = sink.subscribe();
    let handle = sink.run().await.unwrap();

    let ack = queue.deliver_record(&Record::new(json!(1))).unwrap();
    let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(first.error(), PipelineError::Write { attempt: 1, .. }));

    timeout(WAIT, handle.stop()).await.unwrap();

    // The stopped task is never called again.
    assert_eq!(task.put_count(), 1);
    assert!(ack.await.is_err());
}

#[tokio::test]
async fn test_stop_abandons_stalled_put() {
    let (consumer, queue) = memory_queue("orders");
    let task = StalledTask::default();
    let connector = TestConnector::default();

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector({
            let connector = connector.clone();
            move || connector.clone()
        })
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .consumer(consumer)
        .build()
        .unwrap();
    let handle = sink.run().await.unwrap();

    let ack = queue.deliver_record(&Record::new(json!(1))).unwrap();
    timeout(WAIT, async {
        while task.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    timeout(WAIT, handle.stop()).await.unwrap();

    assert_eq!(task.calls.load(Ordering::SeqCst), 1);
    assert!(task.stopped.load(Ordering::SeqCst));
    assert!(connector.stopped.load(Ordering::SeqCst));
    assert!(queue.is_closed());
    assert!(ack.await.is_err());
}

#[tokio::test]
async fn test_connector_start_failure_aborts_run() {
    let (consumer, queue) = memory_queue("orders");
    let task = ScriptedTask::default();
    let connector = TestConnector {
        fail_start: true,
        ..TestConnector::default()
    };

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector({
            let connector = connector.clone();
            move || connector.clone()
        })
        .task({
            let task = task.clone();
            move || task.clone()
        })
        .consumer(consumer)
        .build()
        .unwrap();

    let err = sink.run().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Startup {
            stage: "connector start",
            ..
        }
    ));
    assert!(connector.stopped.load(Ordering::SeqCst));
    assert!(queue.is_closed());
    assert!(task.config.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_empty_task_configs_abort_run() {
    let (consumer, _queue) = memory_queue("orders");
    let connector = TestConnector {
        configs: Some(Vec::new()),
        ..TestConnector::default()
    };

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector(move || connector.clone())
        .task(ScriptedTask::default)
        .consumer(consumer)
        .build()
        .unwrap();

    let err = sink.run().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Startup {
            source: ConnectorError::NoTaskConfig,
            ..
        }
    ));
}

#[tokio::test]
async fn test_task_start_failure_stops_connector() {
    let (consumer, queue) = memory_queue("orders");
    let connector = TestConnector::default();
    let task = ScriptedTask {
        fail_start: true,
        ..ScriptedTask::default()
    };

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector({
            let connector = connector.clone();
            move || connector.clone()
        })
        .task(move || task.clone())
        .consumer(consumer)
        .build()
        .unwrap();

    let err = sink.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::Startup { stage: "task start", .. }));
    assert!(connector.stopped.load(Ordering::SeqCst));
    assert!(queue.is_closed());
}

#[tokio::test]
async fn test_queue_connect_failure_aborts_run() {
    let (consumer, queue) = memory_queue("orders");
    queue.fail_connect(true);
    let connector = TestConnector::default();

    let sink = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector({
            let connector = connector.clone();
            move || connector.clone()
        })
        .task(ScriptedTask::default)
        .consumer(consumer)
        .build()
        .unwrap();

    let err = sink.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::Queue(_)));
    assert!(connector.started_with.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_missing_sections_rejected_on_run() {
    let (consumer, _queue) = memory_queue("orders");
    let config = PipelineConfig::from_json_value(json!({"queue": {"brokers": "memory"}})).unwrap();

    let sink = SinkPipeline::builder("orders-sink", config)
        .connector(TestConnector::default)
        .task(ScriptedTask::default)
        .consumer(consumer)
        .build()
        .unwrap();

    let err = sink.run().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::MissingSection("connector"))
    ));
    assert_eq!(err.to_string(), "configuration error: config.connector must be a valid object");
}

#[test]
fn test_build_requires_consumer() {
    let result = SinkPipeline::builder("orders-sink", sink_config(3, 1))
        .connector(TestConnector::default)
        .task(ScriptedTask::default)
        .build();

    assert!(matches!(
        result,
        Err(PipelineError::Config(ConfigError::MissingComponent("queue consumer")))
    ));
}
