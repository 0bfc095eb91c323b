//! Basic usage example for connectflow.
//!
//! This example demonstrates:
//! - Implementing a connector plus a source task and a sink task
//! - Loading pipeline configuration from YAML
//! - Running a source pipeline that publishes to an in-memory topic
//! - Relaying the topic into a sink pipeline with a flaky writer
//! - Watching retry errors on the pipeline event channel

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use connectflow::{
    memory_queue, Connector, ConnectorError, JsonConverter, MemoryProducer, PipelineConfig,
    QueueMessage, Record, SinkPipeline, SinkTask, SourcePipeline, SourceTask, TaskConfig,
};
use serde_json::json;

/// Connector for a toy key-value table.
///
/// The task configuration is simply the table name from the connector section.
struct TableConnector {
    table: String,
}

#[async_trait]
impl Connector for TableConnector {
    async fn start(&mut self, properties: &serde_json::Value) -> Result<(), ConnectorError> {
        self.table = properties["table"]
            .as_str()
            .ok_or_else(|| ConnectorError::permanent(anyhow::anyhow!("connector.table is required")))?
            .to_string();
        println!("[connector] started for table '{}'", self.table);
        Ok(())
    }

    async fn task_configs(&mut self, _max_tasks: u32) -> Result<Vec<TaskConfig>, ConnectorError> {
        Ok(vec![json!({ "table": self.table })])
    }

    fn stop(&mut self) {
        println!("[connector] stopped");
    }
}

/// Source task that emits the rows of a fixed inventory once.
struct InventorySource {
    rows: Vec<(String, u32)>,
}

#[async_trait]
impl SourceTask for InventorySource {
    async fn start(&mut self, config: &TaskConfig) -> Result<(), ConnectorError> {
        println!("[source] reading {}", config["table"]);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<Option<Record>>, ConnectorError> {
        Ok(self
            .rows
            .drain(..)
            .map(|(sku, count)| Some(Record::new(json!({ "sku": sku, "count": count })).with_key(sku)))
            .collect())
    }

    fn stop(&mut self) {}
}

/// Sink task whose first write of every record fails.
struct Warehouse {
    stored: Arc<Mutex<Vec<serde_json::Value>>>,
    flaky: bool,
}

#[async_trait]
impl SinkTask for Warehouse {
    async fn start(&mut self, _config: &TaskConfig) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn put(&mut self, records: &[Record]) -> Result<(), ConnectorError> {
        self.flaky = !self.flaky;
        if self.flaky {
            return Err(ConnectorError::retryable(anyhow::anyhow!("warehouse busy")));
        }

        let mut stored = self.stored.lock().map_err(|_| {
            ConnectorError::permanent(anyhow::anyhow!("warehouse lock poisoned"))
        })?;
        for record in records {
            println!("[sink] stored {} -> {}", record.entity_id(), record.value);
            stored.push(record.value.clone());
        }
        Ok(())
    }

    fn stop(&mut self) {}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== connectflow - Basic Example ===\n");

    let config = PipelineConfig::from_yaml_str(
        r#"
queue:
  brokers: memory
topic: inventory
connector:
  table: inventory
pollInterval: 20
maxRetries: 2
awaitRetry: 5
"#,
    )?;

    // Source: inventory table -> "inventory" topic
    let producer = MemoryProducer::new();
    let source = SourcePipeline::builder("inventory-source", config.clone())
        .connector(|| TableConnector { table: String::new() })
        .task(|| InventorySource {
            rows: vec![("apple".to_string(), 3), ("pear".to_string(), 7)],
        })
        .converter(JsonConverter::new())
        .producer(producer.clone())
        .build()?;
    let source = source.run().await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    source.stop_and_commit().await;
    println!("[source] published {} messages\n", producer.sent().len());

    // Sink: "inventory" topic -> warehouse
    let stored = Arc::new(Mutex::new(Vec::new()));
    let (consumer, queue) = memory_queue("inventory");
    let sink = SinkPipeline::builder("inventory-sink", config)
        .connector(|| TableConnector { table: String::new() })
        .task({
            let stored = stored.clone();
            move || Warehouse {
                stored: stored.clone(),
                flaky: false,
            }
        })
        .converter(JsonConverter::new())
        .consumer(consumer)
        .build()?;

    let mut events = sink.subscribe();
    let sink = sink.run().await?;

    let mut acks = Vec::new();
    for published in producer.sent() {
        let message = QueueMessage {
            topic: published.message.topic,
            partition: published.partition,
            offset: published.offset,
            key: published.message.key,
            value: published.message.value,
            timestamp: published.message.timestamp,
        };
        acks.push(queue.deliver(message));
    }

    for ack in acks {
        println!("[queue] acknowledgement: {:?}", ack.await?);
    }

    while let Ok(event) = events.try_recv() {
        println!("[events] {}", event.error());
    }

    sink.stop_and_commit().await;
    println!("\nWarehouse holds {} rows", stored.lock().map(|s| s.len()).unwrap_or(0));

    Ok(())
}
