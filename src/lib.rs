//! # Connectflow
//!
//! Source and sink connector pipelines between a message queue and an
//! external data store.
//!
//! - A **source** pipeline polls an external system through a [`SourceTask`],
//!   converts each record, and publishes it to a queue topic.
//! - A **sink** pipeline consumes a queue topic, converts each message into a
//!   [`Record`], and writes it through a [`SinkTask`], retrying failed writes
//!   and escalating once the retry budget is spent.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use connectflow::{memory_queue, JsonConverter, PipelineConfig, SinkPipeline};
//!
//! let config = PipelineConfig::from_yaml_str(r#"
//! queue: { brokers: "localhost:9092" }
//! topic: orders
//! connector: { table: orders }
//! maxRetries: 3
//! awaitRetry: 10
//! haltOnError: true
//! "#)?;
//!
//! let (consumer, queue) = memory_queue("orders");
//!
//! let sink = SinkPipeline::builder("orders-sink", config)
//!     .connector(|| OrdersConnector::default())
//!     .task(|| OrdersTask::default())
//!     .converter(JsonConverter::new())
//!     .consumer(consumer)
//!     .build()?;
//!
//! let mut events = sink.subscribe();
//! let handle = sink.run().await?;
//! // ...
//! handle.stop().await;
//! ```
//!
//! ## Failure handling
//!
//! Conversion failures drop the message. Write failures are retried
//! `maxRetries` times, `awaitRetry` milliseconds apart; then the pipeline
//! halts (`haltOnError`), holds the message unacknowledged (`waitOnError`), or
//! fails the message's acknowledgement and moves on. Every failure is
//! published as a [`PipelineEvent`].
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed delivery recorder

pub mod chain;
pub mod config;
pub mod connector;
pub mod converter;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod recorder;
pub mod retry;
pub mod sink;
pub mod source;

pub use chain::{ChainBuilder, ChainError, ConverterChain, Direction};
pub use config::{ConfigError, PipelineConfig};
pub use connector::{Connector, ConnectorError, SinkTask, SourceTask, TaskConfig};
pub use converter::{
    validate_converter, BaseConverter, ContractError, ContractVersion, ConvertError, Converter,
    ConverterInfo, JsonConverter, Operations,
};
pub use pipeline::{PipelineError, PipelineEvent, PipelineHandle, PipelineState};
pub use queue::{
    memory_queue, Acknowledgement, Acknowledger, Delivery, MemoryConsumer, MemoryProducer,
    MemoryQueueHandle, PublishReceipt, PublishedMessage, QueueConsumer, QueueError, QueueProducer,
};
pub use record::{OutboundMessage, Payload, QueueMessage, Record};
pub use recorder::{AttemptStatus, DeliveryId, DeliveryStatus, NoopRecorder, Recorder};
pub use retry::{Escalation, RetryPolicy};
pub use sink::{SinkPipeline, SinkPipelineBuilder};
pub use source::{SourcePipeline, SourcePipelineBuilder, DEFAULT_POLL_INTERVAL};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecorder;
