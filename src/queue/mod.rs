//! Queue client capability consumed by the pipelines.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::record::{OutboundMessage, QueueMessage};

pub use memory::{memory_queue, MemoryConsumer, MemoryProducer, MemoryQueueHandle, PublishedMessage};

/// Error type for queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("send error: {0}")]
    Send(String),

    #[error("queue client is closed")]
    Closed,
}

/// Outcome reported back to the queue for one consumed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The record was written; the offset may be committed.
    Written,
    /// The record was dropped; the queue moves on past it.
    Failed(String),
}

impl Acknowledgement {
    /// Returns true for a successful write.
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

/// A consumed message together with its completion callback.
///
/// Dropping a delivery without calling [`Delivery::ack`] leaves the message
/// unacknowledged.
#[derive(Debug)]
pub struct Delivery {
    pub message: QueueMessage,
    ack: oneshot::Sender<Acknowledgement>,
}

impl Delivery {
    /// Pair a message with a fresh acknowledgement channel.
    pub fn new(message: QueueMessage) -> (Self, oneshot::Receiver<Acknowledgement>) {
        let (ack, rx) = oneshot::channel();
        (Self { message, ack }, rx)
    }

    /// Split into the message and its acknowledger.
    pub fn into_parts(self) -> (QueueMessage, Acknowledger) {
        (self.message, Acknowledger { tx: self.ack })
    }
}

/// Completion callback of a single delivery.
#[derive(Debug)]
pub struct Acknowledger {
    tx: oneshot::Sender<Acknowledgement>,
}

impl Acknowledger {
    /// Report the outcome. A queue client that stopped listening is ignored.
    pub fn ack(self, outcome: Acknowledgement) {
        let _ = self.tx.send(outcome);
    }
}

/// Queue position assigned to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Consuming side of a queue client.
#[async_trait]
pub trait QueueConsumer: Send {
    async fn connect(&mut self) -> Result<(), QueueError>;

    /// Wait for the next message; `Ok(None)` once the queue is closed.
    ///
    /// Must be cancel safe: the runtime races it against shutdown.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError>;

    /// Close the client, optionally committing acknowledged offsets.
    async fn close(&mut self, commit_offsets: bool);
}

/// Producing side of a queue client.
#[async_trait]
pub trait QueueProducer: Send {
    async fn connect(&mut self) -> Result<(), QueueError>;

    async fn send(&mut self, message: OutboundMessage) -> Result<PublishReceipt, QueueError>;

    async fn close(&mut self, commit_offsets: bool);
}
