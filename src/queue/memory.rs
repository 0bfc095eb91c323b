//! In-memory queue clients.
//!
//! Useful for testing pipelines and for embedding a pipeline next to code
//! that produces or consumes its messages directly.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{Acknowledgement, Delivery, PublishReceipt, QueueConsumer, QueueError, QueueProducer};
use crate::converter::ConvertError;
use crate::record::{OutboundMessage, QueueMessage, Record};

#[derive(Debug, Default)]
struct ConsumerState {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    closed: AtomicBool,
    commit_on_close: Mutex<Option<bool>>,
}

/// Create a consumer and its feeding handle for `topic`.
pub fn memory_queue(topic: impl Into<String>) -> (MemoryConsumer, MemoryQueueHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(ConsumerState::default());

    let consumer = MemoryConsumer {
        rx,
        state: state.clone(),
    };
    let handle = MemoryQueueHandle {
        topic: topic.into(),
        tx,
        next_offset: Arc::new(AtomicI64::new(0)),
        state,
    };

    (consumer, handle)
}

/// Consuming end of an in-memory queue.
#[derive(Debug)]
pub struct MemoryConsumer {
    rx: mpsc::UnboundedReceiver<Delivery>,
    state: Arc<ConsumerState>,
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn connect(&mut self) -> Result<(), QueueError> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("broker unavailable".to_string()));
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(QueueError::Consume("consumer is not connected".to_string()));
        }
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self, commit_offsets: bool) {
        self.rx.close();
        self.state.closed.store(true, Ordering::SeqCst);
        if let Ok(mut commit) = self.state.commit_on_close.lock() {
            *commit = Some(commit_offsets);
        }
    }
}

/// Feeding end of an in-memory queue.
#[derive(Debug, Clone)]
pub struct MemoryQueueHandle {
    topic: String,
    tx: mpsc::UnboundedSender<Delivery>,
    next_offset: Arc<AtomicI64>,
    state: Arc<ConsumerState>,
}

impl MemoryQueueHandle {
    /// Inject a message; the receiver resolves when the pipeline acknowledges it.
    ///
    /// The receiver reports an error if the message is never acknowledged
    /// before the consumer goes away.
    pub fn deliver(&self, message: QueueMessage) -> oneshot::Receiver<Acknowledgement> {
        let (delivery, ack) = Delivery::new(message);
        // A closed consumer drops the delivery, which closes `ack`.
        let _ = self.tx.send(delivery);
        ack
    }

    /// Inject a record encoded as its envelope, at the next offset of partition 0.
    ///
    /// Nothing is delivered, and no offset is taken, if the record fails to encode.
    pub fn deliver_record(
        &self,
        record: &Record,
    ) -> Result<oneshot::Receiver<Acknowledgement>, ConvertError> {
        let value = serde_json::to_vec(record).map_err(|e| ConvertError::Encode(e.to_string()))?;
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let mut message = QueueMessage::new(self.topic.clone(), 0, offset, value);
        message.key = record.key.clone();
        Ok(self.deliver(message))
    }

    /// Inject raw bytes at the next offset of partition 0.
    pub fn deliver_bytes(&self, value: impl Into<Vec<u8>>) -> oneshot::Receiver<Acknowledgement> {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.deliver(QueueMessage::new(self.topic.clone(), 0, offset, value))
    }

    /// Make the next `connect` call fail.
    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Returns true once the consumer was closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// The commit flag passed to `close`, if it was called.
    pub fn committed_on_close(&self) -> Option<bool> {
        self.state.commit_on_close.lock().ok().and_then(|c| *c)
    }
}

/// A message captured by [`MemoryProducer`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub partition: i32,
    pub offset: i64,
    pub message: OutboundMessage,
}

impl PublishedMessage {
    /// Decode the published envelope back into a record.
    pub fn record(&self) -> Result<Record, ConvertError> {
        let message = QueueMessage {
            topic: self.message.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            key: self.message.key.clone(),
            value: self.message.value.clone(),
            timestamp: self.message.timestamp,
        };
        Record::from_message(&message)
    }
}

#[derive(Debug, Default)]
struct ProducerState {
    connected: AtomicBool,
    closed: AtomicBool,
    fail_sends: AtomicUsize,
    next_offset: AtomicI64,
    sent: Mutex<Vec<PublishedMessage>>,
}

/// Producer that keeps every sent message in memory.
///
/// Clones share the same log, so a test can hand one clone to a pipeline
/// and inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemoryProducer {
    state: Arc<ProducerState>,
}

impl MemoryProducer {
    /// Create an empty producer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends.
    pub fn fail_sends(&self, count: usize) {
        self.state.fail_sends.store(count, Ordering::SeqCst);
    }

    /// Snapshot of sent messages in publish order.
    pub fn sent(&self) -> Vec<PublishedMessage> {
        self.state
            .sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    /// Returns true once the producer was closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueProducer for MemoryProducer {
    async fn connect(&mut self) -> Result<(), QueueError> {
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, message: OutboundMessage) -> Result<PublishReceipt, QueueError> {
        if !self.state.connected.load(Ordering::SeqCst) || self.state.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let injected = self
            .state
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(QueueError::Send("injected send failure".to_string()));
        }

        let mut sent = self
            .state
            .sent
            .lock()
            .map_err(|_| QueueError::Send("producer log poisoned".to_string()))?;
        let offset = self.state.next_offset.fetch_add(1, Ordering::SeqCst);
        sent.push(PublishedMessage {
            partition: 0,
            offset,
            message,
        });

        Ok(PublishReceipt {
            partition: 0,
            offset,
        })
    }

    async fn close(&mut self, _commit_offsets: bool) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}
