//! Record envelope and queue message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::converter::ConvertError;

/// The canonical in-flight record exchanged between pipeline stages.
///
/// A record built by a source task carries no `partition`/`offset` until the
/// queue assigns them. A record handed to a sink task always carries both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Partitioning hint, travels as the queue message key.
    #[serde(skip)]
    pub key: Option<String>,
    /// Payload, before or after conversion.
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Topic the record was read from.
    #[serde(skip)]
    pub topic: Option<String>,
    #[serde(skip)]
    pub partition: Option<i32>,
    #[serde(skip)]
    pub offset: Option<i64>,
}

impl Record {
    /// Create an unpositioned record with the given value.
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// Set the key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the value schema.
    pub fn with_value_schema(mut self, schema: serde_json::Value) -> Self {
        self.value_schema = Some(schema);
        self
    }

    /// Set the key schema.
    pub fn with_key_schema(mut self, schema: serde_json::Value) -> Self {
        self.key_schema = Some(schema);
        self
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Returns true once the queue has assigned a position.
    pub fn is_positioned(&self) -> bool {
        self.partition.is_some() && self.offset.is_some()
    }

    /// Identifier used in logs and the delivery recorder.
    pub fn entity_id(&self) -> String {
        match (self.partition, self.offset) {
            (Some(partition), Some(offset)) => format!(
                "{}/{}@{}",
                self.topic.as_deref().unwrap_or("-"),
                partition,
                offset
            ),
            _ => self.key.clone().unwrap_or_else(|| "unkeyed".to_string()),
        }
    }

    /// Decode a queue message carrying a JSON record envelope.
    ///
    /// Position and key are taken from the message, never from the envelope.
    pub fn from_message(message: &QueueMessage) -> Result<Self, ConvertError> {
        let mut record: Record = serde_json::from_slice(&message.value)
            .map_err(|e| ConvertError::Decode(e.to_string()))?;
        record.key = message.key.clone();
        record.topic = Some(message.topic.clone());
        record.partition = Some(message.partition);
        record.offset = Some(message.offset);
        if record.timestamp.is_none() {
            record.timestamp = message.timestamp;
        }
        Ok(record)
    }

    /// Encode this record as an outbound message for `topic`.
    pub fn to_outbound(&self, topic: &str) -> Result<OutboundMessage, ConvertError> {
        let value = serde_json::to_vec(self).map_err(|e| ConvertError::Encode(e.to_string()))?;
        Ok(OutboundMessage {
            topic: topic.to_string(),
            key: self.key.clone(),
            value,
            timestamp: self.timestamp,
        })
    }
}

/// A raw message read from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl QueueMessage {
    /// Create a message at the given position.
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: value.into(),
            timestamp: None,
        }
    }

    /// Set the key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A message ready to be published to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Data flowing through a converter chain.
///
/// A converter may turn a raw message into a canonical record (or back);
/// a `Record` arriving at the end of the sink chain is used as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// External, queue-level form.
    Message(QueueMessage),
    /// Canonical pipeline form.
    Record(Record),
    /// Serialized form ready to publish.
    Outbound(OutboundMessage),
}

impl Payload {
    /// Short name of the variant, for errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Record(_) => "record",
            Self::Outbound(_) => "outbound",
        }
    }

    /// Resolve the payload at the end of a sink chain into a record.
    pub fn into_record(self) -> Result<Record, ConvertError> {
        match self {
            Self::Record(record) => Ok(record),
            Self::Message(message) => Record::from_message(&message),
            Self::Outbound(_) => Err(ConvertError::UnexpectedPayload {
                expected: "message or record",
                found: "outbound",
            }),
        }
    }

    /// Resolve the payload at the end of a source chain into a publishable message.
    pub fn into_outbound(self, topic: &str) -> Result<OutboundMessage, ConvertError> {
        match self {
            Self::Outbound(message) => Ok(message),
            Self::Record(record) => record.to_outbound(topic),
            Self::Message(message) => Ok(OutboundMessage {
                topic: topic.to_string(),
                key: message.key,
                value: message.value,
                timestamp: message.timestamp,
            }),
        }
    }
}
