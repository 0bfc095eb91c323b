//! Converter trait, contract metadata, and built-in converters.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{Payload, Record};

/// Error returned by a converter stage.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The payload could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The payload could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The stage received a payload variant it cannot handle.
    #[error("expected {expected} payload, found {found}")]
    UnexpectedPayload {
        expected: &'static str,
        found: &'static str,
    },

    /// The stage does not implement this direction.
    #[error("converter '{converter}' does not implement {operation}")]
    Unsupported {
        converter: String,
        operation: &'static str,
    },

    /// Any other failure raised by a user converter.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConvertError {
    /// Wrap an arbitrary error.
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        Self::Other(err.into())
    }
}

/// Version of the converter contract a converter was written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContractVersion(pub u16);

impl ContractVersion {
    /// The contract this runtime expects.
    pub const CURRENT: ContractVersion = ContractVersion(1);
}

impl fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Operations a converter implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operations {
    pub to_connect_data: bool,
    pub from_connect_data: bool,
}

impl Operations {
    /// Both directions.
    pub const BOTH: Operations = Operations {
        to_connect_data: true,
        from_connect_data: true,
    };

    /// Only `to_connect_data`.
    pub const TO_CONNECT: Operations = Operations {
        to_connect_data: true,
        from_connect_data: false,
    };

    /// Only `from_connect_data`.
    pub const FROM_CONNECT: Operations = Operations {
        to_connect_data: false,
        from_connect_data: true,
    };

    /// Names of the required operations that are absent.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.to_connect_data {
            missing.push("to_connect_data");
        }
        if !self.from_connect_data {
            missing.push("from_connect_data");
        }
        missing
    }
}

/// Self-description used for the construction-time conformance check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterInfo {
    pub name: String,
    pub contract: ContractVersion,
    pub operations: Operations,
}

/// Conformance violation found while building a converter chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    /// The converter was not written against the runtime's contract.
    #[error("converter '{converter}' does not inherit the converter contract {expected} (declares {found})")]
    Lineage {
        converter: String,
        expected: ContractVersion,
        found: ContractVersion,
    },

    /// The converter lacks required operations.
    #[error("converter '{converter}' is missing functions: {}", missing.join(", "))]
    MissingOperations {
        converter: String,
        missing: Vec<&'static str>,
    },
}

/// A bidirectional transform between raw and canonical representations.
///
/// Converters must be stateless between invocations: the same chain may be
/// applied to independent records concurrently.
#[async_trait]
pub trait Converter: Send + Sync {
    /// The name of this converter for logging and errors.
    fn name(&self) -> &str;

    /// Contract version and implemented operations.
    ///
    /// One-way converters override this to declare the missing direction.
    fn info(&self) -> ConverterInfo {
        ConverterInfo {
            name: self.name().to_string(),
            contract: ContractVersion::CURRENT,
            operations: Operations::BOTH,
        }
    }

    /// Transform an external payload into pipeline form.
    async fn to_connect_data(&self, _payload: Payload) -> Result<Payload, ConvertError> {
        Err(ConvertError::Unsupported {
            converter: self.name().to_string(),
            operation: "to_connect_data",
        })
    }

    /// Transform a pipeline payload into external form.
    async fn from_connect_data(&self, _payload: Payload) -> Result<Payload, ConvertError> {
        Err(ConvertError::Unsupported {
            converter: self.name().to_string(),
            operation: "from_connect_data",
        })
    }
}

/// Check a converter against the runtime contract.
pub fn validate_converter(converter: &dyn Converter) -> Result<(), ContractError> {
    let info = converter.info();

    if info.contract != ContractVersion::CURRENT {
        return Err(ContractError::Lineage {
            converter: info.name,
            expected: ContractVersion::CURRENT,
            found: info.contract,
        });
    }

    let missing = info.operations.missing();
    if !missing.is_empty() {
        return Err(ContractError::MissingOperations {
            converter: info.name,
            missing,
        });
    }

    Ok(())
}

/// Identity converter; the implicit stage of an otherwise empty chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseConverter;

#[async_trait]
impl Converter for BaseConverter {
    fn name(&self) -> &str {
        "base"
    }

    async fn to_connect_data(&self, payload: Payload) -> Result<Payload, ConvertError> {
        Ok(payload)
    }

    async fn from_connect_data(&self, payload: Payload) -> Result<Payload, ConvertError> {
        Ok(payload)
    }
}

/// JSON envelope converter.
///
/// Decodes a raw message into a positioned [`Record`] and encodes a record
/// into its envelope message. Other payloads pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct JsonConverter {
    topic: Option<String>,
}

impl JsonConverter {
    /// Create a converter that encodes records for the pipeline's topic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode records for a fixed topic instead of the pipeline's topic.
    pub fn with_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
        }
    }
}

#[async_trait]
impl Converter for JsonConverter {
    fn name(&self) -> &str {
        "json"
    }

    async fn to_connect_data(&self, payload: Payload) -> Result<Payload, ConvertError> {
        match payload {
            Payload::Message(message) => Ok(Payload::Record(Record::from_message(&message)?)),
            other => Ok(other),
        }
    }

    async fn from_connect_data(&self, payload: Payload) -> Result<Payload, ConvertError> {
        match (payload, &self.topic) {
            (Payload::Record(record), Some(topic)) => Ok(Payload::Outbound(record.to_outbound(topic)?)),
            (other, _) => Ok(other),
        }
    }
}
