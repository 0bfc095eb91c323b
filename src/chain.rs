//! Converter chain builder and executor.

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::converter::{validate_converter, BaseConverter, ContractError, ConvertError, Converter};
use crate::record::Payload;

/// Direction a chain is applied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// External form into pipeline form (sink side).
    ToConnect,
    /// Pipeline form into external form (source side).
    FromConnect,
}

impl Direction {
    fn operation(&self) -> &'static str {
        match self {
            Self::ToConnect => "to_connect_data",
            Self::FromConnect => "from_connect_data",
        }
    }
}

/// A stage of the chain failed; remaining stages were not invoked.
#[derive(Error, Debug)]
#[error("converter '{converter}' (stage {stage}) failed in {operation}: {source}")]
pub struct ChainError {
    pub converter: String,
    pub stage: usize,
    pub operation: &'static str,
    #[source]
    pub source: ConvertError,
}

/// Builder for a [`ConverterChain`].
///
/// Every converter is checked against the runtime contract when the chain is
/// built, before any I/O happens.
#[derive(Default, Clone)]
pub struct ChainBuilder {
    stages: Vec<Arc<dyn Converter>>,
}

impl ChainBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a converter.
    pub fn then<C: Converter + 'static>(mut self, converter: C) -> Self {
        self.stages.push(Arc::new(converter));
        self
    }

    /// Append a shared converter.
    pub fn then_shared(mut self, converter: Arc<dyn Converter>) -> Self {
        self.stages.push(converter);
        self
    }

    /// Number of user-supplied stages so far.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stage was supplied.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Validate every stage and build the chain.
    ///
    /// An empty builder yields a chain holding only [`BaseConverter`].
    pub fn build(self) -> Result<ConverterChain, ContractError> {
        for stage in &self.stages {
            validate_converter(stage.as_ref())?;
        }

        let stages = if self.stages.is_empty() {
            vec![Arc::new(BaseConverter) as Arc<dyn Converter>]
        } else {
            self.stages
        };

        Ok(ConverterChain { stages })
    }
}

impl FromIterator<Arc<dyn Converter>> for ChainBuilder {
    fn from_iter<T: IntoIterator<Item = Arc<dyn Converter>>>(iter: T) -> Self {
        Self {
            stages: iter.into_iter().collect(),
        }
    }
}

/// An ordered, validated, never-empty sequence of converters.
#[derive(Clone)]
pub struct ConverterChain {
    stages: Vec<Arc<dyn Converter>>,
}

impl std::fmt::Debug for ConverterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

impl ConverterChain {
    /// Names of the stages in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Number of stages, at least one.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the chain has no stages, which a built chain never does.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Apply `to_connect_data` left to right.
    pub async fn convert_to(&self, payload: Payload) -> Result<Payload, ChainError> {
        self.apply(payload, Direction::ToConnect).await
    }

    /// Apply `from_connect_data` left to right.
    pub async fn convert_from(&self, payload: Payload) -> Result<Payload, ChainError> {
        self.apply(payload, Direction::FromConnect).await
    }

    async fn apply(&self, mut payload: Payload, direction: Direction) -> Result<Payload, ChainError> {
        for (stage, converter) in self.stages.iter().enumerate() {
            let result = match direction {
                Direction::ToConnect => converter.to_connect_data(payload).await,
                Direction::FromConnect => converter.from_connect_data(payload).await,
            };

            payload = result.map_err(|source| ChainError {
                converter: converter.name().to_string(),
                stage,
                operation: direction.operation(),
                source,
            })?;

            trace!(
                converter = converter.name(),
                stage,
                payload = payload.kind(),
                "Converter stage applied"
            );
        }

        Ok(payload)
    }
}
