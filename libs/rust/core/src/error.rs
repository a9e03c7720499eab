//! Error kinds surfaced by the round engine.
//!
//! Configuration problems abort a simulation before its first round. Client
//! failures and empty aggregations are recorded in the round history and the
//! simulation moves on.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::federated_learning::pool::ClientId;

/// Invalid static experiment parameters.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConfigurationError {
    #[error("client population is empty")]
    EmptyPopulation,
    #[error("{field} must be positive (got {value})")]
    NotPositive { field: &'static str, value: String },
    #[error("momentum must be in [0, 1) (got {0})")]
    MomentumOutOfRange(f64),
    #[error("sampling weight for client {client} must be finite and positive (got {weight})")]
    InvalidWeight { client: ClientId, weight: f64 },
    #[error("weighted sampling needs {expected} weights, pool provides {found}")]
    MissingWeights { expected: usize, found: usize },
    #[error("weighted sampling rejected the pool weights: {0}")]
    Sampling(String),
    #[error("invalid learning-rate schedule: {0}")]
    InvalidSchedule(String),
    #[error("failed to load experiment configuration: {0}")]
    Load(String),
}

impl From<::config::ConfigError> for ConfigurationError {
    fn from(e: ::config::ConfigError) -> Self {
        ConfigurationError::Load(e.to_string())
    }
}

/// Ways a parameter set can disagree with the global model layout.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeMismatch {
    #[error("expected {expected} parameters, found {found}")]
    ParameterCount { expected: usize, found: usize },
    #[error("parameter #{position}: expected `{expected}`, found `{found}`")]
    Name { position: usize, expected: String, found: String },
    #[error("parameter `{name}`: expected dims {expected:?}, found {found:?}")]
    Dims { name: String, expected: Vec<usize>, found: Vec<usize> },
    #[error("parameter `{name}`: dims {dims:?} need {expected} values, found {found}")]
    Storage { name: String, dims: Vec<usize>, expected: usize, found: usize },
}

/// Why a single client invocation did not contribute to its round.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("runner error: {0}")]
    Runner(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("runner panicked: {0}")]
    Panicked(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(ShapeMismatch),
    #[error("invalid result: {0}")]
    InvalidResult(String),
}

impl FailureReason {
    /// Short label used as a metric attribute.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Runner(_) => "runner",
            FailureReason::Timeout(_) => "timeout",
            FailureReason::Panicked(_) => "panicked",
            FailureReason::ShapeMismatch(_) => "shape_mismatch",
            FailureReason::InvalidResult(_) => "invalid_result",
        }
    }
}

/// One client's invocation failed; tolerated and excluded from aggregation.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("client {client_id} failed: {reason}")]
pub struct ClientFailure {
    pub client_id: ClientId,
    pub reason: FailureReason,
}

impl ClientFailure {
    pub fn new(client_id: ClientId, reason: FailureReason) -> Self {
        Self { client_id, reason }
    }

    pub fn runner(client_id: ClientId, msg: impl Into<String>) -> Self {
        Self::new(client_id, FailureReason::Runner(msg.into()))
    }
}

/// A round produced nothing to aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationError {
    #[error("round {round}: no successful client results ({failed} failed)")]
    NoSuccessfulClients { round: u64, failed: usize },
}

/// Fatal simulation errors. Everything else lands in the round history.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
