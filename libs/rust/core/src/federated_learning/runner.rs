//! Boundary to whatever performs local training and evaluation.
//!
//! The orchestrator treats every call as slow and fallible, and invokes
//! distinct clients concurrently. Implementations get their own immutable
//! snapshot of the global model and must not share writable state between
//! invocations.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ClientFailure;
use crate::federated_learning::model::{GlobalModelState, Parameters};
use crate::federated_learning::pool::ClientId;
use crate::federated_learning::round_config::{EvaluateConfig, FitConfig};

/// Scalar metrics reported by a client, keyed by name.
pub type Metrics = BTreeMap<String, f64>;

/// Either a client's result or the reason it has none.
pub type ClientOutcome<T> = Result<T, ClientFailure>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientFitResult {
    pub client_id: ClientId,
    pub parameters: Parameters,
    pub num_examples: u64,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientEvalResult {
    pub client_id: ClientId,
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: Metrics,
}

#[async_trait]
pub trait ClientRunner: Send + Sync {
    async fn fit(&self, client: ClientId, model: Arc<GlobalModelState>, config: FitConfig) -> ClientOutcome<ClientFitResult>;

    async fn evaluate(&self, client: ClientId, model: Arc<GlobalModelState>, config: EvaluateConfig) -> ClientOutcome<ClientEvalResult>;
}


/// Identity and weight of a successful client result.
pub(crate) trait ClientResult {
    fn client_id(&self) -> ClientId;
    fn num_examples(&self) -> u64;
}

impl ClientResult for ClientFitResult {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn num_examples(&self) -> u64 {
        self.num_examples
    }
}

impl ClientResult for ClientEvalResult {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn num_examples(&self) -> u64 {
        self.num_examples
    }
}
