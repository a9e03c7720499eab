//! Round-by-round record of a simulation run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AggregationError, ClientFailure};
use crate::federated_learning::aggregation::AggregateMetrics;
use crate::federated_learning::model::GlobalModelState;
use crate::federated_learning::pool::ClientId;
use crate::federated_learning::runner::Metrics;

#[derive(Debug, Clone, Serialize)]
pub struct FitRoundSummary {
    pub sampled: Vec<ClientId>,
    pub contributors: Vec<ClientId>,
    pub total_examples: u64,
    pub metrics: Metrics,
    pub failures: Vec<ClientFailure>,
    /// Set when the global state was left unchanged.
    pub error: Option<AggregationError>,
    /// Version of the global state after this round.
    pub model_version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluateRoundSummary {
    pub sampled: Vec<ClientId>,
    pub metrics: AggregateMetrics,
    pub failures: Vec<ClientFailure>,
    pub error: Option<AggregationError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundRecord {
    pub round_index: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub fit: FitRoundSummary,
    pub evaluate: Option<EvaluateRoundSummary>,
}

impl RoundRecord {
    /// All client failures of the round, fit then evaluate.
    pub fn failures(&self) -> impl Iterator<Item = &ClientFailure> {
        self.fit.failures.iter().chain(self.evaluate.iter().flat_map(|e| e.failures.iter()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Termination {
    Completed,
    /// Cancelled while `round_index` was in flight; its results were discarded.
    Cancelled { round_index: u64 },
    /// Stopped by the abort-on-empty-round policy.
    Aborted { round_index: u64, error: AggregationError },
}

/// Everything a run produced, returned when orchestration halts.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub run_id: Uuid,
    pub termination: Termination,
    pub final_state: Arc<GlobalModelState>,
    pub rounds: Vec<RoundRecord>,
    /// `(round_index, state after that round)`, one per completed round.
    pub model_history: Vec<(u64, Arc<GlobalModelState>)>,
    pub metrics_history: Vec<AggregateMetrics>,
}

impl SimulationReport {
    pub fn completed_rounds(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_complete(&self) -> bool {
        self.termination == Termination::Completed
    }

    /// `(round_index, weighted_loss)` for evaluate rounds that had data.
    pub fn loss_curve(&self) -> Vec<(u64, f64)> {
        self.metrics_history
            .iter()
            .filter_map(|m| m.weighted_loss.map(|l| (m.round_index, l)))
            .collect()
    }
}
