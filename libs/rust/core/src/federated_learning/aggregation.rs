//! FedAvg reduction over one round's client results.
//!
//! Every call is a pure function of (current state, results). Failed,
//! malformed or shape-mismatched results are screened out first and returned
//! as [`ClientFailure`]s so the caller can record them.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{AggregationError, ClientFailure, FailureReason};
use crate::federated_learning::model::{GlobalModelState, Parameters, Tensor};
use crate::federated_learning::pool::ClientId;
use crate::federated_learning::runner::{ClientEvalResult, ClientFitResult, ClientOutcome, ClientResult, Metrics};

/// Result of one reduction plus the clients excluded from it.
#[derive(Debug)]
pub struct Aggregated<T> {
    pub failures: Vec<ClientFailure>,
    pub result: Result<T, AggregationError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitAggregate {
    pub state: GlobalModelState,
    pub contributors: Vec<ClientId>,
    pub total_examples: u64,
    pub metrics: Metrics,
}

/// Weighted evaluate metrics for one round.
///
/// `weighted_loss == None` marks a round with no usable client data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateMetrics {
    pub round_index: u64,
    pub num_clients: usize,
    pub num_examples: u64,
    pub weighted_loss: Option<f64>,
    pub metrics: Metrics,
}

impl AggregateMetrics {
    pub fn no_data(round_index: u64) -> Self {
        Self { round_index, num_clients: 0, num_examples: 0, weighted_loss: None, metrics: Metrics::new() }
    }

    pub fn is_no_data(&self) -> bool {
        self.weighted_loss.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationEngine;

impl AggregationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Example-weighted average of every parameter over the accepted results.
    ///
    /// `global` is only read; on error the caller keeps it as is.
    pub fn aggregate_fit(
        &self,
        global: &GlobalModelState,
        round_index: u64,
        outcomes: Vec<ClientOutcome<ClientFitResult>>,
    ) -> Aggregated<FitAggregate> {
        let (accepted, failures) = screen(outcomes, |r| {
            if r.num_examples == 0 {
                return Err(FailureReason::InvalidResult("num_examples is zero".into()));
            }
            global.parameters.check_layout(&r.parameters).map_err(FailureReason::ShapeMismatch)?;
            if !r.parameters.is_finite() {
                return Err(FailureReason::InvalidResult("non-finite parameter values".into()));
            }
            Ok(())
        });
        if accepted.is_empty() {
            warn!(round = round_index, failed = failures.len(), "fit round has no successful clients");
            let result = Err(AggregationError::NoSuccessfulClients { round: round_index, failed: failures.len() });
            return Aggregated { failures, result };
        }

        let total_examples: u64 = accepted.iter().map(|r| r.num_examples).sum();
        let mut acc: Vec<Vec<f64>> = global.parameters.iter().map(|(_, t)| vec![0.0; t.values.len()]).collect();
        for r in &accepted {
            let w = r.num_examples as f64 / total_examples as f64;
            for (slot, (_, t)) in acc.iter_mut().zip(r.parameters.iter()) {
                for (a, v) in slot.iter_mut().zip(&t.values) {
                    *a += w * f64::from(*v);
                }
            }
        }
        let mut parameters = Parameters::new();
        for ((name, t), values) in global.parameters.iter().zip(acc) {
            parameters.insert(name, Tensor::new(t.dims.clone(), values.into_iter().map(|v| v as f32).collect()));
        }

        let metrics = weighted_metrics(accepted.iter().map(|r| (r.client_id, r.num_examples, &r.metrics)));
        let contributors: Vec<ClientId> = accepted.iter().map(|r| r.client_id).collect();
        debug!(round = round_index, contributors = contributors.len(), total_examples, "fit results aggregated");
        Aggregated {
            failures,
            result: Ok(FitAggregate { state: global.successor(parameters), contributors, total_examples, metrics }),
        }
    }

    /// Example-weighted loss and per-metric averages over the accepted results.
    pub fn aggregate_evaluate(&self, round_index: u64, outcomes: Vec<ClientOutcome<ClientEvalResult>>) -> Aggregated<AggregateMetrics> {
        let (accepted, failures) = screen(outcomes, |r| {
            if r.num_examples == 0 {
                return Err(FailureReason::InvalidResult("num_examples is zero".into()));
            }
            if !r.loss.is_finite() {
                return Err(FailureReason::InvalidResult(format!("non-finite loss {}", r.loss)));
            }
            Ok(())
        });
        if accepted.is_empty() {
            warn!(round = round_index, failed = failures.len(), "evaluate round has no successful clients");
            let result = Err(AggregationError::NoSuccessfulClients { round: round_index, failed: failures.len() });
            return Aggregated { failures, result };
        }

        let num_examples: u64 = accepted.iter().map(|r| r.num_examples).sum();
        let weighted_loss = accepted.iter().map(|r| r.num_examples as f64 * r.loss).sum::<f64>() / num_examples as f64;
        let metrics = weighted_metrics(accepted.iter().map(|r| (r.client_id, r.num_examples, &r.metrics)));
        Aggregated {
            failures,
            result: Ok(AggregateMetrics {
                round_index,
                num_clients: accepted.len(),
                num_examples,
                weighted_loss: Some(weighted_loss),
                metrics,
            }),
        }
    }
}

/// Splits outcomes into validated results (sorted by client) and failures.
///
/// Example counts are summed in client order; a result that would overflow
/// the round total is rejected as invalid.
fn screen<T: ClientResult>(
    outcomes: Vec<ClientOutcome<T>>,
    validate: impl Fn(&T) -> Result<(), FailureReason>,
) -> (Vec<T>, Vec<ClientFailure>) {
    let mut valid = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(r) => match validate(&r) {
                Ok(()) => valid.push(r),
                Err(reason) => reject(&mut failures, r.client_id(), reason),
            },
            Err(f) => failures.push(f),
        }
    }
    valid.sort_by_key(|r| r.client_id());

    let mut total: u64 = 0;
    let mut accepted = Vec::with_capacity(valid.len());
    for r in valid {
        match total.checked_add(r.num_examples()) {
            Some(sum) => {
                total = sum;
                accepted.push(r);
            }
            None => {
                let reason = FailureReason::InvalidResult(format!("num_examples {} overflows the round total", r.num_examples()));
                reject(&mut failures, r.client_id(), reason);
            }
        }
    }
    failures.sort_by_key(|f| f.client_id);
    (accepted, failures)
}

fn reject(failures: &mut Vec<ClientFailure>, client: ClientId, reason: FailureReason) {
    warn!(client = %client, %reason, "client result rejected");
    failures.push(ClientFailure::new(client, reason));
}

/// Per-metric average weighted by examples, over the clients reporting it.
fn weighted_metrics<'a>(items: impl Iterator<Item = (ClientId, u64, &'a Metrics)>) -> Metrics {
    let mut sums: BTreeMap<&'a str, (f64, f64)> = BTreeMap::new();
    for (client, n, metrics) in items {
        for (name, value) in metrics {
            if !value.is_finite() {
                warn!(client = %client, metric = %name, value, "non-finite metric ignored");
                continue;
            }
            let entry = sums.entry(name.as_str()).or_insert((0.0, 0.0));
            entry.0 += n as f64 * value;
            entry.1 += n as f64;
        }
    }
    sums.into_iter().map(|(name, (total, weight))| (name.to_string(), total / weight)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShapeMismatch;

    fn global() -> GlobalModelState {
        GlobalModelState::initial(
            Parameters::new()
                .with("fc.weight", Tensor::new(vec![1, 3], vec![0.0, 0.0, 0.0]))
                .with("fc.bias", Tensor::new(vec![1], vec![0.0])),
        )
    }

    fn fit(client: u32, w: [f32; 3], b: f32, n: u64) -> ClientOutcome<ClientFitResult> {
        Ok(ClientFitResult {
            client_id: ClientId(client),
            parameters: Parameters::new()
                .with("fc.weight", Tensor::new(vec![1, 3], w.to_vec()))
                .with("fc.bias", Tensor::new(vec![1], vec![b])),
            num_examples: n,
            metrics: Metrics::from([("train_loss".to_string(), f64::from(client))]),
        })
    }

    fn eval(client: u32, loss: f64, n: u64) -> ClientOutcome<ClientEvalResult> {
        Ok(ClientEvalResult {
            client_id: ClientId(client),
            loss,
            num_examples: n,
            metrics: Metrics::from([("mean_loss".to_string(), loss / n as f64)]),
        })
    }

    #[test]
    fn single_client_is_identity() {
        let engine = AggregationEngine::new();
        let w = [0.1, -2.5, 3.3333];
        let agg = engine.aggregate_fit(&global(), 0, vec![fit(1, w, 0.7, 17)]).result.unwrap();
        assert_eq!(agg.state.parameters.get("fc.weight").unwrap().values, w.to_vec());
        assert_eq!(agg.state.parameters.get("fc.bias").unwrap().values, vec![0.7]);
        assert_eq!(agg.state.version, 1);
        assert_eq!(agg.total_examples, 17);
    }

    #[test]
    fn equal_weights_give_arithmetic_mean() {
        let engine = AggregationEngine::new();
        let agg = engine
            .aggregate_fit(&global(), 0, vec![fit(0, [1.0, 2.0, 3.0], 1.0, 5), fit(1, [3.0, 4.0, 6.0], 2.0, 5)])
            .result
            .unwrap();
        let w = &agg.state.parameters.get("fc.weight").unwrap().values;
        for (got, want) in w.iter().zip([2.0, 3.0, 4.5]) {
            assert!((got - want).abs() < 1e-6);
        }
        assert!((agg.state.parameters.get("fc.bias").unwrap().values[0] - 1.5).abs() < 1e-6);
        assert!((agg.metrics["train_loss"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn weights_follow_example_counts() {
        let engine = AggregationEngine::new();
        let agg = engine
            .aggregate_fit(&global(), 0, vec![fit(0, [0.1, 0.0, 0.0], 0.0, 10), fit(1, [0.2, 0.0, 0.0], 0.0, 30)])
            .result
            .unwrap();
        // (0.1*10 + 0.2*30) / 40
        assert!((agg.state.parameters.get("fc.weight").unwrap().values[0] - 0.175).abs() < 1e-6);
    }

    #[test]
    fn no_success_leaves_state_untouched() {
        let engine = AggregationEngine::new();
        let before = global();
        let snapshot = before.clone();
        let out = engine.aggregate_fit(&before, 3, vec![Err(ClientFailure::runner(ClientId(0), "boom"))]);
        assert_eq!(out.result.unwrap_err(), AggregationError::NoSuccessfulClients { round: 3, failed: 1 });
        assert_eq!(out.failures.len(), 1);
        assert_eq!(before, snapshot);

        let empty = engine.aggregate_fit(&before, 4, vec![]);
        assert!(empty.result.is_err());
        assert!(empty.failures.is_empty());
    }

    #[test]
    fn failed_clients_excluded_from_weights() {
        let engine = AggregationEngine::new();
        let out = engine.aggregate_fit(
            &global(),
            0,
            vec![fit(0, [4.0, 4.0, 4.0], 4.0, 1), Err(ClientFailure::runner(ClientId(1), "offline"))],
        );
        let agg = out.result.unwrap();
        assert_eq!(agg.contributors, vec![ClientId(0)]);
        assert_eq!(agg.state.parameters.get("fc.bias").unwrap().values, vec![4.0]);
        assert_eq!(out.failures[0].client_id, ClientId(1));
    }

    #[test]
    fn shape_mismatch_recorded_as_failure() {
        let engine = AggregationEngine::new();
        let bad = Ok(ClientFitResult {
            client_id: ClientId(2),
            parameters: Parameters::new()
                .with("fc.weight", Tensor::new(vec![3, 1], vec![9.0, 9.0, 9.0]))
                .with("fc.bias", Tensor::new(vec![1], vec![9.0])),
            num_examples: 100,
            metrics: Metrics::new(),
        });
        let out = engine.aggregate_fit(&global(), 0, vec![fit(0, [1.0, 1.0, 1.0], 1.0, 1), bad]);
        let agg = out.result.unwrap();
        assert_eq!(agg.state.parameters.get("fc.bias").unwrap().values, vec![1.0]);
        assert_eq!(out.failures.len(), 1);
        assert!(matches!(out.failures[0].reason, FailureReason::ShapeMismatch(ShapeMismatch::Dims { .. })));
    }

    #[test]
    fn zero_examples_rejected() {
        let engine = AggregationEngine::new();
        let out = engine.aggregate_fit(&global(), 0, vec![fit(0, [1.0, 1.0, 1.0], 1.0, 0)]);
        assert!(out.result.is_err());
        assert!(matches!(out.failures[0].reason, FailureReason::InvalidResult(_)));
    }

    #[test]
    fn evaluate_weighted_loss_and_metrics() {
        let engine = AggregationEngine::new();
        let out = engine.aggregate_evaluate(2, vec![eval(0, 1.0, 1), eval(1, 4.0, 3), Err(ClientFailure::runner(ClientId(2), "x"))]);
        let m = out.result.unwrap();
        assert_eq!(m.round_index, 2);
        assert_eq!(m.num_clients, 2);
        assert_eq!(m.num_examples, 4);
        // (1*1 + 3*4) / 4
        assert!((m.weighted_loss.unwrap() - 3.25).abs() < 1e-12);
        // mean_loss: (1*1.0 + 3*(4/3)) / 4
        assert!((m.metrics["mean_loss"] - 1.25).abs() < 1e-12);
        assert_eq!(out.failures.len(), 1);
    }

    #[test]
    fn evaluate_without_success_has_no_data() {
        let engine = AggregationEngine::new();
        let out = engine.aggregate_evaluate(1, vec![eval(0, f64::NAN, 3)]);
        assert_eq!(out.result.unwrap_err(), AggregationError::NoSuccessfulClients { round: 1, failed: 1 });
        let marker = AggregateMetrics::no_data(1);
        assert!(marker.is_no_data());
        assert!(marker.metrics.is_empty());
    }

    #[test]
    fn metrics_average_only_over_reporting_clients() {
        let a = Metrics::from([("acc".to_string(), 0.5), ("extra".to_string(), 2.0)]);
        let b = Metrics::from([("acc".to_string(), 1.0)]);
        let m = weighted_metrics([(ClientId(0), 1, &a), (ClientId(1), 1, &b)].into_iter());
        assert_eq!(m["acc"], 0.75);
        assert_eq!(m["extra"], 2.0);
    }

    #[test]
    fn overflowing_example_counts_are_rejected() {
        let engine = AggregationEngine::new();
        let out = engine.aggregate_fit(&global(), 0, vec![fit(0, [1.0, 1.0, 1.0], 1.0, u64::MAX), fit(1, [3.0, 3.0, 3.0], 3.0, 2)]);
        let agg = out.result.unwrap();
        assert_eq!(agg.contributors, vec![ClientId(0)]);
        assert_eq!(agg.total_examples, u64::MAX);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].client_id, ClientId(1));
        assert!(matches!(out.failures[0].reason, FailureReason::InvalidResult(_)));

        let out = engine.aggregate_evaluate(0, vec![eval(3, 1.0, 5), eval(2, 1.0, u64::MAX - 1)]);
        let m = out.result.unwrap();
        assert_eq!(m.num_clients, 1);
        assert_eq!(m.num_examples, u64::MAX - 1);
        assert_eq!(out.failures[0].client_id, ClientId(3));
    }

    #[test]
    fn non_finite_metrics_are_skipped() {
        let a = Metrics::from([("acc".to_string(), f64::NAN)]);
        let b = Metrics::from([("acc".to_string(), 0.5)]);
        let m = weighted_metrics([(ClientId(0), 4, &a), (ClientId(1), 1, &b)].into_iter());
        assert_eq!(m["acc"], 0.5);
    }
}
