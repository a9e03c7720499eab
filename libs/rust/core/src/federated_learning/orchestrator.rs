//! Round loop: sample, configure, dispatch, barrier, aggregate, record.
//!
//! Rounds run strictly one after another because each one starts from the
//! state the previous aggregation produced. Within a round, client
//! invocations run concurrently on a bounded worker pool and only meet again
//! at the barrier that feeds the single-threaded reduction.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AggregationError, ClientFailure, ConfigurationError, FailureReason, SimulationError};
use crate::federated_learning::aggregation::{AggregateMetrics, Aggregated, AggregationEngine};
use crate::federated_learning::history::{EvaluateRoundSummary, FitRoundSummary, RoundRecord, SimulationReport, Termination};
use crate::federated_learning::model::GlobalModelState;
use crate::federated_learning::pool::{ClientId, ClientPool};
use crate::federated_learning::round_config::{RoundConfig, RoundConfigBuilder, RoundKind, RoundSpec};
use crate::federated_learning::runner::{ClientOutcome, ClientResult, ClientRunner};
use crate::federated_learning::sampling::SamplingPolicy;
use crate::metrics::{self, FL_METRICS};

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub num_rounds: u64,
    pub fit_sample_size: usize,
    pub eval_sample_size: usize,
    /// Evaluate after every n-th fit round; 0 disables evaluation.
    pub evaluate_every: u64,
    pub worker_pool_size: usize,
    /// Per-invocation budget; a client exceeding it is recorded as failed.
    pub client_timeout: Option<Duration>,
    pub abort_on_empty_round: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            num_rounds: 10,
            fit_sample_size: 10,
            eval_sample_size: 10,
            evaluate_every: 1,
            worker_pool_size: 4,
            client_timeout: None,
            abort_on_empty_round: false,
        }
    }
}

impl OrchestratorSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let zero = [
            ("num_rounds", self.num_rounds == 0),
            ("num_clients_per_round_fit", self.fit_sample_size == 0),
            ("worker_pool_size", self.worker_pool_size == 0),
        ];
        if let Some((field, _)) = zero.into_iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigurationError::NotPositive { field, value: "0".into() });
        }
        if self.evaluate_every > 0 && self.eval_sample_size == 0 {
            return Err(ConfigurationError::NotPositive { field: "num_clients_per_round_eval", value: "0".into() });
        }
        if self.client_timeout == Some(Duration::ZERO) {
            return Err(ConfigurationError::NotPositive { field: "client_timeout_ms", value: "0".into() });
        }
        Ok(())
    }

    pub fn evaluates(&self, round_index: u64) -> bool {
        self.evaluate_every > 0 && (round_index + 1) % self.evaluate_every == 0
    }
}

/// What one round hands back to the loop.
struct RoundOutcome {
    record: RoundRecord,
    state: Arc<GlobalModelState>,
    metrics: Option<AggregateMetrics>,
    fit_error: Option<AggregationError>,
}

pub struct RoundOrchestrator {
    settings: OrchestratorSettings,
    pool: ClientPool,
    sampling: SamplingPolicy,
    configs: RoundConfigBuilder,
    engine: AggregationEngine,
    runner: Arc<dyn ClientRunner>,
    workers: Arc<Semaphore>,
}

impl RoundOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        pool: ClientPool,
        sampling: SamplingPolicy,
        configs: RoundConfigBuilder,
        runner: Arc<dyn ClientRunner>,
    ) -> Result<Self, ConfigurationError> {
        settings.validate()?;
        sampling.check_pool(&pool)?;
        let workers = Arc::new(Semaphore::new(settings.worker_pool_size));
        Ok(Self { settings, pool, sampling, configs, engine: AggregationEngine::new(), runner, workers })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Runs all configured rounds.
    pub async fn run(&self, initial: GlobalModelState) -> Result<SimulationReport, SimulationError> {
        self.run_until(initial, std::future::pending()).await
    }

    /// Runs until all rounds are done or `shutdown` resolves.
    ///
    /// On shutdown the in-flight round is dropped together with its client
    /// tasks and the last completed round's state is reported.
    pub async fn run_until<F>(&self, initial: GlobalModelState, shutdown: F) -> Result<SimulationReport, SimulationError>
    where
        F: Future<Output = ()>,
    {
        let run_id = Uuid::new_v4();
        info!(%run_id, rounds = self.settings.num_rounds, population = self.pool.len(), "simulation starting");
        tokio::pin!(shutdown);

        let mut state = Arc::new(initial);
        let mut rounds = Vec::new();
        let mut model_history = Vec::new();
        let mut metrics_history = Vec::new();
        let mut termination = Termination::Completed;

        for round_index in 0..self.settings.num_rounds {
            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!(%run_id, round = round_index, "simulation cancelled, discarding in-flight round");
                    termination = Termination::Cancelled { round_index };
                    break;
                }
                outcome = self.run_round(round_index, Arc::clone(&state)) => outcome?,
            };

            state = outcome.state;
            model_history.push((round_index, Arc::clone(&state)));
            metrics_history.extend(outcome.metrics);
            rounds.push(outcome.record);
            FL_METRICS.rounds_total.add(1, &[]);

            if let Some(error) = outcome.fit_error {
                FL_METRICS.empty_rounds_total.add(1, &[]);
                if self.settings.abort_on_empty_round {
                    warn!(%run_id, round = round_index, %error, "aborting on empty round");
                    termination = Termination::Aborted { round_index, error };
                    break;
                }
            }
        }

        info!(%run_id, rounds = rounds.len(), version = state.version, ?termination, "simulation finished");
        Ok(SimulationReport { run_id, termination, final_state: state, rounds, model_history, metrics_history })
    }

    async fn run_round(&self, round_index: u64, global: Arc<GlobalModelState>) -> Result<RoundOutcome, SimulationError> {
        let started = Instant::now();
        let started_at = Utc::now();

        let fit_spec = RoundSpec::fit(round_index, self.settings.fit_sample_size);
        let sampled = self.sampling.sample(&fit_spec, &self.pool)?;
        let outcomes = match self.configs.build(&fit_spec) {
            RoundConfig::Fit(config) => {
                self.dispatch(RoundKind::Fit, &sampled, |client| {
                    let runner = Arc::clone(&self.runner);
                    let model = Arc::clone(&global);
                    let config = config.clone();
                    async move { runner.fit(client, model, config).await }
                })
                .await
            }
            RoundConfig::Evaluate(_) => Vec::new(),
        };

        let agg_started = Instant::now();
        let Aggregated { failures, result } = self.engine.aggregate_fit(&global, round_index, outcomes);
        FL_METRICS.aggregation_latency_ms.record(agg_started.elapsed().as_secs_f64() * 1000.0, &[]);
        record_failures(RoundKind::Fit, &failures);

        let (state, fit) = match result {
            Ok(agg) => {
                let state = Arc::new(agg.state);
                info!(
                    round = round_index,
                    sampled = sampled.len(),
                    contributors = agg.contributors.len(),
                    failed = failures.len(),
                    examples = agg.total_examples,
                    version = state.version,
                    "fit round aggregated"
                );
                let fit = FitRoundSummary {
                    sampled,
                    contributors: agg.contributors,
                    total_examples: agg.total_examples,
                    metrics: agg.metrics,
                    failures,
                    error: None,
                    model_version: state.version,
                };
                (state, fit)
            }
            Err(error) => {
                warn!(round = round_index, sampled = sampled.len(), %error, "fit round skipped, global state unchanged");
                let fit = FitRoundSummary {
                    sampled,
                    contributors: Vec::new(),
                    total_examples: 0,
                    metrics: Default::default(),
                    failures,
                    error: Some(error),
                    model_version: global.version,
                };
                (global, fit)
            }
        };

        let fit_error = fit.error.clone();
        let evaluate = if self.settings.evaluates(round_index) && !(fit_error.is_some() && self.settings.abort_on_empty_round) {
            Some(self.evaluate_round(round_index, Arc::clone(&state)).await?)
        } else {
            None
        };
        let metrics = evaluate.as_ref().map(|e| e.metrics.clone());

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        FL_METRICS.round_latency_ms.record(duration_ms, &[]);
        Ok(RoundOutcome {
            record: RoundRecord { round_index, started_at, duration_ms, fit, evaluate },
            state,
            metrics,
            fit_error,
        })
    }

    async fn evaluate_round(&self, round_index: u64, model: Arc<GlobalModelState>) -> Result<EvaluateRoundSummary, SimulationError> {
        let spec = RoundSpec::evaluate(round_index, self.settings.eval_sample_size);
        let sampled = self.sampling.sample(&spec, &self.pool)?;
        let outcomes = match self.configs.build(&spec) {
            RoundConfig::Evaluate(config) => {
                self.dispatch(RoundKind::Evaluate, &sampled, |client| {
                    let runner = Arc::clone(&self.runner);
                    let model = Arc::clone(&model);
                    let config = config.clone();
                    async move { runner.evaluate(client, model, config).await }
                })
                .await
            }
            RoundConfig::Fit(_) => Vec::new(),
        };

        let Aggregated { failures, result } = self.engine.aggregate_evaluate(round_index, outcomes);
        record_failures(RoundKind::Evaluate, &failures);
        let (metrics, error) = match result {
            Ok(metrics) => {
                info!(
                    round = round_index,
                    clients = metrics.num_clients,
                    failed = failures.len(),
                    loss = ?metrics.weighted_loss,
                    "evaluate round aggregated"
                );
                (metrics, None)
            }
            Err(error) => {
                warn!(round = round_index, %error, "evaluate round has no data");
                (AggregateMetrics::no_data(round_index), Some(error))
            }
        };
        Ok(EvaluateRoundSummary { sampled, metrics, failures, error })
    }

    /// Runs `call` for every client on the worker pool and waits for all of them.
    ///
    /// Each invocation ends as a result or a [`ClientFailure`]: runner errors,
    /// timeouts and panics are all converted, so the barrier always completes.
    /// Outcomes are attributed to the client they were dispatched to.
    async fn dispatch<T, F, Fut>(&self, kind: RoundKind, clients: &[ClientId], call: F) -> Vec<ClientOutcome<T>>
    where
        T: ClientResult + Send + 'static,
        F: Fn(ClientId) -> Fut,
        Fut: Future<Output = ClientOutcome<T>> + Send + 'static,
    {
        metrics::record_invocations(kind.as_str(), clients.len());
        let timeout = self.settings.client_timeout;
        let mut tasks = JoinSet::new();
        for &client in clients {
            let invocation = call(client);
            let workers = Arc::clone(&self.workers);
            tasks.spawn(async move {
                let Ok(_permit) = workers.acquire_owned().await else {
                    return (client, Err(ClientFailure::runner(client, "worker pool closed")));
                };
                let guarded = AssertUnwindSafe(invocation).catch_unwind();
                let finished = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, guarded).await {
                        Ok(finished) => finished,
                        Err(_) => return (client, Err(ClientFailure::new(client, FailureReason::Timeout(limit)))),
                    },
                    None => guarded.await,
                };
                let outcome = finished.unwrap_or_else(|panic| Err(ClientFailure::new(client, FailureReason::Panicked(panic_message(&*panic)))));
                (client, outcome)
            });
        }

        let mut pending: HashSet<ClientId> = clients.iter().copied().collect();
        let mut outcomes = Vec::with_capacity(clients.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((client, outcome)) => {
                    let outcome = attribute(client, outcome);
                    debug!(client = %client, kind = kind.as_str(), ok = outcome.is_ok(), "client invocation finished");
                    pending.remove(&client);
                    outcomes.push(outcome);
                }
                Err(e) => warn!(kind = kind.as_str(), error = %e, "client task ended without a result"),
            }
        }
        for client in pending {
            outcomes.push(Err(ClientFailure::runner(client, "task ended without a result")));
        }
        outcomes
    }
}

/// Rejects results reported under another identity and pins failures to `client`.
fn attribute<T: ClientResult>(client: ClientId, outcome: ClientOutcome<T>) -> ClientOutcome<T> {
    match outcome {
        Ok(r) if r.client_id() != client => {
            warn!(client = %client, reported = %r.client_id(), "client result carries a foreign id");
            Err(ClientFailure::new(client, FailureReason::InvalidResult(format!("result reported as client {}", r.client_id()))))
        }
        Err(f) if f.client_id != client => Err(ClientFailure::new(client, f.reason)),
        other => other,
    }
}

fn record_failures(kind: RoundKind, failures: &[ClientFailure]) {
    for f in failures {
        debug!(client = %f.client_id, kind = kind.as_str(), reason = %f.reason, "client excluded");
        metrics::record_failure(kind.as_str(), f.reason.label());
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
