//! Federated learning round engine (sampling, configuration, dispatch, FedAvg)

pub mod aggregation;
pub mod history;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod round_config;
pub mod runner;
pub mod sampling;

pub use aggregation::{AggregateMetrics, Aggregated, AggregationEngine, FitAggregate};
pub use history::{EvaluateRoundSummary, FitRoundSummary, RoundRecord, SimulationReport, Termination};
pub use model::{GlobalModelState, Parameters, Tensor};
pub use orchestrator::{OrchestratorSettings, RoundOrchestrator};
pub use pool::{ClientId, ClientPool};
pub use round_config::{EvaluateConfig, FitConfig, FitHyperparams, LrSchedule, RoundConfig, RoundConfigBuilder, RoundKind, RoundSpec};
pub use runner::{ClientEvalResult, ClientFitResult, ClientOutcome, ClientRunner, Metrics};
pub use sampling::SamplingPolicy;
