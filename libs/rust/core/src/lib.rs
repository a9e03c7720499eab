//! Core round orchestration and aggregation engine for federated learning simulations.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the fmt subscriber once per process.
///
/// `RUST_LOG` drives the filter (default `info`); `FEDSIM_JSON_LOG=1` switches
/// to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FEDSIM_JSON_LOG")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_line_number(true);
        let installed = if json {
            builder.json().flatten_event(true).with_current_span(true).try_init()
        } else {
            builder.try_init()
        };
        installed.map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))
    })?;
    info!(target: "fedsim", service, "tracing initialized");
    Ok(())
}

pub mod config;
pub mod error;
pub mod federated_learning;
pub mod metrics;

pub use crate::config::ExperimentConfig;
pub use error::{AggregationError, ClientFailure, ConfigurationError, FailureReason, ShapeMismatch, SimulationError};
pub use federated_learning::{
    AggregateMetrics, AggregationEngine, ClientEvalResult, ClientFitResult, ClientId, ClientOutcome, ClientPool, ClientRunner,
    EvaluateConfig, FitConfig, GlobalModelState, Metrics, OrchestratorSettings, Parameters, RoundConfigBuilder, RoundKind,
    RoundOrchestrator, RoundSpec, SamplingPolicy, SimulationReport, Tensor, Termination,
};
pub use metrics::{FederatedLearningMetrics, FL_METRICS};
