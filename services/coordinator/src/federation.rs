use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use fedsim_core::{ClientPool, ExperimentConfig, GlobalModelState, RoundOrchestrator, SimulationReport};

use crate::dataset::{DatasetSpec, SyntheticDataset};
use crate::model::LinearModel;
use crate::runner::SimulatedClientRunner;

/// Wires the synthetic population, the local trainer and the round engine
/// from one experiment config.
pub struct FederationModule {
    orchestrator: RoundOrchestrator,
    features: usize,
}

impl FederationModule {
    pub fn new(cfg: &ExperimentConfig) -> Result<Self> {
        let spec = DatasetSpec::parse(cfg.datasets.as_deref())?;
        let dataset = Arc::new(SyntheticDataset::generate(spec, cfg.num_clients, cfg.uniform_data_distribution, cfg.seed));

        let pool = if cfg.uniform_data_distribution {
            ClientPool::new(dataset.len())?
        } else {
            ClientPool::with_weights(dataset.train_sizes())?
        };
        let runner = Arc::new(SimulatedClientRunner::new(Arc::clone(&dataset), cfg.seed));
        let orchestrator = RoundOrchestrator::new(
            cfg.orchestrator_settings(),
            pool,
            cfg.sampling_policy(),
            cfg.round_config_builder()?,
            runner,
        )
        .context("building round orchestrator")?;

        info!(clients = dataset.len(), features = spec.features, uniform = cfg.uniform_data_distribution, "federation_module_initialized");
        Ok(Self { orchestrator, features: spec.features })
    }

    pub fn initial_state(&self) -> GlobalModelState {
        GlobalModelState::initial(LinearModel::initial_parameters(self.features))
    }

    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<SimulationReport> {
        let report = self.orchestrator.run_until(self.initial_state(), shutdown).await?;
        info!(rounds = report.completed_rounds(), version = report.final_state.version, "federation_module_shutdown");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use fedsim_core::Termination;

    use super::*;

    fn small(uniform: bool) -> ExperimentConfig {
        ExperimentConfig {
            num_rounds: 4,
            num_clients: 6,
            batch_size: 8,
            uniform_data_distribution: uniform,
            num_clients_per_round_fit: 3,
            num_clients_per_round_eval: 2,
            evaluate_every: 1,
            seed: 3,
            worker_pool_size: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn simulation_reduces_validation_loss() {
        let mut cfg = small(true);
        cfg.config_fit.lr = 0.05;
        cfg.config_fit.momentum = 0.5;
        let module = FederationModule::new(&cfg).unwrap();
        let report = module.run_until(std::future::pending()).await.unwrap();

        assert_eq!(report.termination, Termination::Completed);
        assert_eq!(report.final_state.version, 4);
        let curve = report.loss_curve();
        assert_eq!(curve.len(), 4);
        assert!(curve[3].1 < curve[0].1, "{curve:?}");
    }

    #[tokio::test]
    async fn skewed_population_samples_by_partition_size() {
        let module = FederationModule::new(&small(false)).unwrap();
        let report = module.run_until(std::future::pending()).await.unwrap();
        assert!(report.rounds.iter().all(|r| r.fit.sampled.len() == 3 && r.fit.failures.is_empty()));
    }

    #[test]
    fn rejects_unknown_dataset() {
        let cfg = ExperimentConfig { datasets: Some("cifar10".into()), ..small(true) };
        assert!(FederationModule::new(&cfg).is_err());
    }
}
