//! Static experiment configuration, read once at startup.
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML file,
//! then `FEDSIM__*` environment variables (`__` separates nested keys, e.g.
//! `FEDSIM__CONFIG_FIT__LR=0.05`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::federated_learning::orchestrator::OrchestratorSettings;
use crate::federated_learning::round_config::{FitHyperparams, LrSchedule, RoundConfigBuilder};
use crate::federated_learning::sampling::SamplingPolicy;

pub const ENV_PREFIX: &str = "FEDSIM";
pub const CONFIG_FILE_ENV: &str = "FEDSIM_CONFIG_FILE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub num_rounds: u64,
    /// Total simulated population.
    pub num_clients: usize,
    pub batch_size: usize,
    pub config_fit: FitHyperparams,
    #[serde(default)]
    pub lr_schedule: LrSchedule,
    /// Uniform sampling and equally sized partitions when true; weighted
    /// sampling over skewed partitions otherwise.
    pub uniform_data_distribution: bool,
    pub num_clients_per_round_fit: usize,
    pub num_clients_per_round_eval: usize,
    /// Evaluate after every n-th fit round; 0 disables evaluation.
    pub evaluate_every: u64,
    pub seed: u64,
    pub worker_pool_size: usize,
    #[serde(default)]
    pub client_timeout_ms: Option<u64>,
    #[serde(default)]
    pub abort_on_empty_round: bool,
    /// Handed to the data collaborators verbatim.
    #[serde(default)]
    pub datasets: Option<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            num_rounds: 10,
            num_clients: 100,
            batch_size: 20,
            config_fit: FitHyperparams::default(),
            lr_schedule: LrSchedule::Constant,
            uniform_data_distribution: true,
            num_clients_per_round_fit: 10,
            num_clients_per_round_eval: 25,
            evaluate_every: 1,
            seed: 2024,
            worker_pool_size: 4,
            client_timeout_ms: None,
            abort_on_empty_round: false,
            datasets: None,
        }
    }
}

impl ExperimentConfig {
    /// Loads defaults, then `file` (or `$FEDSIM_CONFIG_FILE`), then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigurationError> {
        let defaults = ::config::Config::try_from(&ExperimentConfig::default())?;
        let mut builder = ::config::Config::builder().add_source(defaults);

        let env_file = std::env::var(CONFIG_FILE_ENV).ok();
        let path = file.map(|p| p.to_string_lossy().into_owned()).or(env_file);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(&path).required(true));
        }
        builder = builder.add_source(::config::Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__").try_parsing(true));

        let cfg: ExperimentConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a YAML document layered over the defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigurationError> {
        let defaults = ::config::Config::try_from(&ExperimentConfig::default())?;
        let cfg: ExperimentConfig = ::config::Config::builder()
            .add_source(defaults)
            .add_source(::config::File::from_str(text, ::config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.num_clients == 0 {
            return Err(ConfigurationError::EmptyPopulation);
        }
        self.config_fit.validate()?;
        self.lr_schedule.validate()?;
        if self.batch_size == 0 {
            return Err(ConfigurationError::NotPositive { field: "batch_size", value: "0".into() });
        }
        self.orchestrator_settings().validate()
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            num_rounds: self.num_rounds,
            fit_sample_size: self.num_clients_per_round_fit,
            eval_sample_size: self.num_clients_per_round_eval,
            evaluate_every: self.evaluate_every,
            worker_pool_size: self.worker_pool_size,
            client_timeout: self.client_timeout_ms.map(Duration::from_millis),
            abort_on_empty_round: self.abort_on_empty_round,
        }
    }

    pub fn sampling_policy(&self) -> SamplingPolicy {
        SamplingPolicy::from_config(self.uniform_data_distribution, self.seed)
    }

    pub fn round_config_builder(&self) -> Result<RoundConfigBuilder, ConfigurationError> {
        RoundConfigBuilder::new(self.config_fit.clone(), self.lr_schedule.clone(), self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ExperimentConfig::default().validate().is_ok());
    }

    #[test]
    fn yaml_overrides_defaults() {
        let cfg = ExperimentConfig::from_yaml_str(
            r#"
num_rounds: 3
num_clients: 4
num_clients_per_round_fit: 2
num_clients_per_round_eval: 2
uniform_data_distribution: false
client_timeout_ms: 250
config_fit:
  lr: 0.05
  momentum: 0.5
  local_epochs: 2
lr_schedule:
  type: step
  step_size: 2
  gamma: 0.5
"#,
        )
        .unwrap();
        assert_eq!(cfg.num_rounds, 3);
        assert_eq!(cfg.num_clients, 4);
        assert_eq!(cfg.batch_size, 20);
        assert_eq!(cfg.config_fit.local_epochs, 2);
        assert_eq!(cfg.lr_schedule, LrSchedule::Step { step_size: 2, gamma: 0.5 });
        assert_eq!(cfg.sampling_policy(), SamplingPolicy::Weighted { seed: 2024 });
        assert_eq!(cfg.orchestrator_settings().client_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let zero_pop = ExperimentConfig { num_clients: 0, ..Default::default() };
        assert_eq!(zero_pop.validate(), Err(ConfigurationError::EmptyPopulation));

        let mut bad_momentum = ExperimentConfig::default();
        bad_momentum.config_fit.momentum = 1.5;
        assert_eq!(bad_momentum.validate(), Err(ConfigurationError::MomentumOutOfRange(1.5)));

        let no_workers = ExperimentConfig { worker_pool_size: 0, ..Default::default() };
        assert!(matches!(no_workers.validate(), Err(ConfigurationError::NotPositive { field: "worker_pool_size", .. })));

        assert!(ExperimentConfig::from_yaml_str("num_rounds: 0").is_err());
    }
}
