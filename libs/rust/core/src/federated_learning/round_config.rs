//! Round descriptors and the per-round configuration sent to clients.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind {
    Fit,
    Evaluate,
}

impl RoundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundKind::Fit => "fit",
            RoundKind::Evaluate => "evaluate",
        }
    }
}

/// Created by the orchestrator at the start of each round, dropped after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoundSpec {
    pub round_index: u64,
    pub kind: RoundKind,
    pub sample_size: usize,
}

impl RoundSpec {
    pub fn fit(round_index: u64, sample_size: usize) -> Self {
        Self { round_index, kind: RoundKind::Fit, sample_size }
    }

    pub fn evaluate(round_index: u64, sample_size: usize) -> Self {
        Self { round_index, kind: RoundKind::Evaluate, sample_size }
    }
}

/// Static fit hyperparameters as written in the experiment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitHyperparams {
    pub lr: f64,
    pub momentum: f64,
    pub local_epochs: u32,
}

impl Default for FitHyperparams {
    fn default() -> Self {
        Self { lr: 0.01, momentum: 0.9, local_epochs: 1 }
    }
}

impl FitHyperparams {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(ConfigurationError::NotPositive { field: "config_fit.lr", value: self.lr.to_string() });
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigurationError::MomentumOutOfRange(self.momentum));
        }
        if self.local_epochs == 0 {
            return Err(ConfigurationError::NotPositive { field: "config_fit.local_epochs", value: "0".into() });
        }
        Ok(())
    }
}

/// Learning rate as a pure function of the round index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    /// `lr * gamma^(round / step_size)`
    Step { step_size: u64, gamma: f64 },
    /// `lr * gamma^round`
    Exponential { gamma: f64 },
}

impl LrSchedule {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            LrSchedule::Constant => Ok(()),
            LrSchedule::Step { step_size, gamma } => {
                if *step_size == 0 {
                    return Err(ConfigurationError::InvalidSchedule("step_size must be positive".into()));
                }
                check_gamma(*gamma)
            }
            LrSchedule::Exponential { gamma } => check_gamma(*gamma),
        }
    }

    pub fn factor(&self, round_index: u64) -> f64 {
        match self {
            LrSchedule::Constant => 1.0,
            LrSchedule::Step { step_size, gamma } => gamma.powf((round_index / step_size) as f64),
            LrSchedule::Exponential { gamma } => gamma.powf(round_index as f64),
        }
    }
}

fn check_gamma(gamma: f64) -> Result<(), ConfigurationError> {
    if gamma.is_finite() && gamma > 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidSchedule(format!("gamma must be finite and positive (got {gamma})")))
    }
}

/// Hyperparameters every sampled client receives for one fit round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitConfig {
    pub round_index: u64,
    pub learning_rate: f64,
    pub momentum: f64,
    pub local_epochs: u32,
    pub batch_size: usize,
}

/// Evaluate rounds carry no training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluateConfig {
    pub round_index: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoundConfig {
    Fit(FitConfig),
    Evaluate(EvaluateConfig),
}

/// Pure builder: the same round spec always yields the same config.
#[derive(Debug, Clone)]
pub struct RoundConfigBuilder {
    fit: FitHyperparams,
    schedule: LrSchedule,
    batch_size: usize,
}

impl RoundConfigBuilder {
    pub fn new(fit: FitHyperparams, schedule: LrSchedule, batch_size: usize) -> Result<Self, ConfigurationError> {
        fit.validate()?;
        schedule.validate()?;
        if batch_size == 0 {
            return Err(ConfigurationError::NotPositive { field: "batch_size", value: "0".into() });
        }
        Ok(Self { fit, schedule, batch_size })
    }

    pub fn learning_rate_at(&self, round_index: u64) -> f64 {
        self.fit.lr * self.schedule.factor(round_index)
    }

    pub fn build(&self, spec: &RoundSpec) -> RoundConfig {
        match spec.kind {
            RoundKind::Fit => RoundConfig::Fit(self.fit_config(spec.round_index)),
            RoundKind::Evaluate => RoundConfig::Evaluate(EvaluateConfig {
                round_index: spec.round_index,
                batch_size: self.batch_size,
            }),
        }
    }

    pub fn fit_config(&self, round_index: u64) -> FitConfig {
        FitConfig {
            round_index,
            learning_rate: self.learning_rate_at(round_index),
            momentum: self.fit.momentum,
            local_epochs: self.fit.local_epochs,
            batch_size: self.batch_size,
        }
    }
}
