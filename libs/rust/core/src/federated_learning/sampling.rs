//! Per-round client selection.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::federated_learning::pool::{ClientId, ClientPool};
use crate::federated_learning::round_config::{RoundKind, RoundSpec};

/// How clients are drawn from the pool. Both variants sample without
/// replacement and are reproducible for a fixed seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingPolicy {
    /// Every client equally likely, independently each round.
    Uniform { seed: u64 },
    /// Probability proportional to the pool's per-client weights.
    Weighted { seed: u64 },
}

impl SamplingPolicy {
    pub fn from_config(uniform: bool, seed: u64) -> Self {
        if uniform {
            SamplingPolicy::Uniform { seed }
        } else {
            SamplingPolicy::Weighted { seed }
        }
    }

    pub fn seed(&self) -> u64 {
        match self {
            SamplingPolicy::Uniform { seed } | SamplingPolicy::Weighted { seed } => *seed,
        }
    }

    /// Checks the policy can serve `pool` before any round runs.
    pub fn check_pool(&self, pool: &ClientPool) -> Result<(), ConfigurationError> {
        if pool.is_empty() {
            return Err(ConfigurationError::EmptyPopulation);
        }
        if matches!(self, SamplingPolicy::Weighted { .. }) && !pool.has_weights() {
            return Err(ConfigurationError::MissingWeights { expected: pool.len(), found: 0 });
        }
        Ok(())
    }

    /// Returns `min(spec.sample_size, pool.len())` distinct ids, sorted.
    pub fn sample(&self, spec: &RoundSpec, pool: &ClientPool) -> Result<Vec<ClientId>, ConfigurationError> {
        self.check_pool(pool)?;
        let amount = spec.sample_size.min(pool.len());
        let mut rng = StdRng::seed_from_u64(round_seed(self.seed(), spec));
        let mut picked: Vec<ClientId> = match self {
            SamplingPolicy::Uniform { .. } => pool.ids().choose_multiple(&mut rng, amount).copied().collect(),
            SamplingPolicy::Weighted { .. } => pool
                .ids()
                .choose_multiple_weighted(&mut rng, amount, |id| pool.weight(*id).unwrap_or(0.0))
                .map_err(|e| ConfigurationError::Sampling(e.to_string()))?
                .copied()
                .collect(),
        };
        picked.sort_unstable();
        debug!(round = spec.round_index, kind = spec.kind.as_str(), requested = spec.sample_size, sampled = picked.len(), "clients sampled");
        Ok(picked)
    }
}

/// Derives an independent stream per (seed, round, kind).
fn round_seed(seed: u64, spec: &RoundSpec) -> u64 {
    let kind = match spec.kind {
        RoundKind::Fit => 0x5fd1_u64,
        RoundKind::Evaluate => 0xe7a1_u64,
    };
    splitmix64(seed ^ splitmix64(spec.round_index.wrapping_add(kind << 48)))
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn sample_size_is_clamped_and_distinct() {
        let pool = ClientPool::new(10).unwrap();
        let policy = SamplingPolicy::Uniform { seed: 7 };
        for (round, size) in [(0, 3), (1, 10), (2, 25), (3, 0)] {
            let picked = policy.sample(&RoundSpec::fit(round, size), &pool).unwrap();
            assert_eq!(picked.len(), size.min(10));
            let unique: HashSet<_> = picked.iter().collect();
            assert_eq!(unique.len(), picked.len());
            assert!(picked.iter().all(|id| pool.contains(*id)));
        }
    }

    #[test]
    fn deterministic_for_same_seed_and_round() {
        let pool = ClientPool::new(100).unwrap();
        let policy = SamplingPolicy::Uniform { seed: 42 };
        let spec = RoundSpec::fit(5, 10);
        assert_eq!(policy.sample(&spec, &pool).unwrap(), policy.sample(&spec, &pool).unwrap());

        let weighted_pool = ClientPool::with_weights((1..=100).map(f64::from).collect()).unwrap();
        let weighted = SamplingPolicy::Weighted { seed: 42 };
        assert_eq!(weighted.sample(&spec, &weighted_pool).unwrap(), weighted.sample(&spec, &weighted_pool).unwrap());
    }

    #[test]
    fn rounds_draw_different_subsets() {
        let pool = ClientPool::new(100).unwrap();
        let policy = SamplingPolicy::Uniform { seed: 1 };
        let draws: HashSet<Vec<ClientId>> = (0..5).map(|r| policy.sample(&RoundSpec::fit(r, 10), &pool).unwrap()).collect();
        assert!(draws.len() > 1);
    }

    #[test]
    fn weighted_prefers_heavy_clients() {
        let mut weights = vec![1.0; 20];
        weights[3] = 1_000.0;
        let pool = ClientPool::with_weights(weights).unwrap();
        let policy = SamplingPolicy::Weighted { seed: 9 };
        let hits = (0..50)
            .filter(|r| policy.sample(&RoundSpec::fit(*r, 2), &pool).unwrap().contains(&ClientId(3)))
            .count();
        assert!(hits > 40, "heavy client sampled only {hits} times");
    }

    #[test]
    fn weighted_without_weights_is_configuration_error() {
        let pool = ClientPool::new(4).unwrap();
        let err = SamplingPolicy::Weighted { seed: 0 }.sample(&RoundSpec::fit(0, 2), &pool).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingWeights { expected: 4, found: 0 });
    }
}
