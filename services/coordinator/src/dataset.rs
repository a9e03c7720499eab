//! Synthetic regression partitions, one per simulated client.

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use fedsim_core::ClientId;

const DEFAULT_FEATURES: usize = 4;
const UNIFORM_PARTITION: usize = 60;
const SKEWED_MIN: usize = 10;
const SKEWED_MAX: usize = 240;
const NOISE: f32 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub features: Vec<f32>,
    pub target: f32,
}

#[derive(Debug, Clone)]
pub struct ClientPartition {
    pub train: Vec<Sample>,
    pub val: Vec<Sample>,
}

/// Parsed form of the opaque `datasets` config value.
///
/// Accepted: unset, `synthetic` or `synthetic:<features>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatasetSpec {
    pub features: usize,
}

impl DatasetSpec {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self { features: DEFAULT_FEATURES });
        };
        let (kind, arg) = raw.split_once(':').unwrap_or((raw, ""));
        if kind != "synthetic" {
            bail!("unsupported dataset `{kind}` (only `synthetic` is available)");
        }
        if arg.is_empty() {
            return Ok(Self { features: DEFAULT_FEATURES });
        }
        let features: usize = arg.parse().with_context(|| format!("invalid feature count `{arg}`"))?;
        if features == 0 {
            bail!("dataset needs at least one feature");
        }
        Ok(Self { features })
    }
}

/// All client partitions drawn from one ground-truth linear function.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    pub features: usize,
    partitions: Vec<ClientPartition>,
}

impl SyntheticDataset {
    /// Partitions are equally sized when `uniform`, otherwise sizes are drawn
    /// from `[SKEWED_MIN, SKEWED_MAX]`. Every partition keeps 10% (at least
    /// one sample) for validation.
    pub fn generate(spec: DatasetSpec, num_clients: usize, uniform: bool, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let truth: Vec<f32> = (0..spec.features).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let bias: f32 = rng.gen_range(-1.0..1.0);

        let partitions = (0..num_clients)
            .map(|_| {
                let size = if uniform { UNIFORM_PARTITION } else { rng.gen_range(SKEWED_MIN..=SKEWED_MAX) };
                let mut samples: Vec<Sample> = (0..size)
                    .map(|_| {
                        let features: Vec<f32> = (0..spec.features).map(|_| rng.gen_range(-1.0..1.0)).collect();
                        let clean: f32 = features.iter().zip(&truth).map(|(x, w)| x * w).sum::<f32>() + bias;
                        Sample { features, target: clean + rng.gen_range(-NOISE..NOISE) }
                    })
                    .collect();
                samples.shuffle(&mut rng);
                let val_len = (size / 10).max(1);
                let val = samples.split_off(size - val_len);
                ClientPartition { train: samples, val }
            })
            .collect();

        Self { features: spec.features, partitions }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, client: ClientId) -> Option<&ClientPartition> {
        self.partitions.get(client.index())
    }

    /// Training-set sizes in client order, used as sampling weights.
    pub fn train_sizes(&self) -> Vec<f64> {
        self.partitions.iter().map(|p| p.train.len() as f64).collect()
    }
}
