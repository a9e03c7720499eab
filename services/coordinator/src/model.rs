//! Single linear layer regressor trained with mini-batch SGD.

use anyhow::{anyhow, ensure, Result};
use rand::seq::SliceRandom;
use rand::Rng;

use fedsim_core::{FitConfig, Parameters, Tensor};

use crate::dataset::Sample;

pub const WEIGHT: &str = "fc.weight";
pub const BIAS: &str = "fc.bias";

/// Flat parameters of `fc`: weight `[1, features]` and bias `[1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub weight: Vec<f32>,
    pub bias: f32,
}

impl LinearModel {
    pub fn zeros(features: usize) -> Self {
        Self { weight: vec![0.0; features], bias: 0.0 }
    }

    pub fn initial_parameters(features: usize) -> Parameters {
        Self::zeros(features).to_parameters()
    }

    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let weight = params.get(WEIGHT).ok_or_else(|| anyhow!("missing `{WEIGHT}`"))?;
        let bias = params.get(BIAS).ok_or_else(|| anyhow!("missing `{BIAS}`"))?;
        ensure!(weight.dims.len() == 2 && weight.dims[0] == 1, "`{WEIGHT}` must be [1, d], got {:?}", weight.dims);
        ensure!(weight.values.len() == weight.dims[1], "`{WEIGHT}` storage does not match {:?}", weight.dims);
        ensure!(bias.dims == [1] && bias.values.len() == 1, "`{BIAS}` must be [1], got {:?}", bias.dims);
        Ok(Self { weight: weight.values.clone(), bias: bias.values[0] })
    }

    pub fn to_parameters(&self) -> Parameters {
        Parameters::new()
            .with(WEIGHT, Tensor::new(vec![1, self.weight.len()], self.weight.clone()))
            .with(BIAS, Tensor::new(vec![1], vec![self.bias]))
    }

    pub fn predict(&self, features: &[f32]) -> f32 {
        self.weight.iter().zip(features).map(|(w, x)| w * x).sum::<f32>() + self.bias
    }

    /// Runs `local_epochs` of shuffled mini-batch SGD with momentum on the
    /// squared error. Returns the mean loss seen during the last epoch.
    pub fn train(&mut self, data: &[Sample], config: &FitConfig, rng: &mut impl Rng) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let lr = config.learning_rate as f32;
        let momentum = config.momentum as f32;
        let batch = config.batch_size.max(1);
        let mut velocity_w = vec![0.0f32; self.weight.len()];
        let mut velocity_b = 0.0f32;
        let mut order: Vec<usize> = (0..data.len()).collect();
        let mut epoch_loss = 0.0f64;

        for _ in 0..config.local_epochs {
            order.shuffle(rng);
            epoch_loss = 0.0;
            for chunk in order.chunks(batch) {
                let mut grad_w = vec![0.0f32; self.weight.len()];
                let mut grad_b = 0.0f32;
                for &i in chunk {
                    let sample = &data[i];
                    let err = self.predict(&sample.features) - sample.target;
                    epoch_loss += f64::from(err * err);
                    for (g, x) in grad_w.iter_mut().zip(&sample.features) {
                        *g += 2.0 * err * x;
                    }
                    grad_b += 2.0 * err;
                }
                let scale = 1.0 / chunk.len() as f32;
                for ((w, v), g) in self.weight.iter_mut().zip(velocity_w.iter_mut()).zip(&grad_w) {
                    *v = momentum * *v + g * scale;
                    *w -= lr * *v;
                }
                velocity_b = momentum * velocity_b + grad_b * scale;
                self.bias -= lr * velocity_b;
            }
        }
        epoch_loss / data.len() as f64
    }

    /// `(total squared error, mean squared error)` over `data`.
    pub fn evaluate(&self, data: &[Sample]) -> (f64, f64) {
        let total: f64 = data
            .iter()
            .map(|s| {
                let err = f64::from(self.predict(&s.features) - s.target);
                err * err
            })
            .sum();
        let mean = if data.is_empty() { 0.0 } else { total / data.len() as f64 };
        (total, mean)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn line(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let x = i as f32 / n as f32 * 2.0 - 1.0;
                Sample { features: vec![x], target: 3.0 * x + 0.5 }
            })
            .collect()
    }

    fn config(lr: f64, epochs: u32) -> FitConfig {
        FitConfig { round_index: 0, learning_rate: lr, momentum: 0.9, local_epochs: epochs, batch_size: 8 }
    }

    #[test]
    fn parameters_keep_fc_layout() {
        let model = LinearModel { weight: vec![1.0, 2.0], bias: 3.0 };
        let params = model.to_parameters();
        assert_eq!(params.names().collect::<Vec<_>>(), vec![WEIGHT, BIAS]);
        assert_eq!(params.get(WEIGHT).unwrap().dims, vec![1, 2]);
        assert_eq!(LinearModel::from_parameters(&params).unwrap(), model);
    }

    #[test]
    fn rejects_foreign_layouts() {
        let params = Parameters::new().with(WEIGHT, Tensor::zeros(vec![2, 2])).with(BIAS, Tensor::zeros(vec![1]));
        assert!(LinearModel::from_parameters(&params).is_err());
        assert!(LinearModel::from_parameters(&Parameters::new()).is_err());
    }

    #[test]
    fn sgd_fits_a_line() {
        let data = line(64);
        let mut model = LinearModel::zeros(1);
        let (_, before) = model.evaluate(&data);
        let mut rng = StdRng::seed_from_u64(1);
        model.train(&data, &config(0.05, 30), &mut rng);
        let (total, after) = model.evaluate(&data);
        assert!(after < before / 100.0, "{before} -> {after}");
        assert!((total - after * 64.0).abs() < 1e-9);
        assert!((model.weight[0] - 3.0).abs() < 0.1);
        assert!((model.bias - 0.5).abs() < 0.1);
    }

    #[test]
    fn empty_data_leaves_model_untouched() {
        let mut model = LinearModel::zeros(3);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(model.train(&[], &config(0.1, 2), &mut rng), 0.0);
        assert_eq!(model, LinearModel::zeros(3));
        assert_eq!(model.evaluate(&[]), (0.0, 0.0));
    }
}
