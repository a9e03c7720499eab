//! In-process client population backed by the synthetic partitions.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use fedsim_core::{
    ClientEvalResult, ClientFailure, ClientFitResult, ClientId, ClientOutcome, ClientRunner, EvaluateConfig, FitConfig,
    GlobalModelState, Metrics,
};

use crate::dataset::SyntheticDataset;
use crate::model::LinearModel;

pub struct SimulatedClientRunner {
    dataset: Arc<SyntheticDataset>,
    seed: u64,
}

impl SimulatedClientRunner {
    pub fn new(dataset: Arc<SyntheticDataset>, seed: u64) -> Self {
        Self { dataset, seed }
    }

    fn local_model(client: ClientId, model: &GlobalModelState) -> ClientOutcome<LinearModel> {
        LinearModel::from_parameters(&model.parameters).map_err(|e| ClientFailure::runner(client, format!("{e:#}")))
    }
}

/// Training is CPU bound, so it runs on the blocking pool.
async fn blocking<T, F>(client: ClientId, work: F) -> ClientOutcome<T>
where
    T: Send + 'static,
    F: FnOnce() -> ClientOutcome<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .unwrap_or_else(|e| Err(ClientFailure::runner(client, format!("local task failed: {e}"))))
}

#[async_trait]
impl ClientRunner for SimulatedClientRunner {
    async fn fit(&self, client: ClientId, model: Arc<GlobalModelState>, config: FitConfig) -> ClientOutcome<ClientFitResult> {
        let dataset = Arc::clone(&self.dataset);
        let seed = self.seed ^ (u64::from(client.0) << 32) ^ config.round_index;
        blocking(client, move || {
            let partition = dataset.partition(client).ok_or_else(|| ClientFailure::runner(client, "no local partition"))?;
            let mut local = Self::local_model(client, &model)?;
            let mut rng = StdRng::seed_from_u64(seed);
            let train_loss = local.train(&partition.train, &config, &mut rng);
            debug!(client = %client, round = config.round_index, train_loss, "local fit done");
            Ok(ClientFitResult {
                client_id: client,
                parameters: local.to_parameters(),
                num_examples: partition.train.len() as u64,
                metrics: Metrics::from([("train_loss".to_string(), train_loss)]),
            })
        })
        .await
    }

    async fn evaluate(&self, client: ClientId, model: Arc<GlobalModelState>, config: EvaluateConfig) -> ClientOutcome<ClientEvalResult> {
        let dataset = Arc::clone(&self.dataset);
        blocking(client, move || {
            let partition = dataset.partition(client).ok_or_else(|| ClientFailure::runner(client, "no local partition"))?;
            let local = Self::local_model(client, &model)?;
            let (total, mean) = local.evaluate(&partition.val);
            debug!(client = %client, round = config.round_index, mean_loss = mean, "local evaluate done");
            Ok(ClientEvalResult {
                client_id: client,
                loss: total,
                num_examples: partition.val.len() as u64,
                metrics: Metrics::from([("mean_loss".to_string(), mean)]),
            })
        })
        .await
    }
}
