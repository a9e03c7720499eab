use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use fedsim_core::{init_tracing, ExperimentConfig};

mod dataset;
mod federation;
mod model;
mod runner;

const HISTORY_OUT_ENV: &str = "FEDSIM_HISTORY_OUT";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("fedsim-coordinator")?;

    let path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = ExperimentConfig::load(path.as_deref()).context("loading experiment config")?;
    info!(?cfg, "config_loaded");

    let module = federation::FederationModule::new(&cfg)?;
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable, running to completion");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };
    let report = module.run_until(shutdown).await?;

    if let Some((round, loss)) = report.loss_curve().last() {
        info!(round, loss, "final evaluate loss");
    }
    if let Ok(out) = std::env::var(HISTORY_OUT_ENV) {
        let json = serde_json::to_vec_pretty(&report)?;
        std::fs::write(&out, json).with_context(|| format!("writing run report to {out}"))?;
        info!(path = %out, "run report written");
    }
    info!(termination = ?report.termination, "shutdown");
    Ok(())
}
