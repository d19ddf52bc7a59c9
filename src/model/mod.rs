//! Inference-only DALLE transformer and VQGAN decoder on ndarray.

pub mod dalle;
pub mod layers;
pub mod vqgan;

pub use dalle::{Dalle, DalleParams, SamplingConfig};
pub use vqgan::{VqGanParams, VqGanVae};

use crate::weights::WeightMap;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::info;

/// Build the VAE from its own files, then the transformer from the
/// checkpoint hyperparameters and weight state.
pub fn assemble(
    hparams: Map<String, Value>,
    weights: WeightMap,
    vae_path: &Path,
    vae_config: &Path,
) -> Result<Dalle> {
    let vae = VqGanVae::load(vae_path, vae_config)?;
    let params = DalleParams::from_hparams(hparams)?;
    info!(?params, "building DALLE");
    Dalle::from_weights(params, vae, weights).context("loading DALLE weight state")
}
