//! Checkpoint bundles stored as safetensors files.
//!
//! A bundle keeps the DALLE hyperparameters and the VAE parameters as JSON
//! strings in the safetensors `__metadata__` map (keys `hparams` and
//! `vae_params`); every tensor in the file is part of the weight state.
//! Transformer tensors use the flat names listed by
//! `DalleParams::parameter_shapes`; DALLE-pytorch's `to_logits.0`/`to_logits.1`
//! head and 4-d axial embeddings are also accepted as saved.

use crate::weights::WeightMap;
use anyhow::{anyhow, bail, Context, Result};
use memmap2::MmapOptions;
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

pub const HPARAMS_KEY: &str = "hparams";
pub const VAE_PARAMS_KEY: &str = "vae_params";

/// A loaded checkpoint: hyperparameters, VAE parameters and weights.
#[derive(Debug, Clone)]
pub struct CheckpointBundle {
    pub hparams: Map<String, Value>,
    pub vae_params: Value,
    pub weights: WeightMap,
}

impl CheckpointBundle {
    /// Read a bundle from disk. The file is memory mapped while tensors are copied out.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("cannot open checkpoint {}", path.display()))?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let bytes = &mmap[..];

        let (_, header) = SafeTensors::read_metadata(bytes)
            .with_context(|| format!("{} is not a safetensors file", path.display()))?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let hparams = match parse_metadata_json(&metadata, HPARAMS_KEY)? {
            Value::Object(map) => map,
            other => bail!("'{HPARAMS_KEY}' must be a JSON object, found {other}"),
        };
        let vae_params = parse_metadata_json(&metadata, VAE_PARAMS_KEY)?;
        let weights = read_weights(bytes)
            .with_context(|| format!("reading tensors from {}", path.display()))?;

        Ok(Self { hparams, vae_params, weights })
    }

    /// Split the bundle into its parts. The `vae` entry some trainers leave
    /// inside the hyperparameters is dropped.
    pub fn into_parts(self) -> (Map<String, Value>, Value, WeightMap) {
        let mut hparams = self.hparams;
        hparams.remove("vae");
        (hparams, self.vae_params, self.weights)
    }

    /// Write the bundle in the same layout `load` reads.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert(
            HPARAMS_KEY.to_string(),
            serde_json::to_string(&self.hparams)?,
        );
        metadata.insert(
            VAE_PARAMS_KEY.to_string(),
            serde_json::to_string(&self.vae_params)?,
        );
        save_weights(&self.weights, Some(metadata), path)
    }
}

fn parse_metadata_json(metadata: &HashMap<String, String>, key: &str) -> Result<Value> {
    let raw = metadata
        .get(key)
        .ok_or_else(|| anyhow!("checkpoint has no '{key}' entry"))?;
    serde_json::from_str(raw).with_context(|| format!("'{key}' is not valid JSON"))
}

/// Copy every tensor of a safetensors buffer into a [`WeightMap`].
pub fn read_weights(bytes: &[u8]) -> Result<WeightMap> {
    let tensors = SafeTensors::deserialize(bytes)?;
    let mut weights = WeightMap::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            bail!("tensor '{name}' has dtype {:?}, only F32 is supported", view.dtype());
        }
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), data)
            .with_context(|| format!("tensor '{name}' data does not match its shape"))?;
        weights.insert(name, tensor);
    }
    Ok(weights)
}

/// Memory map a plain safetensors weight file.
pub fn load_weights(path: &Path) -> Result<WeightMap> {
    let file = File::open(path)
        .with_context(|| format!("cannot open weights {}", path.display()))?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    read_weights(&mmap[..]).with_context(|| format!("reading tensors from {}", path.display()))
}

/// Write weights (and optional string metadata) as a safetensors file.
pub fn save_weights(
    weights: &WeightMap,
    metadata: Option<HashMap<String, String>>,
    path: &Path,
) -> Result<()> {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = weights
        .names()
        .into_iter()
        .filter_map(|name| weights.get(name).map(|t| (name, t)))
        .map(|(name, t)| {
            let data: Vec<f32> = t.iter().copied().collect();
            (name.to_string(), t.shape().to_vec(), bytemuck::cast_slice(&data).to_vec())
        })
        .collect();

    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, data) in &buffers {
        views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), data)?));
    }
    let bytes = safetensors::serialize(views, &metadata)?;
    std::fs::write(path, bytes)
        .with_context(|| format!("cannot write {}", path.display()))
}
