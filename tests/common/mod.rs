#![allow(dead_code)]

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use skill_dalle::checkpoint::{save_weights, CheckpointBundle};
use skill_dalle::model::{DalleParams, VqGanParams};
use skill_dalle::weights::WeightMap;
use std::path::{Path, PathBuf};

pub const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {"[UNK]": 1, "a": 2, "red": 3, "blue": 4, "cube": 5, "sphere": 6, "two": 7},
        "unk_token": "[UNK]"
    }
}"#;

pub fn vae_config() -> Value {
    json!({
        "model": {
            "params": {
                "embed_dim": 4,
                "n_embed": 16,
                "ddconfig": {
                    "double_z": false,
                    "z_channels": 4,
                    "resolution": 8,
                    "in_channels": 3,
                    "out_ch": 3,
                    "ch": 32,
                    "ch_mult": [1, 1],
                    "num_res_blocks": 1,
                    "attn_resolutions": [4],
                    "dropout": 0.0
                }
            }
        }
    })
}

pub fn vae_params() -> VqGanParams {
    serde_json::from_value(vae_config()["model"]["params"].clone()).unwrap()
}

pub fn hparams() -> Map<String, Value> {
    match json!({
        "dim": 16,
        "depth": 2,
        "heads": 2,
        "dim_head": 8,
        "num_text_tokens": 10,
        "text_seq_len": 6,
        "ff_mult": 2,
        "attn_types": ["full"],
        "reversible": false,
        "vae": "VQGanVAE"
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

pub fn dalle_params() -> DalleParams {
    let mut h = hparams();
    h.remove("vae");
    DalleParams::from_hparams(h).unwrap()
}

/// Uniform random tensors for every listed parameter.
pub fn random_weights(shapes: &[(String, Vec<usize>)], seed: u64) -> WeightMap {
    let mut rng = StdRng::seed_from_u64(seed);
    shapes
        .iter()
        .map(|(name, shape)| {
            let t = ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-0.1..0.1));
            (name.clone(), t)
        })
        .collect()
}

pub fn vae_weights() -> WeightMap {
    random_weights(&vae_params().parameter_shapes(), 1)
}

pub fn dalle_weights() -> WeightMap {
    let vae = vae_params();
    random_weights(&dalle_params().parameter_shapes(vae.n_embed, vae.fmap_size()), 2)
}

pub struct Fixture {
    pub checkpoint: PathBuf,
    pub vae_path: PathBuf,
    pub vae_config: PathBuf,
    pub bpe_path: PathBuf,
    pub dataset_dir: PathBuf,
    pub dump_dir: PathBuf,
}

/// Write a complete tiny setup under `root`: checkpoint named `ckpt_name`,
/// VQGAN files, tokenizer and an `object` skill with `captions`.
pub fn write_fixture(root: &Path, ckpt_name: &str, captions: &[(Value, &str)]) -> Fixture {
    let checkpoint = root.join(ckpt_name);
    CheckpointBundle {
        hparams: hparams(),
        vae_params: Value::Null,
        weights: dalle_weights(),
    }
    .save(&checkpoint)
    .unwrap();

    let vae_path = root.join("vqgan.safetensors");
    let mut vae = vae_weights();
    vae.insert("encoder.conv_in.weight", ArrayD::zeros(IxDyn(&[32, 3, 3, 3])));
    save_weights(&vae, None, &vae_path).unwrap();
    let vae_config = root.join("vqgan.config.json");
    std::fs::write(&vae_config, vae_config_string()).unwrap();

    let bpe_path = root.join("tokenizer.json");
    std::fs::write(&bpe_path, TOKENIZER_JSON).unwrap();

    let dataset_dir = root.join("PaintSkills");
    let scenes = dataset_dir.join("object").join("scenes");
    std::fs::create_dir_all(&scenes).unwrap();
    let data: Vec<Value> = captions
        .iter()
        .map(|(id, text)| json!({"id": id, "text": text, "objects": []}))
        .collect();
    std::fs::write(scenes.join("object_val.json"), json!({ "data": data }).to_string()).unwrap();

    Fixture {
        checkpoint,
        vae_path,
        vae_config,
        bpe_path,
        dataset_dir,
        dump_dir: root.join("dump"),
    }
}

fn vae_config_string() -> String {
    serde_json::to_string_pretty(&vae_config()).unwrap()
}
