mod common;

use serde_json::{json, Value};
use skill_dalle::checkpoint::{load_weights, save_weights, CheckpointBundle};
use std::collections::HashMap;
use tempfile::tempdir;

#[test]
fn bundle_round_trips_through_safetensors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("DALLE_CC_object.safetensors");
    let weights = common::dalle_weights();
    CheckpointBundle {
        hparams: common::hparams(),
        vae_params: json!({"image_size": 8}),
        weights: weights.clone(),
    }
    .save(&path)
    .unwrap();

    let (hparams, vae_params, loaded) = CheckpointBundle::load(&path).unwrap().into_parts();
    assert!(!hparams.contains_key("vae"));
    assert_eq!(hparams["dim"], json!(16));
    assert_eq!(vae_params, json!({"image_size": 8}));
    assert_eq!(loaded.len(), weights.len());
    assert_eq!(
        loaded.get("text_emb.weight").unwrap(),
        weights.get("text_emb.weight").unwrap()
    );
}

#[test]
fn loading_twice_gives_the_same_bundle() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scratch.safetensors");
    CheckpointBundle {
        hparams: common::hparams(),
        vae_params: Value::Null,
        weights: common::dalle_weights(),
    }
    .save(&path)
    .unwrap();

    let first = CheckpointBundle::load(&path).unwrap();
    let second = CheckpointBundle::load(&path).unwrap();
    assert_eq!(first.hparams, second.hparams);
    assert_eq!(first.weights.names(), second.weights.names());
}

#[test]
fn missing_hparams_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("weights_only.safetensors");
    save_weights(&common::vae_weights(), None, &path).unwrap();

    let err = CheckpointBundle::load(&path).unwrap_err().to_string();
    assert!(err.contains("hparams"), "{err}");
    // a plain weight file is still readable on its own
    assert!(!load_weights(&path).unwrap().is_empty());
}

#[test]
fn hparams_must_be_an_object() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.safetensors");
    let mut metadata = HashMap::new();
    metadata.insert("hparams".to_string(), "[1, 2]".to_string());
    metadata.insert("vae_params".to_string(), "null".to_string());
    save_weights(&common::vae_weights(), Some(metadata), &path).unwrap();
    assert!(CheckpointBundle::load(&path).is_err());
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    let err = CheckpointBundle::load(&dir.path().join("nope.safetensors"))
        .unwrap_err()
        .to_string();
    assert!(err.contains("nope.safetensors"), "{err}");
}
