use crate::dataset::DatasetConfig;
use crate::model::SamplingConfig;
use clap::Parser;
use std::path::PathBuf;

/// Generate images for a PaintSkills split with a trained DALLE checkpoint.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct InferenceArgs {
    /// Checkpoint bundle (safetensors with hparams/vae_params metadata)
    #[arg(long = "dalle_path", default_value = "./DALLE_CC_object.safetensors")]
    pub dalle_path: PathBuf,

    #[arg(long = "dataset_dir", default_value = "./datasets/PaintSkills")]
    pub dataset_dir: PathBuf,

    /// Scene file name under `<dataset_dir>/<skill_name>/scenes`
    #[arg(long = "text_file", default_value = "object_val.json")]
    pub text_file: String,

    #[arg(long = "skill_name", default_value = "object")]
    pub skill_name: String,

    #[arg(long, default_value = "val")]
    pub split: String,

    /// Root under which the per-run output directory is created
    #[arg(long = "image_dump_dir", default_value = "./datasets/PaintSkills/DALLE_inference")]
    pub image_dump_dir: PathBuf,

    #[arg(long = "batch_size", default_value_t = 20)]
    pub batch_size: usize,

    /// Text sequence length
    #[arg(long = "text_seq_len", default_value_t = 128)]
    pub text_seq_len: usize,

    /// Random resized crop lower ratio
    #[arg(long = "random_resize_crop_lower_ratio", default_value_t = 0.75)]
    pub resize_ratio: f32,

    /// Captions passed in which exceed the max token length will be truncated if this is set.
    #[arg(long = "truncate_captions")]
    pub truncate_captions: bool,

    /// VQGAN weights (safetensors)
    #[arg(long = "vae_path", default_value = "./vqgan.1024.model.safetensors")]
    pub vae_path: PathBuf,

    /// VQGAN config (JSON)
    #[arg(long = "vae_config", default_value = "./vqgan.1024.config.json")]
    pub vae_config: PathBuf,

    /// Caption tokenizer (tokenizer.json)
    #[arg(long = "bpe_path", default_value = "./bpe_simple_vocab.tokenizer.json")]
    pub bpe_path: PathBuf,

    /// Batches prepared ahead of generation; 0 loads inline
    #[arg(long = "num_workers", default_value_t = 4)]
    pub num_workers: usize,

    /// Fraction of logits filtered out before sampling
    #[arg(long = "filter_thres", default_value_t = 0.9, value_parser = parse_unit_interval)]
    pub filter_thres: f64,

    #[arg(long, default_value_t = 1.0, value_parser = parse_positive)]
    pub temperature: f32,

    /// Seed for reproducible sampling
    #[arg(long)]
    pub seed: Option<u64>,
}

fn parse_unit_interval(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..1.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("{v} is not in [0, 1)"))
    }
}

fn parse_positive(s: &str) -> Result<f32, String> {
    let v: f32 = s.parse().map_err(|e| format!("{e}"))?;
    if v > 0.0 {
        Ok(v)
    } else {
        Err(format!("{v} must be greater than 0"))
    }
}

impl InferenceArgs {
    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            text_len: self.text_seq_len,
            resize_ratio: self.resize_ratio,
            truncate_captions: self.truncate_captions,
            ..DatasetConfig::for_skill(&self.dataset_dir, &self.skill_name, &self.split, &self.text_file)
        }
    }

    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig { filter_thres: self.filter_thres, temperature: self.temperature }
    }

    /// Progress label: `<dalle_path>-<skill_name>-<split>`.
    pub fn progress_desc(&self) -> String {
        format!("{}-{}-{}", self.dalle_path.display(), self.skill_name, self.split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_script() {
        let args = InferenceArgs::try_parse_from(["inference_skill_dalle"]).unwrap();
        assert_eq!(args.batch_size, 20);
        assert_eq!(args.text_seq_len, 128);
        assert_eq!(args.resize_ratio, 0.75);
        assert!(!args.truncate_captions);
        assert_eq!(args.filter_thres, 0.9);
        assert_eq!(args.split, "val");
    }

    #[test]
    fn underscore_flags_parse() {
        let args = InferenceArgs::try_parse_from([
            "inference_skill_dalle",
            "--dalle_path",
            "ckpt/CC_auxLR.safetensors",
            "--skill_name",
            "count",
            "--batch_size",
            "4",
            "--random_resize_crop_lower_ratio",
            "0.5",
            "--truncate_captions",
        ])
        .unwrap();
        assert_eq!(args.skill_name, "count");
        assert_eq!(args.batch_size, 4);
        assert_eq!(args.resize_ratio, 0.5);
        assert!(args.truncate_captions);
        assert_eq!(args.progress_desc(), "ckpt/CC_auxLR.safetensors-count-val");

        let cfg = args.dataset_config();
        assert_eq!(cfg.text_len, 128);
        assert!(cfg.truncate_captions);
        assert!(cfg.text_data_file.ends_with("count/scenes/object_val.json"));
    }

    #[test]
    fn bad_sampling_values_are_rejected() {
        assert!(InferenceArgs::try_parse_from(["x", "--filter_thres", "1.0"]).is_err());
        assert!(InferenceArgs::try_parse_from(["x", "--temperature", "0"]).is_err());
    }
}
