//! Wires the command line arguments to the loader, model and generation loop.

use crate::checkpoint::CheckpointBundle;
use crate::cli::InferenceArgs;
use crate::dataset::{BatchLoader, SkillTextDataset};
use crate::model;
use crate::naming::{output_dir_name, run_name};
use crate::pipeline::{prepare_output_dir, run_generation, InferenceContext, RunManifest};
use crate::tokenizer::TextTokenizer;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Application for generating one image per caption of a skill split.
pub struct InferenceApp {
    args: InferenceArgs,
    run_name: String,
    context: InferenceContext,
    dataset: Arc<SkillTextDataset>,
}

impl InferenceApp {
    /// Load the checkpoint, the VAE, the tokenizer and the dataset.
    pub fn new(args: InferenceArgs) -> Result<Self> {
        // Resolved first so an unrecognised checkpoint name fails before any loading.
        let run_name = run_name(&args.dalle_path.to_string_lossy())?;

        let bundle = CheckpointBundle::load(&args.dalle_path)?;
        let (hparams, vae_params, weights) = bundle.into_parts();
        info!(%vae_params, tensors = weights.len(), "loaded checkpoint");
        let dalle = model::assemble(hparams, weights, &args.vae_path, &args.vae_config)?;

        let tokenizer = TextTokenizer::from_file(&args.bpe_path)?;
        info!(vocab = tokenizer.vocab_size(), "loaded tokenizer");
        let dataset = Arc::new(SkillTextDataset::open(args.dataset_config(), tokenizer)?);

        let output_dir = args
            .image_dump_dir
            .join(output_dir_name(&args.skill_name, &run_name, &args.split));
        let context = InferenceContext {
            dalle,
            sampling: args.sampling(),
            output_dir,
            seed: args.seed,
        };
        Ok(Self { args, run_name, context, dataset })
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn output_dir(&self) -> &std::path::Path {
        &self.context.output_dir
    }

    /// Generate every image, then write the run manifest. Returns the image count.
    pub fn run(&self) -> Result<usize> {
        prepare_output_dir(&self.context.output_dir)?;
        info!("Dump images in {}", self.context.output_dir.display());

        let started_at = Utc::now();
        let loader = BatchLoader::new(
            Arc::clone(&self.dataset),
            self.args.batch_size,
            self.args.num_workers,
        )?;
        let images = run_generation(&self.context, loader, &self.args.progress_desc())?;

        RunManifest {
            checkpoint: self.args.dalle_path.display().to_string(),
            run_name: self.run_name.clone(),
            images,
            filter_thres: self.context.sampling.filter_thres,
            temperature: self.context.sampling.temperature,
            seed: self.context.seed,
            started_at,
            finished_at: Utc::now(),
        }
        .write(&self.context.output_dir)?;
        Ok(images)
    }
}
