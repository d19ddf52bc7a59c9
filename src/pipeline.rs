//! The generation loop: batches in, PNG files out.

use crate::dataset::{BatchLoader, ExampleId};
use crate::model::{Dalle, SamplingConfig};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "run_manifest.json";

/// Everything the generation loop needs, passed explicitly.
pub struct InferenceContext {
    pub dalle: Dalle,
    pub sampling: SamplingConfig,
    pub output_dir: PathBuf,
    pub seed: Option<u64>,
}

/// Record of a finished run, written next to the images.
#[derive(Debug, Serialize)]
pub struct RunManifest {
    pub checkpoint: String,
    pub run_name: String,
    pub images: usize,
    pub filter_thres: f64,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunManifest {
    pub fn write(&self, output_dir: &Path) -> Result<()> {
        let path = output_dir.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("cannot write {}", path.display()))
    }
}

/// Create the output directory unless it already exists. A file at that
/// path is an error.
pub fn prepare_output_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        bail!("output path {} exists and is not a directory", path.display());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("cannot create output directory {}", path.display()))
}

/// Convert a `[channels, height, width]` tensor in `[0, 1]` to an 8-bit
/// image. Values are scaled by 255 and truncated.
pub fn tensor_to_image(tensor: &Array3<f32>) -> Result<DynamicImage> {
    let (c, h, w) = tensor.dim();
    let mut pixels = Vec::with_capacity(c * h * w);
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                pixels.push((tensor[[ch, y, x]] * 255.0) as u8);
            }
        }
    }
    let (w, h) = (w as u32, h as u32);
    let image = match c {
        1 => GrayImage::from_raw(w, h, pixels).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgba8),
        _ => bail!("cannot save an image with {c} channels"),
    };
    image.with_context(|| format!("pixel buffer does not match {w}x{h}x{c}"))
}

pub fn save_image(tensor: &Array3<f32>, path: &Path) -> Result<()> {
    tensor_to_image(tensor)?
        .save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("cannot write {}", path.display()))
}

pub fn image_path(output_dir: &Path, id: &ExampleId) -> PathBuf {
    output_dir.join(format!("{id}.png"))
}

/// Generate and save an image for every example the loader yields.
/// Returns the number of images written. The first error stops the run.
pub fn run_generation(ctx: &InferenceContext, loader: BatchLoader, desc: &str) -> Result<usize> {
    let mut rng = match ctx.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let progress = ProgressBar::new(loader.num_batches() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{msg}: {percent}%|{bar:40}| {pos}/{len} [{elapsed_precise}<{eta_precise}]")?
            .progress_chars("##-"),
    );
    progress.set_message(desc.to_string());

    let mut written = 0;
    for batch in loader {
        let batch = batch?;
        let images = ctx
            .dalle
            .generate_images(&batch.tokenized_text, &ctx.sampling, &mut rng)?;
        for (id, image) in batch.ids.iter().zip(&images) {
            let path = image_path(&ctx.output_dir, id);
            save_image(image, &path)?;
            debug!(path = %path.display(), "saved image");
        }
        written += images.len();
        progress.inc(1);
    }
    progress.finish();
    info!(images = written, dir = %ctx.output_dir.display(), "generation finished");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_values_are_scaled_and_truncated() {
        let mut t = Array3::<f32>::zeros((3, 1, 2));
        t[[0, 0, 0]] = 1.0;
        t[[1, 0, 0]] = 0.5;
        t[[2, 0, 1]] = 0.999;
        let img = tensor_to_image(&t).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(0, 0).0, [255, 127, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [0, 0, 254]);
    }

    #[test]
    fn two_channel_images_are_rejected() {
        assert!(tensor_to_image(&Array3::zeros((2, 4, 4))).is_err());
    }

    #[test]
    fn output_dir_conflicts_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("taken");
        std::fs::write(&file, b"x").unwrap();
        assert!(prepare_output_dir(&file).is_err());

        let nested = dir.path().join("a/b");
        prepare_output_dir(&nested).unwrap();
        assert!(nested.is_dir());
        prepare_output_dir(&nested).unwrap();
    }

    #[test]
    fn image_path_uses_id_as_stem() {
        let p = image_path(Path::new("/out"), &ExampleId::Int(12));
        assert_eq!(p, Path::new("/out/12.png"));
    }
}
