//! Captioned skill dataset and the batch loader that feeds generation.
//!
//! Scenes live in `<dataset_dir>/<skill_name>/scenes/<text_file>` as a JSON
//! object with a `data` array of `{ "id", "text" }` entries. Only captions
//! are loaded; the image directory is kept for reference.

use crate::tokenizer::TextTokenizer;
use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array2;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Example identifier; scene files use either strings or integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub enum ExampleId {
    Int(i64),
    Str(String),
}

impl fmt::Display for ExampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExampleId::Int(v) => write!(f, "{v}"),
            ExampleId::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneEntry {
    pub id: ExampleId,
    pub text: String,
}

#[derive(Deserialize)]
struct SceneFile {
    data: Vec<SceneEntry>,
}

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub skill_name: String,
    pub split: String,
    pub image_dir: PathBuf,
    pub text_data_file: PathBuf,
    pub text_len: usize,
    pub resize_ratio: f32,
    pub truncate_captions: bool,
}

impl DatasetConfig {
    /// Standard PaintSkills layout under `dataset_dir`.
    pub fn for_skill(dataset_dir: &Path, skill_name: &str, split: &str, text_file: &str) -> Self {
        let skill_dir = dataset_dir.join(skill_name);
        Self {
            skill_name: skill_name.to_string(),
            split: split.to_string(),
            image_dir: skill_dir.join("images"),
            text_data_file: skill_dir.join("scenes").join(text_file),
            text_len: 128,
            resize_ratio: 0.75,
            truncate_captions: false,
        }
    }
}

/// Captions of one skill split, tokenized on access.
pub struct SkillTextDataset {
    config: DatasetConfig,
    entries: Vec<SceneEntry>,
    tokenizer: TextTokenizer,
}

impl SkillTextDataset {
    pub fn open(config: DatasetConfig, tokenizer: TextTokenizer) -> Result<Self> {
        let raw = std::fs::read_to_string(&config.text_data_file).with_context(|| {
            format!("cannot read scene file {}", config.text_data_file.display())
        })?;
        let scenes: SceneFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid scene file {}", config.text_data_file.display()))?;
        Self::from_entries(config, scenes.data, tokenizer)
    }

    /// Ids become file names, so their rendered names must be unique and
    /// free of path separators. `2` and `"2"` collide.
    pub fn from_entries(
        config: DatasetConfig,
        entries: Vec<SceneEntry>,
        tokenizer: TextTokenizer,
    ) -> Result<Self> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            let name = entry.id.to_string();
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                bail!("example id {name:?} cannot be used as a file name");
            }
            if seen.contains(&name) {
                bail!("duplicate example id {name:?}");
            }
            seen.insert(name);
        }
        info!(
            skill = %config.skill_name,
            split = %config.split,
            examples = entries.len(),
            "loaded captions"
        );
        Ok(Self { config, entries, tokenizer })
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The id and fixed-length token ids of entry `index`.
    pub fn get(&self, index: usize) -> Result<(ExampleId, Vec<usize>)> {
        let entry = &self.entries[index];
        let tokens = self
            .tokenizer
            .tokenize(&entry.text, self.config.text_len, self.config.truncate_captions)
            .with_context(|| format!("example {}", entry.id))?;
        Ok((entry.id.clone(), tokens))
    }
}

/// A `batch x text_len` token matrix and the ids of its rows, in order.
#[derive(Debug, Clone)]
pub struct TextBatch {
    pub tokenized_text: Array2<usize>,
    pub ids: Vec<ExampleId>,
}

/// Stack fixed-length samples into a batch.
pub fn collate(items: Vec<(ExampleId, Vec<usize>)>) -> Result<TextBatch> {
    let width = items.first().map_or(0, |(_, t)| t.len());
    let mut ids = Vec::with_capacity(items.len());
    let mut flat = Vec::with_capacity(items.len() * width);
    for (id, tokens) in items {
        if tokens.len() != width {
            bail!("example {id} has {} tokens, expected {width}", tokens.len());
        }
        flat.extend(tokens);
        ids.push(id);
    }
    let tokenized_text = Array2::from_shape_vec((ids.len(), width), flat)?;
    Ok(TextBatch { tokenized_text, ids })
}

fn load_batch(dataset: &SkillTextDataset, start: usize, batch_size: usize) -> Result<TextBatch> {
    let end = (start + batch_size).min(dataset.len());
    let items = (start..end).map(|i| dataset.get(i)).collect::<Result<Vec<_>>>()?;
    collate(items)
}

/// Iterates a dataset in order, in batches of `batch_size` (the last one may
/// be shorter). With `num_workers > 0` batches are prepared on a background
/// thread, at most `num_workers` ahead of the consumer.
pub struct BatchLoader {
    dataset: Arc<SkillTextDataset>,
    batch_size: usize,
    next_start: usize,
    prefetch: Option<Receiver<Result<TextBatch>>>,
    worker: Option<JoinHandle<()>>,
}

impl BatchLoader {
    pub fn new(dataset: Arc<SkillTextDataset>, batch_size: usize, num_workers: usize) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        let (prefetch, worker) = if num_workers > 0 {
            let (tx, rx) = sync_channel(num_workers);
            let ds = Arc::clone(&dataset);
            let handle = std::thread::Builder::new()
                .name("batch-prefetch".into())
                .spawn(move || {
                    for start in (0..ds.len()).step_by(batch_size) {
                        let batch = load_batch(&ds, start, batch_size);
                        let failed = batch.is_err();
                        // receiver gone means the consumer stopped early
                        if tx.send(batch).is_err() || failed {
                            break;
                        }
                    }
                    debug!("prefetch worker finished");
                })
                .context("spawning prefetch thread")?;
            (Some(rx), Some(handle))
        } else {
            (None, None)
        };
        Ok(Self { dataset, batch_size, next_start: 0, prefetch, worker })
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// The prefetch channel closed while batches were still due.
    fn worker_stopped(&mut self) -> anyhow::Error {
        let done = self.next_start / self.batch_size;
        let total = self.num_batches();
        let reason = match self.worker.take().map(JoinHandle::join) {
            Some(Err(payload)) => panic_message(payload.as_ref()),
            _ => "channel closed".to_string(),
        };
        anyhow!("prefetch worker stopped after {done} of {total} batches: {reason}")
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}

impl Iterator for BatchLoader {
    type Item = Result<TextBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_start >= self.dataset.len() {
            return None;
        }
        let received = self.prefetch.as_ref().map(Receiver::recv);
        let batch = match received {
            Some(Ok(batch)) => batch,
            Some(Err(_)) => Err(self.worker_stopped()),
            None => load_batch(&self.dataset, self.next_start, self.batch_size),
        };
        // an error ends the iteration
        self.next_start = match batch {
            Ok(_) => self.next_start + self.batch_size,
            Err(_) => self.dataset.len(),
        };
        Some(batch)
    }
}

impl Drop for BatchLoader {
    fn drop(&mut self) {
        self.prefetch.take();
        if let Some(worker) = self.worker.take() {
            if let Err(payload) = worker.join() {
                warn!("prefetch worker panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }
}
