use super::layers::{append_rows, gelu, softmax_rows, Embedding, LayerNorm, Linear};
use super::vqgan::VqGanVae;
use crate::weights::{ParameterShapes, WeightMap};
use anyhow::{anyhow, bail, Context, Result};
use ndarray::{s, Array1, Array2, Array3, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Hyperparameters of the transformer, as saved alongside the weights.
#[derive(Clone, Debug, Deserialize)]
pub struct DalleParams {
    /// Embedding/hidden dimension.
    pub dim: usize,
    /// Number of transformer layers.
    pub depth: usize,
    #[serde(default = "default_heads")]
    pub heads: usize,
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,
    /// Size of the caption vocabulary, before the per-position pad tokens.
    #[serde(default = "default_num_text_tokens")]
    pub num_text_tokens: usize,
    #[serde(default = "default_text_seq_len")]
    pub text_seq_len: usize,
    /// Feed-forward expansion factor.
    #[serde(default = "default_ff_mult")]
    pub ff_mult: usize,
    #[serde(default = "default_attn_types")]
    pub attn_types: Vec<String>,
}

fn default_heads() -> usize {
    8
}

fn default_dim_head() -> usize {
    64
}

fn default_num_text_tokens() -> usize {
    10000
}

fn default_text_seq_len() -> usize {
    256
}

fn default_ff_mult() -> usize {
    4
}

fn default_attn_types() -> Vec<String> {
    vec!["full".to_string()]
}

impl DalleParams {
    pub fn from_hparams(hparams: Map<String, Value>) -> Result<Self> {
        let params: Self = serde_json::from_value(Value::Object(hparams))
            .context("invalid DALLE hyperparameters")?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(other) = self.attn_types.iter().find(|t| t.as_str() != "full") {
            bail!("attention type '{other}' is not supported, only 'full'");
        }
        if self.dim == 0 || self.depth == 0 || self.heads == 0 || self.dim_head == 0 {
            bail!("dim, depth, heads and dim_head must be non-zero");
        }
        Ok(())
    }

    /// Text vocabulary including one unique pad token per position.
    pub fn text_vocab_size(&self) -> usize {
        self.num_text_tokens + self.text_seq_len
    }

    fn inner_dim(&self) -> usize {
        self.heads * self.dim_head
    }

    /// Every tensor the model owns, with its shape, for a given VAE.
    pub fn parameter_shapes(&self, num_image_tokens: usize, fmap_size: usize) -> ParameterShapes {
        let dim = self.dim;
        let inner = self.inner_dim();
        let hidden = dim * self.ff_mult;
        let total = self.text_vocab_size() + num_image_tokens;

        let mut shapes: ParameterShapes = vec![
            ("text_emb.weight".into(), vec![self.text_vocab_size(), dim]),
            ("image_emb.weight".into(), vec![num_image_tokens, dim]),
            ("text_pos_emb.weight".into(), vec![self.text_seq_len + 1, dim]),
            ("image_pos_emb.weights_0".into(), vec![fmap_size, dim]),
            ("image_pos_emb.weights_1".into(), vec![fmap_size, dim]),
        ];
        for l in 0..self.depth {
            let p = format!("transformer.layers.{l}");
            shapes.extend([
                (format!("{p}.attn_norm.weight"), vec![dim]),
                (format!("{p}.attn_norm.bias"), vec![dim]),
                (format!("{p}.attn.to_qkv.weight"), vec![inner * 3, dim]),
                (format!("{p}.attn.to_out.weight"), vec![dim, inner]),
                (format!("{p}.attn.to_out.bias"), vec![dim]),
                (format!("{p}.ff_norm.weight"), vec![dim]),
                (format!("{p}.ff_norm.bias"), vec![dim]),
                (format!("{p}.ff.w1.weight"), vec![hidden * 2, dim]),
                (format!("{p}.ff.w1.bias"), vec![hidden * 2]),
                (format!("{p}.ff.w2.weight"), vec![dim, hidden]),
                (format!("{p}.ff.w2.bias"), vec![dim]),
            ]);
        }
        shapes.extend([
            ("to_logits.norm.weight".into(), vec![dim]),
            ("to_logits.norm.bias".into(), vec![dim]),
            ("to_logits.proj.weight".into(), vec![total, dim]),
            ("to_logits.proj.bias".into(), vec![total]),
        ]);
        shapes
    }
}

/// Sampling settings for image generation.
#[derive(Clone, Debug)]
pub struct SamplingConfig {
    /// Fraction of the vocabulary filtered out before sampling.
    pub filter_thres: f64,
    pub temperature: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { filter_thres: 0.9, temperature: 1.0 }
    }
}

/// Keys and values seen so far by one attention layer.
struct LayerCache {
    keys: Array2<f32>,
    values: Array2<f32>,
}

/// Multi-head causal self attention.
struct Attention {
    to_qkv: Linear,
    to_out: Linear,
    heads: usize,
    dim_head: usize,
}

impl Attention {
    fn empty_cache(&self) -> LayerCache {
        let inner = self.heads * self.dim_head;
        LayerCache { keys: Array2::zeros((0, inner)), values: Array2::zeros((0, inner)) }
    }

    /// Attend the new rows `x` to everything cached plus themselves.
    fn forward(&self, x: &Array2<f32>, cache: &mut LayerCache) -> Result<Array2<f32>> {
        let inner = self.heads * self.dim_head;
        let qkv = self.to_qkv.forward(x);
        let q = qkv.slice(s![.., 0..inner]).to_owned();
        let k = qkv.slice(s![.., inner..2 * inner]).to_owned();
        let v = qkv.slice(s![.., 2 * inner..]).to_owned();

        let offset = cache.keys.nrows();
        cache.keys = append_rows(&cache.keys, &k)?;
        cache.values = append_rows(&cache.values, &v)?;
        let total = cache.keys.nrows();
        let scale = (self.dim_head as f32).powf(-0.5);

        let mut out = Array2::<f32>::zeros((x.nrows(), inner));
        for h in 0..self.heads {
            let (lo, hi) = (h * self.dim_head, (h + 1) * self.dim_head);
            let qh = q.slice(s![.., lo..hi]);
            let kh = cache.keys.slice(s![.., lo..hi]);
            let vh = cache.values.slice(s![.., lo..hi]);

            let mut scores = qh.dot(&kh.t()) * scale;
            for i in 0..x.nrows() {
                for j in (offset + i + 1)..total {
                    scores[[i, j]] = f32::NEG_INFINITY;
                }
            }
            softmax_rows(&mut scores);
            out.slice_mut(s![.., lo..hi]).assign(&scores.dot(&vh));
        }
        Ok(self.to_out.forward(&out))
    }
}

/// GEGLU feed-forward network.
struct FeedForward {
    w1: Linear,
    w2: Linear,
}

impl FeedForward {
    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let h = self.w1.forward(x);
        let half = h.ncols() / 2;
        let gated = &h.slice(s![.., ..half]) * &h.slice(s![.., half..]).mapv(gelu);
        self.w2.forward(&gated)
    }
}

/// Pre-norm transformer block.
struct Block {
    attn_norm: LayerNorm,
    attn: Attention,
    ff_norm: LayerNorm,
    ff: FeedForward,
}

impl Block {
    fn load(weights: &mut WeightMap, prefix: &str, params: &DalleParams) -> Result<Self> {
        Ok(Self {
            attn_norm: LayerNorm::load(weights, &format!("{prefix}.attn_norm"))?,
            attn: Attention {
                to_qkv: Linear::load(weights, &format!("{prefix}.attn.to_qkv"), false)?,
                to_out: Linear::load(weights, &format!("{prefix}.attn.to_out"), true)?,
                heads: params.heads,
                dim_head: params.dim_head,
            },
            ff_norm: LayerNorm::load(weights, &format!("{prefix}.ff_norm"))?,
            ff: FeedForward {
                w1: Linear::load(weights, &format!("{prefix}.ff.w1"), true)?,
                w2: Linear::load(weights, &format!("{prefix}.ff.w2"), true)?,
            },
        })
    }

    fn forward(&self, x: &Array2<f32>, cache: &mut LayerCache) -> Result<Array2<f32>> {
        let h = self.attn.forward(&self.attn_norm.forward(x), cache)?;
        let x = x + &h;
        let h = self.ff.forward(&self.ff_norm.forward(&x));
        Ok(x + &h)
    }
}

/// Run new rows through every block, extending each block's cache.
fn run_blocks(blocks: &[Block], mut x: Array2<f32>, caches: &mut [LayerCache]) -> Result<Array2<f32>> {
    for (block, cache) in blocks.iter().zip(caches.iter_mut()) {
        x = block.forward(&x, cache)?;
    }
    Ok(x)
}

/// Accept DALLE-pytorch state dicts as saved: the output head as
/// `to_logits.0`/`to_logits.1` and the axial embeddings as `[1, F, 1, dim]`
/// and `[1, 1, F, dim]`.
fn normalize_layout(weights: &mut WeightMap) -> Result<()> {
    weights.rename_prefix("to_logits.0.", "to_logits.norm.");
    weights.rename_prefix("to_logits.1.", "to_logits.proj.");
    weights.flatten_to_2d("image_pos_emb.weights_0")?;
    weights.flatten_to_2d("image_pos_emb.weights_1")
}

/// Factorized 2d positional embedding over the image token grid.
struct AxialPositionalEmbedding {
    rows: Array2<f32>,
    cols: Array2<f32>,
}

impl AxialPositionalEmbedding {
    fn at(&self, position: usize) -> Array1<f32> {
        let width = self.cols.nrows();
        &self.rows.row(position / width) + &self.cols.row(position % width)
    }
}

/// Text-conditioned image transformer bound to its VQGAN decoder.
pub struct Dalle {
    params: DalleParams,
    vae: VqGanVae,
    text_emb: Embedding,
    image_emb: Embedding,
    text_pos_emb: Embedding,
    image_pos_emb: AxialPositionalEmbedding,
    layers: Vec<Block>,
    logits_norm: LayerNorm,
    logits: Linear,
}

impl Dalle {
    /// Build the model and load its weight state. Loading is strict: every
    /// expected tensor must be present with the right shape and nothing else
    /// may be left over.
    pub fn from_weights(params: DalleParams, vae: VqGanVae, mut weights: WeightMap) -> Result<Self> {
        params.validate()?;
        normalize_layout(&mut weights)?;
        let expected = params.parameter_shapes(vae.num_tokens(), vae.fmap_size());
        weights.check_shapes(&expected, true)?;

        let text_emb = Embedding::load(&mut weights, "text_emb")?;
        let image_emb = Embedding::load(&mut weights, "image_emb")?;
        let text_pos_emb = Embedding::load(&mut weights, "text_pos_emb")?;
        let image_pos_emb = AxialPositionalEmbedding {
            rows: weights.take_2d("image_pos_emb.weights_0")?,
            cols: weights.take_2d("image_pos_emb.weights_1")?,
        };
        let layers = (0..params.depth)
            .map(|l| Block::load(&mut weights, &format!("transformer.layers.{l}"), &params))
            .collect::<Result<Vec<_>>>()?;
        let logits_norm = LayerNorm::load(&mut weights, "to_logits.norm")?;
        let logits = Linear::load(&mut weights, "to_logits.proj", true)?;

        Ok(Self {
            params,
            vae,
            text_emb,
            image_emb,
            text_pos_emb,
            image_pos_emb,
            layers,
            logits_norm,
            logits,
        })
    }

    pub fn params(&self) -> &DalleParams {
        &self.params
    }

    pub fn vae(&self) -> &VqGanVae {
        &self.vae
    }

    pub fn image_seq_len(&self) -> usize {
        self.vae.fmap_size() * self.vae.fmap_size()
    }

    /// Generate one image per row of `text` (`batch x seq` token ids, 0 is
    /// padding). Rows run in parallel; each draws its own seed from `rng` so a
    /// seeded run is reproducible regardless of scheduling.
    pub fn generate_images<R: Rng>(
        &self,
        text: &Array2<usize>,
        sampling: &SamplingConfig,
        rng: &mut R,
    ) -> Result<Vec<Array3<f32>>> {
        let seeds: Vec<u64> = (0..text.nrows()).map(|_| rng.gen()).collect();
        seeds
            .into_par_iter()
            .enumerate()
            .map(|(i, seed)| {
                let mut row_rng = StdRng::seed_from_u64(seed);
                let codes = self.generate_codes(text.row(i), sampling, &mut row_rng)?;
                self.vae.decode(&codes)
            })
            .collect()
    }

    /// Sample the image token sequence for one caption.
    pub fn generate_codes<R: Rng>(
        &self,
        text: ArrayView1<usize>,
        sampling: &SamplingConfig,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        let prompt = self.prepare_text(text)?;
        let positions: Vec<usize> = (0..prompt.len()).collect();
        let x = self.text_emb.forward(&prompt)? + self.text_pos_emb.forward(&positions)?;

        let mut caches: Vec<LayerCache> = self.layers.iter().map(|b| b.attn.empty_cache()).collect();
        let mut hidden = run_blocks(&self.layers, x, &mut caches)?;

        let image_seq_len = self.image_seq_len();
        let mut codes = Vec::with_capacity(image_seq_len);
        loop {
            let last = self.logits_norm.forward(&hidden.slice(s![-1.., ..]).to_owned());
            let code = self.sample_image_token(last.row(0), sampling, rng)?;
            codes.push(code);
            if codes.len() == image_seq_len {
                break;
            }
            let mut x = self.image_emb.forward(&[code])?;
            x.row_mut(0).scaled_add(1.0, &self.image_pos_emb.at(codes.len() - 1));
            hidden = run_blocks(&self.layers, x, &mut caches)?;
        }
        Ok(codes)
    }

    /// `<bos>` followed by the caption, with padding replaced by the pad
    /// token of its position. Captions are cut or zero padded to `text_seq_len`.
    fn prepare_text(&self, text: ArrayView1<usize>) -> Result<Vec<usize>> {
        let seq_len = self.params.text_seq_len;
        let mut prompt = Vec::with_capacity(seq_len + 1);
        prompt.push(0);
        for p in 0..seq_len {
            let tok = text.get(p).copied().unwrap_or(0);
            if tok == 0 {
                prompt.push(self.params.num_text_tokens + p);
            } else if tok >= self.params.num_text_tokens {
                bail!(
                    "text token {tok} outside vocabulary of size {}",
                    self.params.num_text_tokens
                );
            } else {
                prompt.push(tok);
            }
        }
        Ok(prompt)
    }

    /// Image positions may only emit image tokens, so only that slice of the
    /// output projection is computed; the masked text logits never survive
    /// the top-k filter.
    fn sample_image_token<R: Rng>(
        &self,
        hidden: ArrayView1<f32>,
        sampling: &SamplingConfig,
        rng: &mut R,
    ) -> Result<usize> {
        let text_vocab = self.params.text_vocab_size();
        let total = text_vocab + self.vae.num_tokens();
        let logits = self.logits.forward_rows(hidden, text_vocab, total);
        let k = top_k_count(total, sampling.filter_thres).min(logits.len());
        let filtered = top_k(&logits, k);
        gumbel_sample(&filtered, sampling.temperature, rng)
            .ok_or_else(|| anyhow!("no finite logits to sample from"))
    }
}

/// Number of logits kept by a filter threshold: `max(floor((1 - thres) * n), 1)`.
pub fn top_k_count(num_logits: usize, filter_thres: f64) -> usize {
    (((1.0 - filter_thres) * num_logits as f64) as usize).max(1)
}

/// Keep the `k` largest logits and set the rest to negative infinity.
pub fn top_k(logits: &Array1<f32>, k: usize) -> Array1<f32> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    let mut out = Array1::from_elem(logits.len(), f32::NEG_INFINITY);
    for &i in order.iter().take(k) {
        out[i] = logits[i];
    }
    out
}

/// Gumbel-max sampling: `argmax(logits / temperature + gumbel noise)`.
pub fn gumbel_sample<R: Rng>(logits: &Array1<f32>, temperature: f32, rng: &mut R) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &l) in logits.iter().enumerate() {
        if !l.is_finite() {
            continue;
        }
        let u: f32 = rng.gen::<f32>().max(1e-20);
        let noise = -(-u.ln()).max(1e-20).ln();
        let score = l / temperature + noise;
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}
