//! VQGAN decoder: turns a grid of codebook indices back into an image.
//!
//! Parameter names follow the taming-transformers `VQModel` layout so
//! converted checkpoints load without renaming. Only the decoder side
//! (`quantize`, `post_quant_conv`, `decoder`) is read.

use super::layers::{swish, upsample_nearest2x, Conv2d, GroupNorm};
use crate::checkpoint::load_weights;
use crate::weights::{ParameterShapes, WeightMap};
use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

const NORM_GROUPS: usize = 32;

/// Top level of the VQGAN config file (`model.params`).
#[derive(Debug, Clone, Deserialize)]
pub struct VqGanConfig {
    pub model: VqGanModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VqGanModelConfig {
    pub params: VqGanParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VqGanParams {
    pub embed_dim: usize,
    pub n_embed: usize,
    pub ddconfig: DecoderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub ch: usize,
    pub out_ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    #[serde(default)]
    pub attn_resolutions: Vec<usize>,
    pub z_channels: usize,
    pub resolution: usize,
}

impl VqGanParams {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read VAE config {}", path.display()))?;
        let config: VqGanConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid VAE config {}", path.display()))?;
        config.model.params.validate()?;
        Ok(config.model.params)
    }

    pub fn validate(&self) -> Result<()> {
        let dd = &self.ddconfig;
        if dd.ch_mult.is_empty() {
            bail!("ddconfig.ch_mult must not be empty");
        }
        if dd.resolution % (1 << (dd.ch_mult.len() - 1)) != 0 {
            bail!(
                "resolution {} is not divisible by the {} downsampling steps",
                dd.resolution,
                dd.ch_mult.len() - 1
            );
        }
        for mult in &dd.ch_mult {
            if (dd.ch * mult) % NORM_GROUPS != 0 {
                bail!("channel count {} is not a multiple of {NORM_GROUPS}", dd.ch * mult);
            }
        }
        Ok(())
    }

    /// Side length of the token grid.
    pub fn fmap_size(&self) -> usize {
        self.ddconfig.resolution >> (self.ddconfig.ch_mult.len() - 1)
    }

    /// Every tensor the decoder reads, with its shape.
    pub fn parameter_shapes(&self) -> ParameterShapes {
        let dd = &self.ddconfig;
        let mut shapes = ParameterShapes::new();
        let conv = |shapes: &mut ParameterShapes, name: String, out: usize, inp: usize, k: usize| {
            shapes.push((format!("{name}.weight"), vec![out, inp, k, k]));
            shapes.push((format!("{name}.bias"), vec![out]));
        };
        let norm = |shapes: &mut ParameterShapes, name: String, c: usize| {
            shapes.push((format!("{name}.weight"), vec![c]));
            shapes.push((format!("{name}.bias"), vec![c]));
        };
        let resnet = |shapes: &mut ParameterShapes, name: String, inp: usize, out: usize| {
            norm(shapes, format!("{name}.norm1"), inp);
            conv(shapes, format!("{name}.conv1"), out, inp, 3);
            norm(shapes, format!("{name}.norm2"), out);
            conv(shapes, format!("{name}.conv2"), out, out, 3);
            if inp != out {
                conv(shapes, format!("{name}.nin_shortcut"), out, inp, 1);
            }
        };
        let attn = |shapes: &mut ParameterShapes, name: String, c: usize| {
            norm(shapes, format!("{name}.norm"), c);
            for part in ["q", "k", "v", "proj_out"] {
                conv(shapes, format!("{name}.{part}"), c, c, 1);
            }
        };

        shapes.push(("quantize.embedding.weight".into(), vec![self.n_embed, self.embed_dim]));
        conv(&mut shapes, "post_quant_conv".into(), dd.z_channels, self.embed_dim, 1);

        let levels = dd.ch_mult.len();
        let mut block_in = dd.ch * dd.ch_mult[levels - 1];
        let mut curr_res = self.fmap_size();
        conv(&mut shapes, "decoder.conv_in".into(), block_in, dd.z_channels, 3);
        resnet(&mut shapes, "decoder.mid.block_1".into(), block_in, block_in);
        attn(&mut shapes, "decoder.mid.attn_1".into(), block_in);
        resnet(&mut shapes, "decoder.mid.block_2".into(), block_in, block_in);
        for level in (0..levels).rev() {
            let block_out = dd.ch * dd.ch_mult[level];
            for j in 0..=dd.num_res_blocks {
                resnet(&mut shapes, format!("decoder.up.{level}.block.{j}"), block_in, block_out);
                block_in = block_out;
                if dd.attn_resolutions.contains(&curr_res) {
                    attn(&mut shapes, format!("decoder.up.{level}.attn.{j}"), block_in);
                }
            }
            if level != 0 {
                conv(&mut shapes, format!("decoder.up.{level}.upsample.conv"), block_in, block_in, 3);
                curr_res *= 2;
            }
        }
        norm(&mut shapes, "decoder.norm_out".into(), block_in);
        conv(&mut shapes, "decoder.conv_out".into(), dd.out_ch, block_in, 3);
        shapes
    }
}

struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    fn load(weights: &mut WeightMap, prefix: &str) -> Result<Self> {
        let shortcut = format!("{prefix}.nin_shortcut.weight");
        Ok(Self {
            norm1: GroupNorm::load(weights, &format!("{prefix}.norm1"), NORM_GROUPS)?,
            conv1: Conv2d::load(weights, &format!("{prefix}.conv1"))?,
            norm2: GroupNorm::load(weights, &format!("{prefix}.norm2"), NORM_GROUPS)?,
            conv2: Conv2d::load(weights, &format!("{prefix}.conv2"))?,
            nin_shortcut: if weights.contains(&shortcut) {
                Some(Conv2d::load(weights, &format!("{prefix}.nin_shortcut"))?)
            } else {
                None
            },
        })
    }

    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let h = self.conv1.forward(&swish(&self.norm1.forward(x)))?;
        let h = self.conv2.forward(&swish(&self.norm2.forward(&h)))?;
        Ok(match &self.nin_shortcut {
            Some(shortcut) => shortcut.forward(x)? + h,
            None => x + &h,
        })
    }
}

/// Single-head spatial self attention.
struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
}

impl AttnBlock {
    fn load(weights: &mut WeightMap, prefix: &str) -> Result<Self> {
        Ok(Self {
            norm: GroupNorm::load(weights, &format!("{prefix}.norm"), NORM_GROUPS)?,
            q: Conv2d::load(weights, &format!("{prefix}.q"))?,
            k: Conv2d::load(weights, &format!("{prefix}.k"))?,
            v: Conv2d::load(weights, &format!("{prefix}.v"))?,
            proj_out: Conv2d::load(weights, &format!("{prefix}.proj_out"))?,
        })
    }

    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (c, h, w) = x.dim();
        let normed = self.norm.forward(x);
        let flat = |t: Array3<f32>| -> Result<Array2<f32>> { Ok(t.into_shape((c, h * w))?) };
        let q = flat(self.q.forward(&normed)?)?;
        let k = flat(self.k.forward(&normed)?)?;
        let v = flat(self.v.forward(&normed)?)?;

        let mut scores = q.t().dot(&k) * (c as f32).powf(-0.5);
        super::layers::softmax_rows(&mut scores);
        let out = v.dot(&scores.t()).into_shape((c, h, w))?;
        Ok(x + &self.proj_out.forward(&out)?)
    }
}

struct UpLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    upsample: Option<Conv2d>,
}

/// The decoder half of a VQGAN together with its codebook.
pub struct VqGanVae {
    params: VqGanParams,
    codebook: Array2<f32>, // n_embed x embed_dim
    post_quant_conv: Conv2d,
    conv_in: Conv2d,
    mid: (ResnetBlock, AttnBlock, ResnetBlock),
    // stored lowest resolution first, i.e. in execution order
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl VqGanVae {
    /// Load from a safetensors weight file and a JSON config.
    pub fn load(model_path: &Path, config_path: &Path) -> Result<Self> {
        let params = VqGanParams::from_file(config_path)?;
        let weights = load_weights(model_path)?;
        let vae = Self::from_weights(params, weights)
            .with_context(|| format!("loading VAE from {}", model_path.display()))?;
        info!(
            image_size = vae.image_size(),
            fmap_size = vae.fmap_size(),
            num_tokens = vae.num_tokens(),
            "loaded VQGAN decoder"
        );
        Ok(vae)
    }

    pub fn from_weights(params: VqGanParams, mut weights: WeightMap) -> Result<Self> {
        params.validate()?;
        weights.retain_prefixes(&["quantize.", "post_quant_conv.", "decoder."]);
        weights.check_shapes(&params.parameter_shapes(), false)?;

        let codebook = weights.take_2d("quantize.embedding.weight")?;
        let post_quant_conv = Conv2d::load(&mut weights, "post_quant_conv")?;
        let conv_in = Conv2d::load(&mut weights, "decoder.conv_in")?;
        let mid = (
            ResnetBlock::load(&mut weights, "decoder.mid.block_1")?,
            AttnBlock::load(&mut weights, "decoder.mid.attn_1")?,
            ResnetBlock::load(&mut weights, "decoder.mid.block_2")?,
        );

        let dd = &params.ddconfig;
        let mut up = Vec::with_capacity(dd.ch_mult.len());
        for level in (0..dd.ch_mult.len()).rev() {
            let mut blocks = Vec::new();
            let mut attns = Vec::new();
            for j in 0..=dd.num_res_blocks {
                blocks.push(ResnetBlock::load(&mut weights, &format!("decoder.up.{level}.block.{j}"))?);
                if weights.contains(&format!("decoder.up.{level}.attn.{j}.q.weight")) {
                    attns.push(AttnBlock::load(&mut weights, &format!("decoder.up.{level}.attn.{j}"))?);
                }
            }
            let upsample = if level != 0 {
                Some(Conv2d::load(&mut weights, &format!("decoder.up.{level}.upsample.conv"))?)
            } else {
                None
            };
            up.push(UpLevel { blocks, attns, upsample });
        }

        let norm_out = GroupNorm::load(&mut weights, "decoder.norm_out", NORM_GROUPS)?;
        let conv_out = Conv2d::load(&mut weights, "decoder.conv_out")?;
        Ok(Self { params, codebook, post_quant_conv, conv_in, mid, up, norm_out, conv_out })
    }

    pub fn image_size(&self) -> usize {
        self.params.ddconfig.resolution
    }

    pub fn fmap_size(&self) -> usize {
        self.params.fmap_size()
    }

    /// Codebook size.
    pub fn num_tokens(&self) -> usize {
        self.params.n_embed
    }

    pub fn channels(&self) -> usize {
        self.params.ddconfig.out_ch
    }

    /// Decode `fmap_size^2` codebook indices (row major) into a
    /// `[channels, resolution, resolution]` image with values in `[0, 1]`.
    pub fn decode(&self, codes: &[usize]) -> Result<Array3<f32>> {
        let f = self.fmap_size();
        if codes.len() != f * f {
            bail!("expected {} image tokens, got {}", f * f, codes.len());
        }
        if let Some(bad) = codes.iter().find(|&&c| c >= self.codebook.nrows()) {
            bail!("image token {bad} outside codebook of size {}", self.codebook.nrows());
        }

        let dim = self.codebook.ncols();
        let z = Array3::from_shape_fn((dim, f, f), |(d, y, x)| self.codebook[[codes[y * f + x], d]]);
        let z = self.post_quant_conv.forward(&z)?;

        let mut h = self.conv_in.forward(&z)?;
        h = self.mid.0.forward(&h)?;
        h = self.mid.1.forward(&h)?;
        h = self.mid.2.forward(&h)?;
        for level in &self.up {
            for (j, block) in level.blocks.iter().enumerate() {
                h = block.forward(&h)?;
                if let Some(attn) = level.attns.get(j) {
                    h = attn.forward(&h)?;
                }
            }
            if let Some(conv) = &level.upsample {
                h = conv.forward(&upsample_nearest2x(&h))?;
            }
        }
        let h = self.conv_out.forward(&swish(&self.norm_out.forward(&h)))?;
        Ok(h.mapv(|v| (v.clamp(-1.0, 1.0) + 1.0) * 0.5))
    }
}
