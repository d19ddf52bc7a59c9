use crate::weights::WeightMap;
use anyhow::{bail, Result};
use ndarray::{concatenate, s, Array1, Array2, Array3, ArrayView1, Axis};
use std::ops::Range;

/// Upper bound on the im2col buffer of one convolution tile, in elements.
const IM2COL_TILE_ELEMS: usize = 1 << 22;

/// Embedding layer mapping token ids to vectors.
pub struct Embedding {
    weight: Array2<f32>, // num_embeddings x dim
}

impl Embedding {
    pub fn load(weights: &mut WeightMap, prefix: &str) -> Result<Self> {
        Ok(Self { weight: weights.take_2d(&format!("{prefix}.weight"))? })
    }

    pub fn forward(&self, tokens: &[usize]) -> Result<Array2<f32>> {
        let mut out = Array2::<f32>::zeros((tokens.len(), self.weight.ncols()));
        for (i, &tok) in tokens.iter().enumerate() {
            if tok >= self.weight.nrows() {
                bail!("token id {tok} out of range for embedding of size {}", self.weight.nrows());
            }
            out.row_mut(i).assign(&self.weight.row(tok));
        }
        Ok(out)
    }
}

/// Fully connected layer.
pub struct Linear {
    weight: Array2<f32>, // out x in
    bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn load(weights: &mut WeightMap, prefix: &str, bias: bool) -> Result<Self> {
        let weight = weights.take_2d(&format!("{prefix}.weight"))?;
        let bias = if bias {
            Some(weights.take_1d(&format!("{prefix}.bias"))?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            y += &b.view().insert_axis(Axis(0));
        }
        y
    }

    /// Output features `start..end` only.
    pub fn forward_rows(&self, x: ArrayView1<f32>, start: usize, end: usize) -> Array1<f32> {
        let w = self.weight.slice(s![start..end, ..]);
        let mut y = w.dot(&x);
        if let Some(b) = &self.bias {
            y += &b.slice(s![start..end]);
        }
        y
    }
}

/// Layer normalization over the last axis.
pub struct LayerNorm {
    weight: Array1<f32>,
    bias: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn load(weights: &mut WeightMap, prefix: &str) -> Result<Self> {
        Ok(Self {
            weight: weights.take_1d(&format!("{prefix}.weight"))?,
            bias: weights.take_1d(&format!("{prefix}.bias"))?,
            eps: 1e-5,
        })
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let denom = (var + self.eps).sqrt();
            row.mapv_inplace(|v| (v - mean) / denom);
            row *= &self.weight;
            row += &self.bias;
        }
        out
    }
}

/// Group normalization over `[channels, height, width]`.
pub struct GroupNorm {
    weight: Array1<f32>,
    bias: Array1<f32>,
    groups: usize,
    eps: f32,
}

impl GroupNorm {
    pub fn load(weights: &mut WeightMap, prefix: &str, groups: usize) -> Result<Self> {
        Ok(Self {
            weight: weights.take_1d(&format!("{prefix}.weight"))?,
            bias: weights.take_1d(&format!("{prefix}.bias"))?,
            groups,
            eps: 1e-6,
        })
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (c, _, _) = x.dim();
        let per_group = c / self.groups;
        let mut out = x.clone();
        for g in 0..self.groups {
            let mut chunk = out.slice_mut(s![g * per_group..(g + 1) * per_group, .., ..]);
            let n = chunk.len() as f32;
            let mean = chunk.sum() / n;
            let var = chunk.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let denom = (var + self.eps).sqrt();
            chunk.mapv_inplace(|v| (v - mean) / denom);
        }
        for (ci, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
            let (w, b) = (self.weight[ci], self.bias[ci]);
            plane.mapv_inplace(|v| v * w + b);
        }
        out
    }
}

/// Stride-1 2d convolution with "same" zero padding.
pub struct Conv2d {
    weight: Array2<f32>, // out x (in * k * k)
    bias: Array1<f32>,
    kernel: usize,
}

impl Conv2d {
    pub fn load(weights: &mut WeightMap, prefix: &str) -> Result<Self> {
        let (weight, kernel) = weights.take_conv_kernel(&format!("{prefix}.weight"))?;
        let bias = weights.take_1d(&format!("{prefix}.bias"))?;
        Ok(Self { weight, bias, kernel })
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        self.forward_tiled(x, IM2COL_TILE_ELEMS)
    }

    /// Larger kernels are unfolded a band of output rows at a time, so the
    /// column buffer stays under `tile_elems` for any image size.
    fn forward_tiled(&self, x: &Array3<f32>, tile_elems: usize) -> Result<Array3<f32>> {
        let (c, h, w) = x.dim();
        let out_ch = self.weight.nrows();
        let flat = if self.kernel == 1 {
            self.weight.dot(&x.to_shape((c, h * w))?)
        } else {
            let k = self.kernel;
            let band = (tile_elems / (c * k * k * w).max(1)).max(1);
            let mut out = Array2::<f32>::zeros((out_ch, h * w));
            for y0 in (0..h).step_by(band) {
                let y1 = (y0 + band).min(h);
                let cols = im2col(x, k, k / 2, y0..y1);
                out.slice_mut(s![.., y0 * w..y1 * w]).assign(&self.weight.dot(&cols));
            }
            out
        };
        let mut y = flat.into_shape((out_ch, h, w))?;
        for (oc, mut plane) in y.axis_iter_mut(Axis(0)).enumerate() {
            plane += self.bias[oc];
        }
        Ok(y)
    }
}

/// Unfold the `k x k` patches centred on output rows `rows` into columns:
/// `[c*k*k, rows.len()*w]`.
fn im2col(x: &Array3<f32>, k: usize, pad: usize, rows: Range<usize>) -> Array2<f32> {
    let (c, h, w) = x.dim();
    let mut cols = Array2::<f32>::zeros((c * k * k, rows.len() * w));
    for ci in 0..c {
        for ky in 0..k {
            for kx in 0..k {
                let row = (ci * k + ky) * k + kx;
                for y in rows.clone() {
                    let iy = y as isize + ky as isize - pad as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for xx in 0..w {
                        let ix = xx as isize + kx as isize - pad as isize;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        cols[[row, (y - rows.start) * w + xx]] = x[[ci, iy as usize, ix as usize]];
                    }
                }
            }
        }
    }
    cols
}

pub fn swish(x: &Array3<f32>) -> Array3<f32> {
    x.mapv(|v| v / (1.0 + (-v).exp()))
}

/// Nearest-neighbour x2 upsampling.
pub fn upsample_nearest2x(x: &Array3<f32>) -> Array3<f32> {
    let (c, h, w) = x.dim();
    Array3::from_shape_fn((c, h * 2, w * 2), |(ci, y, xx)| x[[ci, y / 2, xx / 2]])
}

/// Exact (erf based) GELU.
pub fn gelu(v: f32) -> f32 {
    0.5 * v * (1.0 + erf(v / std::f32::consts::SQRT_2))
}

// Abramowitz and Stegun 7.1.26, max abs error 1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() as f64;
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let y = 1.0
        - (((((1.061_405_429 * t - 1.453_152_027) * t) + 1.421_413_741) * t - 0.284_496_736) * t
            + 0.254_829_592)
            * t
            * (-x * x).exp();
    sign * y as f32
}

/// In-place softmax over each row.
pub fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

/// Append rows to a growing cache matrix.
pub fn append_rows(cache: &Array2<f32>, rows: &Array2<f32>) -> Result<Array2<f32>> {
    Ok(concatenate(Axis(0), &[cache.view(), rows.view()])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayD, IxDyn};

    #[test]
    fn gelu_matches_reference_values() {
        assert!((gelu(0.0)).abs() < 1e-7);
        assert!((gelu(1.0) - 0.841_344_7).abs() < 1e-5);
        assert!((gelu(-1.0) + 0.158_655_3).abs() < 1e-5);
    }

    #[test]
    fn layer_norm_centres_rows() {
        let mut w = WeightMap::new();
        w.insert("n.weight", ArrayD::ones(IxDyn(&[4])));
        w.insert("n.bias", ArrayD::zeros(IxDyn(&[4])));
        let norm = LayerNorm::load(&mut w, "n").unwrap();
        let out = norm.forward(&array![[1.0, 2.0, 3.0, 4.0]]);
        assert!(out.sum().abs() < 1e-5);
        assert!(out[[0, 3]] > out[[0, 0]]);
    }

    #[test]
    fn identity_3x3_conv_preserves_input() {
        let mut kernel = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 3, 3]));
        kernel[[0, 0, 1, 1]] = 1.0;
        let mut w = WeightMap::new();
        w.insert("c.weight", kernel);
        w.insert("c.bias", ArrayD::from_elem(IxDyn(&[1]), 0.5));
        let conv = Conv2d::load(&mut w, "c").unwrap();
        let x = Array3::from_shape_fn((1, 3, 3), |(_, y, x)| (y * 3 + x) as f32);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y, x.mapv(|v| v + 0.5));
    }

    #[test]
    fn box_conv_sums_neighbours_with_zero_padding() {
        let mut w = WeightMap::new();
        w.insert("c.weight", ArrayD::ones(IxDyn(&[1, 1, 3, 3])));
        w.insert("c.bias", ArrayD::zeros(IxDyn(&[1])));
        let conv = Conv2d::load(&mut w, "c").unwrap();
        let y = conv.forward(&Array3::ones((1, 3, 3))).unwrap();
        assert_eq!(y[[0, 0, 0]], 4.0);
        assert_eq!(y[[0, 1, 1]], 9.0);
        assert_eq!(y[[0, 0, 1]], 6.0);
    }

    #[test]
    fn banded_conv_matches_single_tile() {
        let data: Vec<f32> = (0..2 * 3 * 9).map(|v| ((v * 7) % 11) as f32 - 5.0).collect();
        let mut w = WeightMap::new();
        w.insert("c.weight", ArrayD::from_shape_vec(IxDyn(&[2, 3, 3, 3]), data).unwrap());
        w.insert("c.bias", ArrayD::from_elem(IxDyn(&[2]), 0.25));
        let conv = Conv2d::load(&mut w, "c").unwrap();
        let x = Array3::from_shape_fn((3, 5, 4), |(c, y, x)| (c * 20 + y * 4 + x) as f32 * 0.1);

        let whole = conv.forward_tiled(&x, usize::MAX).unwrap();
        // one output row per band, plus a band size that leaves a short tail
        for budget in [1, 3 * 9 * 4 * 2] {
            let banded = conv.forward_tiled(&x, budget).unwrap();
            assert!((&banded - &whole).iter().all(|d| d.abs() < 1e-4));
        }
    }

    #[test]
    fn append_rows_grows_the_cache() {
        let cache = Array2::<f32>::zeros((0, 2));
        let grown = append_rows(&cache, &array![[1.0, 2.0]]).unwrap();
        assert_eq!(grown.dim(), (1, 2));
        assert!(append_rows(&grown, &array![[1.0, 2.0, 3.0]]).is_err());
    }

    #[test]
    fn upsample_repeats_pixels() {
        let x = Array3::from_shape_vec((1, 1, 2), vec![1.0, 2.0]).unwrap();
        let y = upsample_nearest2x(&x);
        assert_eq!(y.dim(), (1, 2, 4));
        assert_eq!(y.slice(s![0, 1, ..]).to_vec(), vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn embedding_rejects_out_of_range_ids() {
        let mut w = WeightMap::new();
        w.insert("e.weight", ArrayD::zeros(IxDyn(&[3, 2])));
        let emb = Embedding::load(&mut w, "e").unwrap();
        assert!(emb.forward(&[0, 2]).is_ok());
        assert!(emb.forward(&[3]).is_err());
    }
}
