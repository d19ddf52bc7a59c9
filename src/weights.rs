//! Named f32 tensors and the shape checks used when loading them into a model.

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array1, Array2, ArrayD, Ix1, Ix2, IxDyn};
use std::collections::{BTreeSet, HashMap};

/// Expected parameter names and shapes of a model.
pub type ParameterShapes = Vec<(String, Vec<usize>)>;

/// Mapping of parameter names to tensors, as stored in a checkpoint.
#[derive(Debug, Default, Clone)]
pub struct WeightMap {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Names in sorted order, so serialized output is stable.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Keep only tensors whose name starts with one of `prefixes`.
    pub fn retain_prefixes(&mut self, prefixes: &[&str]) {
        self.tensors
            .retain(|name, _| prefixes.iter().any(|p| name.starts_with(p)));
    }

    /// Move every tensor named `from...` to `to...`.
    pub fn rename_prefix(&mut self, from: &str, to: &str) {
        let moved: Vec<String> = self
            .tensors
            .keys()
            .filter(|name| name.starts_with(from))
            .cloned()
            .collect();
        for name in moved {
            if let Some(t) = self.tensors.remove(&name) {
                self.tensors.insert(format!("{to}{}", &name[from.len()..]), t);
            }
        }
    }

    /// Fold all leading axes of `name` into one, e.g. `[1, F, 1, D]` into
    /// `[F, D]`. Absent or already 2-d tensors are left alone.
    pub fn flatten_to_2d(&mut self, name: &str) -> Result<()> {
        let Some(t) = self.tensors.remove(name) else {
            return Ok(());
        };
        if t.ndim() <= 2 {
            self.tensors.insert(name.to_string(), t);
            return Ok(());
        }
        let last = t.shape()[t.ndim() - 1];
        let rows = t.len() / last.max(1);
        let flat = t
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&[rows, last]))
            .with_context(|| format!("flattening weight '{name}'"))?;
        self.tensors.insert(name.to_string(), flat);
        Ok(())
    }

    /// Compare the stored tensors against the parameters a model expects.
    ///
    /// Missing names and shape mismatches are always errors. Names the model
    /// does not know about are errors only when `strict` is set.
    pub fn check_shapes(&self, expected: &[(String, Vec<usize>)], strict: bool) -> Result<()> {
        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        for (name, shape) in expected {
            match self.tensors.get(name) {
                None => missing.push(name.as_str()),
                Some(t) if t.shape() != shape.as_slice() => mismatched.push(format!(
                    "{name}: checkpoint {:?}, model {:?}",
                    t.shape(),
                    shape
                )),
                Some(_) => {}
            }
        }

        let mut unexpected = Vec::new();
        if strict {
            let known: BTreeSet<&str> = expected.iter().map(|(n, _)| n.as_str()).collect();
            unexpected = self
                .names()
                .into_iter()
                .filter(|n| !known.contains(n))
                .collect();
        }

        if missing.is_empty() && mismatched.is_empty() && unexpected.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing keys {missing:?}"));
        }
        if !unexpected.is_empty() {
            problems.push(format!("unexpected keys {unexpected:?}"));
        }
        for m in mismatched {
            problems.push(format!("size mismatch for {m}"));
        }
        bail!("error(s) loading weights: {}", problems.join("; "))
    }

    fn take(&mut self, name: &str) -> Result<ArrayD<f32>> {
        self.tensors
            .remove(name)
            .ok_or_else(|| anyhow!("missing weight '{name}'"))
    }

    pub fn take_1d(&mut self, name: &str) -> Result<Array1<f32>> {
        self.take(name)?
            .into_dimensionality::<Ix1>()
            .with_context(|| format!("weight '{name}' is not 1-dimensional"))
    }

    pub fn take_2d(&mut self, name: &str) -> Result<Array2<f32>> {
        self.take(name)?
            .into_dimensionality::<Ix2>()
            .with_context(|| format!("weight '{name}' is not 2-dimensional"))
    }

    /// Take a 4-d convolution kernel `[out, in, k, k]` flattened to `[out, in*k*k]`.
    pub fn take_conv_kernel(&mut self, name: &str) -> Result<(Array2<f32>, usize)> {
        let t = self.take(name)?;
        let shape = t.shape().to_vec();
        if shape.len() != 4 || shape[2] != shape[3] {
            bail!("weight '{name}' is not a square conv kernel: {shape:?}");
        }
        let (out, inp, k) = (shape[0], shape[1], shape[2]);
        let flat = t
            .as_standard_layout()
            .into_owned()
            .into_shape((out, inp * k * k))
            .with_context(|| format!("reshaping conv kernel '{name}'"))?;
        Ok((flat, k))
    }
}

impl FromIterator<(String, ArrayD<f32>)> for WeightMap {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self { tensors: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn shapes(entries: Vec<(&str, Vec<usize>)>) -> ParameterShapes {
        entries.into_iter().map(|(n, s)| (n.to_string(), s)).collect()
    }

    #[test]
    fn check_reports_missing_and_mismatch() {
        let mut w = WeightMap::new();
        w.insert("a.weight", ArrayD::zeros(IxDyn(&[2, 3])));
        let expected = shapes(vec![("a.weight", vec![3, 2]), ("a.bias", vec![3])]);
        let err = w.check_shapes(&expected, true).unwrap_err().to_string();
        assert!(err.contains("missing keys [\"a.bias\"]"), "{err}");
        assert!(err.contains("size mismatch for a.weight"), "{err}");
    }

    #[test]
    fn unexpected_keys_only_fail_when_strict() {
        let mut w = WeightMap::new();
        w.insert("a", ArrayD::zeros(IxDyn(&[1])));
        w.insert("encoder.x", ArrayD::zeros(IxDyn(&[1])));
        let expected = shapes(vec![("a", vec![1])]);
        assert!(w.check_shapes(&expected, false).is_ok());
        let err = w.check_shapes(&expected, true).unwrap_err().to_string();
        assert!(err.contains("unexpected keys [\"encoder.x\"]"), "{err}");
    }

    #[test]
    fn renaming_a_prefix_moves_only_matching_names() {
        let mut w = WeightMap::new();
        w.insert("to_logits.0.weight", ArrayD::zeros(IxDyn(&[2])));
        w.insert("to_logits.1.bias", ArrayD::zeros(IxDyn(&[3])));
        w.rename_prefix("to_logits.0.", "to_logits.norm.");
        assert_eq!(w.names(), vec!["to_logits.1.bias", "to_logits.norm.weight"]);
    }

    #[test]
    fn axial_weights_flatten_to_rows() {
        let mut w = WeightMap::new();
        let data: Vec<f32> = (0..6).map(|v| v as f32).collect();
        w.insert("p", ArrayD::from_shape_vec(IxDyn(&[1, 1, 3, 2]), data).unwrap());
        w.flatten_to_2d("p").unwrap();
        w.flatten_to_2d("absent").unwrap();
        let p = w.take_2d("p").unwrap();
        assert_eq!(p.dim(), (3, 2));
        assert_eq!(p[[2, 1]], 5.0);
    }

    #[test]
    fn conv_kernel_is_flattened_row_major() {
        let mut w = WeightMap::new();
        let data: Vec<f32> = (0..18).map(|v| v as f32).collect();
        w.insert("k", ArrayD::from_shape_vec(IxDyn(&[2, 1, 3, 3]), data).unwrap());
        let (flat, k) = w.take_conv_kernel("k").unwrap();
        assert_eq!(k, 3);
        assert_eq!(flat.dim(), (2, 9));
        assert_eq!(flat[[1, 0]], 9.0);
        assert!(!w.contains("k"));
    }
}
