//! Model parameters exchanged between the coordinator and its clients.

use serde::{Deserialize, Serialize};

use crate::error::ShapeMismatch;

/// Dense row-major f32 tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub dims: Vec<usize>,
    pub values: Vec<f32>,
}

impl Tensor {
    pub fn new(dims: Vec<usize>, values: Vec<f32>) -> Self {
        Self { dims, values }
    }

    pub fn zeros(dims: Vec<usize>) -> Self {
        let len = dims.iter().product();
        Self { dims, values: vec![0.0; len] }
    }

    pub fn filled(dims: Vec<usize>, value: f32) -> Self {
        let len = dims.iter().product();
        Self { dims, values: vec![value; len] }
    }

    /// Number of elements implied by `dims`.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self { dims: self.dims.clone(), values: self.values.iter().map(|v| f(*v)).collect() }
    }
}

/// Ordered parameter set, e.g. `[("fc.weight", ..), ("fc.bias", ..)]`.
///
/// Order is part of the layout: two sets match only if names, order and
/// dims agree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    entries: Vec<(String, Tensor)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    /// Inserts or replaces `name`, keeping its original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = tensor,
            None => self.entries.push((name, tensor)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self { entries: self.entries.iter().map(|(n, t)| (n.clone(), t.map(&f))).collect() }
    }

    /// Checks that `other` has exactly this layout (names, order, dims, storage).
    pub fn check_layout(&self, other: &Parameters) -> Result<(), ShapeMismatch> {
        if self.entries.len() != other.entries.len() {
            return Err(ShapeMismatch::ParameterCount { expected: self.entries.len(), found: other.entries.len() });
        }
        for (position, ((name, want), (got_name, got))) in self.entries.iter().zip(&other.entries).enumerate() {
            if name != got_name {
                return Err(ShapeMismatch::Name { position, expected: name.clone(), found: got_name.clone() });
            }
            if want.dims != got.dims {
                return Err(ShapeMismatch::Dims { name: name.clone(), expected: want.dims.clone(), found: got.dims.clone() });
            }
            if got.values.len() != got.numel() {
                return Err(ShapeMismatch::Storage {
                    name: name.clone(),
                    dims: got.dims.clone(),
                    expected: got.numel(),
                    found: got.values.len(),
                });
            }
        }
        Ok(())
    }

    /// True when every stored value is finite.
    pub fn is_finite(&self) -> bool {
        self.entries.iter().all(|(_, t)| t.values.iter().all(|v| v.is_finite()))
    }
}

/// The authoritative global model at a round boundary.
///
/// Never mutated in place: aggregation produces a new value with
/// `version + 1`, and clients only ever see it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModelState {
    pub version: u64,
    pub parameters: Parameters,
}

impl GlobalModelState {
    pub fn initial(parameters: Parameters) -> Self {
        Self { version: 0, parameters }
    }

    /// Successor state carrying freshly aggregated parameters.
    pub fn successor(&self, parameters: Parameters) -> Self {
        Self { version: self.version + 1, parameters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Parameters {
        Parameters::new()
            .with("fc.weight", Tensor::zeros(vec![2, 3]))
            .with("fc.bias", Tensor::zeros(vec![2]))
    }

    #[test]
    fn identical_layout_matches() {
        let a = layout();
        let b = a.map(|v| v + 1.0);
        assert!(a.check_layout(&b).is_ok());
    }

    #[test]
    fn detects_dims_mismatch() {
        let a = layout();
        let b = Parameters::new()
            .with("fc.weight", Tensor::zeros(vec![3, 2]))
            .with("fc.bias", Tensor::zeros(vec![2]));
        assert!(matches!(a.check_layout(&b), Err(ShapeMismatch::Dims { .. })));
    }

    #[test]
    fn detects_missing_and_reordered_parameters() {
        let a = layout();
        let missing = Parameters::new().with("fc.weight", Tensor::zeros(vec![2, 3]));
        assert_eq!(a.check_layout(&missing), Err(ShapeMismatch::ParameterCount { expected: 2, found: 1 }));
        let reordered = Parameters::new()
            .with("fc.bias", Tensor::zeros(vec![2]))
            .with("fc.weight", Tensor::zeros(vec![2, 3]));
        assert!(matches!(a.check_layout(&reordered), Err(ShapeMismatch::Name { position: 0, .. })));
    }

    #[test]
    fn detects_short_storage() {
        let a = layout();
        let b = Parameters::new()
            .with("fc.weight", Tensor::new(vec![2, 3], vec![0.0; 5]))
            .with("fc.bias", Tensor::zeros(vec![2]));
        assert!(matches!(a.check_layout(&b), Err(ShapeMismatch::Storage { expected: 6, found: 5, .. })));
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut p = layout();
        p.insert("fc.weight", Tensor::filled(vec![2, 3], 1.0));
        assert_eq!(p.names().collect::<Vec<_>>(), vec!["fc.weight", "fc.bias"]);
        assert_eq!(p.get("fc.weight").map(|t| t.values[0]), Some(1.0));
    }
}
