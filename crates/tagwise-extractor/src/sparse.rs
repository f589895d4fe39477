//! Sparse feature vectors
//!
//! Segment, relation and document features are mostly hashed indicator
//! features plus a few dense blocks, so they are stored as sorted
//! `(index, value)` pairs and scored against dense weight arrays.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Sparse vector of `(index, value)` pairs, sorted by index once finalized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    entries: Vec<(u32, f32)>,
}

impl SparseVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, index: u32, value: f32) {
        self.entries.push((index, value));
    }

    /// Append a dense block starting at `offset`, skipping zeros
    pub fn extend_dense(&mut self, offset: usize, block: ArrayView1<'_, f32>) {
        for (i, &value) in block.iter().enumerate() {
            if value != 0.0 {
                self.entries.push(((offset + i) as u32, value));
            }
        }
    }

    /// Sort by index, sum duplicate indices, and drop zeros
    pub fn finalize(mut self) -> Self {
        self.entries.sort_unstable_by_key(|&(i, _)| i);
        let mut merged: Vec<(u32, f32)> = Vec::with_capacity(self.entries.len());
        for (index, value) in self.entries {
            match merged.last_mut() {
                Some(last) if last.0 == index => last.1 += value,
                _ => merged.push((index, value)),
            }
        }
        merged.retain(|&(_, v)| v != 0.0);
        Self { entries: merged }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        self.entries.iter().copied()
    }

    /// Largest index plus one, or zero when empty
    pub fn min_dimension(&self) -> usize {
        self.entries
            .iter()
            .map(|&(i, _)| i as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Dot product with `weights[offset..]`
    pub fn dot(&self, weights: &Array1<f64>, offset: usize) -> f64 {
        self.entries
            .iter()
            .map(|&(i, v)| weights[offset + i as usize] * f64::from(v))
            .sum()
    }

    /// `weights[offset..] += scale * self`
    pub fn add_to(&self, weights: &mut Array1<f64>, offset: usize, scale: f64) {
        for &(i, v) in &self.entries {
            weights[offset + i as usize] += scale * f64::from(v);
        }
    }
}

impl FromIterator<(u32, f32)> for SparseVector {
    fn from_iter<I: IntoIterator<Item = (u32, f32)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_finalize_merges_duplicates() {
        let v: SparseVector = [(5, 1.0), (2, 0.5), (5, 2.0), (3, 1.0), (3, -1.0)]
            .into_iter()
            .collect();
        let v = v.finalize();
        assert_eq!(v.iter().collect::<Vec<_>>(), vec![(2, 0.5), (5, 3.0)]);
        assert_eq!(v.min_dimension(), 6);
    }

    #[test]
    fn test_dot_and_add_with_offset() {
        let mut weights = Array1::<f64>::zeros(6);
        let v: SparseVector = [(0, 1.0), (2, -2.0)].into_iter().collect();

        v.add_to(&mut weights, 3, 0.5);
        assert_eq!(weights, array![0.0, 0.0, 0.0, 0.5, 0.0, -1.0]);
        assert!((v.dot(&weights, 3) - 2.5).abs() < 1e-12);
        assert_eq!(v.dot(&weights, 0), 0.0);
    }

    #[test]
    fn test_extend_dense_skips_zeros() {
        let mut v = SparseVector::new();
        v.extend_dense(10, array![0.0f32, 1.5, 0.0, -2.0].view());
        assert_eq!(v.iter().collect::<Vec<_>>(), vec![(11, 1.5), (13, -2.0)]);
    }
}
