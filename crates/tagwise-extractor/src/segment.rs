//! Segment features for the sequence tagger
//!
//! A candidate entity span is described by hashed lexical features keyed by
//! the role each token plays (inside, first, last, before, after, wider
//! window) and by five dense blocks: the first and last word vectors, their
//! mean over the span, and the word vectors just outside the span.

use ndarray::{Array1, ArrayView1};

use crate::features::FeatureVector;
use crate::hashing::{bucket, combine, sign};
use crate::sparse::SparseVector;

/// Dense blocks appended after the hashed features
pub const DENSE_BLOCKS: usize = 5;

const WIDE_WINDOW: usize = 8;
const BOUNDARY: u64 = 0xb0b0_b0b0;

#[derive(Clone, Copy)]
#[repr(u64)]
enum Role {
    Inside = 0x1000,
    First = 0x2000,
    Last = 0x3000,
    Before = 0x4000,
    After = 0x5000,
    LeftContext = 0x6000,
    RightContext = 0x7000,
    WideBefore = 0x8000,
    WideAfter = 0x9000,
    Length = 0xa000,
}

/// `x / (0.5 * |x| + 1e-10)`, which keeps direction and bounds the norm by 2
fn squash(x: ArrayView1<'_, f32>) -> Array1<f32> {
    let norm = x.dot(&x).sqrt();
    x.mapv(|v| v / (0.5 * norm + 1e-10))
}

/// Builds sparse span features over one sentence's token features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFeaturizer {
    hash_dimensions: usize,
    word_dimensions: usize,
}

impl SegmentFeaturizer {
    pub fn new(hash_dimensions: usize, word_dimensions: usize) -> Self {
        Self {
            hash_dimensions,
            word_dimensions,
        }
    }

    pub fn hash_dimensions(&self) -> usize {
        self.hash_dimensions
    }

    pub fn word_dimensions(&self) -> usize {
        self.word_dimensions
    }

    /// Length of every span feature vector
    pub fn dimension(&self) -> usize {
        self.hash_dimensions + DENSE_BLOCKS * self.word_dimensions
    }

    fn push_keys(&self, out: &mut SparseVector, role: Role, keys: &[u64]) {
        for &key in keys {
            let h = combine(role as u64, key);
            out.push(bucket(h, self.hash_dimensions), sign(h));
        }
    }

    /// Features of the span `[start, end)`
    ///
    /// The span must be non-empty and inside `feats`.
    pub fn span(&self, feats: &[FeatureVector], start: usize, end: usize) -> SparseVector {
        debug_assert!(start < end && end <= feats.len());
        let mut out = SparseVector::with_capacity(64 + DENSE_BLOCKS * self.word_dimensions);

        for f in &feats[start..end] {
            self.push_keys(&mut out, Role::Inside, &f.lexical);
        }
        self.push_keys(&mut out, Role::First, &feats[start].lexical);
        self.push_keys(&mut out, Role::Last, &feats[end - 1].lexical);
        self.push_keys(&mut out, Role::LeftContext, &feats[start].context_keys);
        self.push_keys(&mut out, Role::RightContext, &feats[end - 1].context_keys);

        match start.checked_sub(1) {
            Some(i) => self.push_keys(&mut out, Role::Before, &feats[i].lexical),
            None => self.push_keys(&mut out, Role::Before, &[BOUNDARY]),
        }
        match feats.get(end) {
            Some(f) => self.push_keys(&mut out, Role::After, &f.lexical),
            None => self.push_keys(&mut out, Role::After, &[BOUNDARY]),
        }

        // Lowercased words in a wider window, position ignored
        for f in &feats[start.saturating_sub(WIDE_WINDOW)..start] {
            self.push_keys(&mut out, Role::WideBefore, &f.lexical[1..2]);
        }
        for f in &feats[end..(end + WIDE_WINDOW).min(feats.len())] {
            self.push_keys(&mut out, Role::WideAfter, &f.lexical[1..2]);
        }

        self.push_keys(&mut out, Role::Length, &[(end - start).min(WIDE_WINDOW) as u64]);

        let dims = self.word_dimensions;
        let offset = self.hash_dimensions;
        let mut mean = Array1::<f32>::zeros(dims);
        for f in &feats[start..end] {
            mean += &f.word;
        }
        mean /= (end - start) as f32;

        out.extend_dense(offset, squash(feats[start].word.view()).view());
        out.extend_dense(offset + dims, squash(feats[end - 1].word.view()).view());
        out.extend_dense(offset + 2 * dims, squash(mean.view()).view());
        if let Some(i) = start.checked_sub(1) {
            out.extend_dense(offset + 3 * dims, squash(feats[i].word.view()).view());
        }
        if let Some(f) = feats.get(end) {
            out.extend_dense(offset + 4 * dims, squash(f.word.view()).view());
        }

        out.finalize()
    }
}

/// Span features for every candidate segment of one sentence
///
/// Indexed by start position and length (`1..=max_length`).
pub struct SpanTable {
    max_length: usize,
    rows: Vec<Vec<SparseVector>>,
}

impl SpanTable {
    pub fn build(featurizer: &SegmentFeaturizer, feats: &[FeatureVector], max_length: usize) -> Self {
        let n = feats.len();
        let rows = (0..n)
            .map(|start| {
                (1..=max_length.min(n - start))
                    .map(|len| featurizer.span(feats, start, start + len))
                    .collect()
            })
            .collect();
        Self { max_length, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Features of `[start, start + len)`; `None` outside the table
    pub fn get(&self, start: usize, len: usize) -> Option<&SparseVector> {
        len.checked_sub(1)
            .and_then(|l| self.rows.get(start).and_then(|row| row.get(l)))
    }
}
