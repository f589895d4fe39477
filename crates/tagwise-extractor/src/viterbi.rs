//! Semi-Markov Viterbi decoding
//!
//! A sentence is segmented into `outside` tokens and entity segments of
//! `1..=max_length` tokens, each labelled with a tag. The score of a
//! segmentation is the sum of segment emission scores, label transition
//! scores and a per-tag length prior. All parameters live in one flat
//! weight vector described by [`WeightLayout`].

use ndarray::Array1;

use crate::segment::SpanTable;

/// Positions of every parameter block in the flat weight vector
///
/// ```text
/// [ emission: (tags + 1) * segment_dim ]   label `tags` is outside
/// [ transition: (tags + 2) * (tags + 1) ]  previous label `tags + 1` is START
/// [ length prior: tags * max_length ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightLayout {
    pub num_tags: usize,
    pub segment_dimension: usize,
    pub max_length: usize,
}

impl WeightLayout {
    pub fn new(num_tags: usize, segment_dimension: usize, max_length: usize) -> Self {
        Self {
            num_tags,
            segment_dimension,
            max_length,
        }
    }

    pub fn outside(&self) -> usize {
        self.num_tags
    }

    pub fn start(&self) -> usize {
        self.num_tags + 1
    }

    pub fn emission_offset(&self, label: usize) -> usize {
        label * self.segment_dimension
    }

    pub fn transition_index(&self, prev: usize, next: usize) -> usize {
        (self.num_tags + 1) * self.segment_dimension + prev * (self.num_tags + 1) + next
    }

    pub fn length_index(&self, tag: usize, len: usize) -> usize {
        (self.num_tags + 1) * self.segment_dimension
            + (self.num_tags + 2) * (self.num_tags + 1)
            + tag * self.max_length
            + (len - 1)
    }

    pub fn dimension(&self) -> usize {
        (self.num_tags + 1) * self.segment_dimension
            + (self.num_tags + 2) * (self.num_tags + 1)
            + self.num_tags * self.max_length
    }
}

/// One piece of a segmentation; `label == layout.outside()` means outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    pub start: usize,
    pub len: usize,
    pub label: usize,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Emission scores of every candidate segment in one sentence
pub struct Lattice {
    layout: WeightLayout,
    n: usize,
    scores: Vec<f64>,
}

impl Lattice {
    pub fn build(layout: WeightLayout, weights: &Array1<f64>, table: &SpanTable) -> Self {
        let n = table.len();
        let labels = layout.num_tags + 1;
        let mut scores = vec![f64::NEG_INFINITY; n * layout.max_length * labels];

        for start in 0..n {
            for len in 1..=layout.max_length.min(n - start) {
                let Some(features) = table.get(start, len) else {
                    continue;
                };
                let base = (start * layout.max_length + len - 1) * labels;
                for tag in 0..layout.num_tags {
                    scores[base + tag] = features.dot(weights, layout.emission_offset(tag))
                        + weights[layout.length_index(tag, len)];
                }
                if len == 1 {
                    scores[base + layout.outside()] =
                        features.dot(weights, layout.emission_offset(layout.outside()));
                }
            }
        }

        Self { layout, n, scores }
    }

    fn slot(&self, start: usize, len: usize, label: usize) -> usize {
        (start * self.layout.max_length + len - 1) * (self.layout.num_tags + 1) + label
    }

    pub fn emission(&self, start: usize, len: usize, label: usize) -> f64 {
        self.scores[self.slot(start, len, label)]
    }

    /// Add loss to every segment that disagrees with `gold`
    ///
    /// An entity segment missing from `gold` is a false alarm and costs
    /// `margin` per token. An outside token covered by a gold entity is a
    /// miss and costs `margin * beta^2`, the recall weight of an F-beta
    /// score.
    pub fn add_loss(&mut self, gold: &[Segment], margin: f64, beta: f64) {
        let outside = self.layout.outside();
        let mut covered = vec![false; self.n];
        for seg in gold.iter().filter(|s| s.label != outside) {
            covered[seg.start..seg.end()].iter_mut().for_each(|c| *c = true);
        }

        for start in 0..self.n {
            for len in 1..=self.layout.max_length.min(self.n - start) {
                for tag in 0..self.layout.num_tags {
                    let candidate = Segment {
                        start,
                        len,
                        label: tag,
                    };
                    if !gold.contains(&candidate) {
                        let slot = self.slot(start, len, tag);
                        self.scores[slot] += margin * len as f64;
                    }
                }
            }
            if covered[start] {
                let slot = self.slot(start, 1, outside);
                self.scores[slot] += margin * beta * beta;
            }
        }
    }

    /// Margin of `seg` over its best single-label alternative
    ///
    /// The alternatives are every other tag on the same span and labelling
    /// each of its tokens outside.
    pub fn confidence(&self, seg: &Segment) -> f64 {
        let chosen = self.emission(seg.start, seg.len, seg.label);
        let best_other_tag = (0..self.layout.num_tags)
            .filter(|&t| t != seg.label)
            .map(|t| self.emission(seg.start, seg.len, t))
            .fold(f64::NEG_INFINITY, f64::max);
        let all_outside: f64 = (seg.start..seg.end())
            .map(|i| self.emission(i, 1, self.layout.outside()))
            .sum();
        chosen - best_other_tag.max(all_outside)
    }
}

/// Candidate `(len, label)` pairs for a segment starting at `start`, in
/// tie-break order: entity spans shortest first, lower tag first, then
/// outside
fn candidates(layout: WeightLayout, start: usize, n: usize) -> impl Iterator<Item = (usize, usize)> {
    let longest = layout.max_length.min(n - start);
    (1..=longest)
        .flat_map(move |len| (0..layout.num_tags).map(move |tag| (len, tag)))
        .chain(std::iter::once((1, layout.outside())))
}

/// Highest-scoring segmentation of the sentence behind `lattice`
///
/// Scores are computed right to left, so every position knows the best
/// completion of the sentence from there. Decoding then walks left to
/// right and keeps the first candidate that reaches the optimum. Among
/// equal-scoring segmentations the one whose entity spans start earliest
/// wins, then the one with the shorter span at that start, then the lower
/// tag.
pub fn viterbi(layout: WeightLayout, weights: &Array1<f64>, lattice: &Lattice) -> Vec<Segment> {
    let n = lattice.n;
    if n == 0 {
        return Vec::new();
    }
    let states = layout.num_tags + 2;

    // suffix[pos * states + prev]: best score of tokens pos.. after label prev
    let mut suffix = vec![f64::NEG_INFINITY; (n + 1) * states];
    suffix[n * states..].iter_mut().for_each(|s| *s = 0.0);

    let step = |suffix: &[f64], start: usize, prev: usize, len: usize, label: usize| -> f64 {
        let emission = lattice.emission(start, len, label);
        let rest = suffix[(start + len) * states + label];
        if emission == f64::NEG_INFINITY || rest == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        weights[layout.transition_index(prev, label)] + emission + rest
    };

    for start in (0..n).rev() {
        for prev in 0..states {
            let best = candidates(layout, start, n)
                .map(|(len, label)| step(&suffix, start, prev, len, label))
                .fold(f64::NEG_INFINITY, f64::max);
            suffix[start * states + prev] = best;
        }
    }

    let mut segments = Vec::new();
    let mut start = 0;
    let mut prev = layout.start();
    while start < n {
        let target = suffix[start * states + prev];
        let Some((len, label)) = candidates(layout, start, n)
            .find(|&(len, label)| step(&suffix, start, prev, len, label) >= target)
        else {
            break;
        };
        segments.push(Segment { start, len, label });
        start += len;
        prev = label;
    }
    segments
}

/// `weights += scale * phi(segments)`, the joint feature map of a segmentation
pub fn accumulate(
    layout: WeightLayout,
    segments: &[Segment],
    table: &SpanTable,
    weights: &mut Array1<f64>,
    scale: f64,
) {
    let mut prev = layout.start();
    for seg in segments {
        if let Some(features) = table.get(seg.start, seg.len) {
            features.add_to(weights, layout.emission_offset(seg.label), scale);
        }
        if seg.label != layout.outside() {
            weights[layout.length_index(seg.label, seg.len)] += scale;
        }
        weights[layout.transition_index(prev, seg.label)] += scale;
        prev = seg.label;
    }
}

/// Expand entity spans into a full segmentation with outside tokens
///
/// `entities` must be sorted and non-overlapping.
pub fn gold_segmentation(layout: WeightLayout, n: usize, entities: &[Segment]) -> Vec<Segment> {
    let mut segments = Vec::with_capacity(n);
    let mut pos = 0;
    for entity in entities {
        while pos < entity.start {
            segments.push(Segment {
                start: pos,
                len: 1,
                label: layout.outside(),
            });
            pos += 1;
        }
        segments.push(*entity);
        pos = entity.end();
    }
    while pos < n {
        segments.push(Segment {
            start: pos,
            len: 1,
            label: layout.outside(),
        });
        pos += 1;
    }
    segments
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentFeaturizer;
    use crate::testing::{sample_extractor, words};

    fn setup(sentence: &[&str]) -> (WeightLayout, SpanTable) {
        let fe = sample_extractor();
        let feats = fe.extract(&words(sentence));
        let featurizer = SegmentFeaturizer::new(1 << 10, fe.num_dimensions());
        let layout = WeightLayout::new(2, featurizer.dimension(), 3);
        (layout, SpanTable::build(&featurizer, &feats, 3))
    }

    #[test]
    fn test_layout_blocks_are_disjoint() {
        let layout = WeightLayout::new(2, 10, 3);
        assert_eq!(layout.emission_offset(2), 20);
        assert_eq!(layout.transition_index(0, 0), 30);
        assert_eq!(layout.transition_index(3, 2), 30 + 11);
        assert_eq!(layout.length_index(0, 1), 42);
        assert_eq!(layout.length_index(1, 3), 47);
        assert_eq!(layout.dimension(), 48);
    }

    #[test]
    fn test_zero_weights_tie_break_is_stable() {
        let (layout, table) = setup(&["a", "b", "c"]);
        let weights = Array1::zeros(layout.dimension());
        let lattice = Lattice::build(layout, &weights, &table);

        let first = viterbi(layout, &weights, &lattice);
        let second = viterbi(layout, &weights, &lattice);
        assert_eq!(first, second);
        // Every segmentation scores zero: spans start as early as possible
        // and stay as short as possible
        let expected: Vec<_> = (0..3).map(|start| Segment { start, len: 1, label: 0 }).collect();
        assert_eq!(first, expected);
    }

    #[test]
    fn test_tie_prefers_shorter_span_at_earliest_start() {
        let fe = sample_extractor();
        let feats = fe.extract(&words(&["a", "b"]));
        let featurizer = SegmentFeaturizer::new(1 << 10, fe.num_dimensions());
        let layout = WeightLayout::new(1, featurizer.dimension(), 2);
        let table = SpanTable::build(&featurizer, &feats, 2);
        let weights = Array1::zeros(layout.dimension());
        let lattice = Lattice::build(layout, &weights, &table);

        let decoded = viterbi(layout, &weights, &lattice);
        assert_eq!(decoded[0], Segment { start: 0, len: 1, label: 0 });
        assert_eq!(decoded.iter().map(|s| s.len).sum::<usize>(), 2);
    }

    fn pseudo_random_weights(dim: usize) -> Array1<f64> {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        Array1::from_shape_fn(dim, |_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 2001) as f64 / 1000.0 - 1.0
        })
    }

    fn all_segmentations(layout: WeightLayout, n: usize, pos: usize) -> Vec<Vec<Segment>> {
        if pos == n {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for label in 0..=layout.num_tags {
            let max_len = if label == layout.outside() { 1 } else { layout.max_length };
            for len in 1..=max_len.min(n - pos) {
                for mut rest in all_segmentations(layout, n, pos + len) {
                    rest.insert(0, Segment { start: pos, len, label });
                    out.push(rest);
                }
            }
        }
        out
    }

    fn score(layout: WeightLayout, table: &SpanTable, weights: &Array1<f64>, segs: &[Segment]) -> f64 {
        let mut phi = Array1::zeros(layout.dimension());
        accumulate(layout, segs, table, &mut phi, 1.0);
        phi.dot(weights)
    }

    #[test]
    fn test_viterbi_matches_brute_force() {
        let (layout, table) = setup(&["Davis", "King", "from", "CMU"]);
        let weights = pseudo_random_weights(layout.dimension());
        let lattice = Lattice::build(layout, &weights, &table);

        let decoded = viterbi(layout, &weights, &lattice);
        let decoded_score = score(layout, &table, &weights, &decoded);
        let best = all_segmentations(layout, 4, 0)
            .iter()
            .map(|segs| score(layout, &table, &weights, segs))
            .fold(f64::NEG_INFINITY, f64::max);

        assert!((decoded_score - best).abs() < 1e-9);
        assert_eq!(decoded.iter().map(|s| s.len).sum::<usize>(), 4);
    }

    #[test]
    fn test_gold_segmentation_fills_outside() {
        let layout = WeightLayout::new(2, 10, 3);
        let gold = gold_segmentation(layout, 5, &[Segment { start: 3, len: 2, label: 1 }]);
        assert_eq!(gold.len(), 4);
        assert!(gold[..3].iter().all(|s| s.label == layout.outside() && s.len == 1));
        assert_eq!(gold[3], Segment { start: 3, len: 2, label: 1 });
    }

    #[test]
    fn test_loss_augmentation_penalizes_gold() {
        let (layout, table) = setup(&["Davis", "King"]);
        let gold = vec![Segment {
            start: 0,
            len: 2,
            label: 0,
        }];
        let weights = Array1::zeros(layout.dimension());
        let mut lattice = Lattice::build(layout, &weights, &table);
        lattice.add_loss(&gold, 1.0, 1.0);

        assert_eq!(lattice.emission(0, 2, 0), 0.0);
        assert_eq!(lattice.emission(0, 2, 1), 2.0);
        assert_eq!(lattice.emission(0, 1, layout.outside()), 1.0);
        // Loss-augmented decoding prefers a wrong segmentation at zero weights
        assert_ne!(viterbi(layout, &weights, &lattice), gold);
    }

    #[test]
    fn test_beta_weighs_misses_against_false_alarms() {
        let (layout, table) = setup(&["Davis", "King", "said"]);
        let gold = vec![
            Segment { start: 0, len: 2, label: 0 },
            Segment { start: 2, len: 1, label: layout.outside() },
        ];
        let weights = Array1::zeros(layout.dimension());
        let mut lattice = Lattice::build(layout, &weights, &table);
        lattice.add_loss(&gold, 2.0, 0.5);

        // Misses cost margin * beta^2, false alarms margin per token
        assert_eq!(lattice.emission(0, 1, layout.outside()), 0.5);
        assert_eq!(lattice.emission(2, 1, layout.outside()), 0.0);
        assert_eq!(lattice.emission(1, 2, 1), 4.0);
        assert_eq!(lattice.emission(0, 2, 0), 0.0);
    }

    #[test]
    fn test_confidence_margin() {
        let (layout, table) = setup(&["MIT"]);
        let mut weights = Array1::zeros(layout.dimension());
        weights[layout.length_index(1, 1)] = 3.0;
        weights[layout.length_index(0, 1)] = 1.0;
        let lattice = Lattice::build(layout, &weights, &table);

        let seg = Segment {
            start: 0,
            len: 1,
            label: 1,
        };
        assert!((lattice.confidence(&seg) - 2.0).abs() < 1e-12);
    }
}
