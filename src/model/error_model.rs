//! Sequencing-error model used to weigh the alignments of ambiguous reads.
//!
//! The model is trained on uniquely-mapping reads (`update`, then `finish`)
//! and afterwards yields, for each alignment of a read, the probability that
//! the read originated there given its sequence.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::io::alignments::AlignmentGroup;

/// Learns from unique reads and scores the alignments of ambiguous ones.
pub trait ReadErrorModel {
    /// Learn from a uniquely-mapping read.
    fn update(&mut self, group: &AlignmentGroup);

    /// Turn accumulated counts into probabilities. Called once, after all updates.
    fn finish(&mut self);

    /// Per-alignment conditional probabilities, normalized to sum to 1 over
    /// the group. `out.len()` must equal `group.len()`.
    fn conditional_probs(&self, group: &AlignmentGroup, out: &mut [f64]);
}

// ---------------------------------------------------------------------------
// MismatchModel
// ---------------------------------------------------------------------------

/// Error model over the number of mismatches per alignment.
///
/// Mismatch counts above `max_mismatches` share the last bin. Probabilities
/// carry a pseudocount of one per bin so unseen counts are not impossible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MismatchModel {
    max_mismatches: u32,
    counts: Vec<u64>,
    probs: Vec<f64>,
    finished: bool,
}

impl MismatchModel {
    pub fn new(max_mismatches: u32) -> Self {
        let bins = max_mismatches as usize + 1;
        Self {
            max_mismatches,
            counts: vec![0; bins],
            probs: vec![1.0 / bins as f64; bins],
            finished: false,
        }
    }

    #[inline]
    fn bin(&self, mismatches: u32) -> usize {
        mismatches.min(self.max_mismatches) as usize
    }

    /// Probability of observing `mismatches` in a correctly placed read.
    pub fn prob(&self, mismatches: u32) -> f64 {
        self.probs[self.bin(mismatches)]
    }

    /// Number of unique reads the model has learned from.
    pub fn num_observations(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

impl ReadErrorModel for MismatchModel {
    fn update(&mut self, group: &AlignmentGroup) {
        if let Some(aln) = group.alignments().first() {
            let bin = self.bin(aln.mismatches);
            self.counts[bin] += 1;
        }
    }

    fn finish(&mut self) {
        let total = self.num_observations() as f64 + self.counts.len() as f64;
        self.probs = self
            .counts
            .iter()
            .map(|&c| (c as f64 + 1.0) / total)
            .collect();
        self.finished = true;
    }

    fn conditional_probs(&self, group: &AlignmentGroup, out: &mut [f64]) {
        debug_assert_eq!(out.len(), group.len());
        let mut sum = 0.0;
        for (slot, aln) in out.iter_mut().zip(group.alignments()) {
            *slot = self.prob(aln.mismatches);
            sum += *slot;
        }
        if sum > 0.0 {
            out.iter_mut().for_each(|p| *p /= sum);
        } else if !out.is_empty() {
            let uniform = 1.0 / out.len() as f64;
            out.iter_mut().for_each(|p| *p = uniform);
        }
    }
}
