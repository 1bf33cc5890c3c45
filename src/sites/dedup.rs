//! Collapsing of ambiguous reads that share an identical ambiguity pattern.
//!
//! Every distinct pattern (ordered list of candidate sites with their
//! conditional probabilities rounded to one decimal) owns one contiguous slice
//! of the shared fraction buffer. Repeats of a pattern only bump the owning
//! record's multiplicity, so EM cost scales with distinct patterns rather than
//! raw read count.

use ahash::AHashMap;

use super::key::SiteKey;
use super::position_index::PositionIndex;

/// One distinct ambiguity pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmbiguousRead {
    /// First cell of this record's slice in the fraction buffer.
    pub offset: usize,
    /// Number of candidate alignments.
    pub size: usize,
    /// Number of reads sharing the pattern.
    pub multiplicity: u32,
}

impl AmbiguousRead {
    #[inline]
    pub fn cells(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Deduplicated ambiguous reads, ready for the EM.
#[derive(Debug, Clone, Default)]
pub struct AmbiguousPool {
    pub reads: Vec<AmbiguousRead>,
    /// Conditional probability of each cell, fixed for the whole EM.
    pub conprbs: Vec<f64>,
    /// Ambiguous reads seen before deduplication.
    pub num_input_reads: u64,
}

impl AmbiguousPool {
    #[inline]
    pub fn num_cells(&self) -> usize {
        self.conprbs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }
}

/// Quantized signature element: site plus probability in tenths.
type SignatureItem = (SiteKey, u8);

#[inline]
fn quantize(p: f64) -> u8 {
    (p.clamp(0.0, 1.0) * 10.0 + 0.5) as u8
}

/// Builds an [`AmbiguousPool`] while registering cells in a [`PositionIndex`].
#[derive(Debug, Default)]
pub struct AmbiguousReadDeduplicator {
    signatures: AHashMap<Vec<SignatureItem>, usize>,
    pool: AmbiguousPool,
    scratch: Vec<SignatureItem>,
}

impl AmbiguousReadDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one ambiguous read given as `(site, conditional probability)` pairs.
    ///
    /// Returns `true` if the read introduced a new pattern.
    pub fn add(&mut self, index: &mut PositionIndex, candidates: &[(SiteKey, f64)]) -> bool {
        debug_assert!(!candidates.is_empty());
        self.pool.num_input_reads += 1;

        self.scratch.clear();
        self.scratch
            .extend(candidates.iter().map(|&(site, p)| (site, quantize(p))));

        if let Some(&rec) = self.signatures.get(&self.scratch) {
            self.pool.reads[rec].multiplicity += 1;
            return false;
        }

        let offset = self.pool.conprbs.len();
        for (i, &(site, p)) in candidates.iter().enumerate() {
            self.pool.conprbs.push(p);
            index.get_or_create(site).add_cell(offset + i);
        }
        self.signatures
            .insert(self.scratch.clone(), self.pool.reads.len());
        self.pool.reads.push(AmbiguousRead {
            offset,
            size: candidates.len(),
            multiplicity: 1,
        });
        true
    }

    pub fn num_records(&self) -> usize {
        self.pool.reads.len()
    }

    pub fn finish(self) -> AmbiguousPool {
        self.pool
    }
}
