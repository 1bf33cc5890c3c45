//! Fragment-length configuration shared by every transcript model.
//!
//! The primer length and the size-selection window are properties of the
//! library preparation, not of any single transcript, so they are validated
//! once and handed to each `TranscriptModel` behind an `Arc`. There is no
//! setter: a model always sees the bounds it was constructed with.

use anyhow::{Result, bail};

/// Immutable primer / fragment-length bounds.
///
/// `min_frag_len` and `max_frag_len` exclude the primer; the
/// `*_fragment_length()` accessors report the observable lengths that include it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentConfig {
    primer_length: usize,
    min_frag_len: usize,
    max_frag_len: usize,
}

impl FragmentConfig {
    /// Validate and build a configuration.
    pub fn new(primer_length: usize, min_frag_len: usize, max_frag_len: usize) -> Result<Self> {
        if min_frag_len == 0 {
            bail!("minimum fragment length (primer excluded) must be at least 1");
        }
        if min_frag_len > max_frag_len {
            bail!(
                "minimum fragment length ({}) exceeds maximum fragment length ({})",
                min_frag_len,
                max_frag_len
            );
        }
        Ok(Self {
            primer_length,
            min_frag_len,
            max_frag_len,
        })
    }

    #[inline]
    pub fn primer_length(&self) -> usize {
        self.primer_length
    }

    /// Minimum fragment length, primer excluded.
    #[inline]
    pub fn min_frag_len(&self) -> usize {
        self.min_frag_len
    }

    /// Maximum fragment length, primer excluded.
    #[inline]
    pub fn max_frag_len(&self) -> usize {
        self.max_frag_len
    }

    /// Minimum observable fragment length (primer included).
    #[inline]
    pub fn minimum_fragment_length(&self) -> usize {
        self.min_frag_len + self.primer_length
    }

    /// Maximum observable fragment length (primer included).
    #[inline]
    pub fn maximum_fragment_length(&self) -> usize {
        self.max_frag_len + self.primer_length
    }
}
