//! Genomic site keys and the window comparator.

use std::fmt;

use anyhow::{Result, bail};

/// Strand of an alignment. Forward sorts before reverse (`+` < `-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    #[inline]
    pub fn as_char(self) -> char {
        match self {
            Strand::Forward => '+',
            Strand::Reverse => '-',
        }
    }

    pub fn from_char(c: char) -> Result<Self> {
        match c {
            '+' => Ok(Strand::Forward),
            '-' => Ok(Strand::Reverse),
            other => bail!("invalid strand '{}', expected '+' or '-'", other),
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A position on one strand of one contig.
///
/// The derived ordering is contig, then strand, then position, which is the
/// order the position index iterates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteKey {
    pub contig: u32,
    pub strand: Strand,
    pub pos: u32,
}

impl SiteKey {
    #[inline]
    pub fn new(contig: u32, strand: Strand, pos: u32) -> Self {
        Self { contig, strand, pos }
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.contig, self.strand, self.pos)
    }
}

/// Signed distance from `b` to `a`, clamped to `[-(w+1), w+1]`.
///
/// Sites on different contigs or strands are always `w + 1` apart, with the
/// sign following key order. `|d| <= w` means `a` lies inside the window of
/// radius `w` centred on `b`.
#[inline]
pub fn window_distance(a: &SiteKey, b: &SiteKey, w: u32) -> i64 {
    let out = w as i64 + 1;
    if a.contig != b.contig || a.strand != b.strand {
        return if (a.contig, a.strand) < (b.contig, b.strand) { -out } else { out };
    }
    (a.pos as i64 - b.pos as i64).clamp(-out, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order() {
        let a = SiteKey::new(0, Strand::Reverse, 5);
        let b = SiteKey::new(1, Strand::Forward, 0);
        let c = SiteKey::new(1, Strand::Forward, 3);
        let d = SiteKey::new(1, Strand::Reverse, 0);
        let mut keys = vec![d, c, b, a];
        keys.sort();
        assert_eq!(keys, vec![a, b, c, d]);
    }

    #[test]
    fn test_window_distance() {
        let w = 10;
        let base = SiteKey::new(2, Strand::Forward, 100);
        assert_eq!(window_distance(&SiteKey::new(2, Strand::Forward, 95), &base, w), -5);
        assert_eq!(window_distance(&SiteKey::new(2, Strand::Forward, 110), &base, w), 10);
        assert_eq!(window_distance(&SiteKey::new(2, Strand::Forward, 500), &base, w), 11);
        assert_eq!(window_distance(&SiteKey::new(2, Strand::Forward, 0), &base, w), -11);
        assert_eq!(window_distance(&SiteKey::new(2, Strand::Reverse, 100), &base, w), 11);
        assert_eq!(window_distance(&SiteKey::new(1, Strand::Reverse, 100), &base, w), -11);
        assert_eq!(window_distance(&SiteKey::new(3, Strand::Forward, 100), &base, w), 11);
    }

    #[test]
    fn test_strand_chars() {
        assert_eq!(Strand::from_char('+').unwrap(), Strand::Forward);
        assert_eq!(Strand::from_char('-').unwrap().as_char(), '-');
        assert!(Strand::from_char('.').is_err());
    }
}
