//! Ordered map from genomic site to aggregated read evidence.
//!
//! The index is filled by one streaming pass (unique counts, then ambiguous
//! back-references) and then frozen. A [`FrozenIndex`] exposes no way to add
//! or remove sites, so the site order seen by window layout and partitioning
//! cannot change underneath the EM.

use std::collections::BTreeMap;

use super::key::SiteKey;

// ---------------------------------------------------------------------------
// SiteValue
// ---------------------------------------------------------------------------

/// Evidence aggregated at one site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteValue {
    /// Number of uniquely-mapping reads at this site.
    pub unique: u32,
    /// Expected read count from ambiguous reads.
    pub weight: f64,
    /// Indices into the shared fraction buffer, one per ambiguous alignment
    /// landing here.
    cells: Vec<usize>,
}

impl SiteValue {
    #[inline]
    pub fn cells(&self) -> &[usize] {
        &self.cells
    }

    /// Whether any ambiguous read has an alignment at this site.
    #[inline]
    pub fn is_ambiguous(&self) -> bool {
        !self.cells.is_empty()
    }

    #[inline]
    pub(crate) fn add_cell(&mut self, cell: usize) {
        self.cells.push(cell);
    }

    /// Sum of the current fractions of every alignment at this site.
    #[inline]
    pub fn collect(&self, fracs: &[f64]) -> f64 {
        self.cells.iter().map(|&c| fracs[c]).sum()
    }
}

// ---------------------------------------------------------------------------
// PositionIndex
// ---------------------------------------------------------------------------

/// Mutable, ordered site map used while reads are being streamed in.
#[derive(Debug, Default)]
pub struct PositionIndex {
    map: BTreeMap<SiteKey, SiteValue>,
}

impl PositionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the value at `key`, created with zero counts on first access.
    pub fn get_or_create(&mut self, key: SiteKey) -> &mut SiteValue {
        self.map.entry(key).or_default()
    }

    /// Record one uniquely-mapping read at `key`.
    pub fn add_unique(&mut self, key: SiteKey) {
        self.get_or_create(key).unique += 1;
    }

    pub fn get(&self, key: &SiteKey) -> Option<&SiteValue> {
        self.map.get(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sites in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&SiteKey, &SiteValue)> {
        self.map.iter()
    }

    /// Fix the site set and order.
    pub fn freeze(self) -> FrozenIndex {
        let (keys, values) = self.map.into_iter().unzip();
        FrozenIndex { keys, values }
    }
}

// ---------------------------------------------------------------------------
// FrozenIndex
// ---------------------------------------------------------------------------

/// Sites in key order, addressable by rank. Only counts and weights can change.
#[derive(Debug, Clone)]
pub struct FrozenIndex {
    keys: Vec<SiteKey>,
    values: Vec<SiteValue>,
}

impl FrozenIndex {
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[inline]
    pub fn keys(&self) -> &[SiteKey] {
        &self.keys
    }

    #[inline]
    pub fn values(&self) -> &[SiteValue] {
        &self.values
    }

    #[inline]
    pub fn key(&self, rank: usize) -> &SiteKey {
        &self.keys[rank]
    }

    #[inline]
    pub fn value(&self, rank: usize) -> &SiteValue {
        &self.values[rank]
    }

    #[inline]
    pub fn set_weight(&mut self, rank: usize, weight: f64) {
        self.values[rank].weight = weight;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteKey, &SiteValue)> {
        self.keys.iter().zip(self.values.iter())
    }

    /// Total number of ambiguous-alignment cells across all sites.
    pub fn num_cells(&self) -> usize {
        self.values.iter().map(|v| v.cells.len()).sum()
    }
}
