//! Window metadata and balanced work partitioning for the EM.
//!
//! Two partitions are built once, before the first round:
//!
//! - **E-step**: contiguous ranges of ambiguous-read records, weighted by the
//!   number of alignments per record.
//! - **MS-step**: contiguous ranges of ambiguous sites, weighted by the number
//!   of cells per site. Cuts are only placed after a site whose smoothing
//!   window ends at the site itself, so a thread never touches a site outside
//!   its range while sliding its window.
//!
//! Both use the same greedy: each thread has a quota (an even share of the
//! total, remainder to the earliest threads), takes units until the quota is
//! met, and gives back the last unit if that lands closer to the ideal cut.
//! The resulting ranges are wrapped in [`ThreadRange`] tokens that can only be
//! obtained from a validated [`WorkPlan`].

use std::ops::Range;

use crate::sites::dedup::AmbiguousPool;
use crate::sites::key::window_distance;
use crate::sites::position_index::FrozenIndex;

// ---------------------------------------------------------------------------
// Window layout
// ---------------------------------------------------------------------------

/// A site with at least one ambiguous cell, plus its smoothing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmbiguousSite {
    /// Rank of the site in the frozen index.
    pub rank: usize,
    /// First ambiguous site inside the window.
    pub left: usize,
    /// One past the last ambiguous site inside the window.
    pub end: usize,
    /// Unique reads at all sites inside the window.
    pub unique_in_window: u64,
}

impl AmbiguousSite {
    /// Whether the window reaches no further right than the site itself.
    #[inline]
    fn closes_block(&self, own: usize) -> bool {
        self.end == own + 1
    }
}

/// Ambiguous sites in key order with their window metadata.
#[derive(Debug, Clone, Default)]
pub struct SiteLayout {
    sites: Vec<AmbiguousSite>,
}

impl SiteLayout {
    /// Sweep the index once with two monotone pointers bounding
    /// `[pos - w, pos + w]` around each ambiguous site.
    pub fn build(index: &FrozenIndex, w: u32) -> Self {
        let keys = index.keys();
        let values = index.values();
        let n = keys.len();
        let w_i = w as i64;

        let mut sites = Vec::new();
        // lb..ub bounds the window over all sites; the ambiguous counters hold
        // how many ambiguous sites precede each pointer.
        let (mut lb, mut ub) = (0usize, 0usize);
        let (mut amb_before_lb, mut amb_before_ub) = (0usize, 0usize);
        let mut sumc: u64 = 0;

        for (rank, value) in values.iter().enumerate() {
            if !value.is_ambiguous() {
                continue;
            }
            let key = &keys[rank];
            while lb < ub && window_distance(&keys[lb], key, w) < -w_i {
                sumc -= values[lb].unique as u64;
                if values[lb].is_ambiguous() {
                    amb_before_lb += 1;
                }
                lb += 1;
            }
            if lb == ub {
                // Window emptied: skip the gap without touching sumc.
                while window_distance(&keys[lb], key, w) < -w_i {
                    if values[lb].is_ambiguous() {
                        amb_before_lb += 1;
                    }
                    lb += 1;
                }
                ub = lb;
                amb_before_ub = amb_before_lb;
            }
            while ub < n && window_distance(&keys[ub], key, w) <= w_i {
                sumc += values[ub].unique as u64;
                if values[ub].is_ambiguous() {
                    amb_before_ub += 1;
                }
                ub += 1;
            }
            sites.push(AmbiguousSite {
                rank,
                left: amb_before_lb,
                end: amb_before_ub,
                unique_in_window: sumc,
            });
        }
        Self { sites }
    }

    #[inline]
    pub fn sites(&self) -> &[AmbiguousSite] {
        &self.sites
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Greedy partition
// ---------------------------------------------------------------------------

/// Split `costs` into `num_threads` contiguous ranges of near-equal total cost.
///
/// Ranges are exhaustive and in order; trailing ranges may be empty when there
/// are fewer units than threads.
pub fn balanced_ranges(costs: &[usize], num_threads: usize) -> Vec<Range<usize>> {
    assert!(num_threads > 0, "partition needs at least one thread");
    let n = costs.len();
    let total: usize = costs.iter().sum();
    let quo = total / num_threads;
    let res = total % num_threads;

    // Cost that should remain unassigned after thread i.
    let mut remaining_after = Vec::with_capacity(num_threads);
    let mut left = total;
    for i in 0..num_threads {
        left -= quo + usize::from(i < res);
        remaining_after.push(left);
    }

    let mut ranges = Vec::with_capacity(num_threads);
    let mut cp = 0;
    let mut left = total;
    for &target in &remaining_after {
        let sp = cp;
        while cp < n && left > target {
            left -= costs[cp];
            cp += 1;
        }
        if cp > sp + 1 && (left + costs[cp - 1] - target) < (target - left) {
            cp -= 1;
            left += costs[cp];
        } else if cp == sp && cp < n {
            left -= costs[cp];
            cp += 1;
        }
        ranges.push(sp..cp);
    }
    ranges
}

// ---------------------------------------------------------------------------
// WorkPlan
// ---------------------------------------------------------------------------

/// The slices of shared state one worker owns during a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRange {
    reads: Range<usize>,
    cells: Range<usize>,
    sites: Range<usize>,
}

impl ThreadRange {
    /// Ambiguous-read records handled in the E-step.
    #[inline]
    pub fn reads(&self) -> Range<usize> {
        self.reads.clone()
    }

    /// Cells written in the E-step; exactly the cells of `reads`.
    #[inline]
    pub fn cells(&self) -> Range<usize> {
        self.cells.clone()
    }

    /// Ambiguous sites handled in the MS-step.
    #[inline]
    pub fn sites(&self) -> Range<usize> {
        self.sites.clone()
    }
}

/// Validated per-thread ranges for both phases.
#[derive(Debug, Clone)]
pub struct WorkPlan {
    ranges: Vec<ThreadRange>,
}

impl WorkPlan {
    pub fn new(
        pool: &AmbiguousPool,
        layout: &SiteLayout,
        index: &FrozenIndex,
        num_threads: usize,
    ) -> Self {
        let read_costs: Vec<usize> = pool.reads.iter().map(|r| r.size).collect();
        let read_ranges = balanced_ranges(&read_costs, num_threads);

        // Group sites into blocks that may not be split.
        let mut block_starts = vec![0usize];
        let mut block_costs = Vec::new();
        let mut cost = 0;
        for (i, site) in layout.sites().iter().enumerate() {
            cost += index.value(site.rank).cells().len();
            if site.closes_block(i) {
                block_costs.push(cost);
                block_starts.push(i + 1);
                cost = 0;
            }
        }
        assert_eq!(
            block_starts[block_starts.len() - 1],
            layout.len(),
            "last ambiguous site must close its window block"
        );
        let block_ranges = balanced_ranges(&block_costs, num_threads);

        let num_cells = pool.num_cells();
        let cell_at = |read: usize| {
            pool.reads
                .get(read)
                .map_or(num_cells, |r| r.offset)
        };

        let ranges = read_ranges
            .into_iter()
            .zip(block_ranges)
            .map(|(reads, blocks)| ThreadRange {
                cells: cell_at(reads.start)..cell_at(reads.end),
                reads,
                sites: block_starts[blocks.start]..block_starts[blocks.end],
            })
            .collect();

        let plan = Self { ranges };
        plan.validate(pool, layout);
        plan
    }

    /// Check disjointness, coverage and window self-containment.
    fn validate(&self, pool: &AmbiguousPool, layout: &SiteLayout) {
        let (mut read, mut cell, mut site) = (0, 0, 0);
        for (t, range) in self.ranges.iter().enumerate() {
            assert_eq!(range.reads.start, read, "thread {} read range not contiguous", t);
            assert_eq!(range.cells.start, cell, "thread {} cell range not contiguous", t);
            assert_eq!(range.sites.start, site, "thread {} site range not contiguous", t);
            for s in range.sites() {
                let info = &layout.sites()[s];
                assert!(
                    info.left >= range.sites.start && info.end <= range.sites.end,
                    "window of site {} ({}..{}) crosses thread {} range {:?}",
                    s,
                    info.left,
                    info.end,
                    t,
                    range.sites
                );
            }
            read = range.reads.end;
            cell = range.cells.end;
            site = range.sites.end;
        }
        assert_eq!(read, pool.reads.len(), "read records not fully covered");
        assert_eq!(cell, pool.num_cells(), "cells not fully covered");
        assert_eq!(site, layout.len(), "ambiguous sites not fully covered");
    }

    #[inline]
    pub fn ranges(&self) -> &[ThreadRange] {
        &self.ranges
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.ranges.len()
    }
}

/// Split `data` into one mutable chunk per range. Ranges must tile `data`
/// from the start, in order.
pub fn split_ranges_mut<T, I>(mut data: &mut [T], ranges: I) -> Vec<&mut [T]>
where
    I: IntoIterator<Item = Range<usize>>,
{
    let mut chunks = Vec::new();
    let mut pos = 0;
    for range in ranges {
        assert_eq!(range.start, pos, "ranges must be contiguous");
        let (head, tail) = std::mem::take(&mut data).split_at_mut(range.len());
        chunks.push(head);
        data = tail;
        pos = range.end;
    }
    assert!(data.is_empty(), "ranges must cover the whole slice");
    chunks
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::sites::dedup::AmbiguousReadDeduplicator;
    use crate::sites::key::{SiteKey, Strand};
    use crate::sites::position_index::PositionIndex;

    fn check_tiling(ranges: &[Range<usize>], n: usize) {
        let mut pos = 0;
        for r in ranges {
            assert_eq!(r.start, pos);
            assert!(r.end >= r.start);
            pos = r.end;
        }
        assert_eq!(pos, n);
    }

    #[test]
    fn test_balanced_ranges_even_split() {
        let ranges = balanced_ranges(&[1; 8], 4);
        assert_eq!(ranges, vec![0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn test_balanced_ranges_more_threads_than_units() {
        let ranges = balanced_ranges(&[3, 1], 4);
        check_tiling(&ranges, 2);
        assert_eq!(ranges[0], 0..1);
        assert_eq!(ranges[1], 1..2);
        assert!(ranges[2].is_empty() && ranges[3].is_empty());
    }

    #[test]
    fn test_balanced_ranges_empty_input() {
        let ranges = balanced_ranges(&[], 3);
        assert_eq!(ranges, vec![0..0, 0..0, 0..0]);
    }

    #[test]
    fn test_balanced_ranges_random_bounds() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..2000 {
            let n = rng.random_range(0..40);
            let threads = rng.random_range(1..9);
            let hi = [2, 5, 20][rng.random_range(0..3)];
            let costs: Vec<usize> = (0..n).map(|_| rng.random_range(1..=hi)).collect();
            let ranges = balanced_ranges(&costs, threads);
            assert_eq!(ranges.len(), threads);
            check_tiling(&ranges, n);

            let total: usize = costs.iter().sum();
            let max_item = costs.iter().copied().max().unwrap_or(0);
            let share = total.div_ceil(threads);
            for r in &ranges {
                let cost: usize = costs[r.clone()].iter().sum();
                if r.len() > 1 {
                    assert!(
                        cost <= share + max_item,
                        "cost {} above share {} + max {} for {:?} / {}",
                        cost,
                        share,
                        max_item,
                        costs,
                        threads
                    );
                }
            }
        }
    }

    fn site(pos: u32) -> SiteKey {
        SiteKey::new(0, Strand::Forward, pos)
    }

    #[test]
    fn test_layout_window_metadata() {
        // ambiguous sites at 10, 12, 30; unique reads at 11 and 25
        let mut index = PositionIndex::new();
        let mut dedup = AmbiguousReadDeduplicator::new();
        for _ in 0..3 {
            index.add_unique(site(11));
        }
        index.add_unique(site(25));
        dedup.add(&mut index, &[(site(10), 0.5), (site(30), 0.5)]);
        dedup.add(&mut index, &[(site(12), 0.5), (site(30), 0.5)]);
        let frozen = index.freeze();

        let layout = SiteLayout::build(&frozen, 5);
        let sites = layout.sites();
        assert_eq!(sites.len(), 3);
        assert_eq!(frozen.key(sites[0].rank), &site(10));
        assert_eq!((sites[0].left, sites[0].end, sites[0].unique_in_window), (0, 2, 3));
        assert_eq!((sites[1].left, sites[1].end, sites[1].unique_in_window), (0, 2, 3));
        assert_eq!((sites[2].left, sites[2].end, sites[2].unique_in_window), (2, 3, 1));
    }

    #[test]
    fn test_layout_window_stops_at_strand_change() {
        let mut index = PositionIndex::new();
        let mut dedup = AmbiguousReadDeduplicator::new();
        index.add_unique(SiteKey::new(0, Strand::Reverse, 101));
        dedup.add(
            &mut index,
            &[
                (SiteKey::new(0, Strand::Forward, 100), 0.5),
                (SiteKey::new(0, Strand::Reverse, 100), 0.5),
            ],
        );
        let frozen = index.freeze();
        let layout = SiteLayout::build(&frozen, 10);
        let sites = layout.sites();
        assert_eq!((sites[0].left, sites[0].end, sites[0].unique_in_window), (0, 1, 0));
        assert_eq!((sites[1].left, sites[1].end, sites[1].unique_in_window), (1, 2, 1));
    }

    /// Random ambiguous reads over a few clustered sites, as a frozen index
    /// plus pool.
    fn random_input(rng: &mut StdRng) -> (FrozenIndex, AmbiguousPool) {
        let mut index = PositionIndex::new();
        let mut dedup = AmbiguousReadDeduplicator::new();
        let span = rng.random_range(20..400);
        for _ in 0..rng.random_range(0..50) {
            index.add_unique(SiteKey::new(
                rng.random_range(0..2),
                Strand::Forward,
                rng.random_range(0..span),
            ));
        }
        for _ in 0..rng.random_range(1..80) {
            let size = rng.random_range(2..5);
            let cands: Vec<(SiteKey, f64)> = (0..size)
                .map(|_| {
                    let key = SiteKey::new(
                        rng.random_range(0..2),
                        if rng.random::<f64>() < 0.5 { Strand::Forward } else { Strand::Reverse },
                        rng.random_range(0..span),
                    );
                    (key, rng.random::<f64>())
                })
                .collect();
            dedup.add(&mut index, &cands);
        }
        (index.freeze(), dedup.finish())
    }

    #[test]
    fn test_work_plan_random_inputs_are_self_contained() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..300 {
            let (index, pool) = random_input(&mut rng);
            let w = rng.random_range(0..30);
            let threads = rng.random_range(1..7);
            let layout = SiteLayout::build(&index, w);
            // WorkPlan::new asserts contiguity, coverage and containment.
            let plan = WorkPlan::new(&pool, &layout, &index, threads);
            assert_eq!(plan.num_threads(), threads);

            for range in plan.ranges() {
                let cells: usize = pool.reads[range.reads()].iter().map(|r| r.size).sum();
                assert_eq!(cells, range.cells().len());
            }
            // windows agree with a brute-force scan
            for (i, s) in layout.sites().iter().enumerate() {
                let key = index.key(s.rank);
                let inside: Vec<usize> = layout
                    .sites()
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| window_distance(index.key(o.rank), key, w).abs() <= w as i64)
                    .map(|(j, _)| j)
                    .collect();
                assert_eq!(s.left, inside[0], "site {}", i);
                assert_eq!(s.end, inside[inside.len() - 1] + 1, "site {}", i);
                let uc: u64 = index
                    .iter()
                    .filter(|(k, _)| window_distance(k, key, w).abs() <= w as i64)
                    .map(|(_, v)| v.unique as u64)
                    .sum();
                assert_eq!(s.unique_in_window, uc);
            }
        }
    }

    #[test]
    fn test_split_ranges_mut_tiles_slice() {
        let mut data = [0u8, 1, 2, 3, 4];
        let chunks = split_ranges_mut(&mut data, [0..2, 2..2, 2..5]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], &[0, 1]);
        assert!(chunks[1].is_empty());
        assert_eq!(chunks[2], &[2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "contiguous")]
    fn test_split_ranges_mut_rejects_gap() {
        let mut data = [0u8; 4];
        let _ = split_ranges_mut(&mut data, [0..1, 2..4]);
    }
}
