//! Multi-threaded EM with window smoothing over ambiguous reads.
//!
//! Each round runs two phases, each a `crossbeam::scope` spawn/join:
//!
//! 1. **E-step**: every record's cells become
//!    `smoothed[site] * conprb`, renormalized to the record's multiplicity.
//! 2. **MS-step**: every ambiguous site collects its cells into a weight, and
//!    the window sum `psum + unique_in_window` becomes the site's smoothed
//!    value for the next E-step. The final round only collects.
//!
//! Workers receive disjoint `&mut` chunks cut along the [`WorkPlan`] ranges,
//! so phase writes never alias.

use anyhow::{Result, bail};
use indicatif::ProgressBar;
use tracing::info;

use super::partition::{SiteLayout, ThreadRange, WorkPlan, split_ranges_mut};
use crate::sites::dedup::{AmbiguousPool, AmbiguousRead};
use crate::sites::position_index::{FrozenIndex, SiteValue};

/// Default number of EM rounds.
pub const DEFAULT_ROUNDS: usize = 100;

/// Validated EM settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmParams {
    window: u32,
    num_threads: usize,
    rounds: usize,
}

impl EmParams {
    pub fn new(window: u32, num_threads: usize, rounds: usize) -> Result<Self> {
        if num_threads == 0 {
            bail!("number of threads must be at least 1");
        }
        if rounds == 0 {
            bail!("number of EM rounds must be at least 1");
        }
        Ok(Self {
            window,
            num_threads,
            rounds,
        })
    }

    #[inline]
    pub fn window(&self) -> u32 {
        self.window
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    #[inline]
    pub fn rounds(&self) -> usize {
        self.rounds
    }
}

/// Running sum over the half-open window `[left, right)` of ambiguous sites.
#[derive(Debug, Clone, Copy)]
struct WindowSum {
    left: usize,
    right: usize,
    psum: f64,
}

impl WindowSum {
    fn starting_at(site: usize) -> Self {
        Self {
            left: site,
            right: site,
            psum: 0.0,
        }
    }
}

pub struct ApportionmentEngine {
    index: FrozenIndex,
    pool: AmbiguousPool,
    layout: SiteLayout,
    plan: WorkPlan,
    /// Ambiguous-site index of every cell.
    cell_site: Vec<u32>,
    fracs: Vec<f64>,
    /// Smoothed value per ambiguous site, read by the next E-step.
    smoothed: Vec<f64>,
    /// Collected weight per ambiguous site.
    weights: Vec<f64>,
    rounds: usize,
}

impl ApportionmentEngine {
    pub fn new(index: FrozenIndex, pool: AmbiguousPool, params: &EmParams) -> Self {
        let layout = SiteLayout::build(&index, params.window());
        let plan = WorkPlan::new(&pool, &layout, &index, params.num_threads());

        assert_eq!(index.num_cells(), pool.num_cells(), "index and pool disagree on cells");
        let mut cell_site = vec![u32::MAX; pool.num_cells()];
        for (a, site) in layout.sites().iter().enumerate() {
            for &cell in index.value(site.rank).cells() {
                cell_site[cell] = a as u32;
            }
        }
        assert!(
            cell_site.iter().all(|&s| s != u32::MAX),
            "every cell must belong to an ambiguous site"
        );

        info!(
            "EM over {} records, {} cells, {} ambiguous sites on {} threads (window {})",
            pool.reads.len(),
            pool.num_cells(),
            layout.len(),
            plan.num_threads(),
            params.window()
        );

        let n_sites = layout.len();
        Self {
            fracs: vec![1.0; pool.num_cells()],
            smoothed: vec![1.0; n_sites],
            weights: vec![0.0; n_sites],
            cell_site,
            index,
            pool,
            layout,
            plan,
            rounds: params.rounds(),
        }
    }

    /// Run all configured rounds; the last one only collects weights.
    pub fn run(&mut self, progress: &ProgressBar) -> Result<()> {
        for round in 1..=self.rounds {
            self.e_step()?;
            self.ms_step(round == self.rounds)?;
            progress.inc(1);
            if round % 10 == 0 || round == self.rounds {
                info!("EM round {}/{} done", round, self.rounds);
            }
        }
        Ok(())
    }

    fn e_step(&mut self) -> Result<()> {
        let ranges = self.plan.ranges();
        let chunks = split_ranges_mut(&mut self.fracs, ranges.iter().map(ThreadRange::cells));
        let reads = &self.pool.reads;
        let conprbs = &self.pool.conprbs;
        let cell_site = &self.cell_site;
        let smoothed = &self.smoothed;

        crossbeam::scope(|s| {
            for (range, chunk) in ranges.iter().zip(chunks) {
                s.spawn(move |_| {
                    let base = range.cells().start;
                    for read in &reads[range.reads()] {
                        let local = read.offset - base..read.offset - base + read.size;
                        expect_record(
                            read,
                            &mut chunk[local],
                            &conprbs[read.cells()],
                            &cell_site[read.cells()],
                            smoothed,
                        );
                    }
                });
            }
        })
        .map_err(|e| anyhow::anyhow!("thread panicked: {:?}", e))?;
        Ok(())
    }

    fn ms_step(&mut self, last_round: bool) -> Result<()> {
        let ranges = self.plan.ranges();
        let weight_chunks =
            split_ranges_mut(&mut self.weights, ranges.iter().map(ThreadRange::sites));
        let smoothed_chunks =
            split_ranges_mut(&mut self.smoothed, ranges.iter().map(ThreadRange::sites));
        let layout = &self.layout;
        let values = self.index.values();
        let fracs = &self.fracs;

        crossbeam::scope(|s| {
            for ((range, weights), smoothed) in ranges.iter().zip(weight_chunks).zip(smoothed_chunks)
            {
                s.spawn(move |_| {
                    let sites = range.sites();
                    if last_round {
                        for (a, w) in sites.zip(weights.iter_mut()) {
                            *w = values[layout.sites()[a].rank].collect(fracs);
                        }
                    } else {
                        smooth_range(sites, layout, values, fracs, weights, smoothed);
                    }
                });
            }
        })
        .map_err(|e| anyhow::anyhow!("thread panicked: {:?}", e))?;
        Ok(())
    }

    #[inline]
    pub fn fracs(&self) -> &[f64] {
        &self.fracs
    }

    #[inline]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    #[inline]
    pub fn plan(&self) -> &WorkPlan {
        &self.plan
    }

    #[inline]
    pub fn pool(&self) -> &AmbiguousPool {
        &self.pool
    }

    /// Write collected weights back into the index.
    pub fn into_index(self) -> FrozenIndex {
        let mut index = self.index;
        for (site, &w) in self.layout.sites().iter().zip(&self.weights) {
            index.set_weight(site.rank, w);
        }
        index
    }
}

/// E-step for one record. A zero sum falls back to 1 so the record keeps
/// finite (all-zero) fractions.
#[inline]
fn expect_record(
    read: &AmbiguousRead,
    fracs: &mut [f64],
    conprbs: &[f64],
    cell_site: &[u32],
    smoothed: &[f64],
) {
    let mut sum = 0.0;
    for ((f, &p), &site) in fracs.iter_mut().zip(conprbs).zip(cell_site) {
        *f = smoothed[site as usize] * p;
        sum += *f;
    }
    if sum <= 0.0 {
        sum = 1.0;
    }
    let scale = read.multiplicity as f64 / sum;
    fracs.iter_mut().for_each(|f| *f *= scale);
}

/// Window-smoothing pass over one thread's contiguous site range.
/// `weights` and `smoothed` are that range's chunks.
fn smooth_range(
    sites: std::ops::Range<usize>,
    layout: &SiteLayout,
    values: &[SiteValue],
    fracs: &[f64],
    weights: &mut [f64],
    smoothed: &mut [f64],
) {
    let base = sites.start;
    let info = layout.sites();
    let mut win = WindowSum::starting_at(base);
    for a in sites {
        let site = &info[a];
        while win.right < site.end {
            let w = values[info[win.right].rank].collect(fracs);
            weights[win.right - base] = w;
            win.psum += w;
            win.right += 1;
        }
        while win.left < site.left {
            win.psum -= weights[win.left - base];
            win.left += 1;
        }
        if win.psum < 0.0 {
            win.psum = 0.0;
        }
        smoothed[a - base] = win.psum + site.unique_in_window as f64;
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::sites::dedup::AmbiguousReadDeduplicator;
    use crate::sites::key::{SiteKey, Strand};
    use crate::sites::position_index::PositionIndex;

    fn site(pos: u32) -> SiteKey {
        SiteKey::new(0, Strand::Forward, pos)
    }

    fn engine(
        uniques: &[(u32, u32)],
        reads: &[Vec<(u32, f64)>],
        window: u32,
        threads: usize,
        rounds: usize,
    ) -> ApportionmentEngine {
        let mut index = PositionIndex::new();
        for &(pos, n) in uniques {
            for _ in 0..n {
                index.add_unique(site(pos));
            }
        }
        let mut dedup = AmbiguousReadDeduplicator::new();
        for r in reads {
            let cands: Vec<_> = r.iter().map(|&(p, c)| (site(p), c)).collect();
            dedup.add(&mut index, &cands);
        }
        let params = EmParams::new(window, threads, rounds).unwrap();
        ApportionmentEngine::new(index.freeze(), dedup.finish(), &params)
    }

    fn weight_at(index: &FrozenIndex, pos: u32) -> f64 {
        index
            .iter()
            .find(|(k, _)| **k == site(pos))
            .map(|(_, v)| v.weight)
            .unwrap()
    }

    #[test]
    fn test_params_reject_zero() {
        assert!(EmParams::new(5, 0, 10).is_err());
        assert!(EmParams::new(5, 2, 0).is_err());
        let p = EmParams::new(5, 2, DEFAULT_ROUNDS).unwrap();
        assert_eq!((p.window(), p.num_threads(), p.rounds()), (5, 2, 100));
    }

    #[test]
    fn test_e_step_sums_to_multiplicity() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut reads = Vec::new();
        for _ in 0..200 {
            let size = rng.random_range(2..6);
            reads.push(
                (0..size)
                    .map(|_| (rng.random_range(0..500), rng.random::<f64>()))
                    .collect::<Vec<_>>(),
            );
        }
        // a degenerate all-zero record
        reads.push(vec![(7, 0.0), (8, 0.0)]);
        let mut eng = engine(&[(3, 4), (250, 9)], &reads, 10, 3, 5);
        let progress = ProgressBar::hidden();
        eng.run(&progress).unwrap();

        // one more E-step on top of the smoothed state
        eng.e_step().unwrap();
        for read in &eng.pool().reads {
            let sum: f64 = eng.fracs()[read.cells()].iter().sum();
            let zero = eng.pool().conprbs[read.cells()].iter().all(|&p| p == 0.0);
            if zero {
                assert_eq!(sum, 0.0);
            } else {
                assert!((sum - read.multiplicity as f64).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_symmetric_reads_split_evenly() {
        let reads = vec![vec![(100, 0.5), (900, 0.5)], vec![(100, 0.5), (900, 0.5)]];
        let mut eng = engine(&[], &reads, 20, 2, DEFAULT_ROUNDS);
        eng.run(&ProgressBar::hidden()).unwrap();
        let index = eng.into_index();
        let (a, b) = (weight_at(&index, 100), weight_at(&index, 900));
        assert!((a - 1.0).abs() < 1e-9, "a = {}", a);
        assert!((b - 1.0).abs() < 1e-9, "b = {}", b);
    }

    #[test]
    fn test_unique_support_attracts_weight() {
        let reads = vec![vec![(100, 0.5), (5000, 0.5)]];
        let mut eng = engine(&[(105, 100)], &reads, 20, 1, DEFAULT_ROUNDS);
        eng.run(&ProgressBar::hidden()).unwrap();
        let index = eng.into_index();
        let a = weight_at(&index, 100);
        let b = weight_at(&index, 5000);
        assert!(a > 0.99, "a = {}", a);
        assert!(b < 0.01, "b = {}", b);
        assert!((a + b - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_reads_match_multiplicity() {
        let pattern = vec![(10, 0.3), (40, 0.7)];
        let reads = vec![pattern.clone(), vec![(40, 0.5), (60, 0.5)], pattern];
        let mut eng = engine(&[(12, 5)], &reads, 5, 2, 30);
        assert_eq!(eng.pool().reads.len(), 2);
        assert_eq!(eng.pool().reads[0].multiplicity, 2);
        eng.run(&ProgressBar::hidden()).unwrap();

        let total: f64 = eng.weights().iter().sum();
        assert!((total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_thread_count_does_not_change_result() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut reads = Vec::new();
        for _ in 0..300 {
            let size = rng.random_range(2..4);
            reads.push(
                (0..size)
                    .map(|_| (rng.random_range(0..2000), rng.random::<f64>()))
                    .collect::<Vec<_>>(),
            );
        }
        let uniques: Vec<(u32, u32)> = (0..40)
            .map(|_| (rng.random_range(0..2000), rng.random_range(1..20)))
            .collect();

        let mut single = engine(&uniques, &reads, 15, 1, 20);
        single.run(&ProgressBar::hidden()).unwrap();
        let mut multi = engine(&uniques, &reads, 15, 6, 20);
        multi.run(&ProgressBar::hidden()).unwrap();

        assert_eq!(single.plan().num_threads(), 1);
        assert_eq!(multi.plan().num_threads(), 6);
        assert_eq!(single.weights().len(), multi.weights().len());
        for (a, b) in single.weights().iter().zip(multi.weights()) {
            assert!((a - b).abs() < 1e-6 * a.abs().max(1.0), "{} vs {}", a, b);
        }
    }
}
