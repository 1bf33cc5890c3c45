//! CLI command for apportioning ambiguous reads across genomic sites.
//!
//! Two passes over the input:
//!
//! 1. Categorize every read group (unaligned / unique / ambiguous). Unique
//!    reads train the error model and add to their site's unique count;
//!    ambiguous reads are sorted by site and spooled to `<prefix>_multi.tsv`.
//! 2. Replay the spooled reads into the deduplicator, scoring each alignment
//!    with the finished error model.
//!
//! Then the EM runs and `<prefix>.site_info`, `<prefix>.model` and
//! `<prefix>_run_info.json` are written.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::em::engine::{ApportionmentEngine, DEFAULT_ROUNDS, EmParams};
use crate::io::alignments::{AlignmentGroup, AlignmentReader, AlignmentWriter};
use crate::io::run_info::{RunInfo, write_run_info};
use crate::io::site_info::write_site_info_file;
use crate::model::error_model::{MismatchModel, ReadErrorModel};
use crate::sites::dedup::AmbiguousReadDeduplicator;
use crate::sites::key::SiteKey;
use crate::sites::position_index::PositionIndex;

use super::{ensure_parent_dir, make_progress_bar, prefixed};

#[derive(Args, Debug)]
pub struct ApportionArgs {
    /// Alignment groups (tab-separated, optionally compressed)
    #[arg(short = 'a', long)]
    pub alignments: PathBuf,
    /// Output prefix
    #[arg(short = 'o', long)]
    pub output: PathBuf,
    /// Half window size for smoothing
    #[arg(short = 'w', long, default_value = "10")]
    pub window: u32,
    /// Number of EM threads
    #[arg(short = 't', long, default_value = "4")]
    pub threads: usize,
    /// Number of EM rounds
    #[arg(long, default_value_t = DEFAULT_ROUNDS)]
    pub rounds: usize,
    /// Mismatch counts above this share one error-model bin
    #[arg(long, default_value = "4")]
    pub max_mismatches: u32,
    /// Keep a copy of all alignments and the ambiguous-read spool
    #[arg(long)]
    pub keep_alignments: bool,
    /// Suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

/// Outputs of an apportionment run.
#[derive(Debug, Clone)]
pub struct ApportionOutputs {
    pub site_info: PathBuf,
    pub model: PathBuf,
    pub run_info: PathBuf,
}

impl ApportionOutputs {
    pub fn for_prefix(prefix: &Path) -> Self {
        Self {
            site_info: prefixed(prefix, ".site_info"),
            model: prefixed(prefix, ".model"),
            run_info: prefixed(prefix, "_run_info.json"),
        }
    }
}

pub fn run(args: ApportionArgs) -> Result<()> {
    let start = Instant::now();
    let params = EmParams::new(args.window, args.threads, args.rounds)?;
    ensure_parent_dir(&args.output)?;

    let multi_path = prefixed(&args.output, "_multi.tsv");
    let all_path = args
        .keep_alignments
        .then(|| prefixed(&args.output, "_alignments.tsv"));

    // Pass 1
    info!("Categorizing reads from {}", args.alignments.display());
    let progress = make_progress_bar(args.quiet, "read groups processed");
    let mut index = PositionIndex::new();
    let mut error_model = MismatchModel::new(args.max_mismatches);
    let mut stats = RunInfo {
        window: params.window(),
        rounds: params.rounds(),
        num_threads: params.num_threads(),
        ..Default::default()
    };
    categorize(
        &args.alignments,
        &multi_path,
        all_path.as_deref(),
        &mut index,
        &mut error_model,
        &mut stats,
        &progress,
    )?;
    progress.finish_and_clear();
    error_model.finish();
    info!(
        "N0 = {}, N1 = {}, N2 = {}, n_mhits = {}",
        stats.num_unaligned, stats.num_unique, stats.num_ambiguous, stats.num_ambiguous_hits
    );

    // Pass 2
    let mut dedup = AmbiguousReadDeduplicator::new();
    collect_ambiguous(&multi_path, &error_model, &mut index, &mut dedup)?;
    if !args.keep_alignments {
        std::fs::remove_file(&multi_path)
            .with_context(|| format!("failed to remove {}", multi_path.display()))?;
    }
    let pool = dedup.finish();
    stats.num_patterns = pool.reads.len() as u64;
    stats.num_cells = pool.num_cells() as u64;
    info!(
        "n_multi = {}, n_mhits = {} after deduplication",
        stats.num_patterns, stats.num_cells
    );

    let frozen = index.freeze();
    stats.num_sites = frozen.len() as u64;
    stats.num_ambiguous_sites = frozen.values().iter().filter(|v| v.is_ambiguous()).count() as u64;

    let frozen = if pool.is_empty() {
        info!("No ambiguous reads; skipping EM");
        frozen
    } else {
        let mut engine = ApportionmentEngine::new(frozen, pool, &params);
        let progress = make_progress_bar(args.quiet, "EM rounds");
        engine.run(&progress)?;
        progress.finish_and_clear();
        engine.into_index()
    };

    let outputs = ApportionOutputs::for_prefix(&args.output);
    write_site_info_file(&outputs.site_info, &frozen)?;
    error_model.save(&outputs.model)?;
    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
    let elapsed = start.elapsed().as_secs_f64();
    write_run_info(&outputs.run_info, &stats, &cmdline, elapsed)?;
    info!(
        "Wrote {} sites to {} ({:.2}s)",
        stats.num_sites,
        outputs.site_info.display(),
        elapsed
    );
    Ok(())
}

/// Pass 1: split reads into categories, train the error model on unique
/// reads and spool ambiguous ones.
fn categorize(
    input: &Path,
    multi_path: &Path,
    all_path: Option<&Path>,
    index: &mut PositionIndex,
    error_model: &mut impl ReadErrorModel,
    stats: &mut RunInfo,
    progress: &indicatif::ProgressBar,
) -> Result<()> {
    let mut reader = AlignmentReader::open(input)?;
    let mut multi_writer = AlignmentWriter::create(multi_path)?;
    let mut all_writer = all_path.map(AlignmentWriter::create).transpose()?;

    let mut group = AlignmentGroup::default();
    while reader.next_group(&mut group)? {
        if let Some(w) = all_writer.as_mut() {
            w.write_group(&group)?;
        }
        stats.num_reads += 1;
        match group.len() {
            0 => stats.num_unaligned += 1,
            1 => {
                stats.num_unique += 1;
                error_model.update(&group);
                index.add_unique(group.alignments()[0].site());
            }
            n => {
                stats.num_ambiguous += 1;
                stats.num_ambiguous_hits += n as u64;
                group.sort_alignments();
                multi_writer.write_group(&group)?;
            }
        }
        progress.inc(1);
    }

    multi_writer.finish()?;
    if let Some(w) = all_writer {
        w.finish()?;
    }
    Ok(())
}

/// Pass 2: feed spooled ambiguous reads into the deduplicator.
fn collect_ambiguous(
    multi_path: &Path,
    error_model: &impl ReadErrorModel,
    index: &mut PositionIndex,
    dedup: &mut AmbiguousReadDeduplicator,
) -> Result<()> {
    let mut reader = AlignmentReader::open(multi_path)?;
    let mut group = AlignmentGroup::default();
    let mut probs: Vec<f64> = Vec::new();
    let mut candidates: Vec<(SiteKey, f64)> = Vec::new();
    while reader.next_group(&mut group)? {
        probs.clear();
        probs.resize(group.len(), 0.0);
        error_model.conditional_probs(&group, &mut probs);
        candidates.clear();
        candidates.extend(
            group
                .alignments()
                .iter()
                .zip(&probs)
                .map(|(aln, &p)| (aln.site(), p)),
        );
        dedup.add(index, &candidates);
    }
    Ok(())
}
