//! CLI command for learning per-transcript drop-off (or marking) rates.
//!
//! Fragments are loaded once and scored by a mismatch error model trained on
//! uniquely-aligned fragments. Each outer round then reassigns every fragment
//! across its candidate transcripts in proportion to
//! `P(fragment | model) * P(sequence | alignment)` and runs one EM iteration of
//! every transcript model in parallel.
//!
//! With `--control`, the drop-off rates of a control sample are loaded and held
//! fixed while marking rates are learned.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;
use smallvec::SmallVec;
use tracing::{info, warn};

use crate::io::alignments::{AlignmentGroup, AlignmentReader};
use crate::io::model_file::{read_models, write_models};
use crate::model::config::FragmentConfig;
use crate::model::error_model::{MismatchModel, ReadErrorModel};
use crate::model::transcript::{INITIAL_GAMMA, TranscriptModel};
use crate::sites::key::Strand;

use super::{ensure_parent_dir, make_progress_bar};

#[derive(Args, Debug)]
pub struct LearnArgs {
    /// Transcript table: `name<TAB>length` per line; line order gives contig ids
    #[arg(long)]
    pub transcripts: PathBuf,
    /// Fragment alignment groups against the transcripts
    #[arg(short = 'a', long)]
    pub alignments: PathBuf,
    /// Output transcript model file
    #[arg(short = 'o', long)]
    pub output: PathBuf,
    /// Primer length (included in observed fragment lengths)
    #[arg(long, default_value = "0")]
    pub primer_length: usize,
    /// Minimum fragment length, primer excluded
    #[arg(long, default_value = "20")]
    pub min_frag_len: usize,
    /// Maximum fragment length, primer excluded
    #[arg(long, default_value = "500")]
    pub max_frag_len: usize,
    /// Number of outer rounds
    #[arg(long, default_value = "20")]
    pub rounds: usize,
    /// Number of threads for the per-transcript EM
    #[arg(short = 't', long, default_value = "4")]
    pub threads: usize,
    /// Model file learned from a control sample; enables marking rates
    #[arg(long)]
    pub control: Option<PathBuf>,
    /// Mismatch counts above this share one error-model bin
    #[arg(long, default_value = "4")]
    pub max_mismatches: u32,
    /// Suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

/// One candidate placement of a fragment on a transcript.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hit {
    pub transcript: usize,
    pub pos: i64,
    pub fragment_length: Option<usize>,
    pub conprb: f64,
}

pub(crate) type Fragment = SmallVec<[Hit; 2]>;

pub fn run(args: LearnArgs) -> Result<()> {
    let start = Instant::now();
    if args.threads == 0 {
        bail!("number of threads must be at least 1");
    }
    if args.rounds == 0 {
        bail!("number of rounds must be at least 1");
    }
    let config = Arc::new(FragmentConfig::new(
        args.primer_length,
        args.min_frag_len,
        args.max_frag_len,
    )?);

    info!(
        "Observable fragment lengths {}..={} (primer {})",
        config.minimum_fragment_length(),
        config.maximum_fragment_length(),
        config.primer_length()
    );

    let lengths = read_transcript_table(&args.transcripts)?;
    info!("Loaded {} transcripts", lengths.len());
    let mut models = initial_models(&config, &lengths, args.control.as_deref())?;

    let progress = make_progress_bar(args.quiet, "fragments loaded");
    let fragments = load_fragments(&args.alignments, lengths.len(), args.max_mismatches, &progress)?;
    progress.finish_and_clear();
    info!("Loaded {} fragments", fragments.len());

    for round in 1..=args.rounds {
        let assigned = assign_fragments(&mut models, &fragments);
        em_all(&mut models, args.threads)?;
        info!("round {}/{}: {:.1} fragments assigned", round, args.rounds, assigned);
    }

    ensure_parent_dir(&args.output)?;
    write_models(&args.output, &models)?;
    info!(
        "Wrote {} models to {} ({:.2}s)",
        models.len(),
        args.output.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Transcript lengths from a `name<TAB>length` table.
pub(crate) fn read_transcript_table(path: &Path) -> Result<Vec<usize>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut lengths = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let length = line
            .split_whitespace()
            .nth(1)
            .with_context(|| format!("{}: line {} has no length column", path.display(), i + 1))?;
        lengths.push(length.parse().with_context(|| {
            format!("{}: invalid length '{}' on line {}", path.display(), length, i + 1)
        })?);
    }
    Ok(lengths)
}

fn initial_models(
    config: &Arc<FragmentConfig>,
    lengths: &[usize],
    control: Option<&Path>,
) -> Result<Vec<TranscriptModel>> {
    let Some(control) = control else {
        return Ok(lengths
            .iter()
            .map(|&len| TranscriptModel::new(Arc::clone(config), len))
            .collect());
    };

    let mut models = read_models(control, Arc::clone(config))?;
    if models.len() != lengths.len() {
        bail!(
            "control model file {} has {} models but the transcript table lists {}",
            control.display(),
            models.len(),
            lengths.len()
        );
    }
    for (i, (model, &len)) in models.iter_mut().zip(lengths).enumerate() {
        let expected = len.saturating_sub(config.primer_length());
        if model.len() != expected {
            bail!(
                "control model {} has {} positions, expected {}",
                i,
                model.len(),
                expected
            );
        }
        model.enable_beta(INITIAL_GAMMA)?;
    }
    info!("Learning marking rates on top of control drop-off rates");
    Ok(models)
}

/// Read all fragments, training the error model on unique ones first.
fn load_fragments(
    path: &Path,
    num_transcripts: usize,
    max_mismatches: u32,
    progress: &indicatif::ProgressBar,
) -> Result<Vec<Fragment>> {
    let mut groups = Vec::new();
    let mut error_model = MismatchModel::new(max_mismatches);
    let mut reader = AlignmentReader::open(path)?;
    let mut group = AlignmentGroup::default();
    let mut skipped = 0u64;
    while reader.next_group(&mut group)? {
        progress.inc(1);
        let before = group.len();
        let mut kept = AlignmentGroup::new(group.name.clone());
        for aln in group.alignments() {
            if aln.strand == Strand::Forward && (aln.contig as usize) < num_transcripts {
                kept.push(*aln);
            }
        }
        skipped += (before - kept.len()) as u64;
        if kept.is_empty() {
            continue;
        }
        if kept.len() == 1 {
            error_model.update(&kept);
        }
        groups.push(kept);
    }
    if skipped > 0 {
        warn!(
            "ignored {} alignments on the reverse strand or an unknown transcript",
            skipped
        );
    }
    error_model.finish();

    let mut probs = Vec::new();
    let fragments = groups
        .iter()
        .map(|g| {
            probs.clear();
            probs.resize(g.len(), 0.0);
            error_model.conditional_probs(g, &mut probs);
            g.alignments()
                .iter()
                .zip(&probs)
                .map(|(aln, &conprb)| Hit {
                    transcript: aln.contig as usize,
                    pos: aln.pos as i64,
                    fragment_length: aln.fragment_length.map(|f| f as usize),
                    conprb,
                })
                .collect()
        })
        .collect();
    Ok(fragments)
}

/// Reset observations and apportion every fragment across its hits.
/// Returns the total assigned mass.
pub(crate) fn assign_fragments(models: &mut [TranscriptModel], fragments: &[Fragment]) -> f64 {
    models.iter_mut().for_each(TranscriptModel::init);
    let mut weights: SmallVec<[f64; 2]> = SmallVec::new();
    let mut assigned = 0.0;
    for fragment in fragments {
        weights.clear();
        weights.extend(fragment.iter().map(|hit| {
            let model = &models[hit.transcript];
            let p = match hit.fragment_length {
                Some(flen) => model.probability_pe(hit.pos, flen),
                None => model.probability_se(hit.pos),
            };
            p * hit.conprb
        }));
        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 {
            continue;
        }
        for (hit, &w) in fragment.iter().zip(&weights) {
            let frac = w / sum;
            let model = &mut models[hit.transcript];
            match hit.fragment_length {
                Some(flen) => model.update_pe(hit.pos, flen, frac),
                None => model.update_se(hit.pos, frac),
            }
        }
        assigned += 1.0;
    }
    assigned
}

/// One EM iteration of every model, spread over `threads` workers.
pub(crate) fn em_all(models: &mut [TranscriptModel], threads: usize) -> Result<()> {
    if models.is_empty() {
        return Ok(());
    }
    let chunk = models.len().div_ceil(threads);
    crossbeam::scope(|s| {
        for part in models.chunks_mut(chunk) {
            s.spawn(move |_| {
                for model in part {
                    let observed = model.observed_count();
                    model.em_round(observed, 1);
                }
            });
        }
    })
    .map_err(|e| anyhow::anyhow!("thread panicked: {:?}", e))?;
    Ok(())
}
