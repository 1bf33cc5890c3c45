//! CLI command for simulating fragment alignments from a transcript model file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::io::alignments::{Alignment, AlignmentGroup, AlignmentWriter};
use crate::io::model_file::read_models;
use crate::model::config::FragmentConfig;
use crate::sites::key::Strand;

use super::ensure_parent_dir;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Transcript model file
    #[arg(short = 'm', long)]
    pub model: PathBuf,
    /// Output alignment groups
    #[arg(short = 'o', long)]
    pub output: PathBuf,
    /// Also write a `name<TAB>length` transcript table here
    #[arg(long)]
    pub transcript_table: Option<PathBuf>,
    /// Primer length (included in fragment lengths)
    #[arg(long, default_value = "0")]
    pub primer_length: usize,
    /// Minimum fragment length, primer excluded
    #[arg(long, default_value = "20")]
    pub min_frag_len: usize,
    /// Maximum fragment length, primer excluded
    #[arg(long, default_value = "500")]
    pub max_frag_len: usize,
    /// Fragments per transcript
    #[arg(short = 'n', long, default_value = "1000")]
    pub num_fragments: usize,
    /// Emit single-end reads (no fragment length)
    #[arg(long)]
    pub single_end: bool,
    /// Random seed
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

pub fn run(args: SimulateArgs) -> Result<()> {
    let config = Arc::new(FragmentConfig::new(
        args.primer_length,
        args.min_frag_len,
        args.max_frag_len,
    )?);
    let models = read_models(&args.model, config)?;
    if models.is_empty() {
        bail!("no transcript models in {}", args.model.display());
    }

    ensure_parent_dir(&args.output)?;
    let mut writer = AlignmentWriter::create(&args.output)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut group = AlignmentGroup::default();
    let mut written = 0u64;

    for (contig, model) in models.iter().enumerate() {
        for i in 0..args.num_fragments {
            let Some((pos, flen)) = model.simulate(&mut rng) else {
                warn!("transcript {} cannot produce size-selected fragments", contig);
                break;
            };
            group.clear();
            group.name = format!("t{}_f{}", contig, i);
            group.push(Alignment {
                contig: contig as u32,
                strand: Strand::Forward,
                pos: pos as u32,
                mismatches: 0,
                fragment_length: (!args.single_end).then_some(flen as u32),
            });
            writer.write_group(&group)?;
            written += 1;
        }
    }
    writer.finish()?;

    if let Some(path) = &args.transcript_table {
        let table: String = models
            .iter()
            .enumerate()
            .map(|(i, m)| format!("t{}\t{}\n", i, m.len() + args.primer_length))
            .collect();
        std::fs::write(path, table)
            .map_err(|e| anyhow::anyhow!("failed to write {}: {}", path.display(), e))?;
    }

    info!(
        "Simulated {} fragments from {} transcripts into {}",
        written,
        models.len(),
        args.output.display()
    );
    Ok(())
}
