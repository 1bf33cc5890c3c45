//! Summary statistics for an apportionment run, written as JSON.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Read-category and EM counts reported after `apportion`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunInfo {
    pub num_reads: u64,
    pub num_unaligned: u64,
    pub num_unique: u64,
    pub num_ambiguous: u64,
    /// Alignments of ambiguous reads before deduplication.
    pub num_ambiguous_hits: u64,
    /// Distinct ambiguity patterns after deduplication.
    pub num_patterns: u64,
    /// Alignments of ambiguous reads after deduplication.
    pub num_cells: u64,
    pub num_sites: u64,
    pub num_ambiguous_sites: u64,
    pub window: u32,
    pub rounds: usize,
    pub num_threads: usize,
}

/// Write `info` plus the command line and runtime.
pub fn write_run_info(path: &Path, info: &RunInfo, cmdline: &str, elapsed_secs: f64) -> Result<()> {
    let percent_ambiguous = if info.num_reads > 0 {
        (info.num_ambiguous as f64 / info.num_reads as f64) * 100.0
    } else {
        0.0
    };

    let mut value = serde_json::to_value(info)?;
    value["percent_ambiguous"] = format!("{:.2}", percent_ambiguous).into();
    value["runtime_seconds"] = format!("{:.2}", elapsed_secs).into();
    value["cmdline"] = cmdline.into();
    value["version"] = crate::VERSION.into();

    let file =
        std::fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &value)?;
    Ok(())
}
