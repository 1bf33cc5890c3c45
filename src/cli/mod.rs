pub mod apportion;
pub mod learn;
pub mod simulate;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

#[derive(Parser, Debug)]
#[command(name = "prober-rs")]
#[command(about = "Position-level apportionment of ambiguous reads and drop-off rate estimation")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apportion ambiguous reads across genomic sites with window-smoothed EM
    Apportion(apportion::ApportionArgs),
    /// Learn per-transcript drop-off (or marking) rates from fragment alignments
    Learn(learn::LearnArgs),
    /// Simulate fragment alignments from a transcript model file
    Simulate(simulate::SimulateArgs),
}

pub fn run() -> Result<()> {
    run_from(std::env::args_os())
}

/// Parse `args` (program name first) and run the selected command.
pub fn run_from<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    match cli.command {
        Commands::Apportion(args) => apportion::run(args),
        Commands::Learn(args) => learn::run(args),
        Commands::Simulate(args) => simulate::run(args),
    }
}

/// `<prefix><suffix>`, e.g. `out/sample` + `.site_info`.
pub(crate) fn prefixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Make sure the directory that will hold `path` exists.
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!("failed to create output directory {}: {}", parent.display(), e)
        })?;
    }
    Ok(())
}

pub(crate) fn make_progress_bar(quiet: bool, what: &str) -> ProgressBar {
    if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(1));
        pb.set_style(
            ProgressStyle::with_template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] {{human_pos}} {} ({{per_sec}})",
                what
            ))
            .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(1_000));
        pb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_appends_to_file_name() {
        let p = prefixed(Path::new("out/sample"), ".site_info");
        assert_eq!(p, PathBuf::from("out/sample.site_info"));
        let p = prefixed(Path::new("sample"), "_multi.tsv");
        assert_eq!(p, PathBuf::from("sample_multi.tsv"));
    }

    #[test]
    fn test_cli_parses_apportion() {
        let cli = Cli::try_parse_from([
            "prober-rs", "apportion", "-a", "in.tsv", "-o", "out/x", "-w", "5", "-t", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Apportion(args) => {
                assert_eq!(args.window, 5);
                assert_eq!(args.threads, 2);
                assert_eq!(args.rounds, crate::em::engine::DEFAULT_ROUNDS);
                assert!(!args.keep_alignments);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
