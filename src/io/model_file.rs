//! Transcript model files: one model per line, in contig-id order.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::model::config::FragmentConfig;
use crate::model::transcript::TranscriptModel;

pub fn write_models(path: &Path, models: &[TranscriptModel]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for model in models {
        model
            .write(&mut writer)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Read every model in a (possibly compressed) model file. Blank lines are skipped.
pub fn read_models(path: &Path, config: Arc<FragmentConfig>) -> Result<Vec<TranscriptModel>> {
    let (reader, _format) = niffler::send::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut models = Vec::new();
    for (i, line) in BufReader::new(reader).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let model = TranscriptModel::parse_line(&line, Arc::clone(&config))
            .with_context(|| format!("{}: bad model on line {}", path.display(), i + 1))?;
        models.push(model);
    }
    Ok(models)
}
