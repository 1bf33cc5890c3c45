//! `<prefix>.site_info` writer and reader.
//!
//! One line per site in key order:
//!
//! ```text
//! contig strand pos<TAB>unique_count<TAB>weight
//! ```
//!
//! with the weight printed to two decimals.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::sites::key::{SiteKey, Strand};
use crate::sites::position_index::FrozenIndex;

/// One parsed site line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteRecord {
    pub site: SiteKey,
    pub unique: u32,
    pub weight: f64,
}

pub fn write_site_info<W: Write>(writer: &mut W, index: &FrozenIndex) -> Result<()> {
    for (key, value) in index.iter() {
        writeln!(writer, "{}\t{}\t{:.2}", key, value.unique, value.weight)?;
    }
    Ok(())
}

pub fn write_site_info_file(path: &Path, index: &FrozenIndex) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_site_info(&mut writer, index)
        .with_context(|| format!("failed to write {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

pub fn read_site_info(path: &Path) -> Result<Vec<SiteRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        records.push(
            parse_site_line(&line)
                .with_context(|| format!("{}: malformed site line {}", path.display(), i + 1))?,
        );
    }
    Ok(records)
}

fn parse_site_line(line: &str) -> Result<SiteRecord> {
    let mut cols = line.split('\t');
    let (Some(site), Some(unique), Some(weight), None) =
        (cols.next(), cols.next(), cols.next(), cols.next())
    else {
        bail!("expected 3 tab-separated columns");
    };
    let mut parts = site.split(' ');
    let (Some(contig), Some(strand), Some(pos), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("expected 'contig strand pos', got '{}'", site);
    };
    let strand = match strand {
        "+" => Strand::Forward,
        "-" => Strand::Reverse,
        other => bail!("invalid strand '{}'", other),
    };
    Ok(SiteRecord {
        site: SiteKey::new(contig.parse()?, strand, pos.parse()?),
        unique: unique.parse()?,
        weight: weight.parse()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::position_index::PositionIndex;

    #[test]
    fn test_write_and_read_site_info() {
        let mut index = PositionIndex::new();
        index.add_unique(SiteKey::new(1, Strand::Reverse, 7));
        index.add_unique(SiteKey::new(0, Strand::Forward, 3));
        index.add_unique(SiteKey::new(0, Strand::Forward, 3));
        let mut frozen = index.freeze();
        frozen.set_weight(1, 0.666);

        let mut buf = Vec::new();
        write_site_info(&mut buf, &frozen).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "0 + 3\t2\t0.00\n1 - 7\t1\t0.67\n");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.site_info");
        write_site_info_file(&path, &frozen).unwrap();
        let back = read_site_info(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].site, SiteKey::new(1, Strand::Reverse, 7));
        assert_eq!(back[1].weight, 0.67);
        assert_eq!(back[0].unique, 2);
    }

    #[test]
    fn test_parse_rejects_bad_strand() {
        assert!(parse_site_line("0 x 3\t1\t0.00").is_err());
        assert!(parse_site_line("0 + 3\t1").is_err());
    }
}
