//! Alignment-group reader and writer.
//!
//! Alignments are stored as tab-separated text, one alignment per line:
//!
//! ```text
//! read_name  contig_id  strand  pos  mismatches  [fragment_length]
//! ```
//!
//! Consecutive lines sharing a `read_name` form one [`AlignmentGroup`]. A line
//! whose contig column is `*` marks an unaligned read; `#` starts a comment.
//! Inputs may be compressed (detected by niffler).

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use smallvec::SmallVec;

use crate::sites::key::{SiteKey, Strand};

// ---------------------------------------------------------------------------
// Alignment / AlignmentGroup
// ---------------------------------------------------------------------------

/// One alignment of a read (or read pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub contig: u32,
    pub strand: Strand,
    /// Leftmost 0-based position.
    pub pos: u32,
    /// Mismatches against the reference, consumed by the error model.
    pub mismatches: u32,
    /// Fragment length implied by the mates, for paired-end reads.
    pub fragment_length: Option<u32>,
}

impl Alignment {
    #[inline]
    pub fn site(&self) -> SiteKey {
        SiteKey::new(self.contig, self.strand, self.pos)
    }

    #[inline]
    pub fn is_paired(&self) -> bool {
        self.fragment_length.is_some()
    }
}

/// All alignments reported for one read.
#[derive(Debug, Clone, Default)]
pub struct AlignmentGroup {
    pub name: String,
    alignments: SmallVec<[Alignment; 4]>,
}

impl AlignmentGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alignments: SmallVec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.name.clear();
        self.alignments.clear();
    }

    pub fn push(&mut self, alignment: Alignment) {
        self.alignments.push(alignment);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.alignments.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.alignments.is_empty()
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        !self.alignments.is_empty()
    }

    #[inline]
    pub fn alignments(&self) -> &[Alignment] {
        &self.alignments
    }

    /// Order alignments by site so identical ambiguity patterns look identical.
    pub fn sort_alignments(&mut self) {
        self.alignments
            .sort_by_key(|a| (a.site(), a.mismatches, a.fragment_length));
    }
}

// ---------------------------------------------------------------------------
// AlignmentReader
// ---------------------------------------------------------------------------

/// Streaming reader that yields one [`AlignmentGroup`] at a time.
pub struct AlignmentReader<R: BufRead> {
    reader: R,
    line: String,
    line_no: usize,
    /// First record of the next group, read ahead while closing the previous one.
    pending: Option<(String, Option<Alignment>)>,
}

impl AlignmentReader<BufReader<Box<dyn std::io::Read + Send>>> {
    /// Open a (possibly compressed) alignment file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (reader, _format) = niffler::send::from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self::new(BufReader::with_capacity(1 << 20, reader)))
    }
}

impl<R: BufRead> AlignmentReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
            pending: None,
        }
    }

    /// Fill `group` with the next read's alignments. Returns `false` at end of input.
    pub fn next_group(&mut self, group: &mut AlignmentGroup) -> Result<bool> {
        group.clear();
        let (name, first) = match self.pending.take() {
            Some(rec) => rec,
            None => match self.read_record()? {
                Some(rec) => rec,
                None => return Ok(false),
            },
        };
        group.name = name;
        if let Some(aln) = first {
            group.push(aln);
        }

        while let Some((name, aln)) = self.read_record()? {
            if name != group.name {
                self.pending = Some((name, aln));
                break;
            }
            if let Some(aln) = aln {
                group.push(aln);
            }
        }
        Ok(true)
    }

    fn read_record(&mut self) -> Result<Option<(String, Option<Alignment>)>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .with_context(|| format!("failed to read alignment line {}", self.line_no + 1))?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let line = self.line.trim_end_matches(['\n', '\r']);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            return parse_line(line)
                .with_context(|| format!("malformed alignment at line {}", self.line_no))
                .map(Some);
        }
    }
}

fn parse_line(line: &str) -> Result<(String, Option<Alignment>)> {
    let mut fields = line.split('\t');
    let name = fields.next().unwrap_or_default().to_string();
    if name.is_empty() {
        bail!("missing read name");
    }
    let contig = fields.next().context("missing contig column")?;
    if contig == "*" {
        return Ok((name, None));
    }
    let contig: u32 = contig
        .parse()
        .with_context(|| format!("invalid contig id '{}'", contig))?;

    let strand = fields.next().context("missing strand column")?;
    let mut chars = strand.chars();
    let strand = match (chars.next(), chars.next()) {
        (Some(c), None) => Strand::from_char(c)?,
        _ => bail!("invalid strand '{}'", strand),
    };

    let pos = fields.next().context("missing position column")?;
    let pos: u32 = pos
        .parse()
        .with_context(|| format!("invalid position '{}'", pos))?;

    let mismatches = fields.next().context("missing mismatch column")?;
    let mismatches: u32 = mismatches
        .parse()
        .with_context(|| format!("invalid mismatch count '{}'", mismatches))?;

    let fragment_length = match fields.next() {
        Some(f) if !f.is_empty() => Some(
            f.parse::<u32>()
                .with_context(|| format!("invalid fragment length '{}'", f))?,
        ),
        _ => None,
    };

    Ok((
        name,
        Some(Alignment {
            contig,
            strand,
            pos,
            mismatches,
            fragment_length,
        }),
    ))
}

// ---------------------------------------------------------------------------
// AlignmentWriter
// ---------------------------------------------------------------------------

/// Writes alignment groups in the format read by [`AlignmentReader`].
pub struct AlignmentWriter<W: Write> {
    writer: W,
}

impl AlignmentWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> AlignmentWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_group(&mut self, group: &AlignmentGroup) -> Result<()> {
        if group.is_empty() {
            writeln!(self.writer, "{}\t*", group.name)?;
            return Ok(());
        }
        for aln in group.alignments() {
            write!(
                self.writer,
                "{}\t{}\t{}\t{}\t{}",
                group.name, aln.contig, aln.strand, aln.pos, aln.mismatches
            )?;
            match aln.fragment_length {
                Some(flen) => writeln!(self.writer, "\t{}", flen)?,
                None => writeln!(self.writer)?,
            }
        }
        Ok(())
    }

    /// Flush and return the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}
