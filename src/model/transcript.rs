//! Per-transcript fragment generative model.
//!
//! Positions are 0-based from the 5' end. A fragment is primed at some
//! position `j`, the reverse transcriptase survives positions `j, j-1, ..., i+1`
//! and terminates at `i` (by drop-off with probability `gamma[i]`, or by
//! running into a mark with probability `beta[i]` when marking is modeled).
//! Position 0 is the 5' origin: every fragment that reaches it terminates there.
//!
//! ```text
//!  5'                          3'
//!  0 - 1 2 ... i ... j ... len
//!      `-- drop --'  `-- priming
//! ```
//!
//! `len` is the transcript length minus the primer length. Internal arrays are
//! indexed `0..=len`; slot 0 of `gamma`/`beta` is unused.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rand::Rng;

use super::config::FragmentConfig;

/// Log-survival terms are floored here so `logsum` never reaches `-inf`.
const LOG_FLOOR: f64 = -1000.0;

/// Allowance on floating-point error in probability-sum checks.
pub const EPS: f64 = 1e-8;

/// Drop-off rate used when a model is created without prior parameters.
pub const INITIAL_GAMMA: f64 = 0.01;

/// `exp(x)`, with anything below `LOG_FLOOR` treated as exactly 0.
#[inline]
fn safe_exp(x: f64) -> f64 {
    if x < LOG_FLOOR { 0.0 } else { x.exp() }
}

// ---------------------------------------------------------------------------
// TranscriptModel
// ---------------------------------------------------------------------------

/// Drop-off / marking model of a single transcript.
///
/// Cloning yields an independent copy (per-thread private state) that still
/// shares the fragment configuration.
#[derive(Debug, Clone)]
pub struct TranscriptModel {
    config: Arc<FragmentConfig>,
    /// Number of positions that can carry parameters.
    len: usize,
    /// Probability of priming at any particular position, `1 / (len + 1)`.
    delta: f64,
    /// Probability that a fragment passes size selection.
    prob_pass: f64,
    gamma: Vec<f64>,
    beta: Option<Vec<f64>>,
    /// Expected counts of fragments primed at a position (paired-end only).
    start: Vec<f64>,
    /// Expected counts of fragments terminating at a position.
    end: Vec<f64>,
    /// The single-end share of `end`; their priming positions are latent.
    unpaired_end: Vec<f64>,
    /// `logsum[i] = sum_{k=1..=i} log survival(k)`.
    logsum: Vec<f64>,
    /// `margin_prob[i] = sum_{j=i+min}^{min(i+max, len)} prod_{k=i+min+1}^{j} survival(k)`.
    margin_prob: Vec<f64>,
    single_end: bool,
}

impl TranscriptModel {
    /// Create a model for a transcript of `transcript_length` bases with a
    /// uniform initial drop-off rate.
    pub fn new(config: Arc<FragmentConfig>, transcript_length: usize) -> Self {
        let len = transcript_length.saturating_sub(config.primer_length());
        let mut gamma = vec![INITIAL_GAMMA; len + 1];
        gamma[0] = 0.0;
        Self::from_internal(config, len, gamma)
    }

    /// Create a model from known drop-off rates for positions `1..=len`.
    pub fn with_gamma(config: Arc<FragmentConfig>, gamma: Vec<f64>) -> Result<Self> {
        check_probabilities(&gamma, "gamma")?;
        let len = gamma.len();
        let mut internal = Vec::with_capacity(len + 1);
        internal.push(0.0);
        internal.extend(gamma);
        Ok(Self::from_internal(config, len, internal))
    }

    fn from_internal(config: Arc<FragmentConfig>, len: usize, gamma: Vec<f64>) -> Self {
        let mut model = Self {
            config,
            len,
            delta: 1.0 / (len + 1) as f64,
            prob_pass: 0.0,
            gamma,
            beta: None,
            start: vec![0.0; len + 1],
            end: vec![0.0; len + 1],
            unpaired_end: vec![0.0; len + 1],
            logsum: vec![0.0; len + 1],
            margin_prob: vec![0.0; len + 1],
            single_end: false,
        };
        model.recompute_auxiliary();
        model
    }

    /// Model a second, independent marking process initialized to `init`
    /// everywhere. Subsequent EM rounds learn `beta` with `gamma` held fixed.
    pub fn enable_beta(&mut self, init: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&init) {
            bail!("initial marking rate {} is outside [0, 1]", init);
        }
        let mut beta = vec![init; self.len + 1];
        beta[0] = 0.0;
        self.beta = Some(beta);
        self.recompute_auxiliary();
        Ok(())
    }

    /// Replace the marking rates for positions `1..=len`.
    pub fn set_beta(&mut self, beta: Vec<f64>) -> Result<()> {
        if beta.len() != self.len {
            bail!(
                "beta has {} values but the transcript has {} positions",
                beta.len(),
                self.len
            );
        }
        check_probabilities(&beta, "beta")?;
        let mut internal = Vec::with_capacity(self.len + 1);
        internal.push(0.0);
        internal.extend(beta);
        self.beta = Some(internal);
        self.recompute_auxiliary();
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn config(&self) -> &FragmentConfig {
        &self.config
    }

    /// Drop-off rates for positions `1..=len`.
    pub fn gamma(&self) -> &[f64] {
        &self.gamma[1..]
    }

    /// Marking rates for positions `1..=len`, if marking is modeled.
    pub fn beta(&self) -> Option<&[f64]> {
        self.beta.as_deref().map(|b| &b[1..])
    }

    #[inline]
    pub fn prob_pass(&self) -> f64 {
        self.prob_pass
    }

    /// Whether any single-end observation has been recorded since `init()`.
    #[inline]
    pub fn is_single_end(&self) -> bool {
        self.single_end
    }

    /// Total expected fragment count recorded since `init()`.
    pub fn observed_count(&self) -> f64 {
        self.end.iter().sum()
    }

    #[inline]
    fn survival(&self, k: usize) -> f64 {
        let g = 1.0 - self.gamma[k];
        match &self.beta {
            Some(beta) => g * (1.0 - beta[k]),
            None => g,
        }
    }

    #[inline]
    fn termination(&self, k: usize) -> f64 {
        if k == 0 {
            return 1.0;
        }
        match &self.beta {
            Some(beta) => self.gamma[k] + beta[k] - self.gamma[k] * beta[k],
            None => self.gamma[k],
        }
    }

    /// Highest position at which a valid fragment can terminate, if any.
    #[inline]
    fn last_valid_end(&self) -> Option<usize> {
        self.len.checked_sub(self.config.min_frag_len())
    }

    // -----------------------------------------------------------------------
    // Derived arrays
    // -----------------------------------------------------------------------

    /// Recompute `logsum`, `margin_prob` and `prob_pass`.
    ///
    /// Must run after any change to `gamma`/`beta` and before any
    /// `probability_*` call. Constructors and setters already do so.
    pub fn recompute_auxiliary(&mut self) {
        let len = self.len;
        let min = self.config.min_frag_len();
        let max = self.config.max_frag_len();

        self.delta = 1.0 / (len + 1) as f64;
        self.logsum[0] = 0.0;
        for k in 1..=len {
            self.logsum[k] = self.logsum[k - 1] + self.survival(k).ln().max(LOG_FLOOR);
        }

        self.margin_prob.iter_mut().for_each(|m| *m = 0.0);
        self.prob_pass = 0.0;
        let Some(last) = self.last_valid_end() else {
            return;
        };

        for i in 0..=last {
            let anchor = i + min;
            let upper = (i + max).min(len);
            let base = self.logsum[anchor];
            let margin: f64 = (anchor..=upper)
                .map(|j| safe_exp(self.logsum[j] - base))
                .sum();
            self.margin_prob[i] = margin;
            self.prob_pass += self.delta
                * margin
                * safe_exp(self.logsum[anchor] - self.logsum[i])
                * self.termination(i);
        }
    }

    // -----------------------------------------------------------------------
    // Probabilities
    // -----------------------------------------------------------------------

    /// Probability of a size-selected single-end fragment whose 5' end is at `pos`.
    pub fn probability_se(&self, pos: i64) -> f64 {
        if pos < 0 || self.prob_pass <= 0.0 {
            return 0.0;
        }
        let pos = pos as usize;
        let start_pos = pos + self.config.min_frag_len();
        if start_pos > self.len {
            return 0.0;
        }
        self.delta
            * self.margin_prob[pos]
            * safe_exp(self.logsum[start_pos] - self.logsum[pos])
            * self.termination(pos)
            / self.prob_pass
    }

    /// Probability of a size-selected paired-end fragment with 5' end at `pos`
    /// and observed length `fragment_length` (primer included).
    pub fn probability_pe(&self, pos: i64, fragment_length: usize) -> f64 {
        if pos < 0 || self.prob_pass <= 0.0 {
            return 0.0;
        }
        let Some(insert) = self.insert_length(fragment_length) else {
            return 0.0;
        };
        let pos = pos as usize;
        let start_pos = pos + insert;
        if start_pos > self.len {
            return 0.0;
        }
        self.delta * safe_exp(self.logsum[start_pos] - self.logsum[pos]) * self.termination(pos)
            / self.prob_pass
    }

    /// Fragment length with the primer removed, if it passes size selection.
    #[inline]
    fn insert_length(&self, fragment_length: usize) -> Option<usize> {
        let insert = fragment_length.checked_sub(self.config.primer_length())?;
        (self.config.min_frag_len()..=self.config.max_frag_len())
            .contains(&insert)
            .then_some(insert)
    }

    // -----------------------------------------------------------------------
    // Observations
    // -----------------------------------------------------------------------

    /// Reset accumulated observations.
    pub fn init(&mut self) {
        self.start.iter_mut().for_each(|v| *v = 0.0);
        self.end.iter_mut().for_each(|v| *v = 0.0);
        self.unpaired_end.iter_mut().for_each(|v| *v = 0.0);
        self.single_end = false;
    }

    /// Record `frac` of a single-end read whose 5' end is at `pos`.
    pub fn update_se(&mut self, pos: i64, frac: f64) {
        if pos < 0 {
            return;
        }
        let pos = pos as usize;
        if pos + self.config.min_frag_len() > self.len {
            return;
        }
        self.end[pos] += frac;
        self.unpaired_end[pos] += frac;
        self.single_end = true;
    }

    /// Record `frac` of a read pair with 5' end at `pos` and fragment length
    /// `fragment_length` (primer included).
    pub fn update_pe(&mut self, pos: i64, fragment_length: usize, frac: f64) {
        if pos < 0 {
            return;
        }
        let Some(insert) = self.insert_length(fragment_length) else {
            return;
        };
        let pos = pos as usize;
        if pos + insert > self.len {
            return;
        }
        self.end[pos] += frac;
        self.start[pos + insert] += frac;
    }

    // -----------------------------------------------------------------------
    // EM
    // -----------------------------------------------------------------------

    /// Re-estimate drop-off (or marking) rates from the recorded observations.
    ///
    /// `n_obs` is the expected number of size-selected fragments of this
    /// transcript; `n_obs / prob_pass` fragments are assumed to have been
    /// generated in total, the rest being lost to size selection.
    pub fn em_round(&mut self, n_obs: f64, rounds: usize) {
        if self.last_valid_end().is_none() || n_obs <= 0.0 {
            return;
        }
        for _ in 0..rounds {
            if self.prob_pass <= 0.0 {
                break;
            }
            let (start2, end2) = self.expected_counts(n_obs);
            self.maximize(&start2, &end2);
            self.recompute_auxiliary();
        }
    }

    /// E-step: expected priming (`start2`) and termination (`end2`) counts of
    /// all generated fragments, observed or lost to size selection.
    fn expected_counts(&self, n_obs: f64) -> (Vec<f64>, Vec<f64>) {
        let len = self.len;
        let min = self.config.min_frag_len();
        let max = self.config.max_frag_len();

        let mut start2 = self.start.clone();
        let mut end2 = self.end.clone();

        // Single-end reads: impute the priming position.
        if let Some(last) = self.last_valid_end() {
            for i in 0..=last {
                let count = self.unpaired_end[i];
                let margin = self.margin_prob[i];
                if count <= 0.0 || margin <= 0.0 {
                    continue;
                }
                let anchor = i + min;
                let upper = (i + max).min(len);
                let base = self.logsum[anchor];
                for (j, slot) in start2.iter_mut().enumerate().take(upper + 1).skip(anchor) {
                    *slot += count * safe_exp(self.logsum[j] - base) / margin;
                }
            }
        }

        // Fragments removed by size selection.
        let scale = n_obs / self.prob_pass * self.delta;

        // reach[k] = sum_{j=k}^{len} prod_{m=k+1}^{j} survival(m)
        let mut reach = vec![0.0; len + 1];
        reach[len] = 1.0;
        for k in (0..len).rev() {
            reach[k] = 1.0 + self.survival(k + 1) * reach[k + 1];
        }

        for (i, slot) in end2.iter_mut().enumerate() {
            let valid = if i + min <= len {
                safe_exp(self.logsum[i + min] - self.logsum[i]) * self.margin_prob[i]
            } else {
                0.0
            };
            *slot += scale * self.termination(i) * (reach[i] - valid).max(0.0);
        }

        for j in 1..=len {
            let mut kept = 0.0;
            if j >= min {
                let lo = j.saturating_sub(max);
                for i in lo..=(j - min) {
                    kept += safe_exp(self.logsum[j] - self.logsum[i]) * self.termination(i);
                }
            }
            start2[j] += scale * (1.0 - kept).max(0.0);
        }

        (start2, end2)
    }

    /// M-step: rates from expected terminations and passes at each position.
    fn maximize(&mut self, start2: &[f64], end2: &[f64]) {
        let mut primed_at_or_after = 0.0;
        let mut ended_at_or_after = 0.0;
        for k in (1..=self.len).rev() {
            primed_at_or_after += start2[k];
            ended_at_or_after += end2[k];
            let drops = end2[k];
            let passes = (primed_at_or_after - ended_at_or_after).max(0.0);
            let denom = drops + passes;
            if denom <= 0.0 {
                continue;
            }
            let termination = self.termination(k);
            match self.beta.as_mut() {
                None => self.gamma[k] = (drops / denom).clamp(0.0, 1.0),
                Some(beta) => {
                    if termination <= 0.0 {
                        continue;
                    }
                    let marks = drops * beta[k] / termination;
                    beta[k] = (marks / denom).clamp(0.0, 1.0);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Simulation
    // -----------------------------------------------------------------------

    /// Sample one size-selected fragment: `(pos, fragment_length)`, with the
    /// primer included in the length. `None` if no fragment can pass.
    pub fn simulate<R: Rng>(&self, rng: &mut R) -> Option<(usize, usize)> {
        if self.prob_pass <= 0.0 {
            return None;
        }
        loop {
            let j = rng.random_range(0..=self.len);
            let mut k = j;
            while k > 0 && rng.random::<f64>() < self.survival(k) {
                k -= 1;
            }
            let insert = j - k;
            if (self.config.min_frag_len()..=self.config.max_frag_len()).contains(&insert) {
                return Some((k, insert + self.config.primer_length()));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write `len` followed by the `len` rates (beta if modeled, else gamma)
    /// as one whitespace-separated line.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let values = match &self.beta {
            Some(beta) => &beta[1..],
            None => &self.gamma[1..],
        };
        write!(writer, "{}", self.len)?;
        for v in values {
            write!(writer, " {}", v)?;
        }
        writeln!(writer)?;
        Ok(())
    }

    /// Read one model line written by [`TranscriptModel::write`]; the values
    /// become the drop-off rates.
    pub fn read<R: BufRead>(reader: &mut R, config: Arc<FragmentConfig>) -> Result<Self> {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .context("failed to read transcript model line")?;
        if n == 0 {
            bail!("unexpected end of input while reading a transcript model");
        }
        Self::parse_line(&line, config)
    }

    /// Parse one model line: `len v_1 ... v_len`.
    pub fn parse_line(line: &str, config: Arc<FragmentConfig>) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let len: usize = fields
            .next()
            .context("empty transcript model line")?
            .parse()
            .context("invalid transcript model length")?;
        let values = fields
            .map(|f| f.parse::<f64>().with_context(|| format!("invalid rate '{}'", f)))
            .collect::<Result<Vec<_>>>()?;
        if values.len() != len {
            bail!(
                "transcript model declares {} positions but lists {} rates",
                len,
                values.len()
            );
        }
        Self::with_gamma(config, values)
    }
}

fn check_probabilities(values: &[f64], name: &str) -> Result<()> {
    if let Some((i, v)) = values
        .iter()
        .enumerate()
        .find(|(_, v)| !(0.0..=1.0).contains(*v))
    {
        bail!("{}[{}] = {} is not a probability", name, i + 1, v);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
