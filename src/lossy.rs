//! Lossy quality-score preservation policies.
//!
//! A policy string such as `"*8"` or `"R8-N40-U40"` expands into an ordered
//! list of [`PreservationPolicy`] entries. Words are separated by `-`; each
//! word is one or more base selectors followed by a treatment number:
//!
//! * selectors: `*` every base, `R` reference match, `N` mismatch,
//!   `U` unplaced read, `I` inserted base, `D` base flanking a deletion,
//!   `P<n>` pileup mismatch depth greater than `n`, `L<n>` coverage lower
//!   than `n`. `P` and `L` consult [`ReferenceTracks`].
//! * treatment: `40` preserves the score verbatim, `0` drops it, any other
//!   value bins it into that many quantization levels.
//!
//! Bases selected by no policy are masked to [`MASKED_QUALITY_SCORE`]. When
//! no policy is configured at all the writer bypasses this module and forces
//! verbatim preservation instead.

use crate::errors::{CramError, Result};
use crate::record::{consumes_read_bases, consumes_reference_bases, is_aligned_op, CramRecord, ReadFeature};
use crate::tracks::ReferenceTracks;
use noodles::sam::alignment::record::Cigar;
use noodles::sam::alignment::RecordBuf;

/// Sentinel stored at read positions whose score was not retained.
pub const MASKED_QUALITY_SCORE: u8 = 0xFF;

/// Highest Phred score considered by binning; higher scores clamp here.
const MAX_BINNABLE_SCORE: u8 = 40;

/// Which bases of a read a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseSelector {
    /// Every base
    All,
    /// Bases matching the reference
    Match,
    /// Bases substituted relative to the reference
    Mismatch,
    /// All bases of unplaced (unmapped) reads
    Unplaced,
    /// Inserted bases
    Insertion,
    /// Bases immediately flanking a deletion
    FlankingDeletion,
    /// Bases whose pileup mismatch depth exceeds the threshold
    Pileup(u32),
    /// Bases whose coverage is below the threshold
    LowCoverage(u32),
}

impl BaseSelector {
    /// True when evaluating this selector needs coverage/mismatch tracks.
    #[must_use]
    pub fn requires_tracks(&self) -> bool {
        matches!(self, Self::Pileup(_) | Self::LowCoverage(_))
    }
}

/// What happens to the quality score of a selected base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Treatment {
    /// Keep the score verbatim
    Preserve,
    /// Quantize the score into this many levels
    Bin(u8),
    /// Mask the score
    Drop,
}

/// One parsed policy word: a set of selectors sharing a treatment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservationPolicy {
    /// Selectors this word applies to (union)
    pub selectors: Vec<BaseSelector>,
    /// Treatment applied to selected bases
    pub treatment: Treatment,
}

/// The full ordered policy list parsed from a specification string.
#[derive(Debug, Clone)]
pub struct QualityScorePreservation {
    policies: Vec<PreservationPolicy>,
}

impl QualityScorePreservation {
    /// Parses a policy specification string.
    ///
    /// # Errors
    ///
    /// Returns [`CramError::InvalidPreservationPolicy`] on unknown selector
    /// codes, missing treatments, or out-of-range parameters.
    pub fn new(spec: &str) -> Result<Self> {
        let invalid = |reason: String| CramError::InvalidPreservationPolicy {
            policy: spec.to_string(),
            reason,
        };

        let mut policies = Vec::new();
        for word in spec.split('-') {
            if word.is_empty() {
                return Err(invalid("empty policy word".to_string()));
            }
            let chars: Vec<char> = word.chars().collect();
            let mut pos = 0;
            let mut selectors = Vec::new();

            loop {
                match chars.get(pos) {
                    Some('*') => {
                        selectors.push(BaseSelector::All);
                        pos += 1;
                    }
                    Some('R') => {
                        selectors.push(BaseSelector::Match);
                        pos += 1;
                    }
                    Some('N') => {
                        selectors.push(BaseSelector::Mismatch);
                        pos += 1;
                    }
                    Some('U') => {
                        selectors.push(BaseSelector::Unplaced);
                        pos += 1;
                    }
                    Some('I') => {
                        selectors.push(BaseSelector::Insertion);
                        pos += 1;
                    }
                    Some('D') => {
                        selectors.push(BaseSelector::FlankingDeletion);
                        pos += 1;
                    }
                    Some(c @ ('P' | 'L')) => {
                        let c = *c;
                        pos += 1;
                        let (param, next) = read_number(&chars, pos)
                            .ok_or_else(|| invalid(format!("selector '{c}' needs a parameter")))?;
                        pos = next;
                        selectors.push(if c == 'P' {
                            BaseSelector::Pileup(param)
                        } else {
                            BaseSelector::LowCoverage(param)
                        });
                    }
                    Some(c) if c.is_ascii_digit() => break,
                    Some(c) => return Err(invalid(format!("unknown base selector '{c}'"))),
                    None => return Err(invalid("policy word has no treatment".to_string())),
                }
            }

            if selectors.is_empty() {
                return Err(invalid("policy word has no selectors".to_string()));
            }
            let (value, next) = read_number(&chars, pos)
                .ok_or_else(|| invalid("policy word has no treatment".to_string()))?;
            if next != chars.len() {
                return Err(invalid(format!("trailing characters in word '{word}'")));
            }
            let treatment = match value {
                40 => Treatment::Preserve,
                0 => Treatment::Drop,
                n if n <= u32::from(MAX_BINNABLE_SCORE) => {
                    Treatment::Bin(u8::try_from(n).unwrap_or(MAX_BINNABLE_SCORE))
                }
                n => return Err(invalid(format!("treatment {n} out of range"))),
            };

            policies.push(PreservationPolicy { selectors, treatment });
        }

        Ok(Self { policies })
    }

    /// The parsed policy entries, in application order.
    #[must_use]
    pub fn policies(&self) -> &[PreservationPolicy] {
        &self.policies
    }

    /// True when any selector consults coverage/mismatch tracks.
    #[must_use]
    pub fn requires_tracks(&self) -> bool {
        self.policies.iter().any(|p| p.selectors.iter().any(BaseSelector::requires_tracks))
    }

    /// Applies the policy list to one record, replacing its quality scores
    /// with the retained/masked array.
    ///
    /// Records without quality scores are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CramError::LossyMultiRefNotSupported`] when a
    /// track-consulting selector runs without tracks.
    pub fn apply(
        &self,
        record: &RecordBuf,
        cram: &mut CramRecord,
        tracks: Option<&ReferenceTracks>,
    ) -> Result<()> {
        let Some(original) = cram.quality_scores.clone() else {
            return Ok(());
        };
        let mut scores = vec![MASKED_QUALITY_SCORE; original.len()];

        for policy in &self.policies {
            for selector in &policy.selectors {
                self.mark(record, cram, tracks, *selector, policy.treatment, &original, &mut scores)?;
            }
        }

        cram.quality_scores = Some(scores);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn mark(
        &self,
        record: &RecordBuf,
        cram: &CramRecord,
        tracks: Option<&ReferenceTracks>,
        selector: BaseSelector,
        treatment: Treatment,
        original: &[u8],
        scores: &mut [u8],
    ) -> Result<()> {
        let mut set = |read_pos: usize| {
            if let Some(score) = original.get(read_pos) {
                scores[read_pos] = treat(*score, treatment);
            }
        };

        match selector {
            BaseSelector::All => {
                for pos in 0..original.len() {
                    set(pos);
                }
            }
            BaseSelector::Unplaced => {
                if cram.segment_unmapped {
                    for pos in 0..original.len() {
                        set(pos);
                    }
                }
            }
            BaseSelector::Mismatch => {
                for feature in &cram.features {
                    if let ReadFeature::Substitution { position, .. } = feature {
                        set(position - 1);
                    }
                }
            }
            BaseSelector::Insertion => {
                for feature in &cram.features {
                    if let ReadFeature::Insertion { position, bases } = feature {
                        for offset in 0..bases.len() {
                            set(position - 1 + offset);
                        }
                    }
                }
            }
            BaseSelector::FlankingDeletion => {
                for feature in &cram.features {
                    if let ReadFeature::Deletion { position, .. } = feature {
                        // position is the first read base after the deletion;
                        // its predecessor is the base before
                        if *position >= 2 {
                            set(position - 2);
                        }
                        set(position - 1);
                    }
                }
            }
            BaseSelector::Match => {
                let substituted: Vec<usize> = cram
                    .features
                    .iter()
                    .filter_map(|f| match f {
                        ReadFeature::Substitution { position, .. } => Some(position - 1),
                        _ => None,
                    })
                    .collect();
                for_each_aligned_position(record, |read_pos, _ref_pos| {
                    if !substituted.contains(&read_pos) {
                        set(read_pos);
                    }
                });
            }
            BaseSelector::Pileup(threshold) => {
                let tracks = tracks.ok_or(CramError::LossyMultiRefNotSupported)?;
                for_each_aligned_position(record, |read_pos, ref_pos| {
                    if tracks.mismatches_at(ref_pos) > threshold {
                        set(read_pos);
                    }
                });
            }
            BaseSelector::LowCoverage(threshold) => {
                let tracks = tracks.ok_or(CramError::LossyMultiRefNotSupported)?;
                for_each_aligned_position(record, |read_pos, ref_pos| {
                    if tracks.coverage_at(ref_pos) < threshold {
                        set(read_pos);
                    }
                });
            }
        }
        Ok(())
    }
}

/// Reads a decimal number from `chars` starting at `pos`.
fn read_number(chars: &[char], mut pos: usize) -> Option<(u32, usize)> {
    let start = pos;
    let mut value: u32 = 0;
    while let Some(c) = chars.get(pos) {
        let Some(digit) = c.to_digit(10) else { break };
        value = value.checked_mul(10)?.checked_add(digit)?;
        pos += 1;
    }
    (pos > start).then_some((value, pos))
}

/// Applies a treatment to a single score.
fn treat(score: u8, treatment: Treatment) -> u8 {
    match treatment {
        Treatment::Preserve => score,
        Treatment::Drop => MASKED_QUALITY_SCORE,
        Treatment::Bin(levels) => bin_score(score, levels),
    }
}

/// Quantizes a Phred score into `levels` uniform bins over `0..=40`,
/// returning the bin midpoint.
fn bin_score(score: u8, levels: u8) -> u8 {
    if levels == 0 {
        return MASKED_QUALITY_SCORE;
    }
    let clamped = score.min(MAX_BINNABLE_SCORE);
    let step = (u32::from(MAX_BINNABLE_SCORE) + 1).div_ceil(u32::from(levels));
    let bin = u32::from(clamped) / step;
    u8::try_from((bin * step + step / 2).min(u32::from(MAX_BINNABLE_SCORE)))
        .unwrap_or(MAX_BINNABLE_SCORE)
}

/// Walks the CIGAR calling `f(read_pos_0based, ref_pos_1based)` for every
/// aligned (M/=/X) base.
fn for_each_aligned_position<F: FnMut(usize, usize)>(record: &RecordBuf, mut f: F) {
    let Some(start) = record.alignment_start() else {
        return;
    };
    let mut ref_pos = usize::from(start);
    let mut read_pos = 0usize;
    for op in record.cigar().iter().filter_map(std::result::Result::ok) {
        let len = op.len();
        if is_aligned_op(op.kind()) {
            for i in 0..len {
                f(read_pos + i, ref_pos + i);
            }
        }
        if consumes_read_bases(op.kind()) {
            read_pos += len;
        }
        if consumes_reference_bases(op.kind()) {
            ref_pos += len;
        }
    }
}
