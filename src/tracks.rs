//! Per-position coverage and mismatch tracks over a reference window.
//!
//! Built once per flushed batch when the active quality-preservation policy
//! consults pileup state. The window is extended lazily to span the batch's
//! `[min_start, max_end]` before population.

use crate::record::{consumes_read_bases, consumes_reference_bases, is_aligned_op};
use noodles::sam::alignment::record::Cigar;
use noodles::sam::alignment::RecordBuf;
use std::sync::Arc;

/// Coverage and mismatch counters over a window of one reference sequence.
///
/// Positions are 1-based reference coordinates. Queries outside the current
/// window return zero counts and `N` bases rather than panicking; the
/// population pass is expected to have sized the window first.
#[derive(Debug)]
pub struct ReferenceTracks {
    sequence_index: usize,
    bases: Arc<Vec<u8>>,
    /// 1-based first position covered by the window; 0 while empty
    window_start: usize,
    coverage: Vec<u32>,
    mismatches: Vec<u32>,
}

impl ReferenceTracks {
    /// Creates empty tracks over the given reference sequence.
    #[must_use]
    pub fn new(sequence_index: usize, bases: Arc<Vec<u8>>) -> Self {
        Self { sequence_index, bases, window_start: 0, coverage: Vec::new(), mismatches: Vec::new() }
    }

    /// Index of the tracked sequence in the header dictionary.
    #[must_use]
    pub fn sequence_index(&self) -> usize {
        self.sequence_index
    }

    /// Extends the window to cover `[start, start + span)`, preserving any
    /// counts already accumulated.
    pub fn ensure_window(&mut self, start: usize, span: usize) {
        if span == 0 {
            return;
        }
        let end = start + span; // exclusive
        if self.window_start == 0 {
            self.window_start = start;
            self.coverage = vec![0; span];
            self.mismatches = vec![0; span];
            return;
        }

        let current_end = self.window_start + self.coverage.len();
        let new_start = self.window_start.min(start);
        let new_end = current_end.max(end);
        if new_start == self.window_start && new_end == current_end {
            return;
        }

        let new_len = new_end - new_start;
        let offset = self.window_start - new_start;
        let mut coverage = vec![0; new_len];
        let mut mismatches = vec![0; new_len];
        coverage[offset..offset + self.coverage.len()].copy_from_slice(&self.coverage);
        mismatches[offset..offset + self.mismatches.len()].copy_from_slice(&self.mismatches);
        self.window_start = new_start;
        self.coverage = coverage;
        self.mismatches = mismatches;
    }

    fn slot(&self, position: usize) -> Option<usize> {
        if self.window_start == 0 || position < self.window_start {
            return None;
        }
        let idx = position - self.window_start;
        (idx < self.coverage.len()).then_some(idx)
    }

    /// Adds to the coverage counter at a 1-based reference position.
    pub fn add_coverage(&mut self, position: usize, amount: u32) {
        if let Some(idx) = self.slot(position) {
            self.coverage[idx] += amount;
        }
    }

    /// Adds to the mismatch counter at a 1-based reference position.
    pub fn add_mismatches(&mut self, position: usize, amount: u32) {
        if let Some(idx) = self.slot(position) {
            self.mismatches[idx] += amount;
        }
    }

    /// Coverage count at a 1-based reference position.
    #[must_use]
    pub fn coverage_at(&self, position: usize) -> u32 {
        self.slot(position).map_or(0, |idx| self.coverage[idx])
    }

    /// Mismatch count at a 1-based reference position.
    #[must_use]
    pub fn mismatches_at(&self, position: usize) -> u32 {
        self.slot(position).map_or(0, |idx| self.mismatches[idx])
    }

    /// Reference base at a 1-based position; `N` beyond the sequence end.
    #[must_use]
    pub fn base_at(&self, position: usize) -> u8 {
        if position == 0 {
            return b'N';
        }
        self.bases.get(position - 1).copied().unwrap_or(b'N')
    }

    /// Accumulates coverage and mismatch counts from every aligned record in
    /// the batch.
    ///
    /// For each CIGAR operation: reference-consuming operations add coverage
    /// over their span, and aligned operations (M/=/X) compare read bases
    /// against the reference, counting mismatches per position. The read-base
    /// index within an aligned operation is `read_pos + i` with `i` bounded
    /// by the operation length.
    pub fn populate(&mut self, records: &[RecordBuf]) {
        for record in records {
            let Some(start) = record.alignment_start() else {
                continue;
            };
            let sequence: &[u8] = record.sequence().as_ref();
            let mut ref_pos = usize::from(start);
            let mut read_pos = 0usize;

            for op in record.cigar().iter().filter_map(std::result::Result::ok) {
                let len = op.len();
                if consumes_reference_bases(op.kind()) {
                    for i in 0..len {
                        self.add_coverage(ref_pos + i, 1);
                    }
                }
                if is_aligned_op(op.kind()) {
                    for i in 0..len {
                        let read_base = sequence.get(read_pos + i).copied().unwrap_or(b'N');
                        if read_base != self.base_at(ref_pos + i) {
                            self.add_mismatches(ref_pos + i, 1);
                        }
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam_builder::SamBuilder;

    fn tracks_over(bases: &[u8]) -> ReferenceTracks {
        ReferenceTracks::new(0, Arc::new(bases.to_vec()))
    }

    #[test]
    fn test_window_counts() {
        let mut tracks = tracks_over(b"ACGTACGTACGT");
        tracks.ensure_window(3, 4);

        tracks.add_coverage(3, 1);
        tracks.add_coverage(3, 1);
        tracks.add_mismatches(5, 1);

        assert_eq!(tracks.coverage_at(3), 2);
        assert_eq!(tracks.coverage_at(4), 0);
        assert_eq!(tracks.mismatches_at(5), 1);
        // outside the window
        assert_eq!(tracks.coverage_at(1), 0);
        assert_eq!(tracks.coverage_at(100), 0);
    }

    #[test]
    fn test_window_extension_preserves_counts() {
        let mut tracks = tracks_over(b"ACGTACGTACGT");
        tracks.ensure_window(5, 3);
        tracks.add_coverage(6, 7);

        tracks.ensure_window(2, 10);
        assert_eq!(tracks.coverage_at(6), 7);
        tracks.add_coverage(2, 1);
        tracks.add_coverage(11, 1);
        assert_eq!(tracks.coverage_at(2), 1);
        assert_eq!(tracks.coverage_at(11), 1);
    }

    #[test]
    fn test_base_at() {
        let tracks = tracks_over(b"ACGT");
        assert_eq!(tracks.base_at(1), b'A');
        assert_eq!(tracks.base_at(4), b'T');
        assert_eq!(tracks.base_at(5), b'N');
        assert_eq!(tracks.base_at(0), b'N');
    }

    #[test]
    fn test_populate_perfect_match() {
        let mut builder = SamBuilder::with_refs(&[("chr1", 100)]);
        let _rec =
            builder.add_frag().name("r1").start(3).bases("GTAC").cigar("4M").build();

        // reference positions 3..=6 are G, T, A, C
        let mut tracks = tracks_over(b"ACGTACGTAC");
        tracks.ensure_window(1, 10);
        tracks.populate(builder.records());

        for pos in 3..=6 {
            assert_eq!(tracks.coverage_at(pos), 1, "coverage at {pos}");
            assert_eq!(tracks.mismatches_at(pos), 0, "mismatches at {pos}");
        }
        assert_eq!(tracks.coverage_at(2), 0);
        assert_eq!(tracks.coverage_at(7), 0);
    }

    #[test]
    fn test_populate_counts_mismatches() {
        let mut builder = SamBuilder::with_refs(&[("chr1", 100)]);
        // reference 1..=4 is ACGT; read has a mismatch at position 2
        let _rec =
            builder.add_frag().name("r1").start(1).bases("AGGT").cigar("4M").build();

        let mut tracks = tracks_over(b"ACGTACGT");
        tracks.ensure_window(1, 8);
        tracks.populate(builder.records());

        assert_eq!(tracks.mismatches_at(1), 0);
        assert_eq!(tracks.mismatches_at(2), 1);
        assert_eq!(tracks.mismatches_at(3), 0);
    }

    #[test]
    fn test_populate_insertion_and_deletion() {
        let mut builder = SamBuilder::with_refs(&[("chr1", 100)]);
        // 2M2I2M over reference ACGTAC starting at 1: read bases AC + GG + GT
        // consume reference positions 1..=4 only
        let _rec =
            builder.add_frag().name("r1").start(1).bases("ACGGGT").cigar("2M2I2M").build();
        // 2M2D2M starting at 11: consumes reference 11..=16
        let _rec2 =
            builder.add_frag().name("r2").start(11).bases("GTGT").cigar("2M2D2M").build();

        let mut tracks = tracks_over(b"ACGTACGTACGTACGTACGT");
        tracks.ensure_window(1, 20);
        tracks.populate(builder.records());

        // insertion does not consume reference
        assert_eq!(tracks.coverage_at(4), 1);
        assert_eq!(tracks.coverage_at(5), 0);
        // the deleted positions still count as covered
        assert_eq!(tracks.coverage_at(13), 1);
        assert_eq!(tracks.coverage_at(14), 1);
        assert_eq!(tracks.coverage_at(16), 1);
        assert_eq!(tracks.coverage_at(17), 0);
        // read GT GT matches reference at 11..=12 and 15..=16
        assert_eq!(tracks.mismatches_at(11), 0);
        assert_eq!(tracks.mismatches_at(15), 0);
    }

    #[test]
    fn test_populate_skips_unmapped() {
        let mut builder = SamBuilder::with_refs(&[("chr1", 100)]);
        let _rec = builder.add_frag().name("u1").bases("ACGT").unmapped().build();

        let mut tracks = tracks_over(b"ACGTACGT");
        tracks.ensure_window(1, 8);
        tracks.populate(builder.records());

        for pos in 1..=8 {
            assert_eq!(tracks.coverage_at(pos), 0);
        }
    }
}
