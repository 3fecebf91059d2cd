//! Fluent builders for test alignment records.
//!
//! Mirrors the shape of fgbio-style SAM builders: a [`SamBuilder`] owns a
//! header and default read settings, and hands out [`FragBuilder`] /
//! [`PairBuilder`] for individual reads. Used by this crate's tests; kept
//! public so downstream crates can build fixtures the same way.

use bstr::BString;
use noodles::core::Position;
use noodles::sam::alignment::record::cigar::op::{Kind, Op};
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::{QualityScores, RecordBuf, Sequence};
use noodles::sam::header::record::value::map::ReferenceSequence;
use noodles::sam::header::record::value::Map;
use noodles::sam::Header;
use std::num::NonZeroUsize;

/// Default read length for generated records.
pub const DEFAULT_READ_LENGTH: usize = 100;
/// Default base quality for generated records.
pub const DEFAULT_BASE_QUALITY: u8 = 30;
/// Default mapping quality for mapped records.
pub const DEFAULT_MAPQ: u8 = 60;

/// Strand orientation for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    /// Forward strand
    Plus,
    /// Reverse strand
    Minus,
}

impl Strand {
    /// True for the reverse strand.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        matches!(self, Strand::Minus)
    }
}

/// Renders a coordinate-sorted header with the given reference dictionary.
#[must_use]
pub fn coordinate_header_text(refs: &[(&str, usize)]) -> String {
    let mut text = String::from("@HD\tVN:1.6\tSO:coordinate\n");
    for (name, length) in refs {
        text.push_str(&format!("@SQ\tSN:{name}\tLN:{length}\n"));
    }
    text
}

/// Accumulates test records and manages the shared header.
#[derive(Debug)]
pub struct SamBuilder {
    /// The SAM header shared by all generated records
    pub header: Header,
    records: Vec<RecordBuf>,
    read_length: usize,
    base_quality: u8,
    counter: u64,
}

impl SamBuilder {
    /// Creates a builder with the given reference dictionary.
    ///
    /// # Panics
    ///
    /// Panics if a reference length is zero.
    #[must_use]
    pub fn with_refs(refs: &[(&str, usize)]) -> Self {
        let mut header = Header::builder();
        for (name, length) in refs {
            let map = Map::<ReferenceSequence>::new(NonZeroUsize::new(*length).unwrap());
            header = header.add_reference_sequence(BString::from(*name), map);
        }
        Self {
            header: header.build(),
            records: Vec::new(),
            read_length: DEFAULT_READ_LENGTH,
            base_quality: DEFAULT_BASE_QUALITY,
            counter: 0,
        }
    }

    /// Overrides the default read length.
    #[must_use]
    pub fn read_length(mut self, read_length: usize) -> Self {
        self.read_length = read_length;
        self
    }

    /// The accumulated records, in build order.
    #[must_use]
    pub fn records(&self) -> &[RecordBuf] {
        &self.records
    }

    /// Starts building a single-end read.
    #[must_use]
    pub fn add_frag(&mut self) -> FragBuilder<'_> {
        FragBuilder::new(self)
    }

    /// Starts building a read pair.
    #[must_use]
    pub fn add_pair(&mut self) -> PairBuilder<'_> {
        PairBuilder::new(self)
    }

    fn next_name(&mut self) -> String {
        let name = format!("q{:04}", self.counter);
        self.counter += 1;
        name
    }

    fn default_bases(&self) -> String {
        let bases = [b'A', b'C', b'G', b'T'];
        (0..self.read_length).map(|i| bases[i % 4] as char).collect()
    }
}

/// Builder for a single-end (fragment) read.
pub struct FragBuilder<'a> {
    parent: &'a mut SamBuilder,
    name: Option<String>,
    bases: Option<String>,
    quals: Option<Vec<u8>>,
    contig: usize,
    start: Option<usize>,
    cigar: Option<String>,
    mapq: u8,
    strand: Strand,
    attrs: Vec<(String, Value)>,
}

impl<'a> FragBuilder<'a> {
    fn new(parent: &'a mut SamBuilder) -> Self {
        Self {
            parent,
            name: None,
            bases: None,
            quals: None,
            contig: 0,
            start: None,
            cigar: None,
            mapq: DEFAULT_MAPQ,
            strand: Strand::Plus,
            attrs: Vec::new(),
        }
    }

    /// Sets the read name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Sets the bases.
    #[must_use]
    pub fn bases(mut self, bases: &str) -> Self {
        self.bases = Some(bases.to_string());
        self
    }

    /// Sets the quality scores.
    #[must_use]
    pub fn quals(mut self, quals: &[u8]) -> Self {
        self.quals = Some(quals.to_vec());
        self
    }

    /// Sets the reference sequence index.
    #[must_use]
    pub fn contig(mut self, contig: usize) -> Self {
        self.contig = contig;
        self
    }

    /// Sets the alignment start (1-based). If not set, the read is unmapped.
    #[must_use]
    pub fn start(mut self, start: usize) -> Self {
        self.start = Some(start);
        self
    }

    /// Sets the CIGAR string.
    #[must_use]
    pub fn cigar(mut self, cigar: &str) -> Self {
        self.cigar = Some(cigar.to_string());
        self
    }

    /// Sets the strand.
    #[must_use]
    pub fn strand(mut self, strand: Strand) -> Self {
        self.strand = strand;
        self
    }

    /// Marks the read as unmapped.
    #[must_use]
    pub fn unmapped(mut self) -> Self {
        self.start = None;
        self
    }

    /// Adds an auxiliary tag.
    #[must_use]
    pub fn attr(mut self, tag: &str, value: Value) -> Self {
        self.attrs.push((tag.to_string(), value));
        self
    }

    /// Builds the record, adds it to the parent and returns a clone.
    ///
    /// # Panics
    ///
    /// Panics if the alignment start position is invalid.
    #[must_use]
    pub fn build(self) -> RecordBuf {
        let name = match self.name {
            Some(name) => name,
            None => self.parent.next_name(),
        };
        let bases = self.bases.unwrap_or_else(|| self.parent.default_bases());
        let quals = self.quals.unwrap_or_else(|| vec![self.parent.base_quality; bases.len()]);
        let cigar = self.cigar.unwrap_or_else(|| format!("{}M", bases.len()));
        let unmapped = self.start.is_none();

        let mut record = RecordBuf::default();
        *record.name_mut() = Some(BString::from(name.as_bytes()));
        *record.sequence_mut() = Sequence::from(bases.as_bytes().to_vec());
        *record.quality_scores_mut() = QualityScores::from(quals);

        let mut flags = Flags::empty();
        if unmapped {
            flags |= Flags::UNMAPPED;
        }
        if self.strand.is_negative() {
            flags |= Flags::REVERSE_COMPLEMENTED;
        }
        *record.flags_mut() = flags;

        if !unmapped {
            *record.reference_sequence_id_mut() = Some(self.contig);
            *record.alignment_start_mut() =
                Some(Position::try_from(self.start.unwrap()).unwrap());
            *record.cigar_mut() = parse_cigar(&cigar).into_iter().collect();
            *record.mapping_quality_mut() =
                noodles::sam::alignment::record::MappingQuality::new(self.mapq);
        }

        for (tag_str, value) in &self.attrs {
            if tag_str.len() == 2 {
                let tag = Tag::from([tag_str.as_bytes()[0], tag_str.as_bytes()[1]]);
                record.data_mut().insert(tag, value.clone());
            }
        }

        self.parent.records.push(record.clone());
        record
    }
}

/// Builder for a paired-end read pair.
///
/// R1 defaults to the forward strand and R2 to the reverse strand, giving an
/// FR pair whose template lengths agree with the 5'-to-5' insert-size rule.
pub struct PairBuilder<'a> {
    parent: &'a mut SamBuilder,
    name: Option<String>,
    contig: usize,
    start1: usize,
    start2: usize,
    bases1: Option<String>,
    bases2: Option<String>,
    strand1: Strand,
    strand2: Strand,
    template_lengths: Option<(i32, i32)>,
    secondary: bool,
}

impl<'a> PairBuilder<'a> {
    fn new(parent: &'a mut SamBuilder) -> Self {
        Self {
            parent,
            name: None,
            contig: 0,
            start1: 100,
            start2: 200,
            bases1: None,
            bases2: None,
            strand1: Strand::Plus,
            strand2: Strand::Minus,
            template_lengths: None,
            secondary: false,
        }
    }

    /// Sets the shared read name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Sets the shared reference sequence index.
    #[must_use]
    pub fn contig(mut self, contig: usize) -> Self {
        self.contig = contig;
        self
    }

    /// Sets R1's alignment start.
    #[must_use]
    pub fn start1(mut self, start: usize) -> Self {
        self.start1 = start;
        self
    }

    /// Sets R2's alignment start.
    #[must_use]
    pub fn start2(mut self, start: usize) -> Self {
        self.start2 = start;
        self
    }

    /// Overrides both template lengths (to build inconsistent pairs).
    #[must_use]
    pub fn template_lengths(mut self, r1: i32, r2: i32) -> Self {
        self.template_lengths = Some((r1, r2));
        self
    }

    /// Marks both reads as secondary alignments.
    #[must_use]
    pub fn secondary(mut self) -> Self {
        self.secondary = true;
        self
    }

    /// Builds both records, adds them to the parent and returns clones.
    ///
    /// # Panics
    ///
    /// Panics if an alignment start position is invalid.
    #[must_use]
    pub fn build(self) -> (RecordBuf, RecordBuf) {
        let name = match self.name {
            Some(name) => name,
            None => self.parent.next_name(),
        };
        let bases1 = self.bases1.unwrap_or_else(|| self.parent.default_bases());
        let bases2 = self.bases2.unwrap_or_else(|| self.parent.default_bases());
        let quals1 = vec![self.parent.base_quality; bases1.len()];
        let quals2 = vec![self.parent.base_quality; bases2.len()];

        let end1 = self.start1 as i32 + bases1.len() as i32 - 1;
        let end2 = self.start2 as i32 + bases2.len() as i32 - 1;
        let (tlen1, tlen2) = self.template_lengths.unwrap_or_else(|| {
            let (left, right) = if self.start1 <= self.start2 {
                (self.start1 as i32, end2)
            } else {
                (self.start2 as i32, end1)
            };
            let tlen = right - left + 1;
            if self.start1 <= self.start2 { (tlen, -tlen) } else { (-tlen, tlen) }
        });

        let mut base_flags = Flags::SEGMENTED;
        if self.secondary {
            base_flags |= Flags::SECONDARY;
        }

        let mut r1 = RecordBuf::default();
        *r1.name_mut() = Some(BString::from(name.as_bytes()));
        *r1.sequence_mut() = Sequence::from(bases1.as_bytes().to_vec());
        *r1.quality_scores_mut() = QualityScores::from(quals1);
        let mut flags1 = base_flags | Flags::FIRST_SEGMENT;
        if self.strand1.is_negative() {
            flags1 |= Flags::REVERSE_COMPLEMENTED;
        }
        if self.strand2.is_negative() {
            flags1 |= Flags::MATE_REVERSE_COMPLEMENTED;
        }
        *r1.flags_mut() = flags1;
        *r1.reference_sequence_id_mut() = Some(self.contig);
        *r1.alignment_start_mut() = Some(Position::try_from(self.start1).unwrap());
        *r1.cigar_mut() =
            parse_cigar(&format!("{}M", bases1.len())).into_iter().collect();
        *r1.mapping_quality_mut() =
            noodles::sam::alignment::record::MappingQuality::new(DEFAULT_MAPQ);
        *r1.mate_reference_sequence_id_mut() = Some(self.contig);
        *r1.mate_alignment_start_mut() = Some(Position::try_from(self.start2).unwrap());
        *r1.template_length_mut() = tlen1;

        let mut r2 = RecordBuf::default();
        *r2.name_mut() = Some(BString::from(name.as_bytes()));
        *r2.sequence_mut() = Sequence::from(bases2.as_bytes().to_vec());
        *r2.quality_scores_mut() = QualityScores::from(quals2);
        let mut flags2 = base_flags | Flags::LAST_SEGMENT;
        if self.strand2.is_negative() {
            flags2 |= Flags::REVERSE_COMPLEMENTED;
        }
        if self.strand1.is_negative() {
            flags2 |= Flags::MATE_REVERSE_COMPLEMENTED;
        }
        *r2.flags_mut() = flags2;
        *r2.reference_sequence_id_mut() = Some(self.contig);
        *r2.alignment_start_mut() = Some(Position::try_from(self.start2).unwrap());
        *r2.cigar_mut() =
            parse_cigar(&format!("{}M", bases2.len())).into_iter().collect();
        *r2.mapping_quality_mut() =
            noodles::sam::alignment::record::MappingQuality::new(DEFAULT_MAPQ);
        *r2.mate_reference_sequence_id_mut() = Some(self.contig);
        *r2.mate_alignment_start_mut() = Some(Position::try_from(self.start1).unwrap());
        *r2.template_length_mut() = tlen2;

        self.parent.records.push(r1.clone());
        self.parent.records.push(r2.clone());
        (r1, r2)
    }
}

/// Parses a CIGAR string into operations.
#[must_use]
pub fn parse_cigar(cigar: &str) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut length = 0usize;
    for c in cigar.chars() {
        if let Some(digit) = c.to_digit(10) {
            length = length * 10 + digit as usize;
            continue;
        }
        let kind = match c {
            'M' => Kind::Match,
            'I' => Kind::Insertion,
            'D' => Kind::Deletion,
            'N' => Kind::Skip,
            'S' => Kind::SoftClip,
            'H' => Kind::HardClip,
            'P' => Kind::Pad,
            '=' => Kind::SequenceMatch,
            'X' => Kind::SequenceMismatch,
            _ => continue,
        };
        if length > 0 {
            ops.push(Op::new(kind, length));
        }
        length = 0;
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frag_defaults() {
        let mut builder = SamBuilder::with_refs(&[("chr1", 1000)]);
        let record = builder.add_frag().contig(0).start(100).build();

        assert_eq!(record.sequence().len(), DEFAULT_READ_LENGTH);
        assert_eq!(record.alignment_start().map(usize::from), Some(100));
        assert!(!record.flags().is_unmapped());
        assert_eq!(builder.records().len(), 1);
    }

    #[test]
    fn test_frag_unmapped() {
        let mut builder = SamBuilder::with_refs(&[("chr1", 1000)]);
        let record = builder.add_frag().bases("ACGT").unmapped().build();

        assert!(record.flags().is_unmapped());
        assert!(record.alignment_start().is_none());
        assert!(record.reference_sequence_id().is_none());
    }

    #[test]
    fn test_pair_template_lengths() {
        let mut builder = SamBuilder::with_refs(&[("chr1", 1000)]);
        let (r1, r2) = builder.add_pair().name("p1").start1(100).start2(200).build();

        // R1 100..=199 forward, R2 200..=299 reverse: outer span 200
        assert_eq!(r1.template_length(), 200);
        assert_eq!(r2.template_length(), -200);
        assert!(r1.flags().is_first_segment());
        assert!(r2.flags().is_last_segment());
        assert!(r2.flags().is_reverse_complemented());
        assert!(r1.flags().is_mate_reverse_complemented());
    }

    #[test]
    fn test_parse_cigar() {
        let ops = parse_cigar("2S8M1I4D");
        let expected = vec![
            Op::new(Kind::SoftClip, 2),
            Op::new(Kind::Match, 8),
            Op::new(Kind::Insertion, 1),
            Op::new(Kind::Deletion, 4),
        ];
        assert_eq!(ops, expected);
    }

    #[test]
    fn test_sequential_names_unique() {
        let mut builder = SamBuilder::with_refs(&[("chr1", 1000)]);
        let a = builder.add_frag().contig(0).start(1).build();
        let b = builder.add_frag().contig(0).start(2).build();
        assert_ne!(a.name(), b.name());
    }
}
