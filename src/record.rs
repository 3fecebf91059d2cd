//! The reference-relative compression record and its read features.
//!
//! A [`CramRecord`] is the intermediate form an alignment record takes between
//! the input buffer and container serialization. Instead of verbatim bases it
//! carries [`ReadFeature`]s describing how the read differs from the
//! reference, plus the mate-linkage slots the resolver fills in.
//!
//! Records of one batch live in a flat arena (`Vec<CramRecord>`); the mate
//! graph links them by arena index, never by shared reference.

use bstr::BString;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record_buf::Data;

/// Value of `records_to_next_fragment` when no downstream mate is linked.
pub const NO_NEXT_FRAGMENT: i32 = -1;

/// Returns true when a CIGAR operator advances the reference cursor.
#[must_use]
pub fn consumes_reference_bases(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch | Kind::Deletion | Kind::Skip
    )
}

/// Returns true when a CIGAR operator advances the read cursor.
#[must_use]
pub fn consumes_read_bases(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::Match
            | Kind::SequenceMatch
            | Kind::SequenceMismatch
            | Kind::Insertion
            | Kind::SoftClip
    )
}

/// Returns true for the three operators that place read bases against the
/// reference (M, =, X).
#[must_use]
pub fn is_aligned_op(kind: Kind) -> bool {
    matches!(kind, Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch)
}

/// A single difference between a read and its reference window.
///
/// Positions are 1-based offsets into the read, matching the in-read
/// coordinate the decoder replays features at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFeature {
    /// A read base that differs from the reference base under it
    Substitution {
        /// 1-based position in the read
        position: usize,
        /// The base observed in the read
        base: u8,
        /// The reference base it replaced
        reference_base: u8,
    },
    /// Bases present in the read but not the reference
    Insertion {
        /// 1-based position in the read
        position: usize,
        /// The inserted bases
        bases: Vec<u8>,
    },
    /// Soft-clipped bases kept in the read
    SoftClip {
        /// 1-based position in the read
        position: usize,
        /// The clipped bases
        bases: Vec<u8>,
    },
    /// Reference bases absent from the read
    Deletion {
        /// 1-based position in the read
        position: usize,
        /// Number of reference bases deleted
        length: usize,
    },
    /// A spliced-out reference stretch (CIGAR N)
    ReferenceSkip {
        /// 1-based position in the read
        position: usize,
        /// Number of reference bases skipped
        length: usize,
    },
    /// Hard-clipped bases (not present in the read)
    HardClip {
        /// 1-based position in the read
        position: usize,
        /// Number of bases clipped away
        length: usize,
    },
    /// Silent padding (CIGAR P)
    Padding {
        /// 1-based position in the read
        position: usize,
        /// Padding length
        length: usize,
    },
}

impl ReadFeature {
    /// The 1-based in-read position this feature applies at.
    #[must_use]
    pub fn position(&self) -> usize {
        match self {
            Self::Substitution { position, .. }
            | Self::Insertion { position, .. }
            | Self::SoftClip { position, .. }
            | Self::Deletion { position, .. }
            | Self::ReferenceSkip { position, .. }
            | Self::HardClip { position, .. }
            | Self::Padding { position, .. } => *position,
        }
    }

    /// Single-byte wire code for the feature kind.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::Substitution { .. } => b'X',
            Self::Insertion { .. } => b'I',
            Self::SoftClip { .. } => b'S',
            Self::Deletion { .. } => b'D',
            Self::ReferenceSkip { .. } => b'N',
            Self::HardClip { .. } => b'H',
            Self::Padding { .. } => b'P',
        }
    }
}

/// A compression record: one alignment record rewritten relative to the
/// reference, with mate-linkage slots resolved per batch.
#[derive(Debug, Clone)]
pub struct CramRecord {
    /// 1-based position of this record within its batch
    pub index: i32,
    /// Sequence index in the header dictionary; `None` for unmapped records
    pub sequence_id: Option<usize>,
    /// 1-based alignment start; 0 when the record has no start
    pub alignment_start: usize,
    /// 1-based inclusive alignment end; 0 for unmapped records
    pub alignment_end: usize,
    /// `alignment_start` minus the previous in-batch record's start
    pub alignment_delta: i64,
    /// Number of bases in the read
    pub read_length: usize,
    /// Read name (QNAME)
    pub read_name: BString,
    /// Verbatim read bases; kept for unmapped records and the round-trip check
    pub read_bases: Vec<u8>,
    /// Quality scores; `None` when the source record carried none.
    /// A lossy policy replaces retained scores in place and masks the rest.
    pub quality_scores: Option<Vec<u8>>,
    /// Signed outer template size (TLEN) as stamped by the aligner
    pub template_size: i32,
    /// Mapping quality, if assigned
    pub mapping_quality: Option<u8>,
    /// Captured auxiliary tags
    pub tags: Data,
    /// Reference-relative differences, ordered by in-read position
    pub features: Vec<ReadFeature>,

    // flags mirrored from the source record
    /// Template has multiple segments (0x1)
    pub multi_fragment: bool,
    /// First segment in the template (0x40)
    pub first_segment: bool,
    /// Last segment in the template (0x80)
    pub last_segment: bool,
    /// Secondary alignment (0x100)
    pub secondary: bool,
    /// Read is reverse-complemented (0x10)
    pub negative_strand: bool,
    /// Read itself is unmapped (0x4)
    pub segment_unmapped: bool,
    /// Mate is reverse-complemented (0x20)
    pub mate_negative_strand: bool,
    /// Mate is unmapped (0x8)
    pub mate_unmapped: bool,
    /// Mate's sequence index, for detached serialization
    pub mate_sequence_id: Option<usize>,
    /// Mate's 1-based alignment start; 0 when absent
    pub mate_alignment_start: usize,

    // in-batch mate linkage (arena indices)
    /// Arena index of the next fragment in this record's chain
    pub next: Option<usize>,
    /// Arena index of the previous fragment in this record's chain
    pub previous: Option<usize>,
    /// Records between this one and its linked next fragment, or −1
    pub records_to_next_fragment: i32,
    /// Stored with full explicit mate fields; implicit reconstruction unsafe
    pub detached: bool,
    /// A linked mate follows later in the same batch
    pub has_mate_downstream: bool,
    /// Quality scores must be stored verbatim (lossless path)
    pub force_preserve_quality_scores: bool,
}

impl CramRecord {
    /// True when the record is aligned to a reference sequence.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        !self.segment_unmapped && self.sequence_id.is_some() && self.alignment_start > 0
    }

    /// Reconstructs the BAM flag word from the mirrored booleans.
    #[must_use]
    pub fn bam_flags(&self) -> u16 {
        let mut flags = 0u16;
        if self.multi_fragment {
            flags |= 0x1;
        }
        if self.segment_unmapped {
            flags |= 0x4;
        }
        if self.mate_unmapped {
            flags |= 0x8;
        }
        if self.negative_strand {
            flags |= 0x10;
        }
        if self.mate_negative_strand {
            flags |= 0x20;
        }
        if self.first_segment {
            flags |= 0x40;
        }
        if self.last_segment {
            flags |= 0x80;
        }
        if self.secondary {
            flags |= 0x100;
        }
        flags
    }

    /// Reconstructs the CRAM flag word from the linkage state.
    ///
    /// Bit 0x1 = force preserve quality scores, 0x2 = detached,
    /// 0x4 = has mate downstream.
    #[must_use]
    pub fn cram_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.force_preserve_quality_scores {
            flags |= 0x1;
        }
        if self.detached {
            flags |= 0x2;
        }
        if self.has_mate_downstream {
            flags |= 0x4;
        }
        flags
    }
}

impl Default for CramRecord {
    fn default() -> Self {
        Self {
            index: 0,
            sequence_id: None,
            alignment_start: 0,
            alignment_end: 0,
            alignment_delta: 0,
            read_length: 0,
            read_name: BString::from(""),
            read_bases: Vec::new(),
            quality_scores: None,
            template_size: 0,
            mapping_quality: None,
            tags: Data::default(),
            features: Vec::new(),
            multi_fragment: false,
            first_segment: false,
            last_segment: false,
            secondary: false,
            negative_strand: false,
            segment_unmapped: false,
            mate_negative_strand: false,
            mate_unmapped: false,
            mate_sequence_id: None,
            mate_alignment_start: 0,
            next: None,
            previous: None,
            records_to_next_fragment: NO_NEXT_FRAGMENT,
            detached: false,
            has_mate_downstream: false,
            force_preserve_quality_scores: false,
        }
    }
}
