//! Conversion between alignment records and compression records.
//!
//! [`Sam2CramFactory`] rewrites one alignment record against the current
//! reference window, emitting [`ReadFeature`]s for every difference.
//! [`Cram2SamFactory`] is the inverse, used by the writer's paranoid-mode
//! round-trip check.

use crate::errors::Result;
use crate::record::{
    consumes_read_bases, consumes_reference_bases, is_aligned_op, CramRecord, ReadFeature,
};
use bstr::BString;
use noodles::core::Position;
use noodles::sam::alignment::record::cigar::op::{Kind, Op};
use noodles::sam::alignment::record::Cigar;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::{Data, QualityScores, RecordBuf, Sequence};
use std::collections::HashSet;
use std::sync::Arc;

/// Converts alignment records into reference-relative compression records.
///
/// The factory is seeded with the bases of the batch's reference sequence;
/// for multi-reference batches the driver re-seeds it per foreign record.
/// Running base/feature counters feed the high-mismatch advisory.
pub struct Sam2CramFactory {
    ref_bases: Arc<Vec<u8>>,
    /// Store read names verbatim on every record
    pub preserve_read_names: bool,
    /// Capture every auxiliary tag not explicitly ignored
    pub capture_all_tags: bool,
    /// Tags to capture when `capture_all_tags` is off
    pub capture_tags: HashSet<Tag>,
    /// Tags never captured
    pub ignore_tags: HashSet<Tag>,
    base_count: u64,
    feature_count: u64,
}

impl Sam2CramFactory {
    /// Creates a factory over the given reference bases.
    #[must_use]
    pub fn new(ref_bases: Arc<Vec<u8>>) -> Self {
        Self {
            ref_bases,
            preserve_read_names: true,
            capture_all_tags: true,
            capture_tags: HashSet::new(),
            ignore_tags: HashSet::new(),
            base_count: 0,
            feature_count: 0,
        }
    }

    /// Replaces the reference window (multi-reference batches).
    pub fn set_reference_bases(&mut self, ref_bases: Arc<Vec<u8>>) {
        self.ref_bases = ref_bases;
    }

    /// Total read bases converted so far.
    #[must_use]
    pub fn base_count(&self) -> u64 {
        self.base_count
    }

    /// Total read features emitted so far.
    #[must_use]
    pub fn feature_count(&self) -> u64 {
        self.feature_count
    }

    /// Converts one alignment record.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors the rest of the pipeline.
    pub fn create_record(&mut self, record: &RecordBuf) -> Result<CramRecord> {
        let flags = record.flags();
        let sequence: &[u8] = record.sequence().as_ref();
        let quality: &[u8] = record.quality_scores().as_ref();

        let mut cram = CramRecord {
            sequence_id: record.reference_sequence_id(),
            alignment_start: record.alignment_start().map_or(0, usize::from),
            read_length: sequence.len(),
            read_name: record
                .name()
                .map_or_else(BString::default, |name| BString::from(name.to_vec())),
            read_bases: sequence.to_vec(),
            quality_scores: (!quality.is_empty()).then(|| quality.to_vec()),
            template_size: record.template_length(),
            mapping_quality: record.mapping_quality().map(u8::from),
            tags: self.captured_tags(record),
            multi_fragment: flags.is_segmented(),
            first_segment: flags.is_first_segment(),
            last_segment: flags.is_last_segment(),
            secondary: flags.is_secondary(),
            negative_strand: flags.is_reverse_complemented(),
            segment_unmapped: flags.is_unmapped(),
            mate_negative_strand: flags.is_mate_reverse_complemented(),
            mate_unmapped: flags.is_mate_unmapped(),
            mate_sequence_id: record.mate_reference_sequence_id(),
            mate_alignment_start: record.mate_alignment_start().map_or(0, usize::from),
            ..CramRecord::default()
        };

        if !flags.is_unmapped() && cram.alignment_start > 0 {
            let (features, alignment_end) =
                self.compute_features(record, sequence, cram.alignment_start);
            self.feature_count += features.len() as u64;
            cram.alignment_end = alignment_end;
            cram.features = features;
        }
        self.base_count += sequence.len() as u64;

        Ok(cram)
    }

    fn captured_tags(&self, record: &RecordBuf) -> Data {
        let mut data = Data::default();
        for (tag, value) in record.data().iter() {
            if self.ignore_tags.contains(&tag) {
                continue;
            }
            if self.capture_all_tags || self.capture_tags.contains(&tag) {
                data.insert(tag, value.clone());
            }
        }
        data
    }

    /// Walks the CIGAR against the reference window, collecting features and
    /// the 1-based inclusive alignment end.
    fn compute_features(
        &self,
        record: &RecordBuf,
        sequence: &[u8],
        alignment_start: usize,
    ) -> (Vec<ReadFeature>, usize) {
        let mut features = Vec::new();
        let mut ref_pos = alignment_start;
        let mut read_pos = 0usize;

        for op in record.cigar().iter().filter_map(std::result::Result::ok) {
            let len = op.len();
            match op.kind() {
                Kind::SoftClip => {
                    features.push(ReadFeature::SoftClip {
                        position: read_pos + 1,
                        bases: sequence[read_pos..read_pos + len].to_vec(),
                    });
                }
                Kind::Insertion => {
                    features.push(ReadFeature::Insertion {
                        position: read_pos + 1,
                        bases: sequence[read_pos..read_pos + len].to_vec(),
                    });
                }
                Kind::Deletion => {
                    features.push(ReadFeature::Deletion { position: read_pos + 1, length: len });
                }
                Kind::Skip => {
                    features
                        .push(ReadFeature::ReferenceSkip { position: read_pos + 1, length: len });
                }
                Kind::HardClip => {
                    features.push(ReadFeature::HardClip { position: read_pos + 1, length: len });
                }
                Kind::Pad => {
                    features.push(ReadFeature::Padding { position: read_pos + 1, length: len });
                }
                kind if is_aligned_op(kind) => {
                    for i in 0..len {
                        let read_base = sequence.get(read_pos + i).copied().unwrap_or(b'N');
                        let ref_base =
                            self.ref_bases.get(ref_pos - 1 + i).copied().unwrap_or(b'N');
                        if read_base != ref_base {
                            features.push(ReadFeature::Substitution {
                                position: read_pos + i + 1,
                                base: read_base,
                                reference_base: ref_base,
                            });
                        }
                    }
                }
                _ => {}
            }
            if consumes_read_bases(op.kind()) {
                read_pos += len;
            }
            if consumes_reference_bases(op.kind()) {
                ref_pos += len;
            }
        }

        (features, ref_pos.saturating_sub(1))
    }
}

/// Restores alignment records from compression records.
///
/// Used in paranoid mode to prove a batch survives the round trip before its
/// container is written.
pub struct Cram2SamFactory;

impl Cram2SamFactory {
    /// Rebuilds an alignment record from a compression record and the
    /// reference window it was encoded against.
    ///
    /// # Errors
    ///
    /// Returns an error when a restored alignment start is out of range.
    pub fn create(&self, cram: &CramRecord, ref_bases: &[u8]) -> Result<RecordBuf> {
        let position = |value: usize| {
            Position::try_from(value).map_err(|_| crate::errors::CramError::RoundTripMismatch {
                read_name: String::from_utf8_lossy(&cram.read_name).into_owned(),
                field: "restored alignment position",
            })
        };

        let mut record = RecordBuf::default();

        if !cram.read_name.is_empty() {
            *record.name_mut() = Some(cram.read_name.clone());
        }
        *record.flags_mut() = Flags::from(cram.bam_flags());
        *record.template_length_mut() = cram.template_size;

        if let Some(id) = cram.mate_sequence_id {
            *record.mate_reference_sequence_id_mut() = Some(id);
        }
        if cram.mate_alignment_start > 0 {
            *record.mate_alignment_start_mut() = Some(position(cram.mate_alignment_start)?);
        }

        if cram.is_mapped() {
            *record.reference_sequence_id_mut() = cram.sequence_id;
            *record.alignment_start_mut() = Some(position(cram.alignment_start)?);
            if let Some(mapq) = cram.mapping_quality {
                *record.mapping_quality_mut() =
                    noodles::sam::alignment::record::MappingQuality::new(mapq);
            }

            let (bases, ops) = restore_bases(cram, ref_bases);
            *record.cigar_mut() = ops.into_iter().map(|(kind, len)| Op::new(kind, len)).collect();
            *record.sequence_mut() = Sequence::from(bases);
        } else {
            *record.sequence_mut() = Sequence::from(cram.read_bases.clone());
        }

        if let Some(quality) = &cram.quality_scores {
            *record.quality_scores_mut() = QualityScores::from(quality.clone());
        }

        Ok(record)
    }
}

/// Replays features over the reference window to rebuild read bases and the
/// CIGAR operations.
fn restore_bases(cram: &CramRecord, ref_bases: &[u8]) -> (Vec<u8>, Vec<(Kind, usize)>) {
    let mut bases = Vec::with_capacity(cram.read_length);
    let mut ops: Vec<(Kind, usize)> = Vec::new();
    let mut read_pos = 0usize; // 0-based
    let mut ref_pos = cram.alignment_start; // 1-based

    fn push_op(ops: &mut Vec<(Kind, usize)>, kind: Kind, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(last) = ops.last_mut() {
            if last.0 == kind {
                last.1 += len;
                return;
            }
        }
        ops.push((kind, len));
    }

    fn copy_match(
        ref_bases: &[u8],
        bases: &mut Vec<u8>,
        ops: &mut Vec<(Kind, usize)>,
        read: &mut usize,
        rf: &mut usize,
        len: usize,
    ) {
        for i in 0..len {
            bases.push(ref_bases.get(*rf - 1 + i).copied().unwrap_or(b'N'));
        }
        push_op(ops, Kind::Match, len);
        *read += len;
        *rf += len;
    }

    for feature in &cram.features {
        let gap = (feature.position() - 1).saturating_sub(read_pos);
        copy_match(ref_bases, &mut bases, &mut ops, &mut read_pos, &mut ref_pos, gap);

        match feature {
            ReadFeature::Substitution { base, .. } => {
                bases.push(*base);
                push_op(&mut ops, Kind::Match, 1);
                read_pos += 1;
                ref_pos += 1;
            }
            ReadFeature::Insertion { bases: inserted, .. } => {
                bases.extend_from_slice(inserted);
                push_op(&mut ops, Kind::Insertion, inserted.len());
                read_pos += inserted.len();
            }
            ReadFeature::SoftClip { bases: clipped, .. } => {
                bases.extend_from_slice(clipped);
                push_op(&mut ops, Kind::SoftClip, clipped.len());
                read_pos += clipped.len();
            }
            ReadFeature::Deletion { length, .. } => {
                push_op(&mut ops, Kind::Deletion, *length);
                ref_pos += length;
            }
            ReadFeature::ReferenceSkip { length, .. } => {
                push_op(&mut ops, Kind::Skip, *length);
                ref_pos += length;
            }
            ReadFeature::HardClip { length, .. } => {
                push_op(&mut ops, Kind::HardClip, *length);
            }
            ReadFeature::Padding { length, .. } => {
                push_op(&mut ops, Kind::Pad, *length);
            }
        }
    }

    let tail = cram.read_length.saturating_sub(read_pos);
    copy_match(ref_bases, &mut bases, &mut ops, &mut read_pos, &mut ref_pos, tail);

    (bases, ops)
}
