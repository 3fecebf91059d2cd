//! Containers, slices and the batch-to-container packer.
//!
//! A container groups one or more slices; each slice holds a run of
//! serialized compression records plus a header carrying the reference MD5
//! for the window it covers. The byte-level framing lives in
//! [`crate::container_io`]; this module owns the structures and the record
//! serialization.

use crate::container_io::{write_itf8, write_ltf8};
use crate::errors::Result;
use crate::record::{CramRecord, ReadFeature};
use md5::{Digest, Md5};
use noodles::sam::alignment::record_buf::data::field::Value;

/// Wire sentinel for a slice or container spanning multiple references.
pub const MULTI_REFERENCE: i32 = -2;
/// Wire sentinel for unmapped records with no reference.
pub const UNMAPPED_OR_NO_REFERENCE: i32 = -1;

/// What a block's payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockContentType {
    /// The textual SAM header
    FileHeader,
    /// Slice header fields
    SliceHeader,
    /// Serialized compression records
    Core,
}

impl BlockContentType {
    /// Single-byte wire code.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::FileHeader => 0,
            Self::SliceHeader => 2,
            Self::Core => 5,
        }
    }
}

/// How a block's payload is compressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Stored verbatim
    Raw,
    /// Gzip-compressed
    Gzip,
}

impl CompressionMethod {
    /// Single-byte wire code.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::Gzip => 1,
        }
    }
}

/// One block: an uncompressed payload plus its framing choices.
#[derive(Debug, Clone)]
pub struct Block {
    /// Compression applied at write time
    pub compression_method: CompressionMethod,
    /// Payload kind
    pub content_type: BlockContentType,
    /// Content id; links slice header entries to data blocks
    pub content_id: i32,
    /// Uncompressed payload
    pub data: Vec<u8>,
}

/// A slice: a run of records over one reference window (or a multi-reference
/// or unmapped run).
#[derive(Debug, Clone)]
pub struct Slice {
    /// Sequence index, [`MULTI_REFERENCE`] or [`UNMAPPED_OR_NO_REFERENCE`]
    pub reference_id: i32,
    /// 1-based start of the covered window; 0 when nothing is mapped
    pub alignment_start: i32,
    /// Number of reference bases covered
    pub alignment_span: i32,
    /// Records serialized into this slice
    pub record_count: i32,
    /// Stream-global index of the first record in this slice
    pub global_record_counter: u64,
    /// Sum of read lengths
    pub base_count: u64,
    /// MD5 of the reference window this slice was encoded against
    pub ref_md5: [u8; 16],
    /// The serialized record stream
    pub core_block: Block,
}

impl Slice {
    /// Stamps the reference MD5 from the batch reference bases.
    ///
    /// A mapped single-reference slice hashes the window
    /// `[alignment_start, alignment_start + alignment_span)` clamped to the
    /// sequence end; multi-reference and unmapped slices hash the empty
    /// string.
    pub fn set_ref_md5(&mut self, ref_bases: &[u8]) {
        if self.reference_id < 0 || self.alignment_start < 1 || self.alignment_span < 1 {
            self.ref_md5 = Md5::digest(b"").into();
            return;
        }
        let from = (self.alignment_start as usize - 1).min(ref_bases.len());
        let to = (from + self.alignment_span as usize).min(ref_bases.len());
        self.ref_md5 = Md5::digest(&ref_bases[from..to]).into();
    }
}

/// A sealed container: slices plus the aggregate header fields and the byte
/// offset it was written at.
#[derive(Debug, Clone)]
pub struct Container {
    /// Sequence index shared by every slice, or a sentinel
    pub reference_id: i32,
    /// 1-based start of the covered window; 0 when nothing is mapped
    pub alignment_start: i32,
    /// Number of reference bases covered
    pub alignment_span: i32,
    /// Records across all slices
    pub record_count: i32,
    /// Stream-global index of the first record
    pub global_record_counter: u64,
    /// Sum of read lengths across all slices
    pub base_count: u64,
    /// The slices, in record order
    pub slices: Vec<Slice>,
    /// Byte position of this container in the output stream
    pub offset: u64,
    /// Byte offsets of each slice within the container body; filled when the
    /// container is written
    pub landmarks: Vec<u32>,
    /// Total byte length of the container body; filled when the container is
    /// written
    pub body_size: u32,
}

/// Packs batches of compression records into containers of slices.
///
/// Owns the stream-global record counter so consecutive containers carry
/// contiguous counters.
#[derive(Debug)]
pub struct ContainerBuilder {
    records_per_slice: usize,
    preserve_read_names: bool,
    global_record_counter: u64,
}

impl ContainerBuilder {
    /// Creates a builder producing slices of at most `records_per_slice`
    /// records.
    #[must_use]
    pub fn new(records_per_slice: usize) -> Self {
        Self { records_per_slice: records_per_slice.max(1), preserve_read_names: true, global_record_counter: 0 }
    }

    /// Controls whether read names are serialized for attached records.
    pub fn set_preserve_read_names(&mut self, preserve: bool) {
        self.preserve_read_names = preserve;
    }

    /// Packs one batch into a container.
    ///
    /// # Errors
    ///
    /// Propagates serialization failures.
    pub fn build_container(&mut self, records: &[CramRecord]) -> Result<Container> {
        let mut slices = Vec::with_capacity(records.len().div_ceil(self.records_per_slice));
        for chunk in records.chunks(self.records_per_slice) {
            let slice = self.build_slice(chunk)?;
            self.global_record_counter += chunk.len() as u64;
            slices.push(slice);
        }

        let reference_id = aggregate_reference_id(slices.iter().map(|s| s.reference_id));
        let (alignment_start, alignment_span) = if reference_id >= 0 {
            aggregate_span(&slices)
        } else {
            (0, 0)
        };

        Ok(Container {
            reference_id,
            alignment_start,
            alignment_span,
            record_count: records.len() as i32,
            global_record_counter: slices.first().map_or(self.global_record_counter, |s| s.global_record_counter),
            base_count: slices.iter().map(|s| s.base_count).sum(),
            slices,
            offset: 0,
            landmarks: Vec::new(),
            body_size: 0,
        })
    }

    fn build_slice(&self, records: &[CramRecord]) -> Result<Slice> {
        let reference_id = aggregate_reference_id(records.iter().map(record_reference_id));

        let mut start = 0i32;
        let mut end = 0i32;
        if reference_id >= 0 {
            for record in records.iter().filter(|r| r.is_mapped()) {
                let record_start = record.alignment_start as i32;
                let record_end = record.alignment_end as i32;
                if start == 0 || record_start < start {
                    start = record_start;
                }
                end = end.max(record_end);
            }
        }
        let span = if start > 0 { end - start + 1 } else { 0 };

        let mut data = Vec::new();
        for record in records {
            self.write_record(&mut data, record);
        }

        Ok(Slice {
            reference_id,
            alignment_start: start,
            alignment_span: span,
            record_count: records.len() as i32,
            global_record_counter: self.global_record_counter,
            base_count: records.iter().map(|r| r.read_length as u64).sum(),
            ref_md5: [0; 16],
            core_block: Block {
                compression_method: CompressionMethod::Gzip,
                content_type: BlockContentType::Core,
                content_id: 1,
                data,
            },
        })
    }

    /// Serializes one record as a self-describing ITF-8 field sequence.
    ///
    /// Layout: BAM flags, CRAM flags, sequence id, read length, alignment
    /// delta; then mate fields (explicit for detached records, the
    /// next-fragment distance for linked ones); read name (when preserved or
    /// detached); mapping quality; features; quality scores; verbatim bases
    /// for unmapped records; captured tags.
    fn write_record(&self, data: &mut Vec<u8>, record: &CramRecord) {
        write_itf8(data, i32::from(record.bam_flags()));
        data.push(record.cram_flags());
        write_itf8(data, record_reference_id(record));
        write_itf8(data, record.read_length as i32);
        write_ltf8(data, record.alignment_delta);

        if record.detached {
            let mut mate_flags = 0u8;
            if record.mate_negative_strand {
                mate_flags |= 0x1;
            }
            if record.mate_unmapped {
                mate_flags |= 0x2;
            }
            data.push(mate_flags);
            write_itf8(
                data,
                record.mate_sequence_id.map_or(UNMAPPED_OR_NO_REFERENCE, |id| id as i32),
            );
            write_itf8(data, record.mate_alignment_start as i32);
            write_itf8(data, record.template_size);
        } else if record.has_mate_downstream {
            write_itf8(data, record.records_to_next_fragment);
        }

        if self.preserve_read_names || record.detached {
            write_itf8(data, record.read_name.len() as i32);
            data.extend_from_slice(&record.read_name);
        }

        write_itf8(data, record.mapping_quality.map_or(-1, i32::from));

        write_itf8(data, record.features.len() as i32);
        for feature in &record.features {
            data.push(feature.code());
            write_itf8(data, feature.position() as i32);
            match feature {
                ReadFeature::Substitution { base, reference_base, .. } => {
                    data.push(*base);
                    data.push(*reference_base);
                }
                ReadFeature::Insertion { bases, .. } | ReadFeature::SoftClip { bases, .. } => {
                    write_itf8(data, bases.len() as i32);
                    data.extend_from_slice(bases);
                }
                ReadFeature::Deletion { length, .. }
                | ReadFeature::ReferenceSkip { length, .. }
                | ReadFeature::HardClip { length, .. }
                | ReadFeature::Padding { length, .. } => {
                    write_itf8(data, *length as i32);
                }
            }
        }

        match &record.quality_scores {
            Some(scores) => {
                data.push(1);
                data.extend_from_slice(scores);
            }
            None => data.push(0),
        }

        if record.segment_unmapped {
            data.extend_from_slice(&record.read_bases);
        }

        let tags: Vec<_> = record.tags.iter().collect();
        write_itf8(data, tags.len() as i32);
        for (tag, value) in tags {
            data.extend_from_slice(tag.as_ref());
            write_tag_value(data, value);
        }
    }
}

fn record_reference_id(record: &CramRecord) -> i32 {
    record.sequence_id.map_or(UNMAPPED_OR_NO_REFERENCE, |id| id as i32)
}

/// Folds per-slice (or per-record) reference ids into one: a shared id stays,
/// anything mixed becomes [`MULTI_REFERENCE`].
fn aggregate_reference_id<I: IntoIterator<Item = i32>>(ids: I) -> i32 {
    let mut iter = ids.into_iter();
    let Some(first) = iter.next() else {
        return UNMAPPED_OR_NO_REFERENCE;
    };
    if iter.all(|id| id == first) {
        first
    } else {
        MULTI_REFERENCE
    }
}

fn aggregate_span(slices: &[Slice]) -> (i32, i32) {
    let mut start = 0i32;
    let mut end = 0i32;
    for slice in slices.iter().filter(|s| s.alignment_start > 0) {
        if start == 0 || slice.alignment_start < start {
            start = slice.alignment_start;
        }
        end = end.max(slice.alignment_start + slice.alignment_span - 1);
    }
    if start > 0 { (start, end - start + 1) } else { (0, 0) }
}

/// Serializes one tag value with a SAM-style type byte.
fn write_tag_value(data: &mut Vec<u8>, value: &Value) {
    use noodles::sam::alignment::record_buf::data::field::value::Array;

    match value {
        Value::Character(c) => {
            data.push(b'A');
            data.push(*c);
        }
        Value::Int8(n) => {
            data.push(b'i');
            write_itf8(data, i32::from(*n));
        }
        Value::UInt8(n) => {
            data.push(b'i');
            write_itf8(data, i32::from(*n));
        }
        Value::Int16(n) => {
            data.push(b'i');
            write_itf8(data, i32::from(*n));
        }
        Value::UInt16(n) => {
            data.push(b'i');
            write_itf8(data, i32::from(*n));
        }
        Value::Int32(n) => {
            data.push(b'i');
            write_itf8(data, *n);
        }
        Value::UInt32(n) => {
            data.push(b'i');
            write_ltf8(data, i64::from(*n));
        }
        Value::Float(f) => {
            data.push(b'f');
            data.extend_from_slice(&f.to_le_bytes());
        }
        Value::String(s) => {
            data.push(b'Z');
            write_itf8(data, s.len() as i32);
            data.extend_from_slice(s);
        }
        Value::Hex(s) => {
            data.push(b'H');
            write_itf8(data, s.len() as i32);
            data.extend_from_slice(s);
        }
        Value::Array(array) => {
            data.push(b'B');
            match array {
                Array::Int8(values) => {
                    data.push(b'c');
                    write_itf8(data, values.len() as i32);
                    for v in values {
                        write_itf8(data, i32::from(*v));
                    }
                }
                Array::UInt8(values) => {
                    data.push(b'C');
                    write_itf8(data, values.len() as i32);
                    for v in values {
                        write_itf8(data, i32::from(*v));
                    }
                }
                Array::Int16(values) => {
                    data.push(b's');
                    write_itf8(data, values.len() as i32);
                    for v in values {
                        write_itf8(data, i32::from(*v));
                    }
                }
                Array::UInt16(values) => {
                    data.push(b'S');
                    write_itf8(data, values.len() as i32);
                    for v in values {
                        write_itf8(data, i32::from(*v));
                    }
                }
                Array::Int32(values) => {
                    data.push(b'i');
                    write_itf8(data, values.len() as i32);
                    for v in values {
                        write_itf8(data, *v);
                    }
                }
                Array::UInt32(values) => {
                    data.push(b'I');
                    write_itf8(data, values.len() as i32);
                    for v in values {
                        write_ltf8(data, i64::from(*v));
                    }
                }
                Array::Float(values) => {
                    data.push(b'f');
                    write_itf8(data, values.len() as i32);
                    for v in values {
                        data.extend_from_slice(&v.to_le_bytes());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::BString;

    fn mapped_record(index: i32, sequence_id: usize, start: usize, len: usize) -> CramRecord {
        CramRecord {
            index,
            sequence_id: Some(sequence_id),
            alignment_start: start,
            alignment_end: start + len - 1,
            read_length: len,
            read_name: BString::from(format!("q{index:04}")),
            read_bases: vec![b'A'; len],
            quality_scores: Some(vec![30; len]),
            detached: true,
            ..CramRecord::default()
        }
    }

    #[test]
    fn test_single_slice_bounds() {
        let mut builder = ContainerBuilder::new(100);
        let records =
            vec![mapped_record(1, 0, 100, 50), mapped_record(2, 0, 150, 50), mapped_record(3, 0, 300, 50)];
        let container = builder.build_container(&records).unwrap();

        assert_eq!(container.slices.len(), 1);
        assert_eq!(container.reference_id, 0);
        assert_eq!(container.alignment_start, 100);
        assert_eq!(container.alignment_span, 250); // 100..=349
        assert_eq!(container.record_count, 3);
        assert_eq!(container.base_count, 150);
    }

    #[test]
    fn test_slice_partitioning() {
        let mut builder = ContainerBuilder::new(2);
        let records: Vec<_> = (0..5).map(|i| mapped_record(i + 1, 0, 100 + i as usize, 10)).collect();
        let container = builder.build_container(&records).unwrap();

        let sizes: Vec<i32> = container.slices.iter().map(|s| s.record_count).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let counters: Vec<u64> =
            container.slices.iter().map(|s| s.global_record_counter).collect();
        assert_eq!(counters, vec![0, 2, 4]);
    }

    #[test]
    fn test_global_counter_spans_containers() {
        let mut builder = ContainerBuilder::new(10);
        let first = builder
            .build_container(&[mapped_record(1, 0, 100, 10), mapped_record(2, 0, 110, 10)])
            .unwrap();
        let second = builder.build_container(&[mapped_record(1, 0, 200, 10)]).unwrap();

        assert_eq!(first.global_record_counter, 0);
        assert_eq!(second.global_record_counter, 2);
    }

    #[test]
    fn test_multi_reference_slice() {
        let mut builder = ContainerBuilder::new(100);
        let records = vec![mapped_record(1, 0, 100, 10), mapped_record(2, 1, 100, 10)];
        let container = builder.build_container(&records).unwrap();

        assert_eq!(container.reference_id, MULTI_REFERENCE);
        assert_eq!(container.slices[0].reference_id, MULTI_REFERENCE);
        assert_eq!(container.alignment_start, 0);
        assert_eq!(container.alignment_span, 0);
    }

    #[test]
    fn test_unmapped_slice() {
        let mut builder = ContainerBuilder::new(100);
        let records = vec![CramRecord {
            index: 1,
            read_length: 10,
            read_bases: vec![b'N'; 10],
            segment_unmapped: true,
            detached: true,
            ..CramRecord::default()
        }];
        let container = builder.build_container(&records).unwrap();

        assert_eq!(container.reference_id, UNMAPPED_OR_NO_REFERENCE);
        assert_eq!(container.slices[0].alignment_start, 0);
        assert_eq!(container.slices[0].alignment_span, 0);
    }

    #[test]
    fn test_ref_md5_window() {
        let bases = b"ACGTACGTACGT";
        let mut slice = Slice {
            reference_id: 0,
            alignment_start: 3,
            alignment_span: 4,
            record_count: 0,
            global_record_counter: 0,
            base_count: 0,
            ref_md5: [0; 16],
            core_block: Block {
                compression_method: CompressionMethod::Raw,
                content_type: BlockContentType::Core,
                content_id: 1,
                data: Vec::new(),
            },
        };

        slice.set_ref_md5(bases);
        let expected: [u8; 16] = Md5::digest(b"GTAC").into();
        assert_eq!(slice.ref_md5, expected);

        // span running past the sequence end clamps
        slice.alignment_start = 11;
        slice.alignment_span = 10;
        slice.set_ref_md5(bases);
        let expected: [u8; 16] = Md5::digest(b"GT").into();
        assert_eq!(slice.ref_md5, expected);

        // multi-reference slices hash the empty string
        slice.reference_id = MULTI_REFERENCE;
        slice.set_ref_md5(bases);
        let expected: [u8; 16] = Md5::digest(b"").into();
        assert_eq!(slice.ref_md5, expected);
    }

    #[test]
    fn test_record_serialization_non_empty() {
        let builder = ContainerBuilder::new(10);
        let mut data = Vec::new();
        let record = mapped_record(1, 0, 100, 10);
        builder.write_record(&mut data, &record);

        assert!(!data.is_empty());
        // detached records carry their name even without preservation
        let needle = b"q0001";
        assert!(data.windows(needle.len()).any(|w| w == needle));
    }
}
