//! The streaming CRAM writer.
//!
//! Alignment records arrive one at a time; the writer buffers them until the
//! container boundary policy says to seal, then drains the buffer through
//! mate resolution, optional lossy quality preservation, record conversion
//! and container serialization, stamping byte offsets for the index as it
//! goes.
//!
//! ```no_run
//! use cramstream::reference::FastaReferenceProvider;
//! use cramstream::writer::CramWriterBuilder;
//! use std::fs::File;
//!
//! # fn main() -> anyhow::Result<()> {
//! let provider = FastaReferenceProvider::from_path("reference.fa")?;
//! let output = File::create("out.cram")?;
//! let mut writer = CramWriterBuilder::new().build(output, provider);
//!
//! writer.write_header("@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:1000\n")?;
//! // writer.write_alignment(record)?; ...
//! writer.finish()?;
//! # Ok(())
//! # }
//! ```

use crate::container::ContainerBuilder;
use crate::container_io::{
    write_container, write_eof_marker, write_file_definition, write_header_container, CramVersion,
    CRAM_V2_1,
};
use crate::errors::{CramError, Result};
use crate::factory::{Cram2SamFactory, Sam2CramFactory};
use crate::index::IndexSink;
use crate::lossy::QualityScorePreservation;
use crate::mate::resolve_mates;
use crate::record::CramRecord;
use crate::reference::ReferenceProvider;
use crate::tracks::ReferenceTracks;
use log::warn;
use noodles::sam::alignment::record::Cigar;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::header::record::value::map::header::tag as header_tag;
use noodles::sam::Header;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

/// Default number of records per slice.
pub const DEFAULT_RECORDS_PER_SLICE: usize = 10_000;
/// Default number of slices per container.
pub const DEFAULT_SLICES_PER_CONTAINER: usize = 1;
/// Batch size above which a foreign-reference record is absorbed into a
/// multi-reference batch instead of forcing a seal.
pub const DEFAULT_MULTI_REF_SWITCH_THRESHOLD: usize = 1_000;

/// Which reference the current batch is accumulating against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceContext {
    /// No record buffered yet
    Uninitialized,
    /// The batch mixes reference sequences
    MultiReference,
    /// Every buffered record is unmapped
    Unmapped,
    /// Every buffered record maps to this sequence index
    Single(usize),
}

impl ReferenceContext {
    fn of(sequence_id: Option<usize>) -> Self {
        sequence_id.map_or(Self::Unmapped, Self::Single)
    }
}

/// Configuration for a [`CramWriter`].
#[derive(Debug, Clone)]
pub struct CramWriterBuilder {
    records_per_slice: usize,
    slices_per_container: usize,
    multi_ref_switch_threshold: usize,
    preserve_read_names: bool,
    capture_all_tags: bool,
    capture_tags: HashSet<Tag>,
    ignore_tags: HashSet<Tag>,
    preservation: Option<QualityScorePreservation>,
    paranoid_mode: bool,
    file_id: [u8; 20],
}

impl Default for CramWriterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CramWriterBuilder {
    /// Creates a builder with the default configuration: 10 000 records per
    /// slice, one slice per container, lossless quality scores, read names
    /// preserved, every tag captured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records_per_slice: DEFAULT_RECORDS_PER_SLICE,
            slices_per_container: DEFAULT_SLICES_PER_CONTAINER,
            multi_ref_switch_threshold: DEFAULT_MULTI_REF_SWITCH_THRESHOLD,
            preserve_read_names: true,
            capture_all_tags: true,
            capture_tags: HashSet::new(),
            ignore_tags: HashSet::new(),
            preservation: None,
            paranoid_mode: false,
            file_id: *b"cramstream          ",
        }
    }

    /// Sets the number of records per slice.
    #[must_use]
    pub fn records_per_slice(mut self, n: usize) -> Self {
        self.records_per_slice = n.max(1);
        self
    }

    /// Sets the number of slices per container.
    #[must_use]
    pub fn slices_per_container(mut self, n: usize) -> Self {
        self.slices_per_container = n.max(1);
        self
    }

    /// Sets the batch size above which a foreign-reference record switches
    /// the batch to multi-reference instead of sealing it.
    #[must_use]
    pub fn multi_ref_switch_threshold(mut self, n: usize) -> Self {
        self.multi_ref_switch_threshold = n;
        self
    }

    /// Controls whether read names are stored verbatim.
    #[must_use]
    pub fn preserve_read_names(mut self, preserve: bool) -> Self {
        self.preserve_read_names = preserve;
        self
    }

    /// Controls whether every auxiliary tag is captured.
    #[must_use]
    pub fn capture_all_tags(mut self, capture: bool) -> Self {
        self.capture_all_tags = capture;
        self
    }

    /// Tags to capture when not capturing everything.
    #[must_use]
    pub fn capture_tags<I: IntoIterator<Item = Tag>>(mut self, tags: I) -> Self {
        self.capture_tags = tags.into_iter().collect();
        self
    }

    /// Tags never captured.
    #[must_use]
    pub fn ignore_tags<I: IntoIterator<Item = Tag>>(mut self, tags: I) -> Self {
        self.ignore_tags = tags.into_iter().collect();
        self
    }

    /// Configures a lossy quality preservation policy (e.g. `"*8"`).
    /// Without one, quality scores are preserved verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`CramError::InvalidPreservationPolicy`] when the string does
    /// not parse.
    pub fn quality_preservation_policy(mut self, policy: &str) -> Result<Self> {
        self.preservation = Some(QualityScorePreservation::new(policy)?);
        Ok(self)
    }

    /// Enables the per-batch round-trip assertion before serialization.
    #[must_use]
    pub fn paranoid_mode(mut self, enabled: bool) -> Self {
        self.paranoid_mode = enabled;
        self
    }

    /// Sets the 20-byte file id stamped into the file definition.
    #[must_use]
    pub fn file_id(mut self, file_id: [u8; 20]) -> Self {
        self.file_id = file_id;
        self
    }

    /// Builds a writer over an output sink and a reference provider.
    pub fn build<W: Write, P: ReferenceProvider>(self, sink: W, provider: P) -> CramWriter<W, P> {
        CramWriter {
            sink,
            provider,
            header: None,
            coordinate_sorted: false,
            container_builder: ContainerBuilder::new(self.records_per_slice),
            buffer: Vec::new(),
            ref_context: ReferenceContext::Uninitialized,
            offset: 0,
            indexer: None,
            version: CRAM_V2_1,
            config: self,
        }
    }
}

/// Streaming writer converting alignment records into CRAM containers.
///
/// Single-threaded: the writer owns the buffer, the reference context, the
/// running byte offset and the container builder. Producers must serialize
/// calls to [`CramWriter::write_alignment`].
pub struct CramWriter<W: Write, P: ReferenceProvider> {
    sink: W,
    provider: P,
    header: Option<Header>,
    coordinate_sorted: bool,
    container_builder: ContainerBuilder,
    buffer: Vec<RecordBuf>,
    ref_context: ReferenceContext,
    offset: u64,
    indexer: Option<Box<dyn IndexSink>>,
    version: CramVersion,
    config: CramWriterBuilder,
}

impl<W: Write, P: ReferenceProvider> CramWriter<W, P> {
    /// Attaches an index sink; it observes containers in write order.
    pub fn set_index_sink(&mut self, indexer: Box<dyn IndexSink>) {
        self.indexer = Some(indexer);
    }

    /// Running count of bytes written to the sink.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Parses the textual SAM header, writes the file definition and the
    /// header container, and arms the writer. Must be called exactly once
    /// before the first [`CramWriter::write_alignment`].
    ///
    /// # Errors
    ///
    /// Fails on a second call, on an unparseable header, or on sink I/O
    /// failure.
    pub fn write_header(&mut self, text: &str) -> Result<()> {
        if self.header.is_some() {
            return Err(CramError::HeaderAlreadyWritten);
        }
        let header: Header =
            text.parse().map_err(|e| CramError::InvalidHeader(format!("{e}")))?;

        self.coordinate_sorted = header
            .header()
            .and_then(|hd| hd.other_fields().get(&header_tag::SORT_ORDER))
            .is_some_and(|so| so.as_slice() == b"coordinate");
        self.container_builder = ContainerBuilder::new(self.config.records_per_slice);
        self.container_builder.set_preserve_read_names(self.config.preserve_read_names);

        self.offset = write_file_definition(&mut self.sink, self.version, &self.config.file_id)?;
        self.offset += write_header_container(&mut self.sink, text.as_bytes())?;
        self.header = Some(header);
        Ok(())
    }

    /// Buffers one alignment record, sealing the current container first when
    /// the boundary policy requires it.
    ///
    /// # Errors
    ///
    /// Fails when called before [`CramWriter::write_header`], or when a seal
    /// triggered by this record fails.
    pub fn write_alignment(&mut self, record: RecordBuf) -> Result<()> {
        if self.header.is_none() {
            return Err(CramError::HeaderNotYetWritten);
        }
        if self.should_seal(&record) {
            self.flush_container()?;
        }
        self.update_reference_context(record.reference_sequence_id());
        self.buffer.push(record);
        Ok(())
    }

    /// Seals any buffered records, writes the EOF marker and finalizes the
    /// sinks.
    ///
    /// # Errors
    ///
    /// Surfaces the first flush, sink or index failure.
    pub fn finish(mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.flush_container()?;
        }
        self.offset += write_eof_marker(&mut self.sink)?;
        self.sink.flush()?;
        if let Some(indexer) = self.indexer.as_mut() {
            indexer.finish()?;
        }
        Ok(())
    }

    /// The container boundary policy, consulted before buffering `incoming`.
    ///
    /// An empty batch adopts the record's reference and never seals. A full
    /// batch always seals. Non-coordinate streams and multi-reference batches
    /// mix references freely. A foreign-reference record seals a small batch
    /// but switches a large one to multi-reference, trading one mixed slice
    /// against a near-empty container.
    fn should_seal(&mut self, incoming: &RecordBuf) -> bool {
        if self.buffer.is_empty() {
            self.ref_context = ReferenceContext::of(incoming.reference_sequence_id());
            return false;
        }

        if self.buffer.len() >= self.container_size() {
            return true;
        }

        if !self.coordinate_sorted || self.ref_context == ReferenceContext::MultiReference {
            return false;
        }

        if self.ref_context == ReferenceContext::of(incoming.reference_sequence_id()) {
            return false;
        }

        if self.buffer.len() > self.config.multi_ref_switch_threshold {
            self.ref_context = ReferenceContext::MultiReference;
            false
        } else {
            true
        }
    }

    fn container_size(&self) -> usize {
        self.config.records_per_slice * self.config.slices_per_container
    }

    /// Tracks the batch reference after a record is appended.
    fn update_reference_context(&mut self, sequence_id: Option<usize>) {
        match self.ref_context {
            ReferenceContext::MultiReference => {}
            ReferenceContext::Uninitialized => {
                self.ref_context = ReferenceContext::of(sequence_id);
            }
            current => {
                if current != ReferenceContext::of(sequence_id) {
                    self.ref_context = ReferenceContext::MultiReference;
                }
            }
        }
    }

    /// Runs the flush pipeline over the buffered batch: reference resolution,
    /// track population, record conversion with delta assignment, quality
    /// preservation, the mismatch advisory and mate resolution. Returns the
    /// batch reference bases and the finished compression records.
    fn prepare_batch(&mut self) -> Result<(Arc<Vec<u8>>, Vec<CramRecord>)> {
        let batch_sequence_id = match self.ref_context {
            ReferenceContext::Single(id) => Some(id),
            ReferenceContext::MultiReference => {
                if self.config.preservation.as_ref().is_some_and(QualityScorePreservation::requires_tracks)
                {
                    return Err(CramError::LossyMultiRefNotSupported);
                }
                None
            }
            ReferenceContext::Unmapped | ReferenceContext::Uninitialized => None,
        };

        let refs = match batch_sequence_id {
            Some(id) => self.provider.reference_bases(id)?,
            None => Arc::new(Vec::new()),
        };

        let (start, stop) = batch_bounds(&self.buffer);

        let mut tracks = None;
        if self.config.preservation.as_ref().is_some_and(QualityScorePreservation::requires_tracks) {
            let Some(id) = batch_sequence_id else {
                return Err(CramError::LossyMultiRefNotSupported);
            };
            let mut t = ReferenceTracks::new(id, refs.clone());
            if start > 0 {
                t.ensure_window(start, stop - start + 1);
            }
            t.populate(&self.buffer);
            tracks = Some(t);
        }

        let mut factory = Sam2CramFactory::new(refs.clone());
        factory.preserve_read_names = self.config.preserve_read_names;
        factory.capture_all_tags = self.config.capture_all_tags;
        factory.capture_tags = self.config.capture_tags.clone();
        factory.ignore_tags = self.config.ignore_tags.clone();

        let mut records = Vec::with_capacity(self.buffer.len());
        let mut index = 0i32;
        let mut prev_alignment_start = start as i64;
        for record in &self.buffer {
            if let Some(id) = record.reference_sequence_id() {
                if batch_sequence_id != Some(id) {
                    // a multi-reference batch: re-seed the factory with this
                    // record's own reference
                    factory.set_reference_bases(self.provider.reference_bases(id)?);
                }
            }

            let mut cram = factory.create_record(record)?;
            index += 1;
            cram.index = index;
            let record_start = record.alignment_start().map_or(0, usize::from) as i64;
            cram.alignment_delta = record_start - prev_alignment_start;
            prev_alignment_start = record_start;

            if let Some(preservation) = &self.config.preservation {
                preservation.apply(record, &mut cram, tracks.as_ref())?;
            } else if cram.quality_scores.is_some() {
                cram.force_preserve_quality_scores = true;
            }

            records.push(cram);
        }

        if factory.base_count() < 3 * factory.feature_count() {
            warn!("Abnormally high number of mismatches, possibly wrong reference.");
        }

        resolve_mates(&mut records, self.coordinate_sorted);

        if self.config.paranoid_mode {
            self.verify_round_trip(&records)?;
        }

        Ok((refs, records))
    }

    /// Seals the buffered batch into one container, writes it, notifies the
    /// index sink and resets the batch state.
    fn flush_container(&mut self) -> Result<()> {
        let (refs, records) = self.prepare_batch()?;

        let mut container = self.container_builder.build_container(&records)?;
        for slice in &mut container.slices {
            slice.set_ref_md5(&refs);
        }
        container.offset = self.offset;
        self.offset += write_container(self.version, &mut container, &mut self.sink)?;

        if let Some(indexer) = self.indexer.as_mut() {
            indexer.process_container(&container)?;
        }

        self.buffer.clear();
        self.ref_context = ReferenceContext::Uninitialized;
        Ok(())
    }

    /// Paranoid mode: every compression record must restore to a record whose
    /// alignment start, reference name, bases and (on the lossless path)
    /// quality scores match the buffered original.
    fn verify_round_trip(&mut self, records: &[CramRecord]) -> Result<()> {
        let header = self.header.as_ref().ok_or(CramError::HeaderNotYetWritten)?;
        let inverse = Cram2SamFactory;
        let lossless = self.config.preservation.is_none();

        for (original, cram) in self.buffer.iter().zip(records) {
            let refs = match cram.sequence_id {
                Some(id) => self.provider.reference_bases(id)?,
                None => Arc::new(Vec::new()),
            };
            let restored = inverse.create(cram, &refs)?;
            let mismatch = |field| CramError::RoundTripMismatch {
                read_name: String::from_utf8_lossy(&cram.read_name).into_owned(),
                field,
            };

            if restored.alignment_start() != original.alignment_start() {
                return Err(mismatch("alignment start"));
            }
            if reference_name(header, restored.reference_sequence_id())
                != reference_name(header, original.reference_sequence_id())
            {
                return Err(mismatch("reference name"));
            }
            if restored.sequence().as_ref() as &[u8] != original.sequence().as_ref() as &[u8] {
                return Err(mismatch("read bases"));
            }
            if lossless
                && restored.quality_scores().as_ref() as &[u8]
                    != original.quality_scores().as_ref() as &[u8]
            {
                return Err(mismatch("quality scores"));
            }
        }
        Ok(())
    }
}

/// Min alignment start / max alignment end over the mapped records of a
/// batch; `(0, 0)` when nothing is mapped.
fn batch_bounds(records: &[RecordBuf]) -> (usize, usize) {
    let mut start = 0usize;
    let mut stop = 0usize;
    for record in records {
        let Some(record_start) = record.alignment_start().map(usize::from) else {
            continue;
        };
        if start == 0 || record_start < start {
            start = record_start;
        }
        stop = stop.max(alignment_end(record).unwrap_or(record_start));
    }
    (start, stop)
}

/// 1-based inclusive alignment end: start plus the reference length of the
/// CIGAR, minus one.
fn alignment_end(record: &RecordBuf) -> Option<usize> {
    use crate::record::consumes_reference_bases;

    let start = usize::from(record.alignment_start()?);
    let ref_len: usize = record
        .cigar()
        .iter()
        .filter_map(std::result::Result::ok)
        .filter(|op| consumes_reference_bases(op.kind()))
        .map(|op| op.len())
        .sum();
    Some(start + ref_len.saturating_sub(1))
}

fn reference_name(header: &Header, sequence_id: Option<usize>) -> Option<String> {
    let id = sequence_id?;
    header
        .reference_sequences()
        .get_index(id)
        .map(|(name, _)| String::from_utf8_lossy(name).into_owned())
}
