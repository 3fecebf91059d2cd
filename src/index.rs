//! Index sinks consuming sealed containers.
//!
//! The writer notifies its index sink once per container, after the
//! container's bytes (and therefore its offset and slice landmarks) are
//! final. [`CraiIndexer`] renders the classic gzip text index: one line per
//! slice with the coordinates needed for random access.

use crate::container::Container;
use crate::errors::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

/// Consumer of sealed containers, notified in stream order.
pub trait IndexSink {
    /// Called once per container, immediately after its bytes are written.
    ///
    /// # Errors
    ///
    /// Surfaces sink failures; the writer aborts the stream on error.
    fn process_container(&mut self, container: &Container) -> Result<()>;

    /// Called once from the writer's `finish`; flushes and closes the index.
    ///
    /// # Errors
    ///
    /// Surfaces sink failures.
    fn finish(&mut self) -> Result<()>;
}

/// Writes a gzip text index: per slice, the tab-separated fields
/// `sequence_id`, `alignment_start`, `alignment_span`, `container_offset`,
/// `slice_offset` (within the container body), `slice_size`.
pub struct CraiIndexer<W: Write> {
    encoder: Option<GzEncoder<W>>,
}

impl<W: Write> CraiIndexer<W> {
    /// Creates an indexer writing to the given sink.
    pub fn new(sink: W) -> Self {
        Self { encoder: Some(GzEncoder::new(sink, Compression::default())) }
    }
}

impl<W: Write> IndexSink for CraiIndexer<W> {
    fn process_container(&mut self, container: &Container) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };

        // landmarks are filled by the container writer; the final slice runs
        // to the end of the body, which the next landmark delta cannot give
        for (i, slice) in container.slices.iter().enumerate() {
            let slice_offset = container.landmarks.get(i).copied().unwrap_or(0);
            let slice_size = match container.landmarks.get(i + 1) {
                Some(next) => next - slice_offset,
                None => container.body_size.saturating_sub(slice_offset),
            };
            writeln!(
                encoder,
                "{}\t{}\t{}\t{}\t{}\t{}",
                slice.reference_id,
                slice.alignment_start,
                slice.alignment_span,
                container.offset,
                slice_offset,
                slice_size,
            )?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            encoder.finish()?.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Block, BlockContentType, CompressionMethod, Slice};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    /// A `Write` handle into a shared buffer, so the test can read what the
    /// indexer wrote after it is finished.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn test_slice(reference_id: i32, start: i32, span: i32) -> Slice {
        Slice {
            reference_id,
            alignment_start: start,
            alignment_span: span,
            record_count: 1,
            global_record_counter: 0,
            base_count: 50,
            ref_md5: [0; 16],
            core_block: Block {
                compression_method: CompressionMethod::Raw,
                content_type: BlockContentType::Core,
                content_id: 1,
                data: Vec::new(),
            },
        }
    }

    #[test]
    fn test_index_lines() {
        let buffer = SharedBuffer::default();
        let mut indexer = CraiIndexer::new(buffer.clone());

        let container = Container {
            reference_id: 0,
            alignment_start: 100,
            alignment_span: 400,
            record_count: 2,
            global_record_counter: 0,
            base_count: 100,
            slices: vec![test_slice(0, 100, 200), test_slice(0, 300, 200)],
            offset: 1234,
            landmarks: vec![0, 96],
            body_size: 200,
        };

        indexer.process_container(&container).unwrap();
        indexer.finish().unwrap();

        let bytes = buffer.0.lock().unwrap().clone();
        let mut text = String::new();
        GzDecoder::new(&bytes[..]).read_to_string(&mut text).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "0\t100\t200\t1234\t0\t96");
        assert_eq!(lines[1], "0\t300\t200\t1234\t96\t104");
    }

    #[test]
    fn test_finish_idempotent_after_close() {
        let buffer = SharedBuffer::default();
        let mut indexer = CraiIndexer::new(buffer.clone());
        indexer.finish().unwrap();
        // further calls are no-ops rather than panics
        indexer.finish().unwrap();

        let container = Container {
            reference_id: 0,
            alignment_start: 1,
            alignment_span: 1,
            record_count: 0,
            global_record_counter: 0,
            base_count: 0,
            slices: Vec::new(),
            offset: 0,
            landmarks: Vec::new(),
            body_size: 0,
        };
        indexer.process_container(&container).unwrap();
    }
}
