//! End-to-end tests over the full output stream: file definition, header
//! container, data containers, EOF marker, offset bookkeeping and the text
//! index.

use cramstream::container_io::EOF_MARKER;
use cramstream::index::CraiIndexer;
use cramstream::reference::InMemoryReferenceProvider;
use cramstream::sam_builder::{coordinate_header_text, SamBuilder};
use cramstream::writer::CramWriterBuilder;
use flate2::read::GzDecoder;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

/// A `Write` handle into a shared buffer so tests can inspect bytes after
/// the writer is consumed by `finish`.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn take(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn test_provider() -> InMemoryReferenceProvider {
    let chr1: Vec<u8> = b"ACGT".iter().copied().cycle().take(4000).collect();
    let chr2 = vec![b'C'; 4000];
    InMemoryReferenceProvider::new([chr1, chr2])
}

/// Walks the container stream, returning the byte offset of every container
/// (the header container included) and asserting the stream ends with the
/// EOF marker.
fn container_offsets(bytes: &[u8]) -> Vec<u64> {
    assert_eq!(&bytes[0..4], b"CRAM", "missing file definition magic");
    let mut pos = 26usize;
    let mut offsets = Vec::new();

    loop {
        let remaining = &bytes[pos..];
        if remaining == EOF_MARKER.as_slice() {
            break;
        }
        assert!(remaining.len() > 4, "stream truncated before EOF marker");
        let length =
            i32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
        offsets.push(pos as u64);
        pos += 4 + length as usize;
    }

    offsets
}

#[test]
fn test_stream_layout_and_offsets() {
    let output = SharedBuffer::default();
    let index_output = SharedBuffer::default();

    let mut writer = CramWriterBuilder::new()
        .records_per_slice(3)
        .build(output.clone(), test_provider());
    writer.set_index_sink(Box::new(CraiIndexer::new(index_output.clone())));
    writer.write_header(&coordinate_header_text(&[("chr1", 4000), ("chr2", 4000)])).unwrap();

    let mut sam = SamBuilder::with_refs(&[("chr1", 4000), ("chr2", 4000)]);
    for i in 0..7usize {
        let record = sam.add_frag().contig(0).start(100 + i * 10).build();
        writer.write_alignment(record).unwrap();
    }
    writer.finish().unwrap();

    let bytes = output.take();
    let offsets = container_offsets(&bytes);
    // header container + three data containers (3, 3, 1 records)
    assert_eq!(offsets.len(), 4);
    assert_eq!(offsets[0], 26);

    // the index recorded one line per slice, stamped with the exact byte
    // offsets the containers landed at
    let mut text = String::new();
    GzDecoder::new(&index_output.take()[..]).read_to_string(&mut text).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);

    for (line, container_offset) in lines.iter().zip(&offsets[1..]) {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0], "0", "sequence id");
        assert_eq!(fields[3], container_offset.to_string(), "container offset");
    }
}

#[test]
fn test_mixed_reference_stream() {
    let output = SharedBuffer::default();
    let mut writer = CramWriterBuilder::new()
        .multi_ref_switch_threshold(2)
        .paranoid_mode(true)
        .build(output.clone(), test_provider());
    writer.write_header(&coordinate_header_text(&[("chr1", 4000), ("chr2", 4000)])).unwrap();

    let mut sam = SamBuilder::with_refs(&[("chr1", 4000), ("chr2", 4000)]);
    // three chr1 records, then a chr2 record absorbed into a multi-ref batch
    for i in 0..3usize {
        let record = sam.add_frag().contig(0).start(200 + i * 5).build();
        writer.write_alignment(record).unwrap();
    }
    let foreign = sam.add_frag().contig(1).start(50).build();
    writer.write_alignment(foreign).unwrap();
    writer.finish().unwrap();

    let bytes = output.take();
    let offsets = container_offsets(&bytes);
    // header container plus a single multi-reference data container
    assert_eq!(offsets.len(), 2);
}

#[test]
fn test_pairs_and_unmapped_records_stream() {
    let output = SharedBuffer::default();
    let mut writer =
        CramWriterBuilder::new().paranoid_mode(true).build(output.clone(), test_provider());
    writer.write_header(&coordinate_header_text(&[("chr1", 4000), ("chr2", 4000)])).unwrap();

    let mut sam = SamBuilder::with_refs(&[("chr1", 4000), ("chr2", 4000)]);
    let (r1, r2) = sam.add_pair().name("pair1").contig(0).start1(500).start2(700).build();
    writer.write_alignment(r1).unwrap();
    let lone = sam.add_frag().name("lone").contig(0).start(600).build();
    writer.write_alignment(lone).unwrap();
    writer.write_alignment(r2).unwrap();
    // an unmapped trailer record is foreign to the chr1 batch, sealing it
    let unmapped = sam.add_frag().name("u1").bases("ACGT").unmapped().build();
    writer.write_alignment(unmapped).unwrap();
    writer.finish().unwrap();

    let bytes = output.take();
    let offsets = container_offsets(&bytes);
    // header container, the mapped batch, the unmapped trailer
    assert_eq!(offsets.len(), 3);
}

#[test]
fn test_lossy_stream_writes() {
    let output = SharedBuffer::default();
    let mut writer = CramWriterBuilder::new()
        .quality_preservation_policy("*8")
        .unwrap()
        .build(output.clone(), test_provider());
    writer.write_header(&coordinate_header_text(&[("chr1", 4000)])).unwrap();

    let mut sam = SamBuilder::with_refs(&[("chr1", 4000)]);
    for i in 0..5usize {
        let record = sam.add_frag().contig(0).start(100 + i * 20).build();
        writer.write_alignment(record).unwrap();
    }
    writer.finish().unwrap();

    let bytes = output.take();
    let offsets = container_offsets(&bytes);
    assert_eq!(offsets.len(), 2);
}

#[test]
fn test_empty_stream_is_just_prelude_and_eof() {
    let output = SharedBuffer::default();
    let mut writer = CramWriterBuilder::new().build(output.clone(), test_provider());
    writer.write_header(&coordinate_header_text(&[("chr1", 4000)])).unwrap();
    writer.finish().unwrap();

    let bytes = output.take();
    let offsets = container_offsets(&bytes);
    // only the header container; no data containers were sealed
    assert_eq!(offsets.len(), 1);
}
