//! Byte-level framing: variable-length integers, the file definition, the
//! header container, data containers and the EOF marker.
//!
//! Integers use the ITF-8 / LTF-8 encodings: a unary length prefix in the
//! first byte followed by payload bits. Container headers carry a big-endian
//! length, ITF-8/LTF-8 fields, slice landmarks and a CRC32. Block payloads
//! are framed with method and content-type bytes, sizes, and a payload CRC32.

use crate::container::{Block, CompressionMethod, Container};
use crate::errors::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// A CRAM (major, minor) version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CramVersion {
    /// Major version byte
    pub major: u8,
    /// Minor version byte
    pub minor: u8,
}

/// The version this writer emits.
pub const CRAM_V2_1: CramVersion = CramVersion { major: 2, minor: 1 };

/// The fixed v2.1 end-of-file container.
pub const EOF_MARKER: [u8; 30] = [
    0x0b, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xe0, 0x45, 0x4f, 0x46, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x06, 0x06, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00,
];

/// Appends an ITF-8 encoded 32-bit integer.
pub fn write_itf8(buf: &mut Vec<u8>, value: i32) {
    let v = value as u32;
    if v < 0x80 {
        buf.push(v as u8);
    } else if v < 0x4000 {
        buf.push(0x80 | (v >> 8) as u8);
        buf.push(v as u8);
    } else if v < 0x0020_0000 {
        buf.push(0xC0 | (v >> 16) as u8);
        buf.push((v >> 8) as u8);
        buf.push(v as u8);
    } else if v < 0x1000_0000 {
        buf.push(0xE0 | (v >> 24) as u8);
        buf.push((v >> 16) as u8);
        buf.push((v >> 8) as u8);
        buf.push(v as u8);
    } else {
        buf.push(0xF0 | (v >> 28) as u8);
        buf.push((v >> 20) as u8);
        buf.push((v >> 12) as u8);
        buf.push((v >> 4) as u8);
        buf.push((v & 0x0F) as u8);
    }
}

/// Reads an ITF-8 encoded 32-bit integer.
///
/// # Errors
///
/// Fails when the source ends mid-value.
pub fn read_itf8<R: Read>(reader: &mut R) -> Result<i32> {
    let first = read_byte(reader)?;
    let value = if first & 0x80 == 0 {
        u32::from(first)
    } else if first & 0x40 == 0 {
        (u32::from(first & 0x3F) << 8) | u32::from(read_byte(reader)?)
    } else if first & 0x20 == 0 {
        (u32::from(first & 0x1F) << 16)
            | (u32::from(read_byte(reader)?) << 8)
            | u32::from(read_byte(reader)?)
    } else if first & 0x10 == 0 {
        (u32::from(first & 0x0F) << 24)
            | (u32::from(read_byte(reader)?) << 16)
            | (u32::from(read_byte(reader)?) << 8)
            | u32::from(read_byte(reader)?)
    } else {
        (u32::from(first & 0x0F) << 28)
            | (u32::from(read_byte(reader)?) << 20)
            | (u32::from(read_byte(reader)?) << 12)
            | (u32::from(read_byte(reader)?) << 4)
            | u32::from(read_byte(reader)? & 0x0F)
    };
    Ok(value as i32)
}

/// Appends an LTF-8 encoded 64-bit integer.
pub fn write_ltf8(buf: &mut Vec<u8>, value: i64) {
    let v = value as u64;
    // number of payload bytes after the prefix byte
    let extra = match v {
        _ if v < 1 << 7 => 0,
        _ if v < 1 << 14 => 1,
        _ if v < 1 << 21 => 2,
        _ if v < 1 << 28 => 3,
        _ if v < 1 << 35 => 4,
        _ if v < 1 << 42 => 5,
        _ if v < 1 << 49 => 6,
        _ if v < 1 << 56 => 7,
        _ => 8,
    };
    if extra == 8 {
        buf.push(0xFF);
        buf.extend_from_slice(&v.to_be_bytes());
        return;
    }
    let prefix_mask = !(0xFFu16 >> extra) as u8;
    buf.push(prefix_mask | (v >> (8 * extra)) as u8);
    for i in (0..extra).rev() {
        buf.push((v >> (8 * i)) as u8);
    }
}

/// Reads an LTF-8 encoded 64-bit integer.
///
/// # Errors
///
/// Fails when the source ends mid-value.
pub fn read_ltf8<R: Read>(reader: &mut R) -> Result<i64> {
    let first = read_byte(reader)?;
    let extra = (first.leading_ones() as usize).min(8);
    if extra == 8 {
        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes)?;
        return Ok(i64::from_be_bytes(bytes));
    }
    let mask = 0xFFu8 >> extra;
    let mut value = u64::from(first & mask);
    for _ in 0..extra {
        value = (value << 8) | u64::from(read_byte(reader)?);
    }
    Ok(value as i64)
}

fn read_byte<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Writes the 26-byte file definition: magic, version, file id.
///
/// # Errors
///
/// Surfaces sink I/O failures.
pub fn write_file_definition<W: Write>(
    sink: &mut W,
    version: CramVersion,
    file_id: &[u8; 20],
) -> Result<u64> {
    sink.write_all(b"CRAM")?;
    sink.write_all(&[version.major, version.minor])?;
    sink.write_all(file_id)?;
    Ok(26)
}

/// Writes the SAM header container: a raw file-header block wrapped in a
/// container with no records.
///
/// # Errors
///
/// Surfaces sink I/O failures.
pub fn write_header_container<W: Write>(sink: &mut W, header_text: &[u8]) -> Result<u64> {
    use crate::container::{BlockContentType, UNMAPPED_OR_NO_REFERENCE};

    let block = Block {
        compression_method: CompressionMethod::Raw,
        content_type: BlockContentType::FileHeader,
        content_id: 0,
        data: header_text.to_vec(),
    };
    let body = block_bytes(&block)?;

    let mut header = Vec::new();
    write_itf8(&mut header, UNMAPPED_OR_NO_REFERENCE);
    write_itf8(&mut header, 0); // alignment start
    write_itf8(&mut header, 0); // alignment span
    write_itf8(&mut header, 0); // record count
    write_ltf8(&mut header, 0); // global record counter
    write_ltf8(&mut header, 0); // base count
    write_itf8(&mut header, 1); // block count
    write_itf8(&mut header, 0); // landmark count

    Ok(write_framed(sink, &header, &body)?)
}

/// Serializes and writes one sealed container, filling its slice landmarks.
/// Returns the number of bytes written.
///
/// # Errors
///
/// Surfaces sink I/O failures.
pub fn write_container<W: Write>(
    _version: CramVersion,
    container: &mut Container,
    sink: &mut W,
) -> Result<u64> {
    let mut body = Vec::new();
    let mut landmarks = Vec::with_capacity(container.slices.len());
    let mut block_count = 0i32;

    for slice in &container.slices {
        landmarks.push(body.len() as u32);
        body.extend_from_slice(&block_bytes(&slice_header_block(slice))?);
        body.extend_from_slice(&block_bytes(&slice.core_block)?);
        block_count += 2;
    }

    let mut header = Vec::new();
    write_itf8(&mut header, container.reference_id);
    write_itf8(&mut header, container.alignment_start);
    write_itf8(&mut header, container.alignment_span);
    write_itf8(&mut header, container.record_count);
    write_ltf8(&mut header, container.global_record_counter as i64);
    write_ltf8(&mut header, container.base_count as i64);
    write_itf8(&mut header, block_count);
    write_itf8(&mut header, landmarks.len() as i32);
    for landmark in &landmarks {
        write_itf8(&mut header, *landmark as i32);
    }

    container.landmarks = landmarks;
    container.body_size = body.len() as u32;
    Ok(write_framed(sink, &header, &body)?)
}

/// Writes the fixed EOF container.
///
/// # Errors
///
/// Surfaces sink I/O failures.
pub fn write_eof_marker<W: Write>(sink: &mut W) -> Result<u64> {
    sink.write_all(&EOF_MARKER)?;
    Ok(EOF_MARKER.len() as u64)
}

/// Writes `length (BE) + header + CRC32(header) + body`.
fn write_framed<W: Write>(sink: &mut W, header: &[u8], body: &[u8]) -> std::io::Result<u64> {
    let length = (header.len() + 4 + body.len()) as i32;
    sink.write_all(&length.to_be_bytes())?;
    sink.write_all(header)?;
    sink.write_all(&crc32fast::hash(header).to_be_bytes())?;
    sink.write_all(body)?;
    Ok(4 + length as u64)
}

fn slice_header_block(slice: &crate::container::Slice) -> Block {
    use crate::container::BlockContentType;

    let mut data = Vec::new();
    write_itf8(&mut data, slice.reference_id);
    write_itf8(&mut data, slice.alignment_start);
    write_itf8(&mut data, slice.alignment_span);
    write_itf8(&mut data, slice.record_count);
    write_ltf8(&mut data, slice.global_record_counter as i64);
    write_itf8(&mut data, 1); // data block count
    write_itf8(&mut data, slice.core_block.content_id);
    data.extend_from_slice(&slice.ref_md5);

    Block {
        compression_method: CompressionMethod::Raw,
        content_type: BlockContentType::SliceHeader,
        content_id: 0,
        data,
    }
}

/// Frames one block: method, content type, content id, compressed and raw
/// sizes, payload, payload CRC32.
fn block_bytes(block: &Block) -> Result<Vec<u8>> {
    let payload = match block.compression_method {
        CompressionMethod::Raw => block.data.clone(),
        CompressionMethod::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&block.data)?;
            encoder.finish()?
        }
    };

    let mut bytes = Vec::with_capacity(payload.len() + 16);
    bytes.push(block.compression_method.code());
    bytes.push(block.content_type.code());
    write_itf8(&mut bytes, block.content_id);
    write_itf8(&mut bytes, payload.len() as i32);
    write_itf8(&mut bytes, block.data.len() as i32);
    bytes.extend_from_slice(&payload);
    bytes.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    Ok(bytes)
}
