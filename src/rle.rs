//! Run-length encoding for resource contents.
//!
//! Buffer and texture contents captured into snapshot blobs are mostly long
//! stretches of one byte value (cleared render targets, zero-filled buffers),
//! so `snapshot` compresses them with this before they go into the log.
//!
//! ## Format
//!
//! An encoded stream is a sequence of segments, each introduced by an
//! unsigned LEB128 count. Segments alternate between two shapes, starting
//! with a repeat:
//!
//! - repeat: the count, then one byte that is repeated that many times;
//! - copy: the count, then that many bytes which are copied as they are.
//!
//! Either shape may be the last segment. A copy segment with a count of zero
//! is legal and sits between two adjacent repeats. The empty stream decodes
//! to no bytes.

use crate::serialize::DeserializeError;
use std::io;

/// A copy segment only gives way to a repeat once this many equal bytes show up.
const MIN_RUN: usize = 4;

/// Write `data` to `stream` with run-length encoding.
pub fn write<S>(stream: &mut S, data: &[u8]) -> io::Result<()>
where
    S: io::Write,
{
    let mut rest = data;
    while let Some(&byte) = rest.first() {
        let repeat = rest.iter().take_while(|&&b| b == byte).count();
        write_count(stream, repeat)?;
        stream.write_all(&[byte])?;
        rest = &rest[repeat..];
        if rest.is_empty() {
            break;
        }

        let copy = next_run(rest);
        write_count(stream, copy)?;
        stream.write_all(&rest[..copy])?;
        rest = &rest[copy..];
    }
    Ok(())
}

/// Index of the first stretch of `MIN_RUN` equal bytes in `data`, or its length.
fn next_run(data: &[u8]) -> usize {
    let mut start = 0;
    for (i, &byte) in data.iter().enumerate().skip(1) {
        if byte != data[start] {
            start = i;
        } else if i + 1 - start >= MIN_RUN {
            return start;
        }
    }
    data.len()
}

fn write_count<S: io::Write>(stream: &mut S, count: usize) -> io::Result<()> {
    leb128::write::unsigned(stream, count as u64)?;
    Ok(())
}

/// Read run-length encoded bytes from `buf`, consuming all of it.
///
/// `expected_len`, if given, bounds the expanded size; a stream that expands
/// past it is rejected rather than allocated.
pub fn read(buf: &mut &[u8], expected_len: Option<usize>) -> Result<Vec<u8>, DeserializeError> {
    let mut expanded = Vec::new();
    let limit = expected_len.unwrap_or(usize::MAX);
    let check = |expanded: &Vec<u8>, count: usize| -> Result<(), DeserializeError> {
        match expanded.len().checked_add(count) {
            Some(total) if total <= limit => Ok(()),
            _ => Err(DeserializeError::BadValue { what: "run length", value: count as u64 }),
        }
    };

    let mut repeat = true;
    while !buf.is_empty() {
        let count = crate::serialize::read_len(buf)?;
        check(&expanded, count)?;
        if repeat {
            let (&byte, tail) = buf.split_first().ok_or(DeserializeError::UnexpectedEof)?;
            expanded.resize(expanded.len() + count, byte);
            *buf = tail;
        } else {
            let bytes = buf.get(..count).ok_or(DeserializeError::UnexpectedEof)?;
            expanded.extend_from_slice(bytes);
            *buf = &buf[count..];
        }
        repeat = !repeat;
    }

    Ok(expanded)
}

#[cfg(test)]
fn encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = vec![];
    write(&mut encoded, data).unwrap();
    encoded
}

#[test]
fn test_encoding_shapes() {
    assert_eq!(encode(&[]), Vec::<u8>::new());
    assert_eq!(encode(&[7]), [1, 7]);
    assert_eq!(encode(&[0; 5]), [5, 0]);
    // Two repeats back to back need an empty copy between them.
    assert_eq!(encode(&[9, 9, 0, 0, 0, 0]), [2, 9, 0, 4, 0]);
    // Short repeats stay inside the copy.
    assert_eq!(encode(&[5, 6, 6, 6, 7]), [1, 5, 4, 6, 6, 6, 7]);
    assert_eq!(encode(&[5, 6, 7, 7, 7, 7, 8]), [1, 5, 1, 6, 4, 7, 1, 8]);
}

#[test]
fn test_cleared_texture_compresses() {
    // An RGBA texture cleared to zero, with one texel drawn into it.
    let mut texels = vec![0u8; 256];
    texels[40..44].copy_from_slice(&[200, 10, 10, 255]);
    let encoded = encode(&texels);
    assert!(encoded.len() < texels.len() / 2);

    let mut cursor = &encoded[..];
    assert_eq!(read(&mut cursor, Some(texels.len())).unwrap(), texels);
    assert!(cursor.is_empty());
}

#[test]
fn test_read_segments() {
    let mut stream: &[u8] = &[3, 1, 2, 8, 9, 2, 4];
    assert_eq!(read(&mut stream, None).unwrap(), [1, 1, 1, 8, 9, 4, 4]);

    // Counts above 127 take two LEB128 bytes.
    let mut stream: &[u8] = &[0x80, 0x01, 0xaa];
    assert_eq!(read(&mut stream, None).unwrap(), vec![0xaa; 128]);
}

#[test]
fn test_read_rejects_bad_streams() {
    // A repeat with no value byte.
    let mut truncated: &[u8] = &[3];
    assert_eq!(read(&mut truncated, None), Err(DeserializeError::UnexpectedEof));

    // A copy longer than the remaining input.
    let mut truncated: &[u8] = &[1, 9, 4, 1, 2];
    assert_eq!(read(&mut truncated, None), Err(DeserializeError::UnexpectedEof));

    // A repeat that expands past the caller's bound.
    let mut huge: &[u8] = &[0xff, 0xff, 0xff, 0x7f, 0];
    assert!(read(&mut huge, Some(16)).is_err());
}
