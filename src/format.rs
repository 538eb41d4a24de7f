//! The layout of a capture log.
//!
//! A log is, in order:
//!
//! - A fixed header: the 8-byte `MAGIC`, the `u32` format version, and the
//!   `InitParams` the capturing context was created with.
//!
//! - A sequence of chunks. Each chunk is a `u16` type tag, `u16` flags and a
//!   `u64` payload length, followed by the payload. Chunks are
//!   self-delimiting, so a reader can always skip one it does not care about.
//!
//! - The frame index: a serialized `Vec<FrameIndexEntry>` recording the byte
//!   offset of each frame's boundary chunks and of every event.
//!
//! - A fixed footer: the index's offset and length, the format version again,
//!   and `FOOTER_MAGIC`.
//!
//! Within one captured frame the chunks appear as a `BeginCaptureFrame`
//! chunk, then `ApiCall`, `DebugMessages` and `StateRefresh` chunks in call
//! order, then the `CaptureScope` chunk, and finally the frame's
//! `InitialState` chunks, ordered so that dependencies come first.
//!
//! All integers are little-endian; see the `serialize` module.

use crate::call::{ContextId, EventId};
use crate::error::LogError;
use crate::serialize::{serialized_struct, Deserialize, DeserializeError, Serialize};

use std::{fmt, io};

pub const MAGIC: [u8; 8] = *b"GLCAPLOG";
pub const FOOTER_MAGIC: [u8; 8] = *b"GLCAPEND";

/// Bump this whenever the layout of anything in a log changes.
pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_LEN: u64 = 8 + 4 + 5 * 4;
pub const CHUNK_HEADER_LEN: u64 = 2 + 2 + 8;
pub const FOOTER_LEN: u64 = 8 + 8 + 4 + 8;

/// Chunk flag: the chunk's payload could not be completely recorded.
pub const CHUNK_PARTIAL: u16 = 0x1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ChunkType {
    BeginCaptureFrame = 1,
    ApiCall = 2,
    CaptureScope = 3,
    InitialState = 4,
    DebugMessages = 5,
    /// A full-state snapshot of a high-traffic resource, standing in for the
    /// mutations that were not recorded.
    StateRefresh = 6,
}

impl ChunkType {
    pub fn from_tag(tag: u16) -> Option<ChunkType> {
        Some(match tag {
            1 => ChunkType::BeginCaptureFrame,
            2 => ChunkType::ApiCall,
            3 => ChunkType::CaptureScope,
            4 => ChunkType::InitialState,
            5 => ChunkType::DebugMessages,
            6 => ChunkType::StateRefresh,
            _ => return None,
        })
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

serialized_struct! {
    /// Properties of the capturing context's default framebuffer.
    pub struct InitParams {
        pub width: u32,
        pub height: u32,
        pub color_bits: u32,
        pub depth_bits: u32,
        pub stencil_bits: u32,
    }

    /// Payload of a `BeginCaptureFrame` chunk.
    pub struct FrameBegin {
        pub frame_number: u64,
        /// The context whose frame boundary started the capture.
        pub context: ContextId,
    }

    /// Payload of a `CaptureScope` chunk.
    pub struct CaptureScope {
        pub frame_number: u64,
        pub event_count: u64,
        pub drawcall_count: u64,
        /// Wall-clock duration of the captured frame.
        pub frame_time_us: u64,
        /// Running frame time statistics up to the capture.
        pub avg_frame_time_us: u64,
        pub min_frame_time_us: u64,
        pub max_frame_time_us: u64,
        /// Number of chunks in the frame flagged `CHUNK_PARTIAL`.
        pub partial_chunks: u32,
        /// Resources touched during the frame, per context.
        pub contexts: Vec<(ContextId, u64)>,
    }

    /// Where one captured frame's chunks live.
    pub struct FrameIndexEntry {
        pub frame_number: u64,
        pub begin_offset: u64,
        pub scope_offset: u64,
        pub initial_states: Vec<u64>,
        /// Event id and chunk offset, in event order.
        pub events: Vec<(EventId, u64)>,
    }
}

impl FrameIndexEntry {
    /// Return the offset of the chunk recording `event`.
    pub fn event_offset(&self, event: EventId) -> Option<u64> {
        self.events
            .binary_search_by_key(&event, |&(id, _)| id)
            .ok()
            .map(|pos| self.events[pos].1)
    }

    /// The id of the frame's last event, or zero if it has none.
    pub fn last_event(&self) -> EventId {
        self.events.last().map_or(0, |&(id, _)| id)
    }
}

pub fn write_header<W: io::Write>(stream: &mut W, init: &InitParams) -> io::Result<()> {
    stream.write_all(&MAGIC)?;
    FORMAT_VERSION.serialize(stream)?;
    init.serialize(stream)
}

/// Check a log's header, and return the init params it carries.
pub fn read_header(mut bytes: &[u8]) -> Result<InitParams, LogError> {
    if bytes.len() < HEADER_LEN as usize || bytes[..8] != MAGIC {
        return Err(LogError::BadMagic);
    }
    bytes = &bytes[8..];
    let version = u32::deserialize(&mut bytes).map_err(LogError::BadHeader)?;
    if version != FORMAT_VERSION {
        return Err(LogError::VersionMismatch { found: version, expected: FORMAT_VERSION });
    }
    InitParams::deserialize(&mut bytes).map_err(LogError::BadHeader)
}

pub struct Footer {
    pub index_offset: u64,
    pub index_len: u64,
}

pub fn write_footer<W: io::Write>(stream: &mut W, footer: &Footer) -> io::Result<()> {
    footer.index_offset.serialize(stream)?;
    footer.index_len.serialize(stream)?;
    FORMAT_VERSION.serialize(stream)?;
    stream.write_all(&FOOTER_MAGIC)
}

pub fn read_footer(mut bytes: &[u8]) -> Result<Footer, LogError> {
    if bytes.len() != FOOTER_LEN as usize || bytes[20..] != FOOTER_MAGIC {
        return Err(LogError::BadMagic);
    }
    let index_offset = u64::deserialize(&mut bytes).map_err(LogError::BadHeader)?;
    let index_len = u64::deserialize(&mut bytes).map_err(LogError::BadHeader)?;
    let version = u32::deserialize(&mut bytes).map_err(LogError::BadHeader)?;
    if version != FORMAT_VERSION {
        return Err(LogError::VersionMismatch { found: version, expected: FORMAT_VERSION });
    }
    Ok(Footer { index_offset, index_len })
}

/// The fixed-size header in front of every chunk's payload.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ChunkHeader {
    pub tag: u16,
    pub flags: u16,
    pub len: u64,
}

impl ChunkHeader {
    pub fn write<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        self.tag.serialize(stream)?;
        self.flags.serialize(stream)?;
        self.len.serialize(stream)
    }

    pub fn read(mut bytes: &[u8]) -> Result<ChunkHeader, DeserializeError> {
        Ok(ChunkHeader {
            tag: u16::deserialize(&mut bytes)?,
            flags: u16::deserialize(&mut bytes)?,
            len: u64::deserialize(&mut bytes)?,
        })
    }
}

#[test]
fn test_header() {
    let init = InitParams { width: 640, height: 480, color_bits: 32, depth_bits: 24, stencil_bits: 8 };
    let mut buf = vec![];
    write_header(&mut buf, &init).unwrap();
    assert_eq!(buf.len() as u64, HEADER_LEN);
    assert_eq!(read_header(&buf).unwrap(), init);

    // A log from some other format version is refused outright.
    buf[8] = 7;
    match read_header(&buf) {
        Err(LogError::VersionMismatch { found: 7, expected: FORMAT_VERSION }) => (),
        other => panic!("unexpected result: {:?}", other),
    }

    buf[0] = b'X';
    assert!(matches!(read_header(&buf), Err(LogError::BadMagic)));
}

#[test]
fn test_footer() {
    let mut buf = vec![];
    write_footer(&mut buf, &Footer { index_offset: 100, index_len: 20 }).unwrap();
    assert_eq!(buf.len() as u64, FOOTER_LEN);
    let footer = read_footer(&buf).unwrap();
    assert_eq!((footer.index_offset, footer.index_len), (100, 20));

    assert!(read_footer(&buf[1..]).is_err());
}

#[test]
fn test_event_offset() {
    let entry = FrameIndexEntry {
        events: vec![(1, 40), (2, 90), (5, 200)],
        ..Default::default()
    };
    assert_eq!(entry.event_offset(2), Some(90));
    assert_eq!(entry.event_offset(3), None);
    assert_eq!(entry.last_event(), 5);
}
