//! Error types for loading and replaying capture logs.
//!
//! Problems while capturing are never reported through these: a capture that
//! goes wrong is logged, flagged and, at worst, discarded. Everything here is
//! fatal to the load or replay that produced it.

use crate::driver::DriverError;
use crate::format::ChunkType;
use crate::resource::{NativeHandle, ResourceId, ResourceKind};
use crate::serialize::DeserializeError;

use std::io;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("native handle {handle} is live as a {existing:?}; cannot track it as a {requested:?}")]
    IncompatibleKind {
        handle: NativeHandle,
        existing: ResourceKind,
        requested: ResourceKind,
    },
    #[error("no live resource {0}")]
    NotFound(ResourceId),
    #[error("resource {id} is a {actual:?}, not a {expected:?}")]
    WrongKind {
        id: ResourceId,
        expected: ResourceKind,
        actual: ResourceKind,
    },
    #[error("resource {0} is already attached to a native handle")]
    AlreadyAttached(ResourceId),
    #[error("no live {kind:?} has native handle {handle}")]
    UnknownHandle { kind: ResourceKind, handle: NativeHandle },
    #[error("the null handle cannot name a {kind:?}")]
    NullHandle { kind: ResourceKind },
}

/// Structural problems with a log file.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("I/O error on capture log: {0}")]
    Io(#[from] io::Error),
    #[error("not a capture log (bad magic number)")]
    BadMagic,
    #[error("capture log format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("capture log header is corrupt: {0}")]
    BadHeader(#[source] DeserializeError),
    #[error("capture log index is corrupt: {0}")]
    BadIndex(String),
    #[error("truncated or corrupt chunk header at offset {offset}")]
    TruncatedChunk { offset: u64 },
    #[error("unknown chunk type {tag} at offset {offset}")]
    UnknownChunkType { offset: u64, tag: u16 },
    #[error("offset {offset} is outside the chunk stream")]
    OffsetOutOfRange { offset: u64 },
    #[error("malformed {ty} chunk at offset {offset}: {source}")]
    BadPayload {
        offset: u64,
        ty: ChunkType,
        #[source]
        source: DeserializeError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("frame {0} is not in the capture log")]
    UnknownFrame(u64),
    #[error("event range {start}..={end} is empty")]
    InvalidRange { start: u64, end: u64 },
    #[error("{ty} chunk at offset {offset}: {source}")]
    Resource {
        offset: u64,
        ty: ChunkType,
        #[source]
        source: ResourceError,
    },
    #[error("{ty} chunk at offset {offset}: {source}")]
    Driver {
        offset: u64,
        ty: ChunkType,
        #[source]
        source: DriverError,
    },
    #[error("unexpected {ty} chunk at offset {offset}")]
    UnexpectedChunk { offset: u64, ty: ChunkType },
    #[error("{ty} chunk at offset {offset} was only partially recorded")]
    PartialChunk { offset: u64, ty: ChunkType },
}
