//! Writing capture logs.
//!
//! `LogWriter` appends chunks to any `io::Write` stream. During capture the
//! stream is a `Vec<u8>`, so nothing on the call path touches the disk; the
//! finished log is written out in one piece at the frame boundary.
//!
//! A chunk is written through a `ChunkScope`, which collects the payload and
//! emits the chunk, with its final length, when it is ended or dropped. A
//! scope dropped without `end` (say, by a `?` bailing out of a half-written
//! payload) still emits its chunk, flagged `CHUNK_PARTIAL`, so the stream
//! stays well-formed.

use crate::call::ApiCall;
use crate::debug_messages::DebugMessageBatch;
use crate::format::{
    self, CaptureScope, ChunkHeader, ChunkType, Footer, FrameBegin, FrameIndexEntry, InitParams,
    CHUNK_HEADER_LEN, CHUNK_PARTIAL, HEADER_LEN,
};
use crate::serialize::Serialize;
use crate::snapshot::ResourceSnapshot;

use std::{io, mem};

pub struct LogWriter<W: io::Write> {
    stream: W,
    offset: u64,
    size_limit: u64,
    frames: Vec<FrameIndexEntry>,
    current: Option<FrameIndexEntry>,
    partial_chunks: u32,
    /// The first error from a chunk emitted by a dropped scope, which had no
    /// way to report it.
    error: Option<io::Error>,
}

impl<W: io::Write> LogWriter<W> {
    pub fn new(mut stream: W, init: &InitParams) -> io::Result<LogWriter<W>> {
        format::write_header(&mut stream, init)?;
        Ok(LogWriter {
            stream,
            offset: HEADER_LEN,
            size_limit: 4 * 1024 * 1024 * 1024,
            frames: Vec::new(),
            current: None,
            partial_chunks: 0,
            error: None,
        })
    }

    /// Refuse to write chunks that would take the log past `limit` bytes.
    pub fn set_size_limit(&mut self, limit: u64) {
        self.size_limit = limit;
    }

    /// The offset at which the next chunk will start.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn partial_chunks(&self) -> u32 {
        self.partial_chunks
    }

    pub fn begin_chunk(&mut self, ty: ChunkType) -> ChunkScope<'_, W> {
        ChunkScope {
            offset: self.offset,
            writer: self,
            ty,
            payload: Vec::new(),
            partial: false,
            closed: false,
        }
    }

    /// Write a chunk whose payload is `payload`. Return the chunk's offset.
    pub fn write_chunk<T>(&mut self, ty: ChunkType, payload: &T, partial: bool) -> io::Result<u64>
    where
        T: Serialize + ?Sized,
    {
        let mut scope = self.begin_chunk(ty);
        if partial {
            scope.mark_partial();
        }
        payload.serialize(&mut scope)?;
        scope.end()
    }

    pub fn begin_frame(&mut self, begin: &FrameBegin) -> io::Result<u64> {
        if let Some(open) = &self.current {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame {} is still open", open.frame_number),
            ));
        }
        let offset = self.write_chunk(ChunkType::BeginCaptureFrame, begin, false)?;
        self.current = Some(FrameIndexEntry {
            frame_number: begin.frame_number,
            begin_offset: offset,
            ..Default::default()
        });
        Ok(offset)
    }

    /// Write an API call chunk, and index it if it is an event.
    pub fn write_call(&mut self, call: &ApiCall, partial: bool) -> io::Result<u64> {
        let offset = self.write_chunk(ChunkType::ApiCall, call, partial)?;
        if call.event_id != 0 {
            if let Some(frame) = &mut self.current {
                frame.events.push((call.event_id, offset));
            }
        }
        Ok(offset)
    }

    pub fn write_debug_messages(&mut self, batch: &DebugMessageBatch) -> io::Result<u64> {
        self.write_chunk(ChunkType::DebugMessages, batch, false)
    }

    pub fn write_state_refresh(&mut self, snapshot: &ResourceSnapshot, partial: bool) -> io::Result<u64> {
        self.write_chunk(ChunkType::StateRefresh, snapshot, partial)
    }

    /// Close the current frame with its capture-scope chunk.
    pub fn end_frame(&mut self, scope: &CaptureScope) -> io::Result<u64> {
        let mut frame = self.current.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no capture frame is open")
        })?;
        let offset = self.write_chunk(ChunkType::CaptureScope, scope, false)?;
        frame.scope_offset = offset;
        self.frames.push(frame);
        Ok(offset)
    }

    /// Write an initial-state chunk for the most recently closed frame.
    pub fn write_initial_state(&mut self, snapshot: &ResourceSnapshot, partial: bool) -> io::Result<u64> {
        if self.current.is_some() || self.frames.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "initial state belongs after a closed frame",
            ));
        }
        let offset = self.write_chunk(ChunkType::InitialState, snapshot, partial)?;
        if let Some(frame) = self.frames.last_mut() {
            frame.initial_states.push(offset);
        }
        Ok(offset)
    }

    /// Write the frame index and footer, and return the underlying stream.
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        if let Some(open) = &self.current {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame {} was never closed", open.frame_number),
            ));
        }

        let mut index = Vec::new();
        self.frames.serialize(&mut index)?;
        self.stream.write_all(&index)?;
        format::write_footer(&mut self.stream, &Footer {
            index_offset: self.offset,
            index_len: index.len() as u64,
        })?;
        self.stream.flush()?;
        Ok(self.stream)
    }

    fn emit(&mut self, ty: ChunkType, flags: u16, payload: &[u8]) -> io::Result<u64> {
        let offset = self.offset;
        let end = offset
            .checked_add(CHUNK_HEADER_LEN + payload.len() as u64)
            .filter(|&end| end <= self.size_limit)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "capture log size limit reached"))?;

        ChunkHeader { tag: ty as u16, flags, len: payload.len() as u64 }.write(&mut self.stream)?;
        self.stream.write_all(payload)?;
        self.offset = end;
        if flags & CHUNK_PARTIAL != 0 {
            self.partial_chunks += 1;
        }
        Ok(offset)
    }
}

/// A chunk being written. See the module documentation.
pub struct ChunkScope<'w, W: io::Write> {
    writer: &'w mut LogWriter<W>,
    ty: ChunkType,
    offset: u64,
    payload: Vec<u8>,
    partial: bool,
    closed: bool,
}

impl<W: io::Write> ChunkScope<'_, W> {
    /// Where this chunk will start in the log.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn mark_partial(&mut self) {
        self.partial = true;
    }

    /// Emit the chunk. Return its offset.
    pub fn end(mut self) -> io::Result<u64> {
        self.close()
    }

    fn close(&mut self) -> io::Result<u64> {
        self.closed = true;
        let flags = if self.partial { CHUNK_PARTIAL } else { 0 };
        let payload = mem::take(&mut self.payload);
        self.writer.emit(self.ty, flags, &payload)
    }
}

impl<W: io::Write> io::Write for ChunkScope<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.payload.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: io::Write> Drop for ChunkScope<'_, W> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        tracing::warn!(ty = %self.ty, offset = self.offset, "chunk abandoned mid-payload; closing it as partial");
        self.partial = true;
        if let Err(err) = self.close() {
            if self.writer.error.is_none() {
                self.writer.error = Some(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ChunkHeader;

    fn init() -> InitParams {
        InitParams { width: 4, height: 4, color_bits: 32, depth_bits: 0, stencil_bits: 0 }
    }

    /// Split a log's chunk stream into (offset, header, payload) triples.
    fn chunks(log: &[u8], end: usize) -> Vec<(u64, ChunkHeader, Vec<u8>)> {
        let mut out = vec![];
        let mut pos = HEADER_LEN as usize;
        while pos < end {
            let header = ChunkHeader::read(&log[pos..]).unwrap();
            let start = pos + CHUNK_HEADER_LEN as usize;
            let payload = log[start..start + header.len as usize].to_vec();
            out.push((pos as u64, header, payload));
            pos = start + header.len as usize;
        }
        out
    }

    #[test]
    fn test_scope_finalizes_length() {
        let mut writer = LogWriter::new(vec![], &init()).unwrap();
        let mut scope = writer.begin_chunk(ChunkType::DebugMessages);
        assert_eq!(scope.offset(), HEADER_LEN);
        io::Write::write_all(&mut scope, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(scope.end().unwrap(), HEADER_LEN);
        let end = writer.offset() as usize;
        assert_eq!(end as u64, HEADER_LEN + CHUNK_HEADER_LEN + 5);

        let log = writer.finish().unwrap();
        let found = chunks(&log, end);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, ChunkHeader { tag: ChunkType::DebugMessages as u16, flags: 0, len: 5 });
        assert_eq!(found[0].2, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_early_return_closes_chunk_as_partial() {
        fn half_written<W: io::Write>(writer: &mut LogWriter<W>, fail: bool) -> io::Result<u64> {
            let mut scope = writer.begin_chunk(ChunkType::ApiCall);
            io::Write::write_all(&mut scope, &[9, 9])?;
            if fail {
                return Err(io::Error::new(io::ErrorKind::Other, "mapped memory unreadable"));
            }
            scope.end()
        }

        let mut writer = LogWriter::new(vec![], &init()).unwrap();
        assert!(half_written(&mut writer, true).is_err());
        assert_eq!(writer.partial_chunks(), 1);
        writer.write_chunk(ChunkType::DebugMessages, &7_u32, false).unwrap();
        let end = writer.offset() as usize;

        let log = writer.finish().unwrap();
        let found = chunks(&log, end);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, ChunkHeader { tag: ChunkType::ApiCall as u16, flags: CHUNK_PARTIAL, len: 2 });
        assert_eq!(found[1].2, 7_u32.to_le_bytes());
    }

    #[test]
    fn test_size_limit() {
        let mut writer = LogWriter::new(vec![], &init()).unwrap();
        writer.set_size_limit(HEADER_LEN + CHUNK_HEADER_LEN + 8);
        assert!(writer.write_chunk(ChunkType::DebugMessages, &1_u64, false).is_ok());
        assert!(writer.write_chunk(ChunkType::DebugMessages, &1_u8, false).is_err());
    }

    #[test]
    fn test_frame_bookkeeping() {
        let mut writer = LogWriter::new(vec![], &init()).unwrap();
        assert!(writer.end_frame(&CaptureScope::default()).is_err());

        let begin = writer.begin_frame(&FrameBegin { frame_number: 3, ..Default::default() }).unwrap();
        assert!(writer.begin_frame(&FrameBegin::default()).is_err());
        assert!(writer.write_initial_state(&ResourceSnapshot::default(), false).is_err());
        writer.end_frame(&CaptureScope { frame_number: 3, ..Default::default() }).unwrap();
        writer.write_initial_state(&ResourceSnapshot::default(), false).unwrap();

        assert_eq!(writer.frames.len(), 1);
        assert_eq!(writer.frames[0].begin_offset, begin);
        assert_eq!(writer.frames[0].initial_states.len(), 1);
        assert!(writer.finish().is_ok());
    }
}
