//! Reading capture logs.
//!
//! `LogReader::open` checks the header and footer and loads the frame index,
//! validating every offset in it against the chunk stream's bounds before
//! anything is trusted. After that, chunks are read sequentially from any
//! offset the index names.

use crate::error::LogError;
use crate::format::{
    self, ChunkHeader, ChunkType, FrameIndexEntry, InitParams, CHUNK_HEADER_LEN, CHUNK_PARTIAL,
    FOOTER_LEN, HEADER_LEN,
};
use crate::serialize::{Deserialize, DeserializeError};

use std::io::{self, Read, Seek, SeekFrom};

/// One chunk, with its payload still serialized.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub offset: u64,
    pub ty: ChunkType,
    pub flags: u16,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn is_partial(&self) -> bool {
        self.flags & CHUNK_PARTIAL != 0
    }

    /// Deserialize the payload, which must be consumed exactly.
    pub fn decode<'b, T: Deserialize<'b>>(&'b self) -> Result<T, LogError> {
        let bad = |source| LogError::BadPayload { offset: self.offset, ty: self.ty, source };
        let mut buf = &self.payload[..];
        let value = T::deserialize(&mut buf).map_err(bad)?;
        if !buf.is_empty() {
            return Err(bad(DeserializeError::BadValue {
                what: "trailing payload length",
                value: buf.len() as u64,
            }));
        }
        Ok(value)
    }
}

pub struct LogReader<R> {
    reader: R,
    init: InitParams,
    frames: Vec<FrameIndexEntry>,
    /// The offset of the frame index, which is where the chunk stream ends.
    chunks_end: u64,
    cursor: u64,
}

impl<R: Read + Seek> LogReader<R> {
    pub fn open(mut reader: R) -> Result<LogReader<R>, LogError> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        if file_len < HEADER_LEN + FOOTER_LEN {
            return Err(LogError::BadMagic);
        }

        reader.seek(SeekFrom::Start(0))?;
        let mut header = [0_u8; HEADER_LEN as usize];
        reader.read_exact(&mut header)?;
        let init = format::read_header(&header)?;

        reader.seek(SeekFrom::Start(file_len - FOOTER_LEN))?;
        let mut footer = [0_u8; FOOTER_LEN as usize];
        reader.read_exact(&mut footer)?;
        let footer = format::read_footer(&footer)?;

        let index_end = footer
            .index_offset
            .checked_add(footer.index_len)
            .ok_or_else(|| LogError::BadIndex("index length overflows".to_owned()))?;
        if footer.index_offset < HEADER_LEN || index_end != file_len - FOOTER_LEN {
            return Err(LogError::BadIndex(format!(
                "index at {}+{} does not end at the footer",
                footer.index_offset, footer.index_len
            )));
        }

        reader.seek(SeekFrom::Start(footer.index_offset))?;
        let mut index = vec![0_u8; footer.index_len as usize];
        reader.read_exact(&mut index)?;
        let mut buf = &index[..];
        let frames = Vec::<FrameIndexEntry>::deserialize(&mut buf)
            .map_err(|err| LogError::BadIndex(err.to_string()))?;

        // The index is untrusted: everything it points at must lie in the
        // chunk stream.
        let chunks_end = footer.index_offset;
        let in_stream = |offset: u64| (HEADER_LEN..chunks_end).contains(&offset);
        for frame in &frames {
            let offsets = [frame.begin_offset, frame.scope_offset]
                .into_iter()
                .chain(frame.initial_states.iter().copied())
                .chain(frame.events.iter().map(|&(_, offset)| offset));
            for offset in offsets {
                if !in_stream(offset) {
                    return Err(LogError::BadIndex(format!(
                        "frame {} refers to offset {}, outside the chunk stream",
                        frame.frame_number, offset
                    )));
                }
            }
            if frame.events.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
                return Err(LogError::BadIndex(format!(
                    "frame {} lists its events out of order",
                    frame.frame_number
                )));
            }
        }

        tracing::debug!(frames = frames.len(), chunks_end, "opened capture log");
        Ok(LogReader {
            reader,
            init,
            frames,
            chunks_end,
            cursor: HEADER_LEN,
        })
    }

    pub fn init_params(&self) -> &InitParams {
        &self.init
    }

    pub fn frames(&self) -> &[FrameIndexEntry] {
        &self.frames
    }

    pub fn frame(&self, frame_number: u64) -> Option<&FrameIndexEntry> {
        self.frames.iter().find(|frame| frame.frame_number == frame_number)
    }

    /// The offset of the chunk `read_chunk` will return next.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub fn seek_to_offset(&mut self, offset: u64) -> Result<(), LogError> {
        if !(HEADER_LEN..=self.chunks_end).contains(&offset) {
            return Err(LogError::OffsetOutOfRange { offset });
        }
        self.reader.seek(SeekFrom::Start(offset))?;
        self.cursor = offset;
        Ok(())
    }

    /// Read the chunk at the current position, or return `None` at the end
    /// of the chunk stream.
    pub fn read_chunk(&mut self) -> Result<Option<Chunk>, LogError> {
        let offset = self.cursor;
        if offset >= self.chunks_end {
            return Ok(None);
        }
        let truncated = LogError::TruncatedChunk { offset };
        if self.chunks_end - offset < CHUNK_HEADER_LEN {
            return Err(truncated);
        }

        let mut header = [0_u8; CHUNK_HEADER_LEN as usize];
        self.reader.read_exact(&mut header)?;
        let header = ChunkHeader::read(&header).map_err(|_| LogError::TruncatedChunk { offset })?;
        let ty = ChunkType::from_tag(header.tag)
            .ok_or(LogError::UnknownChunkType { offset, tag: header.tag })?;

        let payload_start = offset + CHUNK_HEADER_LEN;
        if header.len > self.chunks_end - payload_start {
            return Err(truncated);
        }
        let mut payload = vec![0_u8; header.len as usize];
        self.reader.read_exact(&mut payload)?;
        self.cursor = payload_start + header.len;

        Ok(Some(Chunk { offset, ty, flags: header.flags, payload }))
    }

    /// Read every chunk from `start` up to the end of the chunk stream.
    pub fn chunks_from(&mut self, start: u64) -> Result<Vec<Chunk>, LogError> {
        self.seek_to_offset(start)?;
        let mut chunks = Vec::new();
        while let Some(chunk) = self.read_chunk()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

impl LogReader<io::Cursor<Vec<u8>>> {
    /// Open a log held in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, LogError> {
        LogReader::open(io::Cursor::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{CaptureScope, FrameBegin};
    use crate::writer::LogWriter;

    fn sample_log() -> Vec<u8> {
        let mut writer = LogWriter::new(vec![], &InitParams { width: 8, ..Default::default() }).unwrap();
        writer.begin_frame(&FrameBegin { frame_number: 2, ..Default::default() }).unwrap();
        writer.write_chunk(ChunkType::DebugMessages, &5_u32, true).unwrap();
        writer.end_frame(&CaptureScope { frame_number: 2, ..Default::default() }).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_open_and_read() {
        let mut reader = LogReader::from_bytes(sample_log()).unwrap();
        assert_eq!(reader.init_params().width, 8);
        assert_eq!(reader.frames().len(), 1);
        let begin = reader.frame(2).unwrap().begin_offset;
        assert_eq!(begin, HEADER_LEN);
        assert!(reader.frame(3).is_none());

        let chunks = reader.chunks_from(begin).unwrap();
        let types: Vec<_> = chunks.iter().map(|chunk| chunk.ty).collect();
        assert_eq!(types, [ChunkType::BeginCaptureFrame, ChunkType::DebugMessages, ChunkType::CaptureScope]);
        assert!(chunks[1].is_partial());
        assert_eq!(chunks[1].decode::<u32>().unwrap(), 5);
        assert_eq!(chunks[2].decode::<CaptureScope>().unwrap().frame_number, 2);

        // A payload decoded as the wrong type is caught, not misread.
        assert!(matches!(
            chunks[1].decode::<u16>(),
            Err(LogError::BadPayload { ty: ChunkType::DebugMessages, .. })
        ));
    }

    #[test]
    fn test_rejects_corruption() {
        let log = sample_log();

        assert!(matches!(LogReader::from_bytes(log[..20].to_vec()), Err(LogError::BadMagic)));

        let mut bad_footer = log.clone();
        let len = bad_footer.len();
        bad_footer[len - 1] ^= 0xff;
        assert!(matches!(LogReader::from_bytes(bad_footer), Err(LogError::BadMagic)));

        // Point the index past its own start.
        let mut bad_index = log.clone();
        let footer_start = len - FOOTER_LEN as usize;
        bad_index[footer_start..footer_start + 8].copy_from_slice(&(len as u64).to_le_bytes());
        assert!(matches!(LogReader::from_bytes(bad_index), Err(LogError::BadIndex(_))));

        // An unknown chunk type is reported with its offset.
        let mut bad_chunk = log;
        bad_chunk[HEADER_LEN as usize] = 0x77;
        let mut reader = LogReader::from_bytes(bad_chunk).unwrap();
        match reader.read_chunk() {
            Err(LogError::UnknownChunkType { offset, tag: 0x77 }) => assert_eq!(offset, HEADER_LEN),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_seek_bounds() {
        let mut reader = LogReader::from_bytes(sample_log()).unwrap();
        assert!(matches!(reader.seek_to_offset(3), Err(LogError::OffsetOutOfRange { offset: 3 })));
        assert!(reader.seek_to_offset(1 << 40).is_err());
    }
}
