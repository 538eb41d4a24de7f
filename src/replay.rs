//! Replaying captured frames.
//!
//! A `Replayer` owns a driver and a loaded log. Loading reads only the
//! header, the frame index and each frame's capture-scope chunk; call
//! payloads are read as they are replayed.
//!
//! Driver state is never checkpointed, so the first replay of a frame, and
//! any replay that needs to go backwards, starts over: the driver is reset,
//! the frame's initial-state chunks are expanded into calls and issued, and
//! then the frame's calls are issued in order. A replay that picks up where
//! the last one stopped just carries on.
//!
//! Every id in the log is resolved through the replay-side
//! `ResourceManager`. An id that cannot be resolved means the log is
//! malformed, and stops the replay with the chunk's offset and type.

use crate::call::{ApiCall, Call, EventId, MarkerOp};
use crate::config::ReplayOptions;
use crate::debug_messages::{DebugMessageBatch, DebugSink};
use crate::drawcall::{DrawcallInfo, DrawcallTree, EventNode, TreeBuilder};
use crate::driver::{Driver, DriverError};
use crate::error::{LogError, ReplayError, ResourceError};
use crate::format::{CaptureScope, ChunkType, FrameIndexEntry, InitParams};
use crate::reader::{Chunk, LogReader};
use crate::resource::{NativeHandle, ResourceAttributes, ResourceId, ResourceKind, ResourceManager};
use crate::snapshot::{ResourceSnapshot, RestoreMode};

use std::io::{Read, Seek};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplayMode {
    /// Replay the frame from its start, every event visible.
    Full,
    /// Walk the frame and rebuild its event tree without issuing anything
    /// to the driver. The live replay position is left alone.
    ReadOnly,
    /// Execute up to `start` without reporting it, then visibly up to `end`,
    /// continuing from the current position when possible.
    FrameRange,
}

/// One captured frame, as the log describes it.
#[derive(Clone, Debug)]
pub struct FrameRecord {
    pub index: FrameIndexEntry,
    pub scope: CaptureScope,
    /// The frame's event tree, once it has been replayed.
    pub tree: Option<DrawcallTree>,
}

/// What a call to `Replayer::replay` did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplaySummary {
    pub frame_number: u64,
    /// Events executed visibly, in order.
    pub events: Vec<EventId>,
    /// The last event executed.
    pub last_event: EventId,
    /// True if the frame was replayed from its start.
    pub restarted: bool,
    pub cancelled: bool,
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Position {
    /// Index into `Replayer::frames`.
    frame: usize,
    /// The last event executed; zero before the first.
    event: EventId,
    /// Where the next chunk to replay starts.
    next_offset: u64,
}

#[derive(Default)]
struct ReplayState {
    resources: ResourceManager,
    builder: TreeBuilder,
    /// `None` when the driver's state corresponds to no point in any frame.
    position: Option<Position>,
}

pub struct Replayer<D, R> {
    driver: D,
    log: LogReader<R>,
    options: ReplayOptions,
    frames: Vec<FrameRecord>,
    state: ReplayState,
    debug_sink: Option<Box<dyn DebugSink>>,
    cancel: Arc<AtomicBool>,
}

impl<D: Driver, R: Read + Seek> Replayer<D, R> {
    pub fn load(source: R, driver: D, options: ReplayOptions) -> Result<Replayer<D, R>, ReplayError> {
        let mut log = LogReader::open(source)?;

        let mut frames = Vec::new();
        for index in log.frames().to_vec() {
            let offset = index.scope_offset;
            log.seek_to_offset(offset)?;
            let chunk = log.read_chunk()?.ok_or(LogError::TruncatedChunk { offset })?;
            if chunk.ty != ChunkType::CaptureScope {
                return Err(ReplayError::UnexpectedChunk { offset, ty: chunk.ty });
            }
            let scope = chunk.decode()?;
            frames.push(FrameRecord { index, scope, tree: None });
        }

        tracing::info!(frames = frames.len(), "loaded capture log");
        Ok(Replayer {
            driver,
            log,
            options,
            frames,
            state: ReplayState::default(),
            debug_sink: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn init_params(&self) -> &InitParams {
        self.log.init_params()
    }

    pub fn frame_records(&self) -> &[FrameRecord] {
        &self.frames
    }

    pub fn frame_record(&self, frame_number: u64) -> Option<&FrameRecord> {
        self.frames.iter().find(|frame| frame.index.frame_number == frame_number)
    }

    /// Look up an event in a frame that has been replayed.
    pub fn event(&self, frame_number: u64, event_id: EventId) -> Option<&EventNode> {
        self.frame_record(frame_number)?.tree.as_ref()?.find(event_id)
    }

    pub fn set_debug_sink<S: DebugSink + 'static>(&mut self, sink: S) {
        self.debug_sink = Some(Box::new(sink));
    }

    /// A flag that, once set, stops the replay in progress at the next event
    /// boundary. It is cleared at the start of every replay.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.state.resources
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    fn frame_position(&self, frame_number: u64) -> Result<usize, ReplayError> {
        self.frames
            .iter()
            .position(|frame| frame.index.frame_number == frame_number)
            .ok_or(ReplayError::UnknownFrame(frame_number))
    }

    /// Replay events `start` through `end` of a frame. An `end` past the
    /// frame's last event means the last event.
    pub fn replay(
        &mut self,
        frame_number: u64,
        start: EventId,
        end: EventId,
        mode: ReplayMode,
    ) -> Result<ReplaySummary, ReplayError> {
        let frame = self.frame_position(frame_number)?;
        let end = end.min(self.frames[frame].index.last_event());
        if start > end {
            return Err(ReplayError::InvalidRange { start, end });
        }
        self.cancel.store(false, Ordering::SeqCst);

        let mut inert = InertDriver::default();
        let mut scratch = ReplayState::default();
        let (driver, state): (&mut dyn Driver, &mut ReplayState) = match mode {
            ReplayMode::ReadOnly => (&mut inert, &mut scratch),
            ReplayMode::Full | ReplayMode::FrameRange => (&mut self.driver, &mut self.state),
        };
        let resume = match (mode, state.position) {
            (ReplayMode::FrameRange, Some(pos)) => pos.frame == frame && pos.event <= start,
            _ => false,
        };
        let visible_from = if mode == ReplayMode::Full { 0 } else { start };
        // Chunks after the last event still belong to the frame.
        let until = if end < self.frames[frame].index.last_event() { Some(end) } else { None };

        let mut pass = Pass {
            log: &mut self.log,
            options: &self.options,
            driver,
            state,
            sink: self.debug_sink.as_deref_mut(),
            cancel: &self.cancel,
        };
        let mut summary = ReplaySummary { frame_number, ..Default::default() };
        let index = &self.frames[frame].index;

        let result = (if resume {
            Ok(())
        } else {
            summary.restarted = true;
            pass.restart(frame, index)
        })
        .and_then(|()| pass.run(until, visible_from, &mut summary));
        if let Err(err) = result {
            pass.state.position = None;
            return Err(err);
        }

        tracing::debug!(
            frame_number,
            start,
            end,
            ?mode,
            restarted = summary.restarted,
            executed = summary.events.len(),
            "replayed"
        );
        if !summary.cancelled {
            let tree = pass.state.builder.clone().bake();
            self.frames[frame].tree = Some(tree);
        }
        Ok(summary)
    }

    /// Execute the single API call chunk at `offset` against the live
    /// replay state, and return it.
    ///
    /// If the chunk is the next one the current replay would have executed,
    /// the replay position moves past it; otherwise the position is
    /// discarded and the next ranged replay starts its frame over.
    pub fn replay_call(&mut self, offset: u64) -> Result<ApiCall, ReplayError> {
        let mut pass = Pass {
            log: &mut self.log,
            options: &self.options,
            driver: &mut self.driver,
            state: &mut self.state,
            sink: self.debug_sink.as_deref_mut(),
            cancel: &self.cancel,
        };

        let chunk = pass.read_at(offset)?;
        if chunk.ty != ChunkType::ApiCall {
            return Err(ReplayError::UnexpectedChunk { offset, ty: chunk.ty });
        }
        let api: ApiCall = chunk.decode()?;
        let next_offset = pass.log.position();
        let stepping = matches!(pass.state.position, Some(pos) if pos.next_offset == offset);

        let mut summary = ReplaySummary::default();
        if let Err(err) = pass.execute(offset, api.clone(), 0, &mut summary) {
            pass.state.position = None;
            return Err(err);
        }
        match &mut pass.state.position {
            Some(pos) if stepping => pos.next_offset = next_offset,
            position => *position = None,
        }
        Ok(api)
    }
}

/// One replay's worth of borrowed state.
struct Pass<'p, R, Dr: ?Sized> {
    log: &'p mut LogReader<R>,
    options: &'p ReplayOptions,
    driver: &'p mut Dr,
    state: &'p mut ReplayState,
    sink: Option<&'p mut (dyn DebugSink + 'static)>,
    cancel: &'p AtomicBool,
}

impl<R: Read + Seek, Dr: Driver + ?Sized> Pass<'_, R, Dr> {
    fn read_at(&mut self, offset: u64) -> Result<Chunk, ReplayError> {
        self.log.seek_to_offset(offset)?;
        let chunk = self.log.read_chunk()?.ok_or(LogError::TruncatedChunk { offset })?;
        self.check_partial(&chunk)?;
        Ok(chunk)
    }

    fn check_partial(&self, chunk: &Chunk) -> Result<(), ReplayError> {
        if chunk.is_partial() {
            if self.options.verify_partial_chunks {
                return Err(ReplayError::PartialChunk { offset: chunk.offset, ty: chunk.ty });
            }
            tracing::warn!(offset = chunk.offset, ty = %chunk.ty, "replaying partially recorded chunk");
        }
        Ok(())
    }

    /// Reset the driver and rebuild the frame's initial state.
    fn restart(&mut self, frame: usize, index: &FrameIndexEntry) -> Result<(), ReplayError> {
        tracing::debug!(frame_number = index.frame_number, "replaying frame from its start");
        self.state.position = None;
        self.driver.reset().map_err(|source| ReplayError::Driver {
            offset: index.begin_offset,
            ty: ChunkType::BeginCaptureFrame,
            source,
        })?;
        self.state.resources.clear();
        self.state.builder = TreeBuilder::new();

        for &offset in &index.initial_states {
            let chunk = self.read_at(offset)?;
            if chunk.ty != ChunkType::InitialState {
                return Err(ReplayError::UnexpectedChunk { offset, ty: chunk.ty });
            }
            let snapshot: ResourceSnapshot = chunk.decode()?;
            for (call, created) in snapshot.restore_calls(RestoreMode::Create) {
                self.issue(offset, ChunkType::InitialState, call, created)?;
            }
            self.state.resources.set_attributes(snapshot.id, snapshot.attributes);
        }

        self.state.position = Some(Position { frame, event: 0, next_offset: index.begin_offset });
        Ok(())
    }

    /// Replay chunks from the current position until event `until` has
    /// been executed, or to the end of the frame if `until` is `None`.
    fn run(
        &mut self,
        until: Option<EventId>,
        visible_from: EventId,
        summary: &mut ReplaySummary,
    ) -> Result<(), ReplayError> {
        let until = until.unwrap_or(EventId::MAX);
        loop {
            let pos = match self.state.position {
                Some(pos) => pos,
                None => return Ok(()),
            };
            self.log.seek_to_offset(pos.next_offset)?;
            let chunk = match self.log.read_chunk()? {
                Some(chunk) => chunk,
                None => return Ok(()),
            };
            let offset = chunk.offset;
            match chunk.ty {
                ChunkType::CaptureScope => return Ok(()),
                ChunkType::InitialState => return Err(ReplayError::UnexpectedChunk { offset, ty: chunk.ty }),
                ChunkType::ApiCall | ChunkType::StateRefresh if pos.event >= until => return Ok(()),
                _ => {}
            }
            self.check_partial(&chunk)?;
            let next_offset = self.log.position();
            if let Some(pos) = &mut self.state.position {
                pos.next_offset = next_offset;
            }

            match chunk.ty {
                ChunkType::ApiCall => {
                    let api: ApiCall = chunk.decode()?;
                    if api.event_id != 0 && self.cancel.load(Ordering::SeqCst) {
                        tracing::info!(event_id = api.event_id, "replay cancelled");
                        self.state.position = None;
                        summary.cancelled = true;
                        return Ok(());
                    }
                    self.execute(offset, api, visible_from, summary)?;
                }
                ChunkType::DebugMessages => {
                    let batch: DebugMessageBatch = chunk.decode()?;
                    self.state.builder.on_debug_messages(batch.event_id, &batch.messages);
                    if summary.events.last() == Some(&batch.event_id) {
                        if let Some(sink) = &mut self.sink {
                            sink.on_debug_messages(batch.event_id, &batch.messages);
                        }
                    }
                }
                ChunkType::StateRefresh => {
                    let snapshot: ResourceSnapshot = chunk.decode()?;
                    self.refresh(offset, snapshot)?;
                }
                ChunkType::BeginCaptureFrame | ChunkType::CaptureScope | ChunkType::InitialState => {}
            }
        }
    }

    fn execute(
        &mut self,
        offset: u64,
        api: ApiCall,
        visible_from: EventId,
        summary: &mut ReplaySummary,
    ) -> Result<(), ReplayError> {
        let ApiCall { event_id, context, created, call } = api;
        let duration = self.issue(offset, ChunkType::ApiCall, call.clone(), created)?;
        if event_id == 0 {
            return Ok(());
        }

        let builder = &mut self.state.builder;
        builder.on_event(event_id, call.to_string(), context, offset);
        match call.marker() {
            Some(MarkerOp::Push(label)) => builder.on_push_marker(label),
            Some(MarkerOp::Pop) => builder.on_pop_marker(),
            Some(MarkerOp::Set(label)) => builder.on_set_marker(label),
            None => {}
        }
        if let Some(mut info) = DrawcallInfo::from_call(&call) {
            info.duration = duration;
            builder.on_drawcall(info);
        }

        if let Some(pos) = &mut self.state.position {
            pos.event = event_id;
        }
        summary.last_event = event_id;
        if event_id >= visible_from {
            summary.events.push(event_id);
        }
        Ok(())
    }

    /// Bring a high-traffic resource's state up to date from a snapshot.
    fn refresh(&mut self, offset: u64, snapshot: ResourceSnapshot) -> Result<(), ReplayError> {
        let previous: ResourceAttributes = match self.state.resources.record(snapshot.id) {
            Some(record) if record.alive => record.attributes.clone(),
            _ => {
                return Err(ReplayError::Resource {
                    offset,
                    ty: ChunkType::StateRefresh,
                    source: ResourceError::NotFound(snapshot.id),
                })
            }
        };
        for (call, created) in snapshot.restore_calls(RestoreMode::Refresh(&previous)) {
            self.issue(offset, ChunkType::StateRefresh, call, created)?;
        }
        self.state.resources.set_attributes(snapshot.id, snapshot.attributes);
        Ok(())
    }

    /// Resolve `call`'s ids, execute it, and fold its effects into the
    /// resource table. Return how long the driver took.
    fn issue(
        &mut self,
        offset: u64,
        ty: ChunkType,
        call: Call<ResourceId>,
        created: ResourceId,
    ) -> Result<Duration, ReplayError> {
        let resource_error = |source: ResourceError| ReplayError::Resource { offset, ty, source };
        let resources = &self.state.resources;
        let native = call
            .clone()
            .map_resources(|kind, id| resources.resolve_as(id, kind))
            .map_err(resource_error)?;

        let started = Instant::now();
        let handle = self
            .driver
            .execute(&native)
            .map_err(|source| ReplayError::Driver { offset, ty, source })?;
        let duration = started.elapsed();

        if let Call::CreateResource { kind, .. } = call {
            match handle {
                Some(handle) if !created.is_null() => {
                    self.state.resources.attach(created, handle, kind).map_err(resource_error)?
                }
                _ => tracing::warn!(offset, ?kind, "created object has no recorded id"),
            }
        }
        self.state.resources.apply(&call, created);
        if let Call::DeleteResource { resource, .. } = call {
            if !resource.is_null() {
                self.state.resources.release(resource).map_err(resource_error)?;
            }
        }
        Ok(duration)
    }
}

/// Stands in for the driver during read-only replays. Every object it
/// creates gets a fresh handle; nothing else does anything.
#[derive(Default)]
struct InertDriver {
    last_handle: NativeHandle,
}

impl Driver for InertDriver {
    fn execute(&mut self, call: &Call<NativeHandle>) -> Result<Option<NativeHandle>, DriverError> {
        Ok(match call {
            Call::CreateResource { .. } => {
                self.last_handle += 1;
                Some(self.last_handle)
            }
            _ => None,
        })
    }

    fn read_contents(
        &mut self,
        _kind: ResourceKind,
        _handle: NativeHandle,
        _attributes: &ResourceAttributes,
    ) -> Result<Vec<u8>, DriverError> {
        Ok(Vec::new())
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        self.last_handle = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::ContextId;
    use crate::capture::{FrameOutcome, Recorder};
    use crate::config::CaptureOptions;
    use crate::debug_messages::DebugMessage;
    use crate::memory_driver::MemoryDriver;

    use std::io::Cursor;

    /// Capture one frame of `calls` on a fresh recorder.
    fn capture(calls: Vec<Call<NativeHandle>>) -> Vec<u8> {
        let options = CaptureOptions { min_drawcalls: 0, ..Default::default() };
        let mut recorder = Recorder::new(MemoryDriver::new(1), InitParams::default(), options);
        let ctx = ContextId(1);
        recorder.trigger_capture();
        recorder.on_frame_boundary(ctx);
        for call in calls {
            recorder.record_call(ctx, call).unwrap();
        }
        match recorder.on_frame_boundary(ctx) {
            FrameOutcome::Captured(captured) => captured.log,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    fn three_draws() -> Vec<Call<NativeHandle>> {
        (0..3).map(|i| Call::DrawArrays { mode: 4, first: i, count: 3, instances: 1 }).collect()
    }

    fn load(log: Vec<u8>) -> Replayer<MemoryDriver, Cursor<Vec<u8>>> {
        Replayer::load(Cursor::new(log), MemoryDriver::new(50), ReplayOptions::default()).unwrap()
    }

    #[test]
    fn test_ranges_resume_and_restart() {
        let mut replayer = load(capture(three_draws()));
        assert!(matches!(replayer.replay(9, 0, 1, ReplayMode::Full), Err(ReplayError::UnknownFrame(9))));
        assert!(matches!(
            replayer.replay(1, 3, 2, ReplayMode::FrameRange),
            Err(ReplayError::InvalidRange { start: 3, end: 2 })
        ));

        let first = replayer.replay(1, 0, 1, ReplayMode::FrameRange).unwrap();
        assert!(first.restarted);
        assert_eq!(first.events, [1]);

        let rest = replayer.replay(1, 1, 99, ReplayMode::FrameRange).unwrap();
        assert!(!rest.restarted);
        assert_eq!(rest.events, [2, 3]);
        assert_eq!(replayer.driver().state.draws.len(), 3);

        // Going backwards starts over, executing the skipped events unseen.
        let again = replayer.replay(1, 2, 2, ReplayMode::FrameRange).unwrap();
        assert!(again.restarted);
        assert_eq!(again.events, [2]);
        assert_eq!(again.last_event, 2);
        assert_eq!(replayer.driver().state.draws.len(), 2);
    }

    #[test]
    fn test_read_only_leaves_driver_alone() {
        let mut replayer = load(capture(three_draws()));
        let summary = replayer.replay(1, 0, 3, ReplayMode::ReadOnly).unwrap();
        assert_eq!(summary.events, [1, 2, 3]);
        assert!(replayer.driver().executed.is_empty());
        let tree = replayer.frame_record(1).unwrap().tree.as_ref().unwrap();
        assert_eq!(tree.drawcalls().count(), 3);
        assert!(replayer.event(1, 2).is_some());
    }

    #[test]
    fn test_cancel_discards_position() {
        let options = CaptureOptions { min_drawcalls: 0, ..Default::default() };
        let mut recorder = Recorder::new(MemoryDriver::new(1), InitParams::default(), options);
        let ctx = ContextId(1);
        recorder.trigger_capture();
        recorder.on_frame_boundary(ctx);
        for (i, call) in three_draws().into_iter().enumerate() {
            recorder.record_call(ctx, call).unwrap();
            if i == 0 {
                recorder.on_debug_message(DebugMessage { message: "stall".to_owned(), ..Default::default() });
            }
        }
        let log = match recorder.on_frame_boundary(ctx) {
            FrameOutcome::Captured(captured) => captured.log,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let mut replayer = load(log);
        let cancel = replayer.cancel_handle();
        // Setting the flag before a replay has no effect; it is cleared.
        cancel.store(true, Ordering::SeqCst);
        let full = replayer.replay(1, 0, 3, ReplayMode::Full).unwrap();
        assert!(!full.cancelled);

        let flag = cancel.clone();
        replayer.set_debug_sink(move |event: EventId, messages: &[DebugMessage]| {
            assert_eq!((event, messages.len()), (1, 1));
            flag.store(true, Ordering::SeqCst);
        });
        let summary = replayer.replay(1, 0, 3, ReplayMode::Full).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.events, [1]);
        assert_eq!(replayer.driver().state.draws.len(), 1);
        // The tree from the complete replay is kept.
        assert_eq!(replayer.frame_record(1).unwrap().tree.as_ref().unwrap().len(), 3);

        // With no position to resume from, the next range starts over.
        let resumed = replayer.replay(1, 1, 1, ReplayMode::FrameRange).unwrap();
        assert!(resumed.restarted);
    }

    #[test]
    fn test_replay_call_steps() {
        let log = capture(three_draws());
        let mut replayer = load(log);
        replayer.replay(1, 0, 1, ReplayMode::FrameRange).unwrap();
        let second = replayer.frames[0].index.event_offset(2).unwrap();
        let api = replayer.replay_call(second).unwrap();
        assert_eq!(api.event_id, 2);

        // The position moved past event 2, so this resumes.
        let summary = replayer.replay(1, 2, 3, ReplayMode::FrameRange).unwrap();
        assert!(!summary.restarted);
        assert_eq!(summary.events, [3]);
    }
}
