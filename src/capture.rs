//! Capturing frames.
//!
//! A `Recorder` sits between the application and the real driver. Every
//! call the application makes goes through `Recorder::record_call`, which
//! forwards it to the driver, keeps the resource table up to date, and, while
//! a frame is being captured, appends it to the capture log.
//!
//! Capturing follows the `CaptureSession` lifecycle:
//!
//! - `Idle`: calls pass straight through.
//!
//! - `Armed`: a capture has been requested, and will start at the next frame
//!   boundary. Calls still pass straight through.
//!
//! - `Recording`: every call is logged. Resources the frame uses but did
//!   not create are snapshotted the first time they are referenced, before
//!   the call can change them.
//!
//! - `Finalizing`: at the following frame boundary the log is closed with
//!   the frame's capture-scope chunk and the snapshots, written out, and the
//!   session returns to `Idle`.
//!
//! Nothing on this path panics or fails the application's call because of a
//! capture problem. A call whose arguments cannot be fully recorded is
//! logged with its chunk flagged partial, and a frame whose log cannot be
//! written is discarded at the boundary.

use crate::call::{ApiCall, Call, ContextId, EventId};
use crate::config::CaptureOptions;
use crate::debug_messages::{DebugMessage, DebugMessageBatch};
use crate::driver::{Driver, DriverError};
use crate::format::{CaptureScope, FrameBegin, InitParams};
use crate::hot::{HotResourceTracker, MutationKind};
use crate::resource::{NativeHandle, ResourceId, ResourceManager};
use crate::snapshot::ResourceSnapshot;
use crate::writer::LogWriter;

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use std::{fs, mem};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
    Recording,
    Finalizing,
}

/// What a frame boundary should do to the capture in progress.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Finalize the frame that just ended.
    pub finish: bool,
    /// Start recording the frame that is beginning.
    pub begin: bool,
}

/// The capture state machine, and the bookkeeping that goes with it.
#[derive(Debug)]
pub struct CaptureSession {
    state: CaptureState,
    /// The number of the frame now running. Frame 0 precedes the first
    /// boundary.
    frame_number: u64,
    targets: BTreeSet<u64>,
    current_context: ContextId,
    touched: BTreeMap<ContextId, BTreeSet<ResourceId>>,
}

impl CaptureSession {
    pub fn new<I: IntoIterator<Item = u64>>(targets: I) -> CaptureSession {
        CaptureSession {
            state: CaptureState::Idle,
            frame_number: 0,
            targets: targets.into_iter().collect(),
            current_context: ContextId::default(),
            touched: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn current_context(&self) -> ContextId {
        self.current_context
    }

    /// Ask for the next frame to be captured. Return false if a capture is
    /// already pending or underway, in which case the request is dropped.
    pub fn request_capture(&mut self) -> bool {
        match self.state {
            CaptureState::Idle => {
                tracing::info!(frame = self.frame_number + 1, "capture armed");
                self.state = CaptureState::Armed;
                true
            }
            state => {
                tracing::debug!(?state, "capture request coalesced with capture in flight");
                false
            }
        }
    }

    /// Arrange for frame `frame_number` to be captured when it begins.
    pub fn queue_frame(&mut self, frame_number: u64) {
        if frame_number <= self.frame_number {
            tracing::warn!(frame_number, current = self.frame_number, "queued capture of a frame already begun");
        }
        self.targets.insert(frame_number);
    }

    /// Move to the next frame, on a boundary signalled by `context`.
    pub fn advance(&mut self, context: ContextId) -> Transition {
        self.current_context = context;
        self.frame_number += 1;
        let finish = self.state == CaptureState::Recording;
        let targeted = self.targets.remove(&self.frame_number);
        let begin = targeted || self.state == CaptureState::Armed;

        if finish {
            self.state = CaptureState::Finalizing;
        } else if begin {
            self.begin();
        }
        Transition { finish, begin }
    }

    /// Enter `Recording` for the current frame.
    pub fn begin(&mut self) {
        self.state = CaptureState::Recording;
        self.touched.clear();
    }

    /// Return to `Idle` once a frame has been finalized or abandoned.
    pub fn finish(&mut self) {
        self.state = CaptureState::Idle;
    }

    pub fn is_recording(&self) -> bool {
        self.state == CaptureState::Recording
    }

    pub fn touch(&mut self, context: ContextId, id: ResourceId) {
        if !id.is_null() {
            self.touched.entry(context).or_default().insert(id);
        }
    }

    /// The number of resources each context touched this frame.
    pub fn touched_counts(&self) -> Vec<(ContextId, u64)> {
        self.touched.iter().map(|(&context, ids)| (context, ids.len() as u64)).collect()
    }
}

/// Why a captured frame was thrown away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    TooFewDrawcalls { drawcalls: u64, required: u64 },
    /// The log could not be written in memory, usually because it hit the
    /// size limit.
    LogFailed,
    StorageFailed,
}

#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub frame_number: u64,
    pub scope: CaptureScope,
    /// Where the log was written, if the options name an output directory.
    pub path: Option<PathBuf>,
    pub log: Vec<u8>,
}

/// What a frame boundary did.
///
/// When one captured frame ends just as another begins, the outcome reports
/// the frame that ended.
#[derive(Clone, Debug)]
pub enum FrameOutcome {
    PassThrough,
    Started { frame_number: u64 },
    Captured(CapturedFrame),
    Discarded { frame_number: u64, reason: DiscardReason },
}

/// Frame time statistics, kept whether or not anything is being captured.
#[derive(Debug, Default)]
struct FrameTimer {
    last: Option<Instant>,
    frames: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl FrameTimer {
    /// Note a frame boundary. Return the duration of the frame it ends.
    fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = match self.last.replace(now) {
            Some(last) => now - last,
            None => return Duration::default(),
        };
        self.min = if self.frames == 0 { elapsed } else { self.min.min(elapsed) };
        self.max = self.max.max(elapsed);
        self.total += elapsed;
        self.frames += 1;
        elapsed
    }

    fn average(&self) -> Duration {
        if self.frames == 0 {
            return Duration::default();
        }
        let nanos = self.total.as_nanos() / u128::from(self.frames);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// The state of the frame being recorded.
struct FrameCapture {
    frame_number: u64,
    log: LogWriter<Vec<u8>>,
    next_event: EventId,
    drawcalls: u64,
    /// Resources created during the frame, which need no initial state.
    created: BTreeSet<ResourceId>,
    /// Initial-state snapshots, and whether each was only partly taken.
    initial: BTreeMap<ResourceId, (ResourceSnapshot, bool)>,
    /// `initial`'s keys, dependencies first.
    initial_order: Vec<ResourceId>,
    /// High-traffic resources with elided mutations not yet refreshed, and
    /// whether any of those mutations was only partly recorded.
    dirty_hot: BTreeMap<ResourceId, bool>,
    failed: bool,
}

impl FrameCapture {
    fn last_event(&self) -> EventId {
        self.next_event - 1
    }

    fn log_failure(&mut self, what: &str, err: std::io::Error) {
        if !self.failed {
            tracing::error!(frame = self.frame_number, %err, "failed to write {}; capture will be discarded", what);
        }
        self.failed = true;
    }
}

pub struct Recorder<D> {
    driver: D,
    options: CaptureOptions,
    init: InitParams,
    session: CaptureSession,
    resources: ResourceManager,
    hot: HotResourceTracker,
    timer: FrameTimer,
    frame: Option<FrameCapture>,
}

impl<D: Driver> Recorder<D> {
    pub fn new(driver: D, init: InitParams, options: CaptureOptions) -> Recorder<D> {
        Recorder {
            driver,
            session: CaptureSession::new(options.capture_frames.iter().copied()),
            hot: HotResourceTracker::new(options.hot_resources.clone()),
            options,
            init,
            resources: ResourceManager::new(),
            timer: FrameTimer::default(),
            frame: None,
        }
    }

    /// Request a capture of the next frame. Return false if the request was
    /// coalesced with one already pending or underway.
    pub fn trigger_capture(&mut self) -> bool {
        self.session.request_capture()
    }

    pub fn queue_capture(&mut self, frame_number: u64) {
        self.session.queue_frame(frame_number);
    }

    pub fn state(&self) -> CaptureState {
        self.session.state()
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
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

    /// True if the frame being recorded would be kept if it ended now.
    pub fn has_successful_capture(&self) -> bool {
        match &self.frame {
            Some(frame) => !frame.failed && frame.drawcalls >= self.options.min_drawcalls,
            None => false,
        }
    }

    /// Forward `call` to the driver, recording it if a frame is being
    /// captured. Return the handle of any object the call created.
    ///
    /// Errors are the driver's own; recording problems never fail the call.
    pub fn record_call(
        &mut self,
        context: ContextId,
        call: Call<NativeHandle>,
    ) -> Result<Option<NativeHandle>, DriverError> {
        if self.frame.is_some() {
            self.snapshot_referenced(&call);
        }

        let created_handle = self.driver.execute(&call)?;

        let mut partial = false;
        let resources = &self.resources;
        let logged = call
            .map_resources(|kind, handle| -> Result<ResourceId, Infallible> {
                Ok(resources.lookup(kind, handle).unwrap_or_else(|| {
                    tracing::warn!(?kind, handle, "call refers to an untracked handle; recording it as null");
                    partial = true;
                    ResourceId::NULL
                }))
            })
            .unwrap_or_else(|never| match never {});

        let created = match (&logged, created_handle) {
            (Call::CreateResource { kind, .. }, Some(handle)) => match self.resources.allocate(handle, *kind) {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!(%err, "cannot track created object");
                    partial = true;
                    ResourceId::NULL
                }
            },
            (Call::CreateResource { kind, .. }, None) => {
                tracing::warn!(?kind, "driver returned no handle for a created object");
                partial = true;
                ResourceId::NULL
            }
            _ => ResourceId::NULL,
        };
        self.resources.apply(&logged, created);

        let mutation = logged.mutation().map(|(&id, kind)| (id, kind));
        if let Some((id, kind)) = mutation {
            self.hot.observe(id, kind);
        }
        let is_draw = logged.draw_kind().is_some();
        if is_draw {
            self.hot.note_draw();
        }

        let messages = self.driver.take_debug_messages();
        if self.frame.is_some() {
            self.session.touch(context, created);
            for (_, &id) in logged.resources() {
                self.session.touch(context, id);
            }
            self.log_call(context, logged.clone(), created, mutation, is_draw, partial, messages);
        }

        if let Call::DeleteResource { resource, .. } = logged {
            if !resource.is_null() {
                if let Err(err) = self.resources.release(resource) {
                    tracing::warn!(%err, "deleting untracked resource");
                }
                self.hot.forget(resource);
                if let Some(frame) = &mut self.frame {
                    frame.dirty_hot.remove(&resource);
                }
            }
        }

        Ok(created_handle)
    }

    #[allow(clippy::too_many_arguments)]
    fn log_call(
        &mut self,
        context: ContextId,
        call: Call<ResourceId>,
        created: ResourceId,
        mutation: Option<(ResourceId, MutationKind)>,
        is_draw: bool,
        partial: bool,
        messages: Vec<DebugMessage>,
    ) {
        let frame = match &mut self.frame {
            Some(frame) => frame,
            None => return,
        };
        if created != ResourceId::NULL {
            frame.created.insert(created);
        }

        if let Some((id, MutationKind::State)) = mutation {
            if self.hot.is_hot(id) {
                *frame.dirty_hot.entry(id).or_insert(false) |= partial;
                // The call leaves no chunk of its own; its messages go to
                // the event before it.
                write_debug_messages(frame, messages);
                return;
            }
        }
        if is_draw {
            frame.drawcalls += 1;
            write_refreshes(frame, &self.resources);
        }

        let event_id = if call.is_event() {
            frame.next_event += 1;
            frame.last_event()
        } else {
            0
        };
        let api = ApiCall { event_id, context, created, call };
        if partial {
            tracing::warn!(event_id, call = api.call.kind().name(), "recording partial call");
        }
        if let Err(err) = frame.log.write_call(&api, partial) {
            frame.log_failure("call", err);
        }

        write_debug_messages(frame, messages);
    }

    /// Snapshot every resource `call` refers to that existed before the
    /// frame began, along with whatever they depend on.
    fn snapshot_referenced(&mut self, call: &Call<NativeHandle>) {
        let frame = match &mut self.frame {
            Some(frame) => frame,
            None => return,
        };
        let resources = &self.resources;
        let roots: Vec<ResourceId> = call
            .resources()
            .into_iter()
            .filter_map(|(kind, &handle)| resources.lookup(kind, handle))
            .filter(|&id| !id.is_null() && !frame.created.contains(&id) && !frame.initial.contains_key(&id))
            .collect();
        if roots.is_empty() {
            return;
        }

        for id in resources.initial_state_order(roots) {
            if frame.created.contains(&id) || frame.initial.contains_key(&id) {
                continue;
            }
            let entry = match ResourceSnapshot::capture(resources, &mut self.driver, id) {
                Ok(snapshot) => (snapshot, false),
                Err(err) => {
                    tracing::warn!(%id, %err, "cannot read resource contents; initial state will be partial");
                    match ResourceSnapshot::state_only(resources, id) {
                        Some(snapshot) => (snapshot, true),
                        None => continue,
                    }
                }
            };
            frame.initial.insert(id, entry);
            frame.initial_order.push(id);
        }
    }

    /// Record a debug message reported by the driver outside of any call.
    /// It is attached to the most recent event.
    pub fn on_debug_message(&mut self, message: DebugMessage) {
        if let Some(frame) = &mut self.frame {
            write_debug_messages(frame, vec![message]);
        }
    }

    /// Handle the end of a frame on `context`.
    pub fn on_frame_boundary(&mut self, context: ContextId) -> FrameOutcome {
        let frame_time = self.timer.tick();
        for id in self.hot.end_frame() {
            tracing::info!(%id, "resource is high-traffic; eliding its state mutations");
        }

        let transition = self.session.advance(context);
        let mut outcome = FrameOutcome::PassThrough;
        if transition.finish {
            outcome = self.finalize(frame_time);
            self.session.finish();
        }
        if transition.begin {
            if transition.finish {
                self.session.begin();
            }
            let frame_number = self.session.frame_number();
            match self.start_frame(frame_number, context) {
                Ok(()) => {
                    tracing::info!(frame_number, %context, "capturing frame");
                    if let FrameOutcome::PassThrough = outcome {
                        outcome = FrameOutcome::Started { frame_number };
                    }
                }
                Err(err) => {
                    tracing::error!(frame_number, %err, "cannot start capture log");
                    self.session.finish();
                }
            }
        }
        outcome
    }

    fn start_frame(&mut self, frame_number: u64, context: ContextId) -> std::io::Result<()> {
        let mut log = LogWriter::new(Vec::new(), &self.init)?;
        log.set_size_limit(self.options.size_limit);
        log.begin_frame(&FrameBegin { frame_number, context })?;
        self.frame = Some(FrameCapture {
            frame_number,
            log,
            next_event: 1,
            drawcalls: 0,
            created: BTreeSet::new(),
            initial: BTreeMap::new(),
            initial_order: Vec::new(),
            dirty_hot: BTreeMap::new(),
            failed: false,
        });
        Ok(())
    }

    fn finalize(&mut self, frame_time: Duration) -> FrameOutcome {
        let successful = self.has_successful_capture();
        let mut frame = match self.frame.take() {
            Some(frame) => frame,
            None => return FrameOutcome::PassThrough,
        };
        let frame_number = frame.frame_number;

        if !successful {
            let reason = if frame.failed {
                DiscardReason::LogFailed
            } else {
                DiscardReason::TooFewDrawcalls {
                    drawcalls: frame.drawcalls,
                    required: self.options.min_drawcalls,
                }
            };
            tracing::info!(frame_number, ?reason, "discarding capture");
            return FrameOutcome::Discarded { frame_number, reason };
        }

        write_refreshes(&mut frame, &self.resources);
        let partial_initial = frame.initial.values().filter(|(_, partial)| *partial).count() as u32;
        let as_us = |d: Duration| d.as_micros() as u64;
        let scope = CaptureScope {
            frame_number,
            event_count: frame.last_event(),
            drawcall_count: frame.drawcalls,
            frame_time_us: as_us(frame_time),
            avg_frame_time_us: as_us(self.timer.average()),
            min_frame_time_us: as_us(self.timer.min),
            max_frame_time_us: as_us(self.timer.max),
            partial_chunks: frame.log.partial_chunks() + partial_initial,
            contexts: self.session.touched_counts(),
        };

        let FrameCapture { mut log, mut initial, initial_order, .. } = frame;
        let written = log.end_frame(&scope).and_then(|_| {
            for id in &initial_order {
                if let Some((snapshot, partial)) = initial.remove(id) {
                    log.write_initial_state(&snapshot, partial)?;
                }
            }
            Ok(())
        });
        let bytes = match written.and_then(|()| log.finish()) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(frame_number, %err, "failed to close capture log");
                return FrameOutcome::Discarded { frame_number, reason: DiscardReason::LogFailed };
            }
        };

        let mut path = None;
        if let Some(dir) = &self.options.output_dir {
            let file = dir.join(format!("frame{}.glcap", frame_number));
            if let Err(err) = fs::write(&file, &bytes) {
                tracing::error!(path = %file.display(), %err, "failed to store capture log");
                return FrameOutcome::Discarded { frame_number, reason: DiscardReason::StorageFailed };
            }
            path = Some(file);
        }

        tracing::info!(
            frame_number,
            events = scope.event_count,
            drawcalls = scope.drawcall_count,
            bytes = bytes.len(),
            "captured frame"
        );
        FrameOutcome::Captured(CapturedFrame { frame_number, scope, path, log: bytes })
    }
}

/// Write a state refresh for each dirty high-traffic resource.
fn write_refreshes(frame: &mut FrameCapture, resources: &ResourceManager) {
    for (id, partial) in mem::take(&mut frame.dirty_hot) {
        let snapshot = match ResourceSnapshot::state_only(resources, id) {
            Some(snapshot) => snapshot,
            None => continue,
        };
        if let Err(err) = frame.log.write_state_refresh(&snapshot, partial) {
            frame.log_failure("state refresh", err);
        }
    }
}

/// Attach `messages` to the frame's most recent event.
fn write_debug_messages(frame: &mut FrameCapture, messages: Vec<DebugMessage>) {
    if messages.is_empty() {
        return;
    }
    let batch = DebugMessageBatch { event_id: frame.last_event(), messages };
    if let Err(err) = frame.log.write_debug_messages(&batch) {
        frame.log_failure("debug messages", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_driver::MemoryDriver;
    use crate::reader::LogReader;
    use crate::format::ChunkType;
    use crate::resource::ResourceKind;

    fn recorder(min_drawcalls: u64) -> Recorder<MemoryDriver> {
        let options = CaptureOptions { min_drawcalls, ..Default::default() };
        Recorder::new(MemoryDriver::new(7), InitParams::default(), options)
    }

    fn draw() -> Call<NativeHandle> {
        Call::DrawArrays { mode: 4, first: 0, count: 3, instances: 1 }
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = CaptureSession::new(vec![3]);
        assert_eq!(session.advance(ContextId(1)), Transition::default());
        assert_eq!(session.state(), CaptureState::Idle);

        assert!(session.request_capture());
        assert!(!session.request_capture());
        assert_eq!(session.state(), CaptureState::Armed);

        // Frame 2 begins recording; frame 3 is also a target, so the
        // boundary after frame 2 finishes one capture and begins another.
        assert_eq!(session.advance(ContextId(1)), Transition { finish: false, begin: true });
        assert!(session.is_recording());
        assert!(!session.request_capture());
        assert_eq!(session.advance(ContextId(1)), Transition { finish: true, begin: true });
        assert_eq!(session.state(), CaptureState::Finalizing);
        session.finish();
        session.begin();
        assert_eq!(session.advance(ContextId(2)), Transition { finish: true, begin: false });
        session.finish();
        assert_eq!(session.state(), CaptureState::Idle);
        assert_eq!(session.current_context(), ContextId(2));
    }

    #[test]
    fn test_idle_calls_are_not_logged() {
        let mut recorder = recorder(1);
        let buffer = recorder
            .record_call(ContextId(1), Call::CreateResource { kind: ResourceKind::Buffer, subtype: 0 })
            .unwrap()
            .unwrap();
        assert_eq!(buffer, 7);
        assert_eq!(recorder.resources().live_count(), 1);
        assert!(matches!(recorder.on_frame_boundary(ContextId(1)), FrameOutcome::PassThrough));
        assert!(!recorder.has_successful_capture());
    }

    #[test]
    fn test_empty_frame_is_discarded() {
        let mut recorder = recorder(1);
        assert!(recorder.trigger_capture());
        assert!(matches!(recorder.on_frame_boundary(ContextId(1)), FrameOutcome::Started { frame_number: 1 }));
        recorder.record_call(ContextId(1), Call::Flush {}).unwrap();
        match recorder.on_frame_boundary(ContextId(1)) {
            FrameOutcome::Discarded { frame_number: 1, reason } => {
                assert_eq!(reason, DiscardReason::TooFewDrawcalls { drawcalls: 0, required: 1 })
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(recorder.state(), CaptureState::Idle);
    }

    #[test]
    fn test_preexisting_resources_get_initial_state() {
        let mut recorder = recorder(1);
        let ctx = ContextId(1);
        let buffer = recorder
            .record_call(ctx, Call::CreateResource { kind: ResourceKind::Buffer, subtype: 0 })
            .unwrap()
            .unwrap();
        recorder.record_call(ctx, Call::BufferData { usage: 0, data: vec![4; 8], buffer }).unwrap();

        recorder.trigger_capture();
        recorder.on_frame_boundary(ctx);
        recorder.record_call(ctx, Call::BufferSubData { offset: 0, data: vec![1], buffer }).unwrap();
        recorder.record_call(ctx, draw()).unwrap();
        assert!(recorder.has_successful_capture());

        let captured = match recorder.on_frame_boundary(ctx) {
            FrameOutcome::Captured(captured) => captured,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(captured.scope.event_count, 2);
        assert_eq!(captured.scope.drawcall_count, 1);
        assert_eq!(captured.scope.contexts, [(ctx, 1)]);

        let mut reader = LogReader::from_bytes(captured.log).unwrap();
        let frame = reader.frames()[0].clone();
        assert_eq!(frame.initial_states.len(), 1);
        reader.seek_to_offset(frame.initial_states[0]).unwrap();
        let chunk = reader.read_chunk().unwrap().unwrap();
        assert_eq!(chunk.ty, ChunkType::InitialState);
        // The snapshot predates the frame's own upload.
        let snapshot: ResourceSnapshot = chunk.decode().unwrap();
        assert_eq!(snapshot.contents, [4; 8]);
    }

    #[test]
    fn test_average_survives_long_sessions() {
        let timer = FrameTimer {
            frames: 1 << 33,
            total: Duration::from_secs(1 << 32),
            ..Default::default()
        };
        assert_eq!(timer.average(), Duration::from_millis(500));
        assert_eq!(FrameTimer::default().average(), Duration::default());
    }
}
