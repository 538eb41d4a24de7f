//! Capturing frames with a `Recorder` and replaying them with a `Replayer`,
//! both over `MemoryDriver`.

use gl_capture::debug_messages::DebugMessage;
use gl_capture::format::{CaptureScope, ChunkType, FrameBegin, InitParams, HEADER_LEN};
use gl_capture::resource::{BufferAttributes, ResourceAttributes};
use gl_capture::serialize::DeserializeError;
use gl_capture::snapshot::ResourceSnapshot;
use gl_capture::{
    ApiCall, Call, CaptureOptions, CapturedFrame, ContextId, DiscardReason, Driver, DriverError, FrameOutcome,
    HotResourceOptions, LogError, LogReader, LogWriter, MemoryDriver, NativeHandle, Recorder, ReplayError,
    ReplayMode, ReplayOptions, Replayer, ResourceError, ResourceId, ResourceKind,
};

use std::fs;
use std::io::Cursor;

const CTX: ContextId = ContextId(1);

fn recorder(options: CaptureOptions) -> Recorder<MemoryDriver> {
    let init = InitParams { width: 640, height: 480, color_bits: 32, ..Default::default() };
    Recorder::new(MemoryDriver::new(7), init, options)
}

fn captured(outcome: FrameOutcome) -> CapturedFrame {
    match outcome {
        FrameOutcome::Captured(frame) => frame,
        other => panic!("expected a captured frame, got {:?}", other),
    }
}

fn create(recorder: &mut Recorder<MemoryDriver>, kind: ResourceKind) -> NativeHandle {
    recorder.record_call(CTX, Call::CreateResource { kind, subtype: 0 }).unwrap().unwrap()
}

fn call(recorder: &mut Recorder<MemoryDriver>, call: Call<NativeHandle>) {
    recorder.record_call(CTX, call).unwrap();
}

fn draw(first: i32) -> Call<NativeHandle> {
    Call::DrawArrays { mode: 4, first, count: 3, instances: 1 }
}

fn load_log(log: Vec<u8>) -> Replayer<MemoryDriver, Cursor<Vec<u8>>> {
    Replayer::load(Cursor::new(log), MemoryDriver::new(7), ReplayOptions::default()).unwrap()
}

fn chunk_types(log: &[u8]) -> Vec<ChunkType> {
    let mut reader = LogReader::from_bytes(log.to_vec()).unwrap();
    reader.chunks_from(HEADER_LEN).unwrap().iter().map(|chunk| chunk.ty).collect()
}

/// A frame exercising most kinds of object, with a debug group around the
/// drawing.
fn record_scene(recorder: &mut Recorder<MemoryDriver>) {
    let texture = create(recorder, ResourceKind::Texture);
    call(recorder, Call::TexStorage2d { target: 0x0DE1, levels: 1, internal_format: 0x8058, width: 2, height: 2, texture });
    call(
        recorder,
        Call::TexSubImage2d {
            target: 0x0DE1,
            level: 0,
            x: 0,
            y: 0,
            width: 2,
            height: 1,
            format: 0x1908,
            ty: 0x1401,
            data: vec![0xff; 8],
            texture,
        },
    );
    let framebuffer = create(recorder, ResourceKind::Framebuffer);
    call(
        recorder,
        Call::FramebufferTexture2d { target: 0x8D40, attachment: 0x8CE0, textarget: 0x0DE1, level: 0, framebuffer, texture },
    );
    call(recorder, Call::BindFramebuffer { target: 0x8D40, framebuffer });

    let buffer = create(recorder, ResourceKind::Buffer);
    call(recorder, Call::BufferData { usage: 0x88E4, data: vec![0; 36], buffer });
    let vertex_array = create(recorder, ResourceKind::VertexArray);
    call(
        recorder,
        Call::VertexAttribPointer { index: 0, size: 3, ty: 0x1406, normalized: false, stride: 12, offset: 0, vertex_array, buffer },
    );
    call(recorder, Call::EnableVertexAttribArray { index: 0, vertex_array });
    call(recorder, Call::BindVertexArray { vertex_array });

    call(recorder, Call::PushDebugGroup { id: 0, message: "main pass".to_owned() });
    call(recorder, Call::ClearColor { r: 0.0, g: 0.0, b: 0.0, a: 1.0 });
    call(recorder, Call::Clear { mask: 0x4000 });
    for i in 0..3 {
        call(recorder, Call::BufferSubData { offset: i * 12, data: vec![i as u8 + 1; 12], buffer });
        call(recorder, draw(0));
    }
    call(recorder, Call::PopDebugGroup {});
    call(recorder, Call::Viewport { x: 0, y: 0, width: 320, height: 240 });
}

#[test]
fn test_single_buffer_frame() {
    let options = CaptureOptions { min_drawcalls: 0, ..Default::default() };
    let mut recorder = recorder(options);
    assert!(recorder.trigger_capture());
    assert!(matches!(recorder.on_frame_boundary(CTX), FrameOutcome::Started { frame_number: 1 }));

    let buffer = create(&mut recorder, ResourceKind::Buffer);
    assert_eq!(buffer, 7);
    call(&mut recorder, Call::BufferData { usage: 0x88E4, data: vec![1, 2, 3], buffer });
    let frame = captured(recorder.on_frame_boundary(CTX));
    assert_eq!(frame.frame_number, 1);
    assert_eq!(frame.scope.event_count, 1);
    assert!(frame.path.is_none());

    assert_eq!(
        chunk_types(&frame.log),
        [ChunkType::BeginCaptureFrame, ChunkType::ApiCall, ChunkType::ApiCall, ChunkType::CaptureScope]
    );

    let mut replayer = load_log(frame.log);
    assert_eq!(replayer.init_params().width, 640);
    let summary = replayer.replay(1, 0, u64::MAX, ReplayMode::Full).unwrap();
    assert_eq!(summary.events, [1]);
    assert_eq!(replayer.driver().executed.len(), 2);

    let tree = replayer.frame_record(1).unwrap().tree.clone().unwrap();
    assert_eq!(tree.len(), 1);
    let node = &tree.roots()[0];
    assert_eq!(node.event_id, 1);
    assert!(node.children.is_empty());
    assert!(node.drawcall.is_none());

    let id = recorder.resources().lookup(ResourceKind::Buffer, buffer).unwrap();
    let handle = replayer.resources().resolve(id).unwrap();
    assert_eq!(replayer.driver().object(handle).unwrap().contents, [1, 2, 3]);
}

#[test]
fn test_replay_matches_capture() {
    let mut recorder = recorder(CaptureOptions::default());
    recorder.trigger_capture();
    recorder.on_frame_boundary(CTX);
    record_scene(&mut recorder);
    let frame = captured(recorder.on_frame_boundary(CTX));
    assert_eq!(frame.scope.drawcall_count, 4);
    assert_eq!(frame.scope.partial_chunks, 0);

    let mut replayer = load_log(frame.log);
    replayer.replay(1, 0, u64::MAX, ReplayMode::Full).unwrap();
    // Every object was created during the frame, in the same order, so even
    // the native handles agree.
    assert_eq!(replayer.driver().state, recorder.driver().state);

    let tree = replayer.frame_record(1).unwrap().tree.clone().unwrap();
    let group = tree.roots().iter().find(|node| node.marker.as_deref() == Some("main pass")).unwrap();
    // Clear color, clear, three uploads and draws, and the pop.
    assert_eq!(group.children.len(), 9);
    let drawcalls: Vec<u64> = tree.drawcalls().map(|(_, info)| info.drawcall_id).collect();
    assert_eq!(drawcalls, [1, 2, 3, 4]);
}

#[test]
fn test_partial_replays_agree_with_full_replay() {
    let mut recorder = recorder(CaptureOptions::default());
    recorder.trigger_capture();
    recorder.on_frame_boundary(CTX);
    record_scene(&mut recorder);
    let log = captured(recorder.on_frame_boundary(CTX)).log;

    let mut full = load_log(log.clone());
    full.replay(1, 0, u64::MAX, ReplayMode::Full).unwrap();
    let last = full.frame_record(1).unwrap().index.last_event();
    assert!(last > 10);

    for split in [1, 5, last / 2, last - 1] {
        let mut stepped = load_log(log.clone());
        let first = stepped.replay(1, 0, split, ReplayMode::FrameRange).unwrap();
        assert_eq!(first.last_event, split);
        let second = stepped.replay(1, split, u64::MAX, ReplayMode::FrameRange).unwrap();
        assert!(!second.restarted);
        assert_eq!(second.events.first(), Some(&(split + 1)));
        assert_eq!(stepped.driver().state, full.driver().state, "split at {}", split);
    }
}

#[test]
fn test_preexisting_resources_keep_their_ids() {
    let mut recorder = recorder(CaptureOptions::default());
    let buffer = create(&mut recorder, ResourceKind::Buffer);
    call(&mut recorder, Call::BufferData { usage: 0x88E4, data: vec![5; 64], buffer });
    let shader = recorder
        .record_call(CTX, Call::CreateResource { kind: ResourceKind::Shader, subtype: 0x8B31 })
        .unwrap()
        .unwrap();
    call(&mut recorder, Call::ShaderSource { source: "void main() {}".to_owned(), shader });
    call(&mut recorder, Call::CompileShader { shader });
    let program = create(&mut recorder, ResourceKind::Program);
    call(&mut recorder, Call::AttachShader { program, shader });
    call(&mut recorder, Call::LinkProgram { program });
    let buffer_id = recorder.resources().lookup(ResourceKind::Buffer, buffer).unwrap();
    let program_id = recorder.resources().lookup(ResourceKind::Program, program).unwrap();

    recorder.queue_capture(2);
    assert!(matches!(recorder.on_frame_boundary(CTX), FrameOutcome::PassThrough));
    assert!(matches!(recorder.on_frame_boundary(CTX), FrameOutcome::Started { frame_number: 2 }));
    call(&mut recorder, Call::UseProgram { program });
    call(&mut recorder, Call::BufferSubData { offset: 0, data: vec![6; 4], buffer });
    call(&mut recorder, draw(0));
    let frame = captured(recorder.on_frame_boundary(CTX));

    // The shader comes before the program that depends on it.
    let mut reader = LogReader::from_bytes(frame.log.clone()).unwrap();
    let index = reader.frame(2).unwrap().clone();
    let mut restored = Vec::new();
    for &offset in &index.initial_states {
        reader.seek_to_offset(offset).unwrap();
        let chunk = reader.read_chunk().unwrap().unwrap();
        let snapshot: ResourceSnapshot = chunk.decode().unwrap();
        restored.push(snapshot.kind);
        if snapshot.id == buffer_id {
            // Contents as of the frame's start.
            assert_eq!(snapshot.contents, vec![5; 64]);
        }
    }
    assert_eq!(restored, [ResourceKind::Shader, ResourceKind::Program, ResourceKind::Buffer]);

    // Replay on a driver that hands out different handles.
    let mut replayer = Replayer::load(Cursor::new(frame.log), MemoryDriver::new(1000), ReplayOptions::default()).unwrap();
    replayer.replay(2, 0, u64::MAX, ReplayMode::Full).unwrap();
    let replay_buffer = replayer.resources().resolve(buffer_id).unwrap();
    assert!(replay_buffer >= 1000);
    let mut expected = vec![5; 64];
    expected[..4].copy_from_slice(&[6; 4]);
    assert_eq!(replayer.driver().object(replay_buffer).unwrap().contents, expected);

    let replay_program = replayer.resources().resolve(program_id).unwrap();
    assert_eq!(replayer.driver().state.program, replay_program);
    assert!(replayer.driver().object(replay_program).unwrap().ready);
}

#[test]
fn test_frames_without_drawcalls_are_discarded() {
    let mut recorder = recorder(CaptureOptions::default());
    recorder.trigger_capture();
    recorder.on_frame_boundary(CTX);
    let buffer = create(&mut recorder, ResourceKind::Buffer);
    call(&mut recorder, Call::BufferData { usage: 0x88E4, data: vec![1; 4], buffer });

    match recorder.on_frame_boundary(CTX) {
        FrameOutcome::Discarded { frame_number: 1, reason: DiscardReason::TooFewDrawcalls { drawcalls: 0, required: 1 } } => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!recorder.has_successful_capture());

    // The calls still reached the driver.
    assert_eq!(recorder.driver().object(buffer).unwrap().contents, [1; 4]);
}

#[test]
fn test_unbalanced_markers_replay() {
    let mut recorder = recorder(CaptureOptions::default());
    recorder.trigger_capture();
    recorder.on_frame_boundary(CTX);
    call(&mut recorder, Call::PopDebugGroup {});
    call(&mut recorder, draw(0));
    call(&mut recorder, Call::PushDebugGroup { id: 0, message: "never closed".to_owned() });
    call(&mut recorder, Call::DebugMarker { message: "note".to_owned() });
    call(&mut recorder, draw(3));
    let log = captured(recorder.on_frame_boundary(CTX)).log;

    let mut replayer = load_log(log);
    replayer.replay(1, 0, u64::MAX, ReplayMode::Full).unwrap();
    let tree = replayer.frame_record(1).unwrap().tree.clone().unwrap();
    let roots = tree.roots();
    assert_eq!(roots.len(), 3);
    assert!(roots[0].children.is_empty());
    assert_eq!(roots[2].marker.as_deref(), Some("never closed"));
    let nested: Vec<u64> = roots[2].children.iter().map(|node| node.event_id).collect();
    assert_eq!(nested, [4, 5]);
    assert_eq!(roots[2].children[0].marker.as_deref(), Some("note"));
}

#[test]
fn test_hot_resources_are_refreshed() {
    let options = CaptureOptions {
        hot_resources: HotResourceOptions { enabled: true, mutation_ratio: 0.75, min_draws: 2 },
        ..Default::default()
    };
    let mut recorder = recorder(options);
    let buffer = create(&mut recorder, ResourceKind::Buffer);
    call(&mut recorder, Call::BufferData { usage: 0x88E4, data: vec![0; 24], buffer });
    let vertex_array = create(&mut recorder, ResourceKind::VertexArray);
    let vao_id = recorder.resources().lookup(ResourceKind::VertexArray, vertex_array).unwrap();

    // An uncaptured frame that re-points the vertex array before every draw.
    for i in 0..4 {
        call(
            &mut recorder,
            Call::VertexAttribPointer { index: 0, size: 2, ty: 0x1406, normalized: false, stride: 8, offset: i * 8, vertex_array, buffer },
        );
        call(&mut recorder, draw(0));
    }
    recorder.trigger_capture();
    recorder.on_frame_boundary(CTX);

    for i in 0..3 {
        call(&mut recorder, Call::EnableVertexAttribArray { index: 1, vertex_array });
        call(
            &mut recorder,
            Call::VertexAttribPointer { index: 1, size: 4, ty: 0x1406, normalized: true, stride: 0, offset: i * 4, vertex_array, buffer },
        );
        call(&mut recorder, draw(0));
    }
    call(&mut recorder, Call::DisableVertexAttribArray { index: 1, vertex_array });
    let log = captured(recorder.on_frame_boundary(CTX)).log;

    let types = chunk_types(&log);
    assert_eq!(types.iter().filter(|&&ty| ty == ChunkType::StateRefresh).count(), 4);
    let reader = LogReader::from_bytes(log.clone()).unwrap();
    assert_eq!(reader.frames()[0].events.len(), 3);

    let mut replayer = load_log(log);
    replayer.replay(1, 0, u64::MAX, ReplayMode::Full).unwrap();
    assert_eq!(
        replayer.resources().record(vao_id).unwrap().attributes,
        recorder.resources().record(vao_id).unwrap().attributes
    );
}

#[test]
fn test_logs_written_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let options = CaptureOptions {
        capture_frames: vec![1],
        output_dir: Some(dir.path().to_owned()),
        ..Default::default()
    };
    let mut recorder = recorder(options);
    assert!(matches!(recorder.on_frame_boundary(CTX), FrameOutcome::Started { frame_number: 1 }));
    call(&mut recorder, draw(0));
    let frame = captured(recorder.on_frame_boundary(CTX));

    let path = frame.path.unwrap();
    assert_eq!(path, dir.path().join("frame1.glcap"));
    let file = fs::File::open(&path).unwrap();
    let mut replayer = Replayer::load(file, MemoryDriver::new(1), ReplayOptions::default()).unwrap();
    let summary = replayer.replay(1, 0, 1, ReplayMode::FrameRange).unwrap();
    assert_eq!(summary.events, [1]);
    assert_eq!(replayer.driver().state.draws.len(), 1);
}

#[test]
fn test_corrupt_logs_are_rejected() {
    let mut recorder = recorder(CaptureOptions::default());
    recorder.trigger_capture();
    recorder.on_frame_boundary(CTX);
    call(&mut recorder, draw(0));
    let log = captured(recorder.on_frame_boundary(CTX)).log;

    let mut truncated = log.clone();
    truncated.truncate(log.len() - 3);
    assert!(Replayer::load(Cursor::new(truncated), MemoryDriver::new(1), ReplayOptions::default()).is_err());

    let mut replayer = load_log(log);
    assert!(matches!(replayer.replay(4, 0, 1, ReplayMode::Full), Err(ReplayError::UnknownFrame(4))));

    // A call naming a resource the log never created.
    let mut writer = LogWriter::new(Vec::new(), &InitParams::default()).unwrap();
    writer.begin_frame(&FrameBegin { frame_number: 1, context: CTX }).unwrap();
    let stray = ResourceId::from_raw(99);
    let api = ApiCall { event_id: 1, context: CTX, created: ResourceId::NULL, call: Call::UseProgram { program: stray } };
    let offset = writer.write_call(&api, false).unwrap();
    writer.end_frame(&CaptureScope { frame_number: 1, event_count: 1, ..Default::default() }).unwrap();
    let log = writer.finish().unwrap();

    let mut replayer = load_log(log);
    match replayer.replay(1, 0, 1, ReplayMode::Full) {
        Err(ReplayError::Resource { offset: at, ty: ChunkType::ApiCall, source: ResourceError::NotFound(id) }) => {
            assert_eq!(at, offset);
            assert_eq!(id, stray);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

/// A `MemoryDriver` that complains about every vertex attribute pointer.
struct NoisyDriver {
    inner: MemoryDriver,
    pending: Vec<DebugMessage>,
}

impl Driver for NoisyDriver {
    fn execute(&mut self, call: &Call<NativeHandle>) -> Result<Option<NativeHandle>, DriverError> {
        if let Call::VertexAttribPointer { index, .. } = call {
            self.pending.push(DebugMessage {
                severity: 0x9147,
                message: format!("attribute {} is misaligned", index),
                ..Default::default()
            });
        }
        self.inner.execute(call)
    }

    fn read_contents(
        &mut self,
        kind: ResourceKind,
        handle: NativeHandle,
        attributes: &ResourceAttributes,
    ) -> Result<Vec<u8>, DriverError> {
        self.inner.read_contents(kind, handle, attributes)
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        self.inner.reset()
    }

    fn take_debug_messages(&mut self) -> Vec<DebugMessage> {
        std::mem::take(&mut self.pending)
    }
}

#[test]
fn test_elided_mutations_keep_their_messages() {
    let options = CaptureOptions {
        hot_resources: HotResourceOptions { enabled: true, mutation_ratio: 0.75, min_draws: 2 },
        ..Default::default()
    };
    let driver = NoisyDriver { inner: MemoryDriver::new(7), pending: Vec::new() };
    let mut recorder = Recorder::new(driver, InitParams::default(), options);
    let create = |recorder: &mut Recorder<NoisyDriver>, kind| {
        recorder.record_call(CTX, Call::CreateResource { kind, subtype: 0 }).unwrap().unwrap()
    };
    let buffer = create(&mut recorder, ResourceKind::Buffer);
    let vertex_array = create(&mut recorder, ResourceKind::VertexArray);
    let pointer = |index, buffer| Call::VertexAttribPointer {
        index, size: 2, ty: 0x1406, normalized: false, stride: 8, offset: 0, vertex_array, buffer,
    };

    for _ in 0..4 {
        recorder.record_call(CTX, pointer(0, buffer)).unwrap();
        recorder.record_call(CTX, draw(0)).unwrap();
    }
    recorder.trigger_capture();
    recorder.on_frame_boundary(CTX);

    // A buffer the recorder never saw, so the elided call is only partly
    // recorded.
    let stray = recorder
        .driver_mut()
        .execute(&Call::CreateResource { kind: ResourceKind::Buffer, subtype: 0 })
        .unwrap()
        .unwrap();
    recorder.record_call(CTX, draw(0)).unwrap();
    recorder.record_call(CTX, pointer(1, stray)).unwrap();
    recorder.record_call(CTX, draw(3)).unwrap();
    let frame = captured(recorder.on_frame_boundary(CTX));
    assert_eq!(frame.scope.event_count, 2);
    assert_eq!(frame.scope.partial_chunks, 1);

    let mut reader = LogReader::from_bytes(frame.log.clone()).unwrap();
    let chunks = reader.chunks_from(HEADER_LEN).unwrap();
    let refresh = chunks.iter().find(|chunk| chunk.ty == ChunkType::StateRefresh).unwrap();
    assert!(refresh.is_partial());

    let mut replayer = load_log(frame.log);
    replayer.replay(1, 0, u64::MAX, ReplayMode::Full).unwrap();
    let first = replayer.event(1, 1).unwrap();
    assert_eq!(first.debug_messages.len(), 1);
    assert_eq!(first.debug_messages[0].message, "attribute 1 is misaligned");
    assert!(replayer.event(1, 2).unwrap().debug_messages.is_empty());
}

/// A one-draw frame whose log also carries `initial`, built by hand.
fn log_with_initial_state(calls: &[ApiCall], initial: &ResourceSnapshot) -> Vec<u8> {
    let mut writer = LogWriter::new(Vec::new(), &InitParams::default()).unwrap();
    writer.begin_frame(&FrameBegin { frame_number: 1, context: CTX }).unwrap();
    for api in calls {
        writer.write_call(api, false).unwrap();
    }
    let draw = Call::DrawArrays { mode: 4, first: 0, count: 3, instances: 1 };
    let event_id = calls.iter().map(|api| api.event_id).max().unwrap_or(0) + 1;
    writer.write_call(&ApiCall { event_id, context: CTX, created: ResourceId::NULL, call: draw }, false).unwrap();
    writer.end_frame(&CaptureScope { frame_number: 1, event_count: event_id, drawcall_count: 1, ..Default::default() }).unwrap();
    writer.write_initial_state(initial, false).unwrap();
    writer.finish().unwrap()
}

#[test]
fn test_hostile_sizes_are_rejected() {
    let huge_buffer = ResourceSnapshot {
        id: ResourceId::from_raw(5),
        kind: ResourceKind::Buffer,
        attributes: ResourceAttributes::Buffer(BufferAttributes { size: u64::MAX, target: 0, usage: 0 }),
        contents: vec![],
    };
    let mut replayer = load_log(log_with_initial_state(&[], &huge_buffer));
    match replayer.replay(1, 0, u64::MAX, ReplayMode::Full) {
        Err(ReplayError::Log(LogError::BadPayload { ty: ChunkType::InitialState, source, .. })) => {
            assert_eq!(source, DeserializeError::BadValue { what: "buffer size", value: u64::MAX });
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // Texture storage far too large to allocate.
    let texture = ResourceId::from_raw(1);
    let calls = [
        ApiCall {
            event_id: 0,
            context: CTX,
            created: texture,
            call: Call::CreateResource { kind: ResourceKind::Texture, subtype: 0 },
        },
        ApiCall {
            event_id: 1,
            context: CTX,
            created: ResourceId::NULL,
            call: Call::TexStorage2d { target: 0x0DE1, levels: 1, internal_format: 0x8058, width: u32::MAX, height: u32::MAX, texture },
        },
    ];
    let empty = ResourceSnapshot { id: ResourceId::from_raw(2), attributes: ResourceAttributes::None, ..Default::default() };
    let mut replayer = load_log(log_with_initial_state(&calls, &empty));
    assert!(matches!(
        replayer.replay(1, 0, u64::MAX, ReplayMode::Full),
        Err(ReplayError::Driver { ty: ChunkType::ApiCall, source: DriverError::Failed { call: "TexStorage2d", .. }, .. })
    ));
}

#[test]
fn test_newer_format_versions_are_refused() {
    let mut recorder = recorder(CaptureOptions::default());
    recorder.trigger_capture();
    recorder.on_frame_boundary(CTX);
    call(&mut recorder, draw(0));
    let mut log = captured(recorder.on_frame_boundary(CTX)).log;

    // The version follows the eight-byte magic number.
    log[8..12].copy_from_slice(&2_u32.to_le_bytes());
    match Replayer::load(Cursor::new(log), MemoryDriver::new(1), ReplayOptions::default()) {
        Err(ReplayError::Log(LogError::VersionMismatch { found: 2, expected: 1 })) => {}
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("log with a foreign version was loaded"),
    }
}
