use docopt::Docopt;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use gl_capture::call::ApiCall;
use gl_capture::debug_messages::DebugMessageBatch;
use gl_capture::format::{CaptureScope, ChunkType, FrameBegin, HEADER_LEN};
use gl_capture::reader::Chunk;
use gl_capture::snapshot::ResourceSnapshot;
use gl_capture::{LogError, LogReader};

use std::{fs, io};

static USAGE: &str = "
Dump the chunks of gl-capture logs.

Print each chunk's offset, type and a summary of its payload, followed by
the frame index. Set RUST_LOG to see what the reader is doing.

Usage:
  dump-chunks [--index-only] <log>...
  dump-chunks --help

Options:
  --index-only  Print only the header and the frame index.
";

#[derive(Debug, Deserialize)]
struct Args {
    arg_log: Vec<String>,
    flag_index_only: bool,
}

fn describe(chunk: &Chunk) -> Result<String, LogError> {
    Ok(match chunk.ty {
        ChunkType::BeginCaptureFrame => {
            let begin: FrameBegin = chunk.decode()?;
            format!("frame {} on {}", begin.frame_number, begin.context)
        }
        ChunkType::ApiCall => {
            let api: ApiCall = chunk.decode()?;
            let mut line = format!("[{}] {}: {}", api.event_id, api.context, api.call);
            if !api.created.is_null() {
                line.push_str(&format!(" -> {}", api.created));
            }
            line
        }
        ChunkType::CaptureScope => {
            let scope: CaptureScope = chunk.decode()?;
            format!(
                "frame {}: {} events, {} drawcalls, {}us, {} partial chunks",
                scope.frame_number,
                scope.event_count,
                scope.drawcall_count,
                scope.frame_time_us,
                scope.partial_chunks
            )
        }
        ChunkType::InitialState | ChunkType::StateRefresh => {
            let snapshot: ResourceSnapshot = chunk.decode()?;
            format!("{} {:?}, {} bytes of contents", snapshot.id, snapshot.kind, snapshot.contents.len())
        }
        ChunkType::DebugMessages => {
            let batch: DebugMessageBatch = chunk.decode()?;
            let texts: Vec<&str> = batch.messages.iter().map(|m| m.message.as_str()).collect();
            format!("event {}: {:?}", batch.event_id, texts)
        }
    })
}

fn dump(path: &str, index_only: bool) -> Result<(), LogError> {
    let mut log = LogReader::open(io::BufReader::new(fs::File::open(path)?))?;
    println!("{}: {:?}", path, log.init_params());

    if !index_only {
        log.seek_to_offset(HEADER_LEN)?;
        while let Some(chunk) = log.read_chunk()? {
            let partial = if chunk.is_partial() { " (partial)" } else { "" };
            let summary = describe(&chunk).unwrap_or_else(|err| format!("<{}>", err));
            println!("{:10} {:18} {:8}{} {}", chunk.offset, chunk.ty.to_string(), chunk.payload.len(), partial, summary);
        }
    }

    for frame in log.frames() {
        println!(
            "frame {}: begin {}, scope {}, {} events, {} initial states",
            frame.frame_number,
            frame.begin_offset,
            frame.scope_offset,
            frame.events.len(),
            frame.initial_states.len()
        );
    }
    Ok(())
}

fn main() {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut failed = false;
    for path in &args.arg_log {
        if let Err(err) = dump(path, args.flag_index_only) {
            eprintln!("{}: {}", path, err);
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
}
