use docopt::Docopt;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use gl_capture::config::{self, ReplayOptions};
use gl_capture::{EventNode, MemoryDriver, ReplayMode, Replayer};

use std::error::Error;
use std::{fs, io};

static USAGE: &str = "
Replay captured frames and print their event trees.

Frames are replayed against an in-memory driver, so this works without a GL
context. Events inside debug groups are indented under the group's push.

Usage:
  dump-events [options] <log>
  dump-events --help

Options:
  --frame=<n>      Only replay frame <n>.
  --start=<id>     First event to report [default: 0].
  --end=<id>       Last event to replay [default: 18446744073709551615].
  --read-only      Build the trees without executing anything.
  --config=<file>  Replay options, as JSON.
";

#[derive(Debug, Deserialize)]
struct Args {
    arg_log: String,
    flag_frame: Option<u64>,
    flag_start: u64,
    flag_end: u64,
    flag_read_only: bool,
    flag_config: Option<String>,
}

fn print_nodes(nodes: &[EventNode], depth: usize) {
    for node in nodes {
        let label = match &node.marker {
            Some(marker) if !node.children.is_empty() => format!("{} \"{}\"", node.description, marker),
            _ => node.description.clone(),
        };
        let drawcall = match &node.drawcall {
            Some(info) => format!("  #{} {:?} {:?}", info.drawcall_id, info.kind, info.duration),
            None => String::new(),
        };
        println!("{:6} {:indent$}{}{}", node.event_id, "", label, drawcall, indent = depth * 2);
        for message in &node.debug_messages {
            println!("{:6} {:indent$}! {}", "", "", message.message, indent = depth * 2 + 2);
        }
        print_nodes(&node.children, depth + 1);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let options: ReplayOptions = match &args.flag_config {
        Some(path) => config::load(path)?,
        None => ReplayOptions::default(),
    };
    let file = io::BufReader::new(fs::File::open(&args.arg_log)?);
    let mut replayer = Replayer::load(file, MemoryDriver::new(1), options)?;

    let frames: Vec<u64> = match args.flag_frame {
        Some(frame) => vec![frame],
        None => replayer.frame_records().iter().map(|frame| frame.index.frame_number).collect(),
    };
    let mode = if args.flag_read_only { ReplayMode::ReadOnly } else { ReplayMode::FrameRange };

    for frame_number in frames {
        let summary = replayer.replay(frame_number, args.flag_start, args.flag_end, mode)?;
        let record = replayer.frame_record(frame_number).ok_or("frame vanished")?;
        println!(
            "frame {}: {} events, {} drawcalls, replayed {} visibly",
            frame_number,
            record.scope.event_count,
            record.scope.drawcall_count,
            summary.events.len()
        );
        if let Some(tree) = &record.tree {
            print_nodes(tree.roots(), 0);
        }
    }
    Ok(())
}
