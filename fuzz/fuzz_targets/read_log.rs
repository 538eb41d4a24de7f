#![no_main]
use libfuzzer_sys::fuzz_target;

use gl_capture::{MemoryDriver, ReplayMode, ReplayOptions, Replayer};

// Arbitrary bytes must never panic the reader or the replayer.
fuzz_target!(|data: &[u8]| {
    let source = std::io::Cursor::new(data.to_vec());
    let mut replayer = match Replayer::load(source, MemoryDriver::new(1), ReplayOptions::default()) {
        Ok(replayer) => replayer,
        Err(_) => return,
    };
    let frames: Vec<u64> = replayer.frame_records().iter().map(|f| f.index.frame_number).collect();
    for frame in frames {
        let _ = replayer.replay(frame, 0, u64::MAX, ReplayMode::Full);
    }
});
