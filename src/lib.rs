//! Frame capture and replay for a handle-based GL-like API.
//!
//! A `Recorder` wraps a `Driver` and forwards every call to it. When a
//! capture is requested, the next frame's calls are written to a chunked log,
//! with every driver handle rewritten as a stable `ResourceId`. Resources the
//! frame uses that were created before it are snapshotted as they are first
//! touched, and stored after the frame so replay can rebuild them.
//!
//! A `Replayer` loads such a log and re-issues a frame's calls against
//! another driver, in full or up to a chosen event, building a tree of the
//! frame's events grouped by debug markers as it goes.
//!
//! The log layout is described in the `format` module.

pub mod call;
pub mod capture;
pub mod config;
pub mod debug_messages;
pub mod drawcall;
pub mod driver;
pub mod error;
pub mod format;
pub mod gl_driver;
pub mod hot;
pub mod memory_driver;
pub mod reader;
pub mod replay;
pub mod resource;
pub mod rle;
pub mod serialize;
pub mod snapshot;
pub mod writer;

pub use call::{ApiCall, Call, CallKind, ContextId, EventId};
pub use capture::{CaptureState, CapturedFrame, DiscardReason, FrameOutcome, Recorder};
pub use config::{CaptureOptions, HotResourceOptions, ReplayOptions};
pub use drawcall::{DrawcallInfo, DrawcallTree, EventNode};
pub use driver::{Driver, DriverError};
pub use error::{LogError, ReplayError, ResourceError};
pub use gl_driver::GlDriver;
pub use memory_driver::MemoryDriver;
pub use reader::LogReader;
pub use replay::{ReplayMode, ReplaySummary, Replayer};
pub use resource::{NativeHandle, ResourceId, ResourceKind, ResourceManager};
pub use writer::LogWriter;
