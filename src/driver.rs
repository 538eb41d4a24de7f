//! The interface to a real driver.
//!
//! Capture wraps a `Driver` and forwards every call to it; replay issues the
//! recorded calls to another. `GlDriver` implements this on top of a
//! `gleam::gl::Gl` context, and `MemoryDriver` is a deterministic stand-in
//! for tools and tests.

use crate::call::Call;
use crate::debug_messages::DebugMessage;
use crate::resource::{NativeHandle, ResourceAttributes, ResourceKind};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("invalid native handle {0}")]
    InvalidHandle(NativeHandle),
    #[error("{0} is not supported by this driver")]
    Unsupported(&'static str),
    #[error("{call} failed: {message}")]
    Failed { call: &'static str, message: String },
}

pub trait Driver {
    /// Carry out `call`. A `CreateResource` call returns the new object's
    /// handle; everything else returns `None`.
    fn execute(&mut self, call: &Call<NativeHandle>) -> Result<Option<NativeHandle>, DriverError>;

    /// Read back an object's contents: a buffer's bytes, or a texture's
    /// level 0 texels in the format and type named by `attributes`. Kinds
    /// with no contents return an empty vector.
    fn read_contents(
        &mut self,
        kind: ResourceKind,
        handle: NativeHandle,
        attributes: &ResourceAttributes,
    ) -> Result<Vec<u8>, DriverError>;

    /// Throw away every object and all context state, leaving the driver as
    /// if freshly created.
    fn reset(&mut self) -> Result<(), DriverError>;

    /// Return any debug messages the driver has produced since the last
    /// call to this method.
    fn take_debug_messages(&mut self) -> Vec<DebugMessage> {
        Vec::new()
    }
}

impl<D: Driver + ?Sized> Driver for Box<D> {
    fn execute(&mut self, call: &Call<NativeHandle>) -> Result<Option<NativeHandle>, DriverError> {
        (**self).execute(call)
    }

    fn read_contents(
        &mut self,
        kind: ResourceKind,
        handle: NativeHandle,
        attributes: &ResourceAttributes,
    ) -> Result<Vec<u8>, DriverError> {
        (**self).read_contents(kind, handle, attributes)
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        (**self).reset()
    }

    fn take_debug_messages(&mut self) -> Vec<DebugMessage> {
        (**self).take_debug_messages()
    }
}
