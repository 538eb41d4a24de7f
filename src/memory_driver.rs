//! A deterministic in-memory driver.
//!
//! `MemoryDriver` keeps just enough state to check that a replay did what the
//! captured program did: object contents, bindings, and a trace of the calls
//! it was given. Handles come from one counter shared by every kind, starting
//! wherever the caller asks, so tests can make capture and replay hand out
//! different handles for the same objects.

use crate::call::Call;
use crate::driver::{Driver, DriverError};
use crate::resource::{NativeHandle, ResourceAttributes, ResourceKind};
use crate::snapshot::MAX_CONTENTS_LEN;

use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq)]
pub struct MemoryObject {
    pub kind: ResourceKind,
    /// Buffer bytes, or a texture's level 0 texels.
    pub contents: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub parameters: BTreeMap<u32, i32>,
    pub source: String,
    /// Compiled or linked.
    pub ready: bool,
    /// Attached shaders, pipeline stages, vertex attribute buffers or
    /// framebuffer attachments, keyed by slot.
    pub links: BTreeMap<u32, NativeHandle>,
    pub enabled: BTreeSet<u32>,
}

impl MemoryObject {
    fn new(kind: ResourceKind) -> MemoryObject {
        MemoryObject {
            kind,
            contents: Vec::new(),
            width: 0,
            height: 0,
            parameters: BTreeMap::new(),
            source: String::new(),
            ready: false,
            links: BTreeMap::new(),
            enabled: BTreeSet::new(),
        }
    }
}

/// Everything a `MemoryDriver` remembers, apart from handle numbering.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryState {
    pub objects: BTreeMap<NativeHandle, MemoryObject>,
    /// Bind target (or texture unit) to bound object.
    pub bindings: BTreeMap<u32, NativeHandle>,
    pub program: NativeHandle,
    pub pipeline: NativeHandle,
    pub vertex_array: NativeHandle,
    pub capabilities: BTreeSet<u32>,
    pub viewport: [i32; 4],
    pub scissor: [i32; 4],
    pub clear_color: [f32; 4],
    /// A line per draw, clear, dispatch or blit.
    pub draws: Vec<String>,
    /// Debug group nesting, as the driver sees it.
    pub markers: Vec<String>,
    pub active_queries: BTreeMap<u32, NativeHandle>,
}

pub struct MemoryDriver {
    next_handle: NativeHandle,
    first_handle: NativeHandle,
    pub state: MemoryState,
    /// Every call executed, in order, as its `Display` form.
    pub executed: Vec<String>,
}

impl MemoryDriver {
    /// Create a driver whose first object gets handle `first_handle`.
    pub fn new(first_handle: NativeHandle) -> MemoryDriver {
        let first_handle = first_handle.max(1);
        MemoryDriver {
            next_handle: first_handle,
            first_handle,
            state: MemoryState::default(),
            executed: Vec::new(),
        }
    }

    pub fn object(&self, handle: NativeHandle) -> Option<&MemoryObject> {
        self.state.objects.get(&handle)
    }

    fn object_mut(&mut self, handle: NativeHandle, kind: ResourceKind) -> Result<&mut MemoryObject, DriverError> {
        match self.state.objects.get_mut(&handle) {
            Some(object) if object.kind == kind => Ok(object),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    /// Check a handle used as a bind argument, where zero means "unbind".
    fn check_bindable(&self, handle: NativeHandle, kind: ResourceKind) -> Result<(), DriverError> {
        if handle == 0 {
            return Ok(());
        }
        match self.state.objects.get(&handle) {
            Some(object) if object.kind == kind => Ok(()),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }
}

impl Driver for MemoryDriver {
    fn execute(&mut self, call: &Call<NativeHandle>) -> Result<Option<NativeHandle>, DriverError> {
        self.executed.push(call.to_string());

        match *call {
            Call::CreateResource { kind, .. } => {
                let handle = self.next_handle;
                self.next_handle += 1;
                self.state.objects.insert(handle, MemoryObject::new(kind));
                return Ok(Some(handle));
            }
            Call::DeleteResource { kind, resource } => {
                self.object_mut(resource, kind)?;
                self.state.objects.remove(&resource);
                self.state.bindings.retain(|_, bound| *bound != resource);
            }
            Call::BindBuffer { target, buffer } => {
                self.check_bindable(buffer, ResourceKind::Buffer)?;
                self.state.bindings.insert(target, buffer);
            }
            Call::BufferData { ref data, buffer, .. } => {
                self.object_mut(buffer, ResourceKind::Buffer)?.contents = data.clone();
            }
            Call::BufferSubData { offset, ref data, buffer } => {
                let object = self.object_mut(buffer, ResourceKind::Buffer)?;
                let start = offset as usize;
                let end = start
                    .checked_add(data.len())
                    .filter(|&end| end <= object.contents.len())
                    .ok_or(DriverError::Failed {
                        call: "BufferSubData",
                        message: format!("range {}+{} outside buffer", offset, data.len()),
                    })?;
                object.contents[start..end].copy_from_slice(data);
            }
            Call::BindTexture { unit, texture, .. } => {
                self.check_bindable(texture, ResourceKind::Texture)?;
                self.state.bindings.insert(0x1_0000 + unit, texture);
            }
            Call::TexStorage2d { width, height, texture, .. } => {
                let len = texel_bytes("TexStorage2d", width, height)?;
                let object = self.object_mut(texture, ResourceKind::Texture)?;
                object.width = width;
                object.height = height;
                object.contents = vec![0; len];
            }
            Call::TexImage2d { level, width, height, ref data, texture, .. } => {
                let len = texel_bytes("TexImage2d", width, height)?;
                let object = self.object_mut(texture, ResourceKind::Texture)?;
                if level == 0 {
                    object.width = width;
                    object.height = height;
                    object.contents = match data {
                        Some(data) => data.clone(),
                        None => vec![0; len],
                    };
                }
            }
            Call::TexSubImage2d { level, x, y, width, height, ref data, texture, .. } => {
                let object = self.object_mut(texture, ResourceKind::Texture)?;
                if level == 0 {
                    copy_region(object, x, y, width, height, data)?;
                }
            }
            Call::TexParameterI { pname, param, texture, .. } => {
                self.object_mut(texture, ResourceKind::Texture)?.parameters.insert(pname, param);
            }
            Call::ShaderSource { ref source, shader } => {
                let object = self.object_mut(shader, ResourceKind::Shader)?;
                object.source = source.clone();
                object.ready = false;
            }
            Call::CompileShader { shader } => {
                self.object_mut(shader, ResourceKind::Shader)?.ready = true;
            }
            Call::AttachShader { program, shader } => {
                self.object_mut(shader, ResourceKind::Shader)?;
                let object = self.object_mut(program, ResourceKind::Program)?;
                let slot = object.links.len() as u32;
                if !object.links.values().any(|&linked| linked == shader) {
                    object.links.insert(slot, shader);
                }
            }
            Call::LinkProgram { program } => {
                self.object_mut(program, ResourceKind::Program)?.ready = true;
            }
            Call::UseProgram { program } => {
                self.check_bindable(program, ResourceKind::Program)?;
                self.state.program = program;
            }
            Call::UseProgramStages { stages, pipeline, program } => {
                self.check_bindable(program, ResourceKind::Program)?;
                let object = self.object_mut(pipeline, ResourceKind::Pipeline)?;
                if program == 0 {
                    object.links.remove(&stages);
                } else {
                    object.links.insert(stages, program);
                }
            }
            Call::BindPipeline { pipeline } => {
                self.check_bindable(pipeline, ResourceKind::Pipeline)?;
                self.state.pipeline = pipeline;
            }
            Call::BindVertexArray { vertex_array } => {
                self.check_bindable(vertex_array, ResourceKind::VertexArray)?;
                self.state.vertex_array = vertex_array;
            }
            Call::VertexAttribPointer { index, vertex_array, buffer, .. } => {
                self.check_bindable(buffer, ResourceKind::Buffer)?;
                self.object_mut(vertex_array, ResourceKind::VertexArray)?.links.insert(index, buffer);
            }
            Call::EnableVertexAttribArray { index, vertex_array } => {
                self.object_mut(vertex_array, ResourceKind::VertexArray)?.enabled.insert(index);
            }
            Call::DisableVertexAttribArray { index, vertex_array } => {
                self.object_mut(vertex_array, ResourceKind::VertexArray)?.enabled.remove(&index);
            }
            Call::BindFramebuffer { target, framebuffer } => {
                self.check_bindable(framebuffer, ResourceKind::Framebuffer)?;
                self.state.bindings.insert(target, framebuffer);
            }
            Call::FramebufferTexture2d { attachment, framebuffer, texture, .. } => {
                self.check_bindable(texture, ResourceKind::Texture)?;
                let object = self.object_mut(framebuffer, ResourceKind::Framebuffer)?;
                if texture == 0 {
                    object.links.remove(&attachment);
                } else {
                    object.links.insert(attachment, texture);
                }
            }
            Call::Viewport { x, y, width, height } => self.state.viewport = [x, y, width, height],
            Call::Scissor { x, y, width, height } => self.state.scissor = [x, y, width, height],
            Call::Enable { cap } => {
                self.state.capabilities.insert(cap);
            }
            Call::Disable { cap } => {
                self.state.capabilities.remove(&cap);
            }
            Call::ClearColor { r, g, b, a } => self.state.clear_color = [r, g, b, a],
            Call::Clear { .. }
            | Call::DrawArrays { .. }
            | Call::DrawElements { .. }
            | Call::DispatchCompute { .. } => {
                self.state.draws.push(call.to_string());
            }
            Call::BlitFramebuffer { read, draw, .. } => {
                self.check_bindable(read, ResourceKind::Framebuffer)?;
                self.check_bindable(draw, ResourceKind::Framebuffer)?;
                self.state.draws.push(call.to_string());
            }
            Call::PushDebugGroup { ref message, .. } => self.state.markers.push(message.clone()),
            Call::PopDebugGroup {} => {
                self.state.markers.pop();
            }
            Call::DebugMarker { .. } => {}
            Call::BeginQuery { target, query } => {
                self.object_mut(query, ResourceKind::Query)?;
                self.state.active_queries.insert(target, query);
            }
            Call::EndQuery { target } => {
                self.state.active_queries.remove(&target);
            }
            Call::ClientWaitSync { sync, .. } => {
                self.object_mut(sync, ResourceKind::Sync)?;
            }
            Call::Flush {} => {}
        }

        Ok(None)
    }

    fn read_contents(
        &mut self,
        kind: ResourceKind,
        handle: NativeHandle,
        _attributes: &ResourceAttributes,
    ) -> Result<Vec<u8>, DriverError> {
        let object = self.object_mut(handle, kind)?;
        Ok(match kind {
            ResourceKind::Buffer | ResourceKind::Texture => object.contents.clone(),
            _ => Vec::new(),
        })
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        self.state = MemoryState::default();
        self.executed.clear();
        self.next_handle = self.first_handle;
        Ok(())
    }
}

/// The size of a `width` by `height` block of 4-byte texels, refusing
/// anything larger than a snapshot could hold.
fn texel_bytes(call: &'static str, width: u32, height: u32) -> Result<usize, DriverError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|texels| texels.checked_mul(4))
        .filter(|&len| len <= MAX_CONTENTS_LEN)
        .ok_or_else(|| DriverError::Failed { call, message: format!("{}x{} texture is too large", width, height) })
}

/// Copy a `width` by `height` block of 4-byte texels into a texture.
fn copy_region(
    object: &mut MemoryObject,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    data: &[u8],
) -> Result<(), DriverError> {
    let out_of_bounds = || DriverError::Failed {
        call: "TexSubImage2d",
        message: format!("region {}x{} at ({}, {}) outside texture", width, height, x, y),
    };
    if x < 0
        || y < 0
        || x as u64 + width as u64 > object.width as u64
        || y as u64 + height as u64 > object.height as u64
    {
        return Err(out_of_bounds());
    }
    if data.len() < texel_bytes("TexSubImage2d", width, height)? {
        return Err(out_of_bounds());
    }

    let row_len = width as usize * 4;
    let stride = object.width as usize * 4;
    for row in 0..height as usize {
        let dst = (y as usize + row) * stride + x as usize * 4;
        let src = row * row_len;
        object
            .contents
            .get_mut(dst..dst + row_len)
            .ok_or_else(out_of_bounds)?
            .copy_from_slice(&data[src..src + row_len]);
    }
    Ok(())
}

#[test]
fn test_handles_and_contents() {
    let mut driver = MemoryDriver::new(7);
    let buffer = driver
        .execute(&Call::CreateResource { kind: ResourceKind::Buffer, subtype: 0 })
        .unwrap()
        .unwrap();
    assert_eq!(buffer, 7);
    driver.execute(&Call::BufferData { usage: 0, data: vec![1, 2, 3, 4], buffer }).unwrap();
    driver.execute(&Call::BufferSubData { offset: 2, data: vec![9], buffer }).unwrap();
    assert_eq!(driver.object(buffer).unwrap().contents, [1, 2, 9, 4]);

    assert_eq!(
        driver.execute(&Call::BufferSubData { offset: 4, data: vec![1], buffer }),
        Err(DriverError::Failed { call: "BufferSubData", message: "range 4+1 outside buffer".to_owned() })
    );
    assert_eq!(
        driver.execute(&Call::CompileShader { shader: buffer }),
        Err(DriverError::InvalidHandle(buffer))
    );

    driver.reset().unwrap();
    assert!(driver.executed.is_empty());
    let again = driver
        .execute(&Call::CreateResource { kind: ResourceKind::Texture, subtype: 0 })
        .unwrap();
    assert_eq!(again, Some(7));
}

#[test]
fn test_tex_sub_image() {
    let mut driver = MemoryDriver::new(1);
    let texture = driver
        .execute(&Call::CreateResource { kind: ResourceKind::Texture, subtype: 0 })
        .unwrap()
        .unwrap();
    driver
        .execute(&Call::TexStorage2d { target: 0, levels: 1, internal_format: 0, width: 2, height: 2, texture })
        .unwrap();
    driver
        .execute(&Call::TexSubImage2d {
            target: 0, level: 0, x: 1, y: 1, width: 1, height: 1,
            format: 0, ty: 0, data: vec![5, 6, 7, 8], texture,
        })
        .unwrap();

    let mut expected = vec![0; 16];
    expected[12..].copy_from_slice(&[5, 6, 7, 8]);
    assert_eq!(driver.object(texture).unwrap().contents, expected);
}

#[test]
fn test_huge_textures_fail() {
    let mut driver = MemoryDriver::new(1);
    let texture = driver
        .execute(&Call::CreateResource { kind: ResourceKind::Texture, subtype: 0 })
        .unwrap()
        .unwrap();
    let storage = Call::TexStorage2d {
        target: 0, levels: 1, internal_format: 0, width: u32::MAX, height: u32::MAX, texture,
    };
    assert!(matches!(driver.execute(&storage), Err(DriverError::Failed { call: "TexStorage2d", .. })));
    let image = Call::TexImage2d {
        target: 0, level: 0, internal_format: 0, width: 1 << 16, height: 1 << 16,
        format: 0, ty: 0, data: None, texture,
    };
    assert!(matches!(driver.execute(&image), Err(DriverError::Failed { call: "TexImage2d", .. })));
    assert!(driver.object(texture).unwrap().contents.is_empty());
}
