//! A `Driver` that issues calls to a `gleam` GL context.
//!
//! Recorded calls name the objects they modify, but GL mostly operates on
//! whatever is bound. For those calls the driver binds the object to a
//! target, makes the call, and puts back whatever was bound before, so the
//! application's own bindings are never disturbed.
//!
//! `gleam` has no program pipelines, samplers, compute dispatch or
//! base-vertex draws; calls needing them fail with `Unsupported`.

use crate::call::Call;
use crate::debug_messages::DebugMessage;
use crate::driver::{Driver, DriverError};
use crate::resource::{NativeHandle, ResourceAttributes, ResourceKind};

use gleam::gl::{self, GLenum, GLsync, GLuint, Gl};

use std::rc::Rc;

pub struct GlDriver {
    gl: Rc<dyn Gl>,
    /// Every object this driver has created and not deleted, so `reset`
    /// can dispose of them.
    live: Vec<(ResourceKind, NativeHandle)>,
}

fn name(handle: NativeHandle) -> Result<GLuint, DriverError> {
    GLuint::try_from(handle).map_err(|_| DriverError::InvalidHandle(handle))
}

fn sync(handle: NativeHandle) -> GLsync {
    handle as usize as GLsync
}

/// Only `WAIT_FAILED` is an error; a timeout is an ordinary outcome.
fn wait_status(status: GLenum) -> Result<(), DriverError> {
    if status == gl::WAIT_FAILED {
        return Err(DriverError::Failed { call: "ClientWaitSync", message: "wait failed".to_owned() });
    }
    Ok(())
}

/// The `get_integer_v` query for what is bound to a texture target.
fn texture_binding(target: GLenum) -> Result<GLenum, DriverError> {
    Ok(match target {
        gl::TEXTURE_2D => gl::TEXTURE_BINDING_2D,
        gl::TEXTURE_2D_ARRAY => gl::TEXTURE_BINDING_2D_ARRAY,
        gl::TEXTURE_RECTANGLE => gl::TEXTURE_BINDING_RECTANGLE,
        gl::TEXTURE_CUBE_MAP
        | gl::TEXTURE_CUBE_MAP_POSITIVE_X
        | gl::TEXTURE_CUBE_MAP_NEGATIVE_X
        | gl::TEXTURE_CUBE_MAP_POSITIVE_Y
        | gl::TEXTURE_CUBE_MAP_NEGATIVE_Y
        | gl::TEXTURE_CUBE_MAP_POSITIVE_Z
        | gl::TEXTURE_CUBE_MAP_NEGATIVE_Z => gl::TEXTURE_BINDING_CUBE_MAP,
        _ => return Err(DriverError::Unsupported("texture target")),
    })
}

/// The target to bind to when operating on a texture whose calls use
/// `target`. Cube map faces are bound through the cube map itself.
fn texture_bind_target(target: GLenum) -> GLenum {
    match texture_binding(target) {
        Ok(gl::TEXTURE_BINDING_CUBE_MAP) => gl::TEXTURE_CUBE_MAP,
        _ => target,
    }
}

fn framebuffer_binding(target: GLenum) -> GLenum {
    match target {
        gl::READ_FRAMEBUFFER => gl::READ_FRAMEBUFFER_BINDING,
        _ => gl::DRAW_FRAMEBUFFER_BINDING,
    }
}

/// Bytes per texel for client-side pixel data.
fn texel_size(format: GLenum, ty: GLenum) -> Result<usize, DriverError> {
    let components = match format {
        gl::RED | gl::ALPHA | gl::LUMINANCE | gl::DEPTH_COMPONENT => 1,
        gl::RG | gl::LUMINANCE_ALPHA => 2,
        gl::RGB => 3,
        gl::RGBA | gl::BGRA => 4,
        _ => return Err(DriverError::Unsupported("texel format")),
    };
    let size = match ty {
        gl::UNSIGNED_BYTE | gl::BYTE => 1,
        gl::UNSIGNED_SHORT | gl::SHORT | gl::HALF_FLOAT => 2,
        gl::UNSIGNED_INT | gl::INT | gl::FLOAT => 4,
        _ => return Err(DriverError::Unsupported("texel type")),
    };
    Ok(components * size)
}

impl GlDriver {
    pub fn new(gl: Rc<dyn Gl>) -> GlDriver {
        GlDriver { gl, live: Vec::new() }
    }

    pub fn gl(&self) -> &Rc<dyn Gl> {
        &self.gl
    }

    fn binding(&self, query: GLenum) -> GLuint {
        let mut value = [0];
        unsafe {
            self.gl.get_integer_v(query, &mut value);
        }
        value[0] as GLuint
    }

    /// Run `f` with `texture` bound to `target` on the active unit.
    fn with_texture<T>(&self, target: GLenum, texture: GLuint, f: impl FnOnce(&dyn Gl) -> T) -> Result<T, DriverError> {
        let bind_target = texture_bind_target(target);
        let previous = self.binding(texture_binding(target)?);
        self.gl.bind_texture(bind_target, texture);
        let result = f(&*self.gl);
        self.gl.bind_texture(bind_target, previous);
        Ok(result)
    }

    fn with_buffer<T>(&self, target: GLenum, query: GLenum, buffer: GLuint, f: impl FnOnce(&dyn Gl) -> T) -> T {
        let previous = self.binding(query);
        self.gl.bind_buffer(target, buffer);
        let result = f(&*self.gl);
        self.gl.bind_buffer(target, previous);
        result
    }

    fn with_vertex_array<T>(&self, vao: GLuint, f: impl FnOnce(&dyn Gl) -> T) -> T {
        let previous = self.binding(gl::VERTEX_ARRAY_BINDING);
        self.gl.bind_vertex_array(vao);
        let result = f(&*self.gl);
        self.gl.bind_vertex_array(previous);
        result
    }

    fn with_framebuffer<T>(&self, target: GLenum, framebuffer: GLuint, f: impl FnOnce(&dyn Gl) -> T) -> T {
        let previous = self.binding(framebuffer_binding(target));
        self.gl.bind_framebuffer(target, framebuffer);
        let result = f(&*self.gl);
        self.gl.bind_framebuffer(target, previous);
        result
    }

    fn create(&mut self, kind: ResourceKind, subtype: u32) -> Result<NativeHandle, DriverError> {
        let gl = &self.gl;
        let handle = match kind {
            ResourceKind::Buffer => gl.gen_buffers(1).first().copied().unwrap_or(0) as NativeHandle,
            ResourceKind::Texture => gl.gen_textures(1).first().copied().unwrap_or(0) as NativeHandle,
            ResourceKind::Framebuffer => gl.gen_framebuffers(1).first().copied().unwrap_or(0) as NativeHandle,
            ResourceKind::Renderbuffer => gl.gen_renderbuffers(1).first().copied().unwrap_or(0) as NativeHandle,
            ResourceKind::VertexArray => gl.gen_vertex_arrays(1).first().copied().unwrap_or(0) as NativeHandle,
            ResourceKind::Query => gl.gen_queries(1).first().copied().unwrap_or(0) as NativeHandle,
            ResourceKind::Shader => gl.create_shader(subtype) as NativeHandle,
            ResourceKind::Program => gl.create_program() as NativeHandle,
            ResourceKind::Sync => gl.fence_sync(gl::SYNC_GPU_COMMANDS_COMPLETE, 0) as usize as NativeHandle,
            ResourceKind::Pipeline => return Err(DriverError::Unsupported("program pipelines")),
            ResourceKind::Sampler => return Err(DriverError::Unsupported("sampler objects")),
        };
        if handle == 0 {
            return Err(DriverError::Failed {
                call: "CreateResource",
                message: format!("driver returned no {:?}", kind),
            });
        }
        self.live.push((kind, handle));
        Ok(handle)
    }

    fn delete(&mut self, kind: ResourceKind, handle: NativeHandle) -> Result<(), DriverError> {
        let gl = &self.gl;
        match kind {
            ResourceKind::Buffer => gl.delete_buffers(&[name(handle)?]),
            ResourceKind::Texture => gl.delete_textures(&[name(handle)?]),
            ResourceKind::Framebuffer => gl.delete_framebuffers(&[name(handle)?]),
            ResourceKind::Renderbuffer => gl.delete_renderbuffers(&[name(handle)?]),
            ResourceKind::VertexArray => gl.delete_vertex_arrays(&[name(handle)?]),
            ResourceKind::Query => gl.delete_queries(&[name(handle)?]),
            ResourceKind::Shader => gl.delete_shader(name(handle)?),
            ResourceKind::Program => gl.delete_program(name(handle)?),
            ResourceKind::Sync => gl.delete_sync(sync(handle)),
            ResourceKind::Pipeline => return Err(DriverError::Unsupported("program pipelines")),
            ResourceKind::Sampler => return Err(DriverError::Unsupported("sampler objects")),
        }
        self.live.retain(|&live| live != (kind, handle));
        Ok(())
    }

    fn check_status(&self, call: &'static str, object: GLuint) {
        let mut status = [0];
        let log = unsafe {
            if call == "CompileShader" {
                self.gl.get_shader_iv(object, gl::COMPILE_STATUS, &mut status);
                if status[0] != 0 {
                    return;
                }
                self.gl.get_shader_info_log(object)
            } else {
                self.gl.get_program_iv(object, gl::LINK_STATUS, &mut status);
                if status[0] != 0 {
                    return;
                }
                self.gl.get_program_info_log(object)
            }
        };
        tracing::warn!(call, object, %log, "failed");
    }
}

impl Driver for GlDriver {
    fn execute(&mut self, call: &Call<NativeHandle>) -> Result<Option<NativeHandle>, DriverError> {
        match *call {
            Call::CreateResource { kind, subtype } => return self.create(kind, subtype).map(Some),
            Call::DeleteResource { kind, resource } => self.delete(kind, resource)?,

            Call::BindBuffer { target, buffer } => self.gl.bind_buffer(target, name(buffer)?),
            Call::BufferData { usage, ref data, buffer } => {
                self.with_buffer(gl::COPY_WRITE_BUFFER, gl::COPY_WRITE_BUFFER_BINDING, name(buffer)?, |gl| {
                    gl.buffer_data_untyped(
                        gl::COPY_WRITE_BUFFER,
                        data.len() as isize,
                        data.as_ptr() as *const _,
                        usage,
                    )
                })
            }
            Call::BufferSubData { offset, ref data, buffer } => {
                self.with_buffer(gl::COPY_WRITE_BUFFER, gl::COPY_WRITE_BUFFER_BINDING, name(buffer)?, |gl| {
                    gl.buffer_sub_data_untyped(
                        gl::COPY_WRITE_BUFFER,
                        offset as isize,
                        data.len() as isize,
                        data.as_ptr() as *const _,
                    )
                })
            }

            Call::BindTexture { unit, target, texture } => {
                self.gl.active_texture(gl::TEXTURE0 + unit);
                self.gl.bind_texture(target, name(texture)?);
            }
            Call::TexStorage2d { target, levels, internal_format, width, height, texture } => {
                self.with_texture(target, name(texture)?, |gl| {
                    gl.tex_storage_2d(target, levels as i32, internal_format, width as i32, height as i32)
                })?
            }
            Call::TexImage2d { target, level, internal_format, width, height, format, ty, ref data, texture } => {
                self.with_texture(target, name(texture)?, |gl| {
                    gl.tex_image_2d(
                        target,
                        level,
                        internal_format as i32,
                        width as i32,
                        height as i32,
                        0,
                        format,
                        ty,
                        data.as_deref(),
                    )
                })?
            }
            Call::TexSubImage2d { target, level, x, y, width, height, format, ty, ref data, texture } => {
                self.with_texture(target, name(texture)?, |gl| {
                    gl.tex_sub_image_2d(target, level, x, y, width as i32, height as i32, format, ty, data)
                })?
            }
            Call::TexParameterI { target, pname, param, texture } => {
                self.with_texture(target, name(texture)?, |gl| {
                    gl.tex_parameter_i(texture_bind_target(target), pname, param)
                })?
            }

            Call::ShaderSource { ref source, shader } => self.gl.shader_source(name(shader)?, &[source.as_bytes()]),
            Call::CompileShader { shader } => {
                self.gl.compile_shader(name(shader)?);
                self.check_status("CompileShader", name(shader)?);
            }
            Call::AttachShader { program, shader } => self.gl.attach_shader(name(program)?, name(shader)?),
            Call::LinkProgram { program } => {
                self.gl.link_program(name(program)?);
                self.check_status("LinkProgram", name(program)?);
            }
            Call::UseProgram { program } => self.gl.use_program(name(program)?),
            Call::UseProgramStages { .. } | Call::BindPipeline { .. } => {
                return Err(DriverError::Unsupported("program pipelines"))
            }

            Call::BindVertexArray { vertex_array } => self.gl.bind_vertex_array(name(vertex_array)?),
            Call::VertexAttribPointer { index, size, ty, normalized, stride, offset, vertex_array, buffer } => {
                let buffer = name(buffer)?;
                self.with_vertex_array(name(vertex_array)?, |gl| {
                    let previous = {
                        let mut value = [0];
                        unsafe { gl.get_integer_v(gl::ARRAY_BUFFER_BINDING, &mut value) };
                        value[0] as GLuint
                    };
                    gl.bind_buffer(gl::ARRAY_BUFFER, buffer);
                    gl.vertex_attrib_pointer(index, size, ty, normalized, stride, offset as GLuint);
                    gl.bind_buffer(gl::ARRAY_BUFFER, previous);
                })
            }
            Call::EnableVertexAttribArray { index, vertex_array } => {
                self.with_vertex_array(name(vertex_array)?, |gl| gl.enable_vertex_attrib_array(index))
            }
            Call::DisableVertexAttribArray { index, vertex_array } => {
                self.with_vertex_array(name(vertex_array)?, |gl| gl.disable_vertex_attrib_array(index))
            }

            Call::BindFramebuffer { target, framebuffer } => self.gl.bind_framebuffer(target, name(framebuffer)?),
            Call::FramebufferTexture2d { target, attachment, textarget, level, framebuffer, texture } => {
                let texture = name(texture)?;
                self.with_framebuffer(target, name(framebuffer)?, |gl| {
                    gl.framebuffer_texture_2d(target, attachment, textarget, texture, level)
                })
            }

            Call::Viewport { x, y, width, height } => self.gl.viewport(x, y, width, height),
            Call::Scissor { x, y, width, height } => self.gl.scissor(x, y, width, height),
            Call::Enable { cap } => self.gl.enable(cap),
            Call::Disable { cap } => self.gl.disable(cap),
            Call::ClearColor { r, g, b, a } => self.gl.clear_color(r, g, b, a),

            Call::Clear { mask } => self.gl.clear(mask),
            Call::DrawArrays { mode, first, count, instances } => {
                if instances > 1 {
                    self.gl.draw_arrays_instanced(mode, first, count, instances);
                } else {
                    self.gl.draw_arrays(mode, first, count);
                }
            }
            Call::DrawElements { mode, count, index_type, offset, instances, base_vertex } => {
                if base_vertex != 0 {
                    return Err(DriverError::Unsupported("base-vertex draws"));
                }
                if instances > 1 {
                    self.gl.draw_elements_instanced(mode, count, index_type, offset as GLuint, instances);
                } else {
                    self.gl.draw_elements(mode, count, index_type, offset as GLuint);
                }
            }
            Call::DispatchCompute { .. } => return Err(DriverError::Unsupported("compute dispatch")),
            Call::BlitFramebuffer {
                src_x0, src_y0, src_x1, src_y1, dst_x0, dst_y0, dst_x1, dst_y1, mask, filter, read, draw,
            } => {
                let draw = name(draw)?;
                self.with_framebuffer(gl::READ_FRAMEBUFFER, name(read)?, |gl| {
                    let previous = {
                        let mut value = [0];
                        unsafe { gl.get_integer_v(gl::DRAW_FRAMEBUFFER_BINDING, &mut value) };
                        value[0] as GLuint
                    };
                    gl.bind_framebuffer(gl::DRAW_FRAMEBUFFER, draw);
                    gl.blit_framebuffer(src_x0, src_y0, src_x1, src_y1, dst_x0, dst_y0, dst_x1, dst_y1, mask, filter);
                    gl.bind_framebuffer(gl::DRAW_FRAMEBUFFER, previous);
                })
            }

            Call::PushDebugGroup { id, ref message } => {
                self.gl.push_debug_group_khr(gl::DEBUG_SOURCE_APPLICATION, id, message)
            }
            Call::PopDebugGroup {} => self.gl.pop_debug_group_khr(),
            Call::DebugMarker { ref message } => self.gl.insert_event_marker_ext(message),

            Call::BeginQuery { target, query } => self.gl.begin_query(target, name(query)?),
            Call::EndQuery { target } => self.gl.end_query(target),
            Call::ClientWaitSync { flags, timeout, sync: handle } => {
                wait_status(self.gl.client_wait_sync(sync(handle), flags, timeout))?
            }
            Call::Flush {} => self.gl.flush(),
        }
        Ok(None)
    }

    fn read_contents(
        &mut self,
        kind: ResourceKind,
        handle: NativeHandle,
        attributes: &ResourceAttributes,
    ) -> Result<Vec<u8>, DriverError> {
        match (kind, attributes) {
            (ResourceKind::Buffer, ResourceAttributes::Buffer(buffer)) => {
                if buffer.size == 0 {
                    return Ok(Vec::new());
                }
                let size = buffer.size as usize;
                self.with_buffer(gl::COPY_READ_BUFFER, gl::COPY_READ_BUFFER_BINDING, name(handle)?, |gl| {
                    let mapped = gl.map_buffer_range(gl::COPY_READ_BUFFER, 0, size as isize, gl::MAP_READ_BIT);
                    if mapped.is_null() {
                        return Err(DriverError::Failed {
                            call: "map_buffer_range",
                            message: format!("cannot map {} bytes of buffer {}", size, handle),
                        });
                    }
                    let contents = unsafe { std::slice::from_raw_parts(mapped as *const u8, size) }.to_vec();
                    gl.unmap_buffer(gl::COPY_READ_BUFFER);
                    Ok(contents)
                })
            }
            (ResourceKind::Texture, ResourceAttributes::Texture(texture)) => {
                if texture.width == 0 || texture.height == 0 {
                    return Ok(Vec::new());
                }
                let (format, ty) = match (texture.format, texture.ty) {
                    (0, _) | (_, 0) => (gl::RGBA, gl::UNSIGNED_BYTE),
                    pair => pair,
                };
                let len = texture.width as usize * texture.height as usize * texel_size(format, ty)?;
                let mut contents = vec![0; len];
                self.with_texture(texture.target, name(handle)?, |gl| {
                    gl.get_tex_image_into_buffer(texture.target, 0, format, ty, &mut contents)
                })?;
                Ok(contents)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        tracing::debug!(objects = self.live.len(), "deleting replay objects");
        for (kind, handle) in std::mem::take(&mut self.live).into_iter().rev() {
            self.delete(kind, handle)?;
        }
        let gl = &self.gl;
        gl.use_program(0);
        gl.bind_vertex_array(0);
        gl.bind_framebuffer(gl::FRAMEBUFFER, 0);
        gl.bind_buffer(gl::ARRAY_BUFFER, 0);
        gl.active_texture(gl::TEXTURE0);
        Ok(())
    }

    fn take_debug_messages(&mut self) -> Vec<DebugMessage> {
        self.gl
            .get_debug_messages()
            .into_iter()
            .map(|message| DebugMessage {
                source: message.source,
                ty: message.ty,
                id: message.id,
                severity: message.severity,
                message: message.message,
            })
            .collect()
    }
}

#[test]
fn test_texel_size() {
    assert_eq!(texel_size(gl::RGBA, gl::UNSIGNED_BYTE), Ok(4));
    assert_eq!(texel_size(gl::RG, gl::HALF_FLOAT), Ok(4));
    assert_eq!(texel_size(gl::RGB, gl::FLOAT), Ok(12));
    assert_eq!(texel_size(0x1234, gl::FLOAT), Err(DriverError::Unsupported("texel format")));
}

#[test]
fn test_binding_queries() {
    assert_eq!(texture_binding(gl::TEXTURE_CUBE_MAP_NEGATIVE_Y), Ok(gl::TEXTURE_BINDING_CUBE_MAP));
    assert_eq!(texture_bind_target(gl::TEXTURE_CUBE_MAP_POSITIVE_Z), gl::TEXTURE_CUBE_MAP);
    assert_eq!(texture_bind_target(gl::TEXTURE_2D), gl::TEXTURE_2D);
    assert_eq!(framebuffer_binding(gl::FRAMEBUFFER), gl::DRAW_FRAMEBUFFER_BINDING);
    assert!(name(1 << 40).is_err());
}

#[test]
fn test_wait_status() {
    assert_eq!(wait_status(gl::CONDITION_SATISFIED), Ok(()));
    assert_eq!(wait_status(gl::TIMEOUT_EXPIRED), Ok(()));
    assert!(matches!(wait_status(gl::WAIT_FAILED), Err(DriverError::Failed { call: "ClientWaitSync", .. })));
}
