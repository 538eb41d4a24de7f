//! Full-state snapshots of resources.
//!
//! A `ResourceSnapshot` carries everything needed to rebuild one resource
//! from nothing: its kind-specific attributes, and for buffers and textures
//! the contents read back from the driver. Capture writes one as an
//! `InitialState` chunk for every resource a frame used but did not create,
//! and as a `StateRefresh` chunk in place of the elided mutations of a
//! high-traffic resource.
//!
//! Replay never interprets a snapshot directly. `restore_calls` expands it
//! into ordinary calls, which then go through the same path as recorded
//! ones.
//!
//! ## Serialized form
//!
//! The id, the kind, and the attributes, followed by the length of the
//! contents, the length of their compressed form, and the compressed bytes,
//! as written by `rle::write`.

use crate::call::Call;
use crate::driver::{Driver, DriverError};
use crate::resource::{ResourceAttributes, ResourceId, ResourceKind, ResourceManager};
use crate::rle;
use crate::serialize::{read_len, take, write_len, Deserialize, DeserializeError, Serialize};

use gleam::gl;
use std::io;

/// The largest contents a snapshot may expand to when read from a log.
/// Buffer sizes and texture dimensions recorded in its attributes are held
/// to the same bound, since restoring allocates them.
pub const MAX_CONTENTS_LEN: usize = 256 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub attributes: ResourceAttributes,
    pub contents: Vec<u8>,
}

impl Default for ResourceSnapshot {
    fn default() -> ResourceSnapshot {
        ResourceSnapshot {
            id: ResourceId::NULL,
            kind: ResourceKind::Buffer,
            attributes: ResourceAttributes::None,
            contents: Vec::new(),
        }
    }
}

/// How a snapshot is to be applied.
#[derive(Clone, Copy, Debug)]
pub enum RestoreMode<'a> {
    /// The resource does not exist yet: create it and set everything.
    Create,
    /// The resource exists with the given attributes: bring its state up to
    /// date, leaving contents alone.
    Refresh(&'a ResourceAttributes),
}

impl ResourceSnapshot {
    /// Snapshot the live resource `id`, reading its contents from `driver`.
    pub fn capture<D>(manager: &ResourceManager, driver: &mut D, id: ResourceId) -> Result<ResourceSnapshot, DriverError>
    where
        D: Driver + ?Sized,
    {
        let record = match manager.record(id) {
            Some(record) if record.alive => record,
            _ => {
                return Err(DriverError::Failed {
                    call: "snapshot",
                    message: format!("{} is not a live resource", id),
                })
            }
        };
        let contents = driver.read_contents(record.kind, record.handle, &record.attributes)?;
        Ok(ResourceSnapshot {
            id,
            kind: record.kind,
            attributes: live_references(record.attributes.clone(), manager),
            contents,
        })
    }

    /// Snapshot a live resource's attributes alone, without its contents,
    /// as a state refresh needs.
    pub fn state_only(manager: &ResourceManager, id: ResourceId) -> Option<ResourceSnapshot> {
        let record = manager.record(id).filter(|record| record.alive)?;
        Some(ResourceSnapshot {
            id,
            kind: record.kind,
            attributes: live_references(record.attributes.clone(), manager),
            contents: Vec::new(),
        })
    }

    /// Expand this snapshot into the calls that rebuild it.
    ///
    /// Each call is paired with the id it creates, which is null for all but
    /// the leading `CreateResource` of `RestoreMode::Create`.
    pub fn restore_calls(&self, mode: RestoreMode) -> Vec<(Call<ResourceId>, ResourceId)> {
        let id = self.id;
        let mut calls = Vec::new();
        let create = matches!(mode, RestoreMode::Create);
        if create {
            let subtype = match &self.attributes {
                ResourceAttributes::Shader(shader) => shader.stage,
                _ => 0,
            };
            calls.push((Call::CreateResource { kind: self.kind, subtype }, id));
        }
        let mut push = |call: Call<ResourceId>| calls.push((call, ResourceId::NULL));

        match &self.attributes {
            ResourceAttributes::None => {}
            ResourceAttributes::Buffer(buffer) => {
                if create {
                    let data = if self.contents.is_empty() {
                        vec![0; buffer.size as usize]
                    } else {
                        self.contents.clone()
                    };
                    push(Call::BufferData { usage: buffer.usage, data, buffer: id });
                }
            }
            ResourceAttributes::Texture(texture) => {
                if create && texture.target != 0 && texture.width != 0 {
                    let data = if self.contents.is_empty() { None } else { Some(self.contents.clone()) };
                    if texture.immutable {
                        push(Call::TexStorage2d {
                            target: texture.target,
                            levels: texture.levels,
                            internal_format: texture.internal_format,
                            width: texture.width,
                            height: texture.height,
                            texture: id,
                        });
                        if let Some(data) = data {
                            push(Call::TexSubImage2d {
                                target: texture.target,
                                level: 0,
                                x: 0,
                                y: 0,
                                width: texture.width,
                                height: texture.height,
                                format: texture.format,
                                ty: texture.ty,
                                data,
                                texture: id,
                            });
                        }
                    } else {
                        push(Call::TexImage2d {
                            target: texture.target,
                            level: 0,
                            internal_format: texture.internal_format,
                            width: texture.width,
                            height: texture.height,
                            format: texture.format,
                            ty: texture.ty,
                            data,
                            texture: id,
                        });
                    }
                }
                for &(pname, param) in &texture.parameters {
                    push(Call::TexParameterI { target: texture.target, pname, param, texture: id });
                }
            }
            ResourceAttributes::Shader(shader) => {
                if create {
                    if !shader.source.is_empty() {
                        push(Call::ShaderSource { source: shader.source.clone(), shader: id });
                    }
                    if shader.compiled {
                        push(Call::CompileShader { shader: id });
                    }
                }
            }
            ResourceAttributes::Program(program) => {
                if create {
                    for &shader in &program.shaders {
                        push(Call::AttachShader { program: id, shader });
                    }
                    if program.linked {
                        push(Call::LinkProgram { program: id });
                    }
                }
            }
            ResourceAttributes::Pipeline(pipeline) => {
                if let RestoreMode::Refresh(ResourceAttributes::Pipeline(previous)) = mode {
                    for &(stages, _) in &previous.stages {
                        if !pipeline.stages.iter().any(|&(current, _)| current == stages) {
                            push(Call::UseProgramStages { stages, pipeline: id, program: ResourceId::NULL });
                        }
                    }
                }
                for &(stages, program) in &pipeline.stages {
                    push(Call::UseProgramStages { stages, pipeline: id, program });
                }
            }
            ResourceAttributes::VertexArray(vao) => {
                for attrib in &vao.attribs {
                    push(Call::VertexAttribPointer {
                        index: attrib.index,
                        size: attrib.size,
                        ty: attrib.ty,
                        normalized: attrib.normalized,
                        stride: attrib.stride,
                        offset: attrib.offset,
                        vertex_array: id,
                        buffer: attrib.buffer,
                    });
                    push(if attrib.enabled {
                        Call::EnableVertexAttribArray { index: attrib.index, vertex_array: id }
                    } else {
                        Call::DisableVertexAttribArray { index: attrib.index, vertex_array: id }
                    });
                }
            }
            ResourceAttributes::Framebuffer(framebuffer) => {
                if let RestoreMode::Refresh(ResourceAttributes::Framebuffer(previous)) = mode {
                    for old in &previous.attachments {
                        if !framebuffer.attachments.iter().any(|a| a.attachment == old.attachment) {
                            push(Call::FramebufferTexture2d {
                                target: gl::FRAMEBUFFER,
                                attachment: old.attachment,
                                textarget: old.textarget,
                                level: 0,
                                framebuffer: id,
                                texture: ResourceId::NULL,
                            });
                        }
                    }
                }
                for attachment in &framebuffer.attachments {
                    push(Call::FramebufferTexture2d {
                        target: gl::FRAMEBUFFER,
                        attachment: attachment.attachment,
                        textarget: attachment.textarget,
                        level: attachment.level,
                        framebuffer: id,
                        texture: attachment.texture,
                    });
                }
            }
        }

        calls
    }
}

/// Drop references to released resources, which replay could not resolve.
fn live_references(mut attributes: ResourceAttributes, manager: &ResourceManager) -> ResourceAttributes {
    let live = |id: ResourceId| id.is_null() || manager.is_live(id);
    match &mut attributes {
        ResourceAttributes::Program(program) => program.shaders.retain(|&shader| live(shader)),
        ResourceAttributes::Pipeline(pipeline) => pipeline.stages.retain(|&(_, program)| live(program)),
        ResourceAttributes::VertexArray(vao) => {
            for attrib in &mut vao.attribs {
                if !live(attrib.buffer) {
                    attrib.buffer = ResourceId::NULL;
                }
            }
        }
        ResourceAttributes::Framebuffer(framebuffer) => {
            framebuffer.attachments.retain(|attachment| live(attachment.texture))
        }
        _ => {}
    }
    attributes
}

impl Serialize for ResourceSnapshot {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        self.id.serialize(stream)?;
        self.kind.serialize(stream)?;
        self.attributes.serialize(stream)?;

        let mut compressed = Vec::new();
        rle::write(&mut compressed, &self.contents)?;
        write_len(stream, self.contents.len())?;
        write_len(stream, compressed.len())?;
        stream.write_all(&compressed)
    }
}

impl<'b> Deserialize<'b> for ResourceSnapshot {
    fn deserialize(buf: &mut &'b [u8]) -> Result<ResourceSnapshot, DeserializeError> {
        let id = ResourceId::deserialize(buf)?;
        let kind = ResourceKind::deserialize(buf)?;
        let attributes = ResourceAttributes::deserialize(buf)?;
        check_sizes(&attributes)?;
        let len = read_len(buf)?;
        if len > MAX_CONTENTS_LEN {
            return Err(DeserializeError::BadValue { what: "contents length", value: len as u64 });
        }
        let compressed_len = read_len(buf)?;
        let mut compressed = take(buf, compressed_len)?;
        let contents = rle::read(&mut compressed, Some(len))?;
        if contents.len() != len {
            return Err(DeserializeError::BadValue { what: "contents length", value: contents.len() as u64 });
        }
        Ok(ResourceSnapshot { id, kind, attributes, contents })
    }
}

/// Reject attributes that would make `restore_calls` allocate more than
/// `MAX_CONTENTS_LEN` bytes.
fn check_sizes(attributes: &ResourceAttributes) -> Result<(), DeserializeError> {
    match attributes {
        ResourceAttributes::Buffer(buffer) if buffer.size > MAX_CONTENTS_LEN as u64 => {
            Err(DeserializeError::BadValue { what: "buffer size", value: buffer.size })
        }
        ResourceAttributes::Texture(texture) => {
            let bytes = u64::from(texture.width)
                .checked_mul(u64::from(texture.height))
                .and_then(|texels| texels.checked_mul(4));
            match bytes {
                Some(bytes) if bytes <= MAX_CONTENTS_LEN as u64 => Ok(()),
                _ => Err(DeserializeError::BadValue { what: "texture size", value: bytes.unwrap_or(u64::MAX) }),
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{
        BufferAttributes, FramebufferAttachment, FramebufferAttributes, ProgramAttributes,
        TextureAttributes,
    };

    fn id(raw: u64) -> ResourceId {
        ResourceId::from_raw(raw)
    }

    #[test]
    fn test_contents_are_compressed() {
        let snapshot = ResourceSnapshot {
            id: id(3),
            kind: ResourceKind::Buffer,
            attributes: ResourceAttributes::Buffer(BufferAttributes { size: 4096, target: 0, usage: 0 }),
            contents: vec![0; 4096],
        };
        let mut buf = vec![];
        snapshot.serialize(&mut buf).unwrap();
        assert!(buf.len() < 64);

        let mut rest = &buf[..];
        assert_eq!(ResourceSnapshot::deserialize(&mut rest).unwrap(), snapshot);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_program_restore_order() {
        let snapshot = ResourceSnapshot {
            id: id(5),
            kind: ResourceKind::Program,
            attributes: ResourceAttributes::Program(ProgramAttributes {
                shaders: vec![id(1), id(2)],
                linked: true,
            }),
            contents: vec![],
        };
        let calls = snapshot.restore_calls(RestoreMode::Create);
        assert_eq!(
            calls,
            vec![
                (Call::CreateResource { kind: ResourceKind::Program, subtype: 0 }, id(5)),
                (Call::AttachShader { program: id(5), shader: id(1) }, ResourceId::NULL),
                (Call::AttachShader { program: id(5), shader: id(2) }, ResourceId::NULL),
                (Call::LinkProgram { program: id(5) }, ResourceId::NULL),
            ]
        );
    }

    #[test]
    fn test_framebuffer_refresh_detaches() {
        let color = |attachment, texture| FramebufferAttachment {
            attachment,
            textarget: gl::TEXTURE_2D,
            level: 0,
            texture,
        };
        let previous = ResourceAttributes::Framebuffer(FramebufferAttributes {
            attachments: vec![color(gl::COLOR_ATTACHMENT0, id(1)), color(gl::COLOR_ATTACHMENT1, id(2))],
        });
        let snapshot = ResourceSnapshot {
            id: id(9),
            kind: ResourceKind::Framebuffer,
            attributes: ResourceAttributes::Framebuffer(FramebufferAttributes {
                attachments: vec![color(gl::COLOR_ATTACHMENT0, id(3))],
            }),
            contents: vec![],
        };

        let calls: Vec<_> = snapshot
            .restore_calls(RestoreMode::Refresh(&previous))
            .into_iter()
            .map(|(call, _)| call)
            .collect();
        assert_eq!(calls.len(), 2);
        assert!(matches!(
            calls[0],
            Call::FramebufferTexture2d { attachment: gl::COLOR_ATTACHMENT1, texture: ResourceId::NULL, .. }
        ));
        assert!(matches!(calls[1], Call::FramebufferTexture2d { attachment: gl::COLOR_ATTACHMENT0, .. }));
    }

    #[test]
    fn test_oversized_snapshots_are_rejected() {
        let decode = |snapshot: &ResourceSnapshot| {
            let mut buf = vec![];
            snapshot.serialize(&mut buf).unwrap();
            ResourceSnapshot::deserialize(&mut &buf[..])
        };

        let buffer = ResourceSnapshot {
            id: id(2),
            kind: ResourceKind::Buffer,
            attributes: ResourceAttributes::Buffer(BufferAttributes { size: u64::MAX, target: 0, usage: 0 }),
            contents: vec![],
        };
        assert_eq!(decode(&buffer), Err(DeserializeError::BadValue { what: "buffer size", value: u64::MAX }));

        let texture = ResourceSnapshot {
            id: id(3),
            kind: ResourceKind::Texture,
            attributes: ResourceAttributes::Texture(TextureAttributes {
                target: gl::TEXTURE_2D,
                width: u32::MAX,
                height: u32::MAX,
                ..Default::default()
            }),
            contents: vec![],
        };
        assert!(matches!(decode(&texture), Err(DeserializeError::BadValue { what: "texture size", .. })));

        // Five bytes of repeat segment claiming a terabyte of zeros.
        let mut buf = vec![];
        id(4).serialize(&mut buf).unwrap();
        ResourceKind::Buffer.serialize(&mut buf).unwrap();
        ResourceAttributes::None.serialize(&mut buf).unwrap();
        write_len(&mut buf, 1 << 40).unwrap();
        write_len(&mut buf, 7).unwrap();
        buf.extend_from_slice(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x20, 0]);
        assert_eq!(
            ResourceSnapshot::deserialize(&mut &buf[..]),
            Err(DeserializeError::BadValue { what: "contents length", value: 1 << 40 })
        );
    }
}
