//! The set of recordable driver calls.
//!
//! Every recordable operation is a variant of `Call<R>`, where `R` is the type
//! used for resource arguments. The shim layer builds `Call<NativeHandle>`
//! values; the log stores `Call<ResourceId>`; replay turns those back into
//! `Call<NativeHandle>` for the replay driver. `map_resources` does the
//! conversion in each direction.
//!
//! Resource arguments are always explicit, in the style of direct state
//! access: `BufferData` names the buffer it fills, rather than relying on a
//! previous `BindBuffer`. That lets the resource manager keep its records
//! without modelling the driver's bind points.
//!
//! The `calls!` table below generates the enum, the `CallKind` tag type, and
//! one encode/decode pair per variant. In each variant, the fields before the
//! `;` are plain values, and the fields after it are resources, annotated
//! with their kind. `(kind)` means the kind is given by the plain field
//! `kind`.

use crate::drawcall::DrawKind;
use crate::hot::MutationKind;
use crate::resource::{ResourceId, ResourceKind};
use crate::serialize::{Deserialize, DeserializeError, Serialize};

use std::{fmt, io};

/// An event's ordinal position in a captured frame. Events are numbered from
/// 1; zero marks a call that is not an event.
pub type EventId = u64;

/// Identifies one logical rendering context.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

impl Serialize for ContextId {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        self.0.serialize(stream)
    }
}

impl<'b> Deserialize<'b> for ContextId {
    fn deserialize(buf: &mut &'b [u8]) -> Result<ContextId, DeserializeError> {
        Ok(ContextId(u64::deserialize(buf)?))
    }
}

macro_rules! resource_kind {
    (owned ($field:ident)) => { $field };
    (borrowed ($field:ident)) => { *$field };
    ($mode:ident $kind:ident) => { ResourceKind::$kind };
}

macro_rules! calls {
    ( $( $name:ident = $tag:literal {
            $( $field:ident : $type:ty ),* ;
            $( $res:ident : $kind:tt ),*
        } ),* $(,)? ) => {
        #[derive(Clone, Debug, PartialEq)]
        pub enum Call<R> {
            $( $name { $( $field: $type, )* $( $res: R, )* }, )*
        }

        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum CallKind {
            $( $name = $tag, )*
        }

        impl CallKind {
            pub fn from_tag(tag: u16) -> Option<CallKind> {
                match tag {
                    $( $tag => Some(CallKind::$name), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( CallKind::$name => stringify!($name), )*
                }
            }
        }

        impl<R> Call<R> {
            pub fn kind(&self) -> CallKind {
                match self {
                    $( Call::$name { .. } => CallKind::$name, )*
                }
            }

            /// Convert every resource argument with `f`, which is passed the
            /// argument's expected kind.
            #[allow(unused_variables, unused_mut)]
            pub fn map_resources<S, E, F>(self, mut f: F) -> Result<Call<S>, E>
            where
                F: FnMut(ResourceKind, R) -> Result<S, E>,
            {
                Ok(match self {
                    $(
                        Call::$name { $( $field, )* $( $res, )* } => Call::$name {
                            $( $res: f(resource_kind!(owned $kind), $res)?, )*
                            $( $field, )*
                        },
                    )*
                })
            }

            /// Return each resource argument with its expected kind.
            #[allow(unused_variables)]
            pub fn resources(&self) -> Vec<(ResourceKind, &R)> {
                match *self {
                    $(
                        Call::$name { $( ref $field, )* $( ref $res, )* } => {
                            vec![ $( (resource_kind!(borrowed $kind), $res), )* ]
                        }
                    )*
                }
            }
        }

        impl Call<ResourceId> {
            /// Write this call's arguments, without its kind tag.
            #[allow(unused_variables)]
            pub fn encode<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
                match self {
                    $(
                        Call::$name { $( $field, )* $( $res, )* } => {
                            $( $field.serialize(stream)?; )*
                            $( $res.serialize(stream)?; )*
                        }
                    )*
                }
                Ok(())
            }

            /// Read the arguments of a call of the given kind.
            #[allow(unused_variables)]
            pub fn decode(kind: CallKind, buf: &mut &[u8]) -> Result<Call<ResourceId>, DeserializeError> {
                Ok(match kind {
                    $(
                        CallKind::$name => Call::$name {
                            $( $field: Deserialize::deserialize(buf)?, )*
                            $( $res: Deserialize::deserialize(buf)?, )*
                        },
                    )*
                })
            }
        }

        impl<R: Describe> fmt::Display for Call<R> {
            #[allow(unused_assignments, unused_mut)]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self {
                    $(
                        Call::$name { $( $field, )* $( $res, )* } => {
                            f.write_str(stringify!($name))?;
                            f.write_str("(")?;
                            let mut _sep = "";
                            $(
                                write!(f, "{}{}=", _sep, stringify!($field))?;
                                $field.describe(f)?;
                                _sep = ", ";
                            )*
                            $(
                                write!(f, "{}{}=", _sep, stringify!($res))?;
                                $res.describe(f)?;
                                _sep = ", ";
                            )*
                            f.write_str(")")
                        }
                    )*
                }
            }
        }
    }
}

calls! {
    CreateResource = 1 { kind: ResourceKind, subtype: u32 ; },
    DeleteResource = 2 { kind: ResourceKind ; resource: (kind) },

    BindBuffer = 3 { target: u32 ; buffer: Buffer },
    BufferData = 4 { usage: u32, data: Vec<u8> ; buffer: Buffer },
    BufferSubData = 5 { offset: u64, data: Vec<u8> ; buffer: Buffer },

    BindTexture = 6 { unit: u32, target: u32 ; texture: Texture },
    TexStorage2d = 7 {
        target: u32, levels: u32, internal_format: u32, width: u32, height: u32 ;
        texture: Texture
    },
    TexImage2d = 8 {
        target: u32, level: i32, internal_format: u32, width: u32, height: u32,
        format: u32, ty: u32, data: Option<Vec<u8>> ;
        texture: Texture
    },
    TexSubImage2d = 9 {
        target: u32, level: i32, x: i32, y: i32, width: u32, height: u32,
        format: u32, ty: u32, data: Vec<u8> ;
        texture: Texture
    },
    TexParameterI = 10 { target: u32, pname: u32, param: i32 ; texture: Texture },

    ShaderSource = 11 { source: String ; shader: Shader },
    CompileShader = 12 { ; shader: Shader },
    AttachShader = 13 { ; program: Program, shader: Shader },
    LinkProgram = 14 { ; program: Program },
    UseProgram = 15 { ; program: Program },
    UseProgramStages = 16 { stages: u32 ; pipeline: Pipeline, program: Program },
    BindPipeline = 17 { ; pipeline: Pipeline },

    BindVertexArray = 18 { ; vertex_array: VertexArray },
    VertexAttribPointer = 19 {
        index: u32, size: i32, ty: u32, normalized: bool, stride: i32, offset: u64 ;
        vertex_array: VertexArray, buffer: Buffer
    },
    EnableVertexAttribArray = 20 { index: u32 ; vertex_array: VertexArray },
    DisableVertexAttribArray = 21 { index: u32 ; vertex_array: VertexArray },

    BindFramebuffer = 22 { target: u32 ; framebuffer: Framebuffer },
    FramebufferTexture2d = 23 {
        target: u32, attachment: u32, textarget: u32, level: i32 ;
        framebuffer: Framebuffer, texture: Texture
    },

    Viewport = 24 { x: i32, y: i32, width: i32, height: i32 ; },
    Scissor = 25 { x: i32, y: i32, width: i32, height: i32 ; },
    Enable = 26 { cap: u32 ; },
    Disable = 27 { cap: u32 ; },
    ClearColor = 28 { r: f32, g: f32, b: f32, a: f32 ; },

    Clear = 29 { mask: u32 ; },
    DrawArrays = 30 { mode: u32, first: i32, count: i32, instances: i32 ; },
    DrawElements = 31 {
        mode: u32, count: i32, index_type: u32, offset: u64, instances: i32, base_vertex: i32 ;
    },
    DispatchCompute = 32 { x: u32, y: u32, z: u32 ; },
    BlitFramebuffer = 33 {
        src_x0: i32, src_y0: i32, src_x1: i32, src_y1: i32,
        dst_x0: i32, dst_y0: i32, dst_x1: i32, dst_y1: i32,
        mask: u32, filter: u32 ;
        read: Framebuffer, draw: Framebuffer
    },

    PushDebugGroup = 34 { id: u32, message: String ; },
    PopDebugGroup = 35 { ; },
    DebugMarker = 36 { message: String ; },

    BeginQuery = 37 { target: u32 ; query: Query },
    EndQuery = 38 { target: u32 ; },
    ClientWaitSync = 39 { flags: u32, timeout: u64 ; sync: Sync },
    Flush = 40 { ; },
}

/// What a debug-marker call does to the event tree.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MarkerOp<'a> {
    Push(&'a str),
    Pop,
    Set(&'a str),
}

impl<R> Call<R> {
    /// Calls that manage object lifetimes but are not themselves events.
    pub fn is_event(&self) -> bool {
        !matches!(self, Call::CreateResource { .. })
    }

    pub fn draw_kind(&self) -> Option<DrawKind> {
        Some(match self {
            Call::DrawArrays { .. } => DrawKind::Draw,
            Call::DrawElements { .. } => DrawKind::DrawIndexed,
            Call::DispatchCompute { .. } => DrawKind::Dispatch,
            Call::Clear { .. } => DrawKind::Clear,
            Call::BlitFramebuffer { .. } => DrawKind::Copy,
            _ => return None,
        })
    }

    pub fn marker(&self) -> Option<MarkerOp> {
        match self {
            Call::PushDebugGroup { message, .. } => Some(MarkerOp::Push(message)),
            Call::PopDebugGroup {} => Some(MarkerOp::Pop),
            Call::DebugMarker { message } => Some(MarkerOp::Set(message)),
            _ => None,
        }
    }

    /// The resource whose state this call changes, if any, and how.
    pub fn mutation(&self) -> Option<(&R, MutationKind)> {
        match self {
            Call::BufferData { buffer, .. } | Call::BufferSubData { buffer, .. } => {
                Some((buffer, MutationKind::Contents))
            }
            Call::TexImage2d { texture, .. } | Call::TexSubImage2d { texture, .. } => {
                Some((texture, MutationKind::Contents))
            }
            Call::TexParameterI { texture, .. } => Some((texture, MutationKind::State)),
            Call::UseProgramStages { pipeline, .. } => Some((pipeline, MutationKind::State)),
            Call::VertexAttribPointer { vertex_array, .. }
            | Call::EnableVertexAttribArray { vertex_array, .. }
            | Call::DisableVertexAttribArray { vertex_array, .. } => {
                Some((vertex_array, MutationKind::State))
            }
            Call::FramebufferTexture2d { framebuffer, .. } => {
                Some((framebuffer, MutationKind::State))
            }
            _ => None,
        }
    }
}

/// Formatting for call arguments in event descriptions.
///
/// Byte payloads are summarized by length rather than dumped.
pub trait Describe {
    fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result;
}

macro_rules! describe_with_display {
    ( $( $type:ty ),* ) => {
        $(
            impl Describe for $type {
                fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}", self)
                }
            }
        )*
    }
}

describe_with_display!(u32, u64, i32, f32, bool, ResourceId);

impl Describe for String {
    fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Describe for ResourceKind {
    fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Describe for Vec<u8> {
    fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{} bytes>", self.len())
    }
}

impl<T: Describe> Describe for Option<T> {
    fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Some(value) => value.describe(f),
            None => f.write_str("None"),
        }
    }
}

/// The payload of an API call chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiCall {
    /// Zero for calls that are not events.
    pub event_id: EventId,
    pub context: ContextId,
    /// The id allocated by a `CreateResource` call; null otherwise.
    pub created: ResourceId,
    pub call: Call<ResourceId>,
}

impl Serialize for ApiCall {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        self.event_id.serialize(stream)?;
        self.context.serialize(stream)?;
        (self.call.kind() as u16).serialize(stream)?;
        self.created.serialize(stream)?;
        self.call.encode(stream)
    }
}

impl<'b> Deserialize<'b> for ApiCall {
    fn deserialize(buf: &mut &'b [u8]) -> Result<ApiCall, DeserializeError> {
        let event_id = Deserialize::deserialize(buf)?;
        let context = Deserialize::deserialize(buf)?;
        let tag = u16::deserialize(buf)?;
        let kind = CallKind::from_tag(tag)
            .ok_or(DeserializeError::BadValue { what: "call kind", value: tag as u64 })?;
        let created = Deserialize::deserialize(buf)?;
        let call = Call::decode(kind, buf)?;
        Ok(ApiCall { event_id, context, created, call })
    }
}

#[test]
fn test_map_resources() {
    let call: Call<u64> = Call::AttachShader { program: 10, shader: 11 };
    let mut seen = vec![];
    let mapped = call
        .map_resources(|kind, handle| -> Result<ResourceId, ()> {
            seen.push(kind);
            Ok(ResourceId::from_raw(handle + 100))
        })
        .unwrap();
    assert_eq!(seen, [ResourceKind::Program, ResourceKind::Shader]);
    assert_eq!(
        mapped,
        Call::AttachShader {
            program: ResourceId::from_raw(110),
            shader: ResourceId::from_raw(111),
        }
    );

    // The kind of a deleted resource comes from the call itself.
    let delete: Call<u64> = Call::DeleteResource { kind: ResourceKind::Sync, resource: 3 };
    assert_eq!(delete.resources(), vec![(ResourceKind::Sync, &3)]);
}

#[test]
fn test_api_call_layout() {
    let api = ApiCall {
        event_id: 2,
        context: ContextId(1),
        created: ResourceId::NULL,
        call: Call::BufferData {
            usage: 0x88E4,
            data: vec![1, 2, 3],
            buffer: ResourceId::from_raw(1),
        },
    };
    let mut buf = vec![];
    api.serialize(&mut buf).unwrap();

    let mut expected = vec![];
    expected.extend_from_slice(&2_u64.to_le_bytes());
    expected.extend_from_slice(&1_u64.to_le_bytes());
    expected.extend_from_slice(&(CallKind::BufferData as u16).to_le_bytes());
    expected.extend_from_slice(&0_u64.to_le_bytes());
    expected.extend_from_slice(&0x88E4_u32.to_le_bytes());
    expected.extend_from_slice(&[3, 1, 2, 3]);
    expected.extend_from_slice(&1_u64.to_le_bytes());
    assert_eq!(buf, expected);

    let mut rest = &buf[..];
    assert_eq!(ApiCall::deserialize(&mut rest), Ok(api));
    assert!(rest.is_empty());
}

#[test]
fn test_unknown_call_kind() {
    let mut buf = vec![];
    0_u64.serialize(&mut buf).unwrap();
    0_u64.serialize(&mut buf).unwrap();
    999_u16.serialize(&mut buf).unwrap();
    let mut rest = &buf[..];
    assert_eq!(
        ApiCall::deserialize(&mut rest),
        Err(DeserializeError::BadValue { what: "call kind", value: 999 })
    );
}

#[test]
fn test_display() {
    let call = Call::DrawArrays { mode: 4, first: 0, count: 3, instances: 1 };
    let call: Call<ResourceId> = call;
    assert_eq!(call.to_string(), "DrawArrays(mode=4, first=0, count=3, instances=1)");

    let call = Call::BufferData { usage: 1, data: vec![0; 16], buffer: ResourceId::from_raw(4) };
    assert_eq!(call.to_string(), "BufferData(usage=1, data=<16 bytes>, buffer=res#4)");

    let call: Call<ResourceId> = Call::PopDebugGroup {};
    assert_eq!(call.to_string(), "PopDebugGroup()");
}
