//! Resource identity virtualization.
//!
//! The driver names its objects with native handles: small integers that are
//! recycled as soon as an object is deleted, and that will certainly differ
//! between the capturing process and the replaying one. Nothing written to a
//! log ever carries a native handle. Instead, each object is given a
//! `ResourceId` when it is created, and the `ResourceManager` translates in
//! both directions.
//!
//! Ids are assigned from a monotonically increasing counter and are never
//! reused, even after the object they name is released. During replay the
//! same ids are attached, in recorded order, to whatever handles the replay
//! driver hands out.
//!
//! The manager also keeps a `ResourceRecord` per id, with the kind-specific
//! attributes needed to rebuild the object from scratch, and the set of other
//! resources it depends on (a program depends on its shaders, a vertex array
//! on its buffers, and so on). Those dependency edges give the order in which
//! initial state must be rebuilt.

use crate::call::Call;
use crate::error::ResourceError;
use crate::serialize::{serialized_struct, Deserialize, DeserializeError, Serialize};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::{fmt, io};

/// A stable, log-portable name for a driver object.
///
/// `ResourceId::NULL` stands for the driver's reserved "no object" handle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub const NULL: ResourceId = ResourceId(0);

    pub fn from_raw(raw: u64) -> ResourceId {
        ResourceId(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            f.write_str("NULL")
        } else {
            write!(f, "res#{}", self.0)
        }
    }
}

/// The driver's own name for an object. Zero is the null object.
pub type NativeHandle = u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ResourceKind {
    Buffer = 1,
    Texture = 2,
    Shader = 3,
    Program = 4,
    Pipeline = 5,
    Sync = 6,
    Query = 7,
    Framebuffer = 8,
    Renderbuffer = 9,
    VertexArray = 10,
    Sampler = 11,
}

/// A set of object kinds whose native handles are drawn from one pool.
///
/// Shaders and programs share a name space, so a live shader's handle can
/// never be a program's. Every other kind has its own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Buffer,
    Texture,
    ShaderProgram,
    Pipeline,
    Sync,
    Query,
    Framebuffer,
    Renderbuffer,
    VertexArray,
    Sampler,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 11] = [
        ResourceKind::Buffer,
        ResourceKind::Texture,
        ResourceKind::Shader,
        ResourceKind::Program,
        ResourceKind::Pipeline,
        ResourceKind::Sync,
        ResourceKind::Query,
        ResourceKind::Framebuffer,
        ResourceKind::Renderbuffer,
        ResourceKind::VertexArray,
        ResourceKind::Sampler,
    ];

    pub fn from_u8(tag: u8) -> Option<ResourceKind> {
        ResourceKind::ALL.iter().copied().find(|kind| *kind as u8 == tag)
    }

    pub fn namespace(self) -> Namespace {
        match self {
            ResourceKind::Buffer => Namespace::Buffer,
            ResourceKind::Texture => Namespace::Texture,
            ResourceKind::Shader | ResourceKind::Program => Namespace::ShaderProgram,
            ResourceKind::Pipeline => Namespace::Pipeline,
            ResourceKind::Sync => Namespace::Sync,
            ResourceKind::Query => Namespace::Query,
            ResourceKind::Framebuffer => Namespace::Framebuffer,
            ResourceKind::Renderbuffer => Namespace::Renderbuffer,
            ResourceKind::VertexArray => Namespace::VertexArray,
            ResourceKind::Sampler => Namespace::Sampler,
        }
    }
}

impl Serialize for ResourceId {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        self.0.serialize(stream)
    }
}

impl<'b> Deserialize<'b> for ResourceId {
    fn deserialize(buf: &mut &'b [u8]) -> Result<ResourceId, DeserializeError> {
        Ok(ResourceId(u64::deserialize(buf)?))
    }
}

impl Serialize for ResourceKind {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        (*self as u8).serialize(stream)
    }
}

impl<'b> Deserialize<'b> for ResourceKind {
    fn deserialize(buf: &mut &'b [u8]) -> Result<ResourceKind, DeserializeError> {
        let tag = u8::deserialize(buf)?;
        ResourceKind::from_u8(tag)
            .ok_or(DeserializeError::BadValue { what: "resource kind", value: tag as u64 })
    }
}

serialized_struct! {
    pub struct BufferAttributes {
        pub size: u64,
        /// The target the buffer was most recently bound to.
        pub target: u32,
        pub usage: u32,
    }

    pub struct TextureAttributes {
        pub target: u32,
        pub width: u32,
        pub height: u32,
        pub depth: u32,
        pub internal_format: u32,
        /// Client-side format and type of the level 0 upload, used to read
        /// the contents back.
        pub format: u32,
        pub ty: u32,
        pub levels: u32,
        pub layers: u32,
        /// Set by `TexStorage2d`.
        pub immutable: bool,
        pub parameters: Vec<(u32, i32)>,
    }

    pub struct ShaderAttributes {
        pub stage: u32,
        pub source: String,
        pub compiled: bool,
    }

    pub struct ProgramAttributes {
        pub shaders: Vec<ResourceId>,
        pub linked: bool,
    }

    pub struct PipelineAttributes {
        /// Stage bitfield and the program supplying those stages.
        pub stages: Vec<(u32, ResourceId)>,
    }

    pub struct VertexAttrib {
        pub index: u32,
        pub size: i32,
        pub ty: u32,
        pub normalized: bool,
        pub stride: i32,
        pub offset: u64,
        pub buffer: ResourceId,
        pub enabled: bool,
    }

    pub struct VertexArrayAttributes {
        /// Sorted by `index`.
        pub attribs: Vec<VertexAttrib>,
    }

    pub struct FramebufferAttachment {
        pub attachment: u32,
        pub textarget: u32,
        pub level: i32,
        pub texture: ResourceId,
    }

    pub struct FramebufferAttributes {
        pub attachments: Vec<FramebufferAttachment>,
    }
}

/// Kind-specific state needed to rebuild a resource.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceAttributes {
    None,
    Buffer(BufferAttributes),
    Texture(TextureAttributes),
    Shader(ShaderAttributes),
    Program(ProgramAttributes),
    Pipeline(PipelineAttributes),
    VertexArray(VertexArrayAttributes),
    Framebuffer(FramebufferAttributes),
}

impl ResourceAttributes {
    pub fn for_kind(kind: ResourceKind) -> ResourceAttributes {
        match kind {
            ResourceKind::Buffer => ResourceAttributes::Buffer(Default::default()),
            ResourceKind::Texture => ResourceAttributes::Texture(Default::default()),
            ResourceKind::Shader => ResourceAttributes::Shader(Default::default()),
            ResourceKind::Program => ResourceAttributes::Program(Default::default()),
            ResourceKind::Pipeline => ResourceAttributes::Pipeline(Default::default()),
            ResourceKind::VertexArray => ResourceAttributes::VertexArray(Default::default()),
            ResourceKind::Framebuffer => ResourceAttributes::Framebuffer(Default::default()),
            ResourceKind::Sync
            | ResourceKind::Query
            | ResourceKind::Renderbuffer
            | ResourceKind::Sampler => ResourceAttributes::None,
        }
    }
}

impl Serialize for ResourceAttributes {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        match self {
            ResourceAttributes::None => 0_u8.serialize(stream),
            ResourceAttributes::Buffer(a) => (1_u8, a).serialize(stream),
            ResourceAttributes::Texture(a) => (2_u8, a).serialize(stream),
            ResourceAttributes::Shader(a) => (3_u8, a).serialize(stream),
            ResourceAttributes::Program(a) => (4_u8, a).serialize(stream),
            ResourceAttributes::Pipeline(a) => (5_u8, a).serialize(stream),
            ResourceAttributes::VertexArray(a) => (6_u8, a).serialize(stream),
            ResourceAttributes::Framebuffer(a) => (7_u8, a).serialize(stream),
        }
    }
}

impl<'b> Deserialize<'b> for ResourceAttributes {
    fn deserialize(buf: &mut &'b [u8]) -> Result<ResourceAttributes, DeserializeError> {
        Ok(match u8::deserialize(buf)? {
            0 => ResourceAttributes::None,
            1 => ResourceAttributes::Buffer(Deserialize::deserialize(buf)?),
            2 => ResourceAttributes::Texture(Deserialize::deserialize(buf)?),
            3 => ResourceAttributes::Shader(Deserialize::deserialize(buf)?),
            4 => ResourceAttributes::Program(Deserialize::deserialize(buf)?),
            5 => ResourceAttributes::Pipeline(Deserialize::deserialize(buf)?),
            6 => ResourceAttributes::VertexArray(Deserialize::deserialize(buf)?),
            7 => ResourceAttributes::Framebuffer(Deserialize::deserialize(buf)?),
            other => {
                return Err(DeserializeError::BadValue {
                    what: "attribute tag",
                    value: other as u64,
                })
            }
        })
    }
}

/// Everything the manager knows about one resource.
#[derive(Clone, Debug)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub handle: NativeHandle,
    /// False once the resource has been released. The record, and its id,
    /// stay reserved.
    pub alive: bool,
    pub attributes: ResourceAttributes,
    pub dependencies: BTreeSet<ResourceId>,
}

/// The table mapping `ResourceId`s to native handles and back.
#[derive(Debug)]
pub struct ResourceManager {
    next_id: u64,
    records: BTreeMap<ResourceId, ResourceRecord>,
    live: HashMap<(Namespace, NativeHandle), ResourceId>,
}

impl Default for ResourceManager {
    fn default() -> ResourceManager {
        ResourceManager::new()
    }
}

impl ResourceManager {
    pub fn new() -> ResourceManager {
        ResourceManager {
            next_id: 1,
            records: BTreeMap::new(),
            live: HashMap::new(),
        }
    }

    /// Start tracking a freshly created driver object.
    ///
    /// If `handle` is still tracked as a live object of the same kind, the
    /// driver must have recycled it behind our back: the stale id is retired
    /// and a fresh one issued.
    pub fn allocate(&mut self, handle: NativeHandle, kind: ResourceKind) -> Result<ResourceId, ResourceError> {
        if handle == 0 {
            return Err(ResourceError::NullHandle { kind });
        }

        let key = (kind.namespace(), handle);
        if let Some(&stale) = self.live.get(&key) {
            let existing = self.records[&stale].kind;
            if existing != kind {
                return Err(ResourceError::IncompatibleKind { handle, existing, requested: kind });
            }
            tracing::warn!(%stale, handle, ?kind, "native handle reused without a release; retiring stale id");
            self.release(stale)?;
        }

        let id = ResourceId(self.next_id);
        self.next_id += 1;
        self.insert(id, handle, kind);
        Ok(id)
    }

    /// Attach a recorded id to a handle created by the replay driver.
    pub fn attach(&mut self, id: ResourceId, handle: NativeHandle, kind: ResourceKind) -> Result<(), ResourceError> {
        if id.is_null() {
            return Err(ResourceError::NotFound(id));
        }
        if handle == 0 {
            return Err(ResourceError::NullHandle { kind });
        }
        if self.records.contains_key(&id) {
            return Err(ResourceError::AlreadyAttached(id));
        }
        if let Some(&other) = self.live.get(&(kind.namespace(), handle)) {
            let existing = self.records[&other].kind;
            return Err(ResourceError::IncompatibleKind { handle, existing, requested: kind });
        }

        self.next_id = self.next_id.max(id.0 + 1);
        self.insert(id, handle, kind);
        Ok(())
    }

    fn insert(&mut self, id: ResourceId, handle: NativeHandle, kind: ResourceKind) {
        self.live.insert((kind.namespace(), handle), id);
        self.records.insert(id, ResourceRecord {
            id,
            kind,
            handle,
            alive: true,
            attributes: ResourceAttributes::for_kind(kind),
            dependencies: BTreeSet::new(),
        });
    }

    /// Return the native handle currently backing `id`.
    ///
    /// `ResourceId::NULL` resolves to the null handle.
    pub fn resolve(&self, id: ResourceId) -> Result<NativeHandle, ResourceError> {
        if id.is_null() {
            return Ok(0);
        }
        match self.records.get(&id) {
            Some(record) if record.alive => Ok(record.handle),
            _ => Err(ResourceError::NotFound(id)),
        }
    }

    /// Like `resolve`, but also check that `id` names a resource of `kind`.
    pub fn resolve_as(&self, id: ResourceId, kind: ResourceKind) -> Result<NativeHandle, ResourceError> {
        let handle = self.resolve(id)?;
        if let Some(record) = self.records.get(&id) {
            if record.kind != kind {
                return Err(ResourceError::WrongKind { id, expected: kind, actual: record.kind });
            }
        }
        Ok(handle)
    }

    /// Find the live id for a native handle, if we are tracking one.
    ///
    /// The null handle maps to `ResourceId::NULL`.
    pub fn lookup(&self, kind: ResourceKind, handle: NativeHandle) -> Option<ResourceId> {
        if handle == 0 {
            return Some(ResourceId::NULL);
        }
        let id = *self.live.get(&(kind.namespace(), handle))?;
        if self.records[&id].kind == kind {
            Some(id)
        } else {
            None
        }
    }

    /// Mark `id` dead. Its native handle becomes free for reuse; the id does
    /// not.
    pub fn release(&mut self, id: ResourceId) -> Result<(), ResourceError> {
        let record = match self.records.get_mut(&id) {
            Some(record) if record.alive => record,
            _ => return Err(ResourceError::NotFound(id)),
        };
        record.alive = false;
        self.live.remove(&(record.kind.namespace(), record.handle));
        Ok(())
    }

    pub fn record(&self, id: ResourceId) -> Option<&ResourceRecord> {
        self.records.get(&id)
    }

    pub fn is_live(&self, id: ResourceId) -> bool {
        self.records.get(&id).map_or(false, |record| record.alive)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.records.values().filter(|record| record.alive).map(|record| record.id)
    }

    /// Forget everything. The id counter restarts too, since a cleared table
    /// is only used to re-drive a log from its beginning.
    pub fn clear(&mut self) {
        *self = ResourceManager::new();
    }

    pub fn add_dependency(&mut self, id: ResourceId, depends_on: ResourceId) {
        if depends_on.is_null() || id == depends_on {
            return;
        }
        if let Some(record) = self.records.get_mut(&id) {
            record.dependencies.insert(depends_on);
        }
    }

    /// Replace a record's attributes wholesale, as when a state blob is
    /// applied.
    pub fn set_attributes(&mut self, id: ResourceId, attributes: ResourceAttributes) {
        if let Some(record) = self.records.get_mut(&id) {
            record.attributes = attributes;
        }
    }

    fn update(&mut self, id: ResourceId, f: impl FnOnce(&mut ResourceAttributes)) {
        if let Some(record) = self.records.get_mut(&id) {
            f(&mut record.attributes);
        }
    }

    /// Fold the effects of a call into the records it touches.
    ///
    /// Both capture and replay run every call through here, so both sides
    /// end up with the same attributes and dependency edges. `created` is
    /// the id allocated by a `CreateResource` call, and null otherwise.
    pub fn apply(&mut self, call: &Call<ResourceId>, created: ResourceId) {
        match *call {
            Call::CreateResource { kind: ResourceKind::Shader, subtype } => {
                self.update(created, |attrs| {
                    if let ResourceAttributes::Shader(shader) = attrs {
                        shader.stage = subtype;
                    }
                });
            }
            Call::BindBuffer { target, buffer } => {
                self.update(buffer, |attrs| {
                    if let ResourceAttributes::Buffer(b) = attrs {
                        b.target = target;
                    }
                });
            }
            Call::BufferData { usage, ref data, buffer } => {
                let size = data.len() as u64;
                self.update(buffer, |attrs| {
                    if let ResourceAttributes::Buffer(b) = attrs {
                        b.size = size;
                        b.usage = usage;
                    }
                });
            }
            Call::BindTexture { target, texture, .. } => {
                self.update(texture, |attrs| {
                    if let ResourceAttributes::Texture(t) = attrs {
                        if t.target == 0 {
                            t.target = target;
                        }
                    }
                });
            }
            Call::TexStorage2d { target, levels, internal_format, width, height, texture } => {
                self.update(texture, |attrs| {
                    if let ResourceAttributes::Texture(t) = attrs {
                        t.target = target;
                        t.levels = levels;
                        t.internal_format = internal_format;
                        t.width = width;
                        t.height = height;
                        t.depth = 1;
                        t.layers = 1;
                        t.immutable = true;
                    }
                });
            }
            Call::TexImage2d { target, level, internal_format, width, height, format, ty, texture, .. } => {
                self.update(texture, |attrs| {
                    if let ResourceAttributes::Texture(t) = attrs {
                        t.target = target;
                        t.levels = t.levels.max(level.max(0) as u32 + 1);
                        if level == 0 {
                            t.internal_format = internal_format;
                            t.width = width;
                            t.height = height;
                            t.depth = 1;
                            t.layers = 1;
                            t.format = format;
                            t.ty = ty;
                        }
                    }
                });
            }
            Call::TexSubImage2d { level: 0, format, ty, texture, .. } => {
                self.update(texture, |attrs| {
                    if let ResourceAttributes::Texture(t) = attrs {
                        if t.format == 0 {
                            t.format = format;
                            t.ty = ty;
                        }
                    }
                });
            }
            Call::TexParameterI { pname, param, texture, .. } => {
                self.update(texture, |attrs| {
                    if let ResourceAttributes::Texture(t) = attrs {
                        match t.parameters.iter_mut().find(|(name, _)| *name == pname) {
                            Some(entry) => entry.1 = param,
                            None => t.parameters.push((pname, param)),
                        }
                    }
                });
            }
            Call::ShaderSource { ref source, shader } => {
                let source = source.clone();
                self.update(shader, |attrs| {
                    if let ResourceAttributes::Shader(s) = attrs {
                        s.source = source;
                        s.compiled = false;
                    }
                });
            }
            Call::CompileShader { shader } => {
                self.update(shader, |attrs| {
                    if let ResourceAttributes::Shader(s) = attrs {
                        s.compiled = true;
                    }
                });
            }
            Call::AttachShader { program, shader } => {
                self.update(program, |attrs| {
                    if let ResourceAttributes::Program(p) = attrs {
                        if !p.shaders.contains(&shader) {
                            p.shaders.push(shader);
                        }
                    }
                });
                self.add_dependency(program, shader);
            }
            Call::LinkProgram { program } => {
                self.update(program, |attrs| {
                    if let ResourceAttributes::Program(p) = attrs {
                        p.linked = true;
                    }
                });
            }
            Call::UseProgramStages { stages, pipeline, program } => {
                self.update(pipeline, |attrs| {
                    if let ResourceAttributes::Pipeline(p) = attrs {
                        p.stages.retain(|(bits, _)| *bits != stages);
                        if !program.is_null() {
                            p.stages.push((stages, program));
                        }
                    }
                });
                self.add_dependency(pipeline, program);
            }
            Call::VertexAttribPointer { index, size, ty, normalized, stride, offset, vertex_array, buffer } => {
                self.update(vertex_array, |attrs| {
                    if let ResourceAttributes::VertexArray(vao) = attrs {
                        let attrib = vertex_attrib_mut(&mut vao.attribs, index);
                        attrib.size = size;
                        attrib.ty = ty;
                        attrib.normalized = normalized;
                        attrib.stride = stride;
                        attrib.offset = offset;
                        attrib.buffer = buffer;
                    }
                });
                self.add_dependency(vertex_array, buffer);
            }
            Call::EnableVertexAttribArray { index, vertex_array } |
            Call::DisableVertexAttribArray { index, vertex_array } => {
                let enabled = matches!(call, Call::EnableVertexAttribArray { .. });
                self.update(vertex_array, |attrs| {
                    if let ResourceAttributes::VertexArray(vao) = attrs {
                        vertex_attrib_mut(&mut vao.attribs, index).enabled = enabled;
                    }
                });
            }
            Call::FramebufferTexture2d { attachment, textarget, level, framebuffer, texture, .. } => {
                self.update(framebuffer, |attrs| {
                    if let ResourceAttributes::Framebuffer(fb) = attrs {
                        fb.attachments.retain(|a| a.attachment != attachment);
                        if !texture.is_null() {
                            fb.attachments.push(FramebufferAttachment { attachment, textarget, level, texture });
                        }
                    }
                });
                self.add_dependency(framebuffer, texture);
            }
            _ => {}
        }
    }

    /// Return `roots` and everything they transitively depend on, ordered so
    /// that every resource comes after its dependencies.
    ///
    /// Released resources are left out. Dependency cycles are broken at the
    /// first back edge found. The walk uses an explicit stack, so deep
    /// dependency chains cannot overflow the call stack.
    pub fn initial_state_order<I>(&self, roots: I) -> Vec<ResourceId>
    where
        I: IntoIterator<Item = ResourceId>,
    {
        let roots: BTreeSet<ResourceId> = roots.into_iter().collect();
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        let mut stack = Vec::new();

        for root in roots {
            stack.push((root, false));
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    order.push(id);
                    continue;
                }
                if !self.is_live(id) || !visited.insert(id) {
                    continue;
                }
                stack.push((id, true));
                let record = &self.records[&id];
                for &dep in record.dependencies.iter().rev() {
                    if !visited.contains(&dep) {
                        stack.push((dep, false));
                    }
                }
            }
        }

        order
    }
}

fn vertex_attrib_mut(attribs: &mut Vec<VertexAttrib>, index: u32) -> &mut VertexAttrib {
    let pos = match attribs.binary_search_by_key(&index, |a| a.index) {
        Ok(pos) => pos,
        Err(pos) => {
            attribs.insert(pos, VertexAttrib { index, ..Default::default() });
            pos
        }
    };
    &mut attribs[pos]
}

#[test]
fn test_ids_are_monotonic_and_never_reused() {
    let mut manager = ResourceManager::new();
    let a = manager.allocate(7, ResourceKind::Buffer).unwrap();
    let b = manager.allocate(8, ResourceKind::Buffer).unwrap();
    assert_eq!(a, ResourceId::from_raw(1));
    assert_eq!(b, ResourceId::from_raw(2));

    manager.release(a).unwrap();
    assert_eq!(manager.resolve(a), Err(ResourceError::NotFound(a)));

    // The driver hands the same handle out again; it gets a new id.
    let c = manager.allocate(7, ResourceKind::Buffer).unwrap();
    assert_eq!(c, ResourceId::from_raw(3));
    assert_eq!(manager.resolve(c), Ok(7));
    assert_eq!(manager.lookup(ResourceKind::Buffer, 7), Some(c));
    assert!(!manager.is_live(a));
}

#[test]
fn test_resolve_errors() {
    let mut manager = ResourceManager::new();
    let unknown = ResourceId::from_raw(42);
    assert_eq!(manager.resolve(unknown), Err(ResourceError::NotFound(unknown)));
    assert_eq!(manager.resolve(ResourceId::NULL), Ok(0));

    let id = manager.allocate(3, ResourceKind::Texture).unwrap();
    manager.release(id).unwrap();
    assert_eq!(manager.release(id), Err(ResourceError::NotFound(id)));
}

#[test]
fn test_shared_shader_program_namespace() {
    let mut manager = ResourceManager::new();
    manager.allocate(5, ResourceKind::Shader).unwrap();
    assert_eq!(
        manager.allocate(5, ResourceKind::Program),
        Err(ResourceError::IncompatibleKind {
            handle: 5,
            existing: ResourceKind::Shader,
            requested: ResourceKind::Program,
        })
    );

    // Buffers have their own pool, so handle 5 is fine there.
    assert!(manager.allocate(5, ResourceKind::Buffer).is_ok());
    assert_eq!(manager.lookup(ResourceKind::Program, 5), None);
}

#[test]
fn test_recycled_handle_retires_stale_id() {
    let mut manager = ResourceManager::new();
    let old = manager.allocate(9, ResourceKind::Query).unwrap();
    let new = manager.allocate(9, ResourceKind::Query).unwrap();
    assert_ne!(old, new);
    assert!(!manager.is_live(old));
    assert_eq!(manager.lookup(ResourceKind::Query, 9), Some(new));
}

#[test]
fn test_attach_for_replay() {
    let mut manager = ResourceManager::new();
    let recorded = ResourceId::from_raw(7);
    manager.attach(recorded, 100, ResourceKind::Buffer).unwrap();
    assert_eq!(manager.resolve(recorded), Ok(100));
    assert_eq!(
        manager.attach(recorded, 101, ResourceKind::Buffer),
        Err(ResourceError::AlreadyAttached(recorded))
    );

    // Fresh allocations continue past any attached id.
    assert_eq!(manager.allocate(1, ResourceKind::Buffer), Ok(ResourceId::from_raw(8)));
    assert_eq!(
        manager.resolve_as(recorded, ResourceKind::Texture),
        Err(ResourceError::WrongKind {
            id: recorded,
            expected: ResourceKind::Texture,
            actual: ResourceKind::Buffer,
        })
    );
}

#[test]
fn test_initial_state_order() {
    let mut manager = ResourceManager::new();
    let vs = manager.allocate(1, ResourceKind::Shader).unwrap();
    let fs = manager.allocate(2, ResourceKind::Shader).unwrap();
    let program = manager.allocate(3, ResourceKind::Program).unwrap();
    let pipeline = manager.allocate(1, ResourceKind::Pipeline).unwrap();

    manager.apply(&Call::AttachShader { program, shader: fs }, ResourceId::NULL);
    manager.apply(&Call::AttachShader { program, shader: vs }, ResourceId::NULL);
    manager.apply(&Call::UseProgramStages { stages: 3, pipeline, program }, ResourceId::NULL);

    // Asking for the pipeline alone pulls in everything beneath it.
    let order = manager.initial_state_order(vec![pipeline]);
    assert_eq!(order, vec![vs, fs, program, pipeline]);

    // A released dependency is skipped rather than rebuilt.
    manager.release(fs).unwrap();
    assert_eq!(manager.initial_state_order(vec![program]), vec![vs, program]);
}

#[test]
fn test_initial_state_order_tolerates_cycles() {
    let mut manager = ResourceManager::new();
    let a = manager.allocate(1, ResourceKind::Framebuffer).unwrap();
    let b = manager.allocate(1, ResourceKind::Texture).unwrap();
    manager.add_dependency(a, b);
    manager.add_dependency(b, a);

    let order = manager.initial_state_order(vec![a, b]);
    assert_eq!(order.len(), 2);
    assert_eq!(order, vec![b, a]);
}

#[test]
fn test_apply_tracks_attributes() {
    let mut manager = ResourceManager::new();
    let vao = manager.allocate(1, ResourceKind::VertexArray).unwrap();
    let buffer = manager.allocate(4, ResourceKind::Buffer).unwrap();

    manager.apply(&Call::BufferData { usage: 0x88E4, data: vec![0; 48], buffer }, ResourceId::NULL);
    manager.apply(
        &Call::VertexAttribPointer {
            index: 2,
            size: 3,
            ty: 0x1406,
            normalized: false,
            stride: 12,
            offset: 0,
            vertex_array: vao,
            buffer,
        },
        ResourceId::NULL,
    );
    manager.apply(&Call::EnableVertexAttribArray { index: 2, vertex_array: vao }, ResourceId::NULL);

    match &manager.record(buffer).unwrap().attributes {
        ResourceAttributes::Buffer(b) => assert_eq!((b.size, b.usage), (48, 0x88E4)),
        other => panic!("unexpected attributes {:?}", other),
    }
    let record = manager.record(vao).unwrap();
    assert!(record.dependencies.contains(&buffer));
    match &record.attributes {
        ResourceAttributes::VertexArray(v) => {
            assert_eq!(v.attribs.len(), 1);
            assert!(v.attribs[0].enabled);
            assert_eq!(v.attribs[0].buffer, buffer);
        }
        other => panic!("unexpected attributes {:?}", other),
    }
}
