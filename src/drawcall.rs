//! The event and drawcall tree.
//!
//! Replay feeds every event it executes to a `TreeBuilder`. Debug-group
//! pushes open a scope: the push event's node becomes the parent of every
//! event up to the matching pop. `bake` freezes the result into a
//! `DrawcallTree`, whose pre-order walk visits events in the order they were
//! recorded.
//!
//! Marker nesting in real applications is frequently broken. A pop with no
//! open scope on its context is logged and ignored, and scopes still open
//! when the frame ends are closed by `bake`.

use crate::call::{Call, ContextId, EventId};
use crate::debug_messages::DebugMessage;

use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrawKind {
    Draw,
    DrawIndexed,
    Dispatch,
    Clear,
    Copy,
}

/// Metadata for an event that produces rendering work.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawcallInfo {
    /// Drawcalls are numbered from 1 within a frame.
    pub drawcall_id: u64,
    pub kind: DrawKind,
    /// Primitive mode, for draws.
    pub mode: u32,
    pub num_indices: u32,
    pub num_instances: u32,
    pub index_type: u32,
    pub index_offset: u64,
    pub base_vertex: i32,
    pub dispatch: [u32; 3],
    /// How long the replay driver took to execute the call.
    pub duration: Duration,
}

impl DrawcallInfo {
    /// Describe `call`, if it is a drawcall. The drawcall id is assigned by
    /// the builder.
    pub fn from_call<R>(call: &Call<R>) -> Option<DrawcallInfo> {
        let mut info = DrawcallInfo {
            drawcall_id: 0,
            kind: call.draw_kind()?,
            mode: 0,
            num_indices: 0,
            num_instances: 1,
            index_type: 0,
            index_offset: 0,
            base_vertex: 0,
            dispatch: [0; 3],
            duration: Duration::default(),
        };
        match *call {
            Call::DrawArrays { mode, count, instances, .. } => {
                info.mode = mode;
                info.num_indices = count.max(0) as u32;
                info.num_instances = instances.max(1) as u32;
            }
            Call::DrawElements { mode, count, index_type, offset, instances, base_vertex } => {
                info.mode = mode;
                info.num_indices = count.max(0) as u32;
                info.num_instances = instances.max(1) as u32;
                info.index_type = index_type;
                info.index_offset = offset;
                info.base_vertex = base_vertex;
            }
            Call::DispatchCompute { x, y, z } => info.dispatch = [x, y, z],
            _ => {}
        }
        Some(info)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventNode {
    /// Zero for a scope opened by a marker push with no event of its own to
    /// hang from.
    pub event_id: EventId,
    pub description: String,
    pub context: ContextId,
    /// Where the event's chunk lives in the log.
    pub chunk_offset: u64,
    /// The label, if this node opened a debug-group scope.
    pub marker: Option<String>,
    pub drawcall: Option<DrawcallInfo>,
    pub debug_messages: Vec<DebugMessage>,
    pub children: Box<[EventNode]>,
}

impl EventNode {
    fn new(event_id: EventId, description: String, context: ContextId, chunk_offset: u64) -> EventNode {
        EventNode {
            event_id,
            description,
            context,
            chunk_offset,
            marker: None,
            drawcall: None,
            debug_messages: Vec::new(),
            children: Box::new([]),
        }
    }
}

/// A scope under construction: its node, and the children gathered so far.
#[derive(Clone, Debug)]
struct OpenScope {
    node: EventNode,
    children: Vec<EventNode>,
}

#[derive(Clone, Debug, Default)]
pub struct TreeBuilder {
    roots: Vec<EventNode>,
    stack: Vec<OpenScope>,
    next_drawcall: u64,
    last_context: ContextId,
}

impl TreeBuilder {
    pub fn new() -> TreeBuilder {
        TreeBuilder {
            next_drawcall: 1,
            ..Default::default()
        }
    }

    fn siblings(&mut self) -> &mut Vec<EventNode> {
        match self.stack.last_mut() {
            Some(scope) => &mut scope.children,
            None => &mut self.roots,
        }
    }

    fn last_node(&mut self) -> Option<&mut EventNode> {
        self.siblings().last_mut()
    }

    pub fn on_event(&mut self, event_id: EventId, description: String, context: ContextId, chunk_offset: u64) {
        self.last_context = context;
        self.siblings().push(EventNode::new(event_id, description, context, chunk_offset));
    }

    /// Open a scope under the most recent event, which should be the push
    /// itself.
    pub fn on_push_marker(&mut self, label: &str) {
        let context = self.last_context;
        let mut node = match self.siblings().pop() {
            Some(node) => node,
            None => EventNode::new(0, String::new(), context, 0),
        };
        node.marker = Some(label.to_owned());
        self.stack.push(OpenScope { node, children: Vec::new() });
    }

    /// Close the innermost scope opened by the most recent event's context.
    pub fn on_pop_marker(&mut self) {
        let context = self.last_context;
        let depth = match self.stack.iter().rposition(|scope| scope.node.context == context) {
            Some(depth) => depth,
            None if self.stack.is_empty() => {
                tracing::warn!(%context, "debug group pop with no open group; ignoring");
                return;
            }
            None => {
                tracing::warn!(%context, open = self.stack.len(), "debug group pop matches no group on this context; closing all");
                0
            }
        };
        while self.stack.len() > depth {
            self.close_scope();
        }
    }

    /// Label the most recent event.
    pub fn on_set_marker(&mut self, label: &str) {
        if let Some(node) = self.last_node() {
            node.marker = Some(label.to_owned());
        }
    }

    /// Attach drawcall metadata to the most recent event, and number it.
    pub fn on_drawcall(&mut self, mut info: DrawcallInfo) {
        info.drawcall_id = self.next_drawcall;
        self.next_drawcall += 1;
        match self.last_node() {
            Some(node) => node.drawcall = Some(info),
            None => tracing::warn!(drawcall = info.drawcall_id, "drawcall with no event"),
        }
    }

    /// Attach debug messages to the event with id `event_id`, which must be
    /// the most recent one, or the scope it opened.
    pub fn on_debug_messages(&mut self, event_id: EventId, messages: &[DebugMessage]) {
        let on_last = self.last_node().map_or(false, |node| node.event_id == event_id);
        let node = if on_last {
            self.last_node()
        } else {
            self.stack.last_mut().map(|scope| &mut scope.node).filter(|node| node.event_id == event_id)
        };
        match node {
            Some(node) => node.debug_messages.extend_from_slice(messages),
            None => tracing::debug!(event_id, "debug messages for an event not in the tree"),
        }
    }

    pub fn drawcall_count(&self) -> u64 {
        self.next_drawcall.saturating_sub(1)
    }

    fn close_scope(&mut self) {
        if let Some(OpenScope { mut node, children }) = self.stack.pop() {
            node.children = children.into_boxed_slice();
            self.siblings().push(node);
        }
    }

    /// Close any open scopes and freeze the tree.
    pub fn bake(mut self) -> DrawcallTree {
        if !self.stack.is_empty() {
            tracing::debug!(open = self.stack.len(), "closing debug groups left open at end of frame");
        }
        while !self.stack.is_empty() {
            self.close_scope();
        }
        DrawcallTree { roots: self.roots.into_boxed_slice() }
    }
}

/// A frame's finished event tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrawcallTree {
    roots: Box<[EventNode]>,
}

impl DrawcallTree {
    pub fn roots(&self) -> &[EventNode] {
        &self.roots
    }

    /// Walk every node in pre-order.
    pub fn iter(&self) -> PreOrder<'_> {
        PreOrder { stack: vec![self.roots.iter()] }
    }

    pub fn find(&self, event_id: EventId) -> Option<&EventNode> {
        self.iter().find(|node| node.event_id == event_id && event_id != 0)
    }

    pub fn drawcalls(&self) -> impl Iterator<Item = (&EventNode, &DrawcallInfo)> + '_ {
        self.iter().filter_map(|node| Some((node, node.drawcall.as_ref()?)))
    }

    /// The number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

pub struct PreOrder<'t> {
    stack: Vec<std::slice::Iter<'t, EventNode>>,
}

impl<'t> Iterator for PreOrder<'t> {
    type Item = &'t EventNode;

    fn next(&mut self) -> Option<&'t EventNode> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(node) => {
                    self.stack.push(node.children.iter());
                    return Some(node);
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(builder: &mut TreeBuilder, id: EventId) {
        builder.on_event(id, format!("event {}", id), ContextId(1), id * 100);
    }

    fn shape(nodes: &[EventNode]) -> String {
        nodes
            .iter()
            .map(|node| {
                if node.children.is_empty() {
                    node.event_id.to_string()
                } else {
                    format!("{}[{}]", node.event_id, shape(&node.children))
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_nesting() {
        let mut builder = TreeBuilder::new();
        event(&mut builder, 1);
        event(&mut builder, 2);
        builder.on_push_marker("shadows");
        event(&mut builder, 3);
        builder.on_drawcall(DrawcallInfo::from_call(&Call::<u64>::DrawArrays { mode: 4, first: 0, count: 3, instances: 1 }).unwrap());
        event(&mut builder, 4);
        builder.on_push_marker("inner");
        event(&mut builder, 5);
        builder.on_pop_marker();
        event(&mut builder, 6);
        builder.on_pop_marker();
        event(&mut builder, 7);

        let tree = builder.bake();
        assert_eq!(shape(tree.roots()), "1 2[3 4[5] 6] 7");
        let order: Vec<_> = tree.iter().map(|node| node.event_id).collect();
        assert_eq!(order, [1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(tree.find(2).unwrap().marker.as_deref(), Some("shadows"));

        let draws: Vec<_> = tree.drawcalls().map(|(node, info)| (node.event_id, info.drawcall_id)).collect();
        assert_eq!(draws, [(3, 1)]);
    }

    #[test]
    fn test_unbalanced_markers() {
        // A pop at the root is ignored.
        let mut builder = TreeBuilder::new();
        event(&mut builder, 1);
        builder.on_pop_marker();
        event(&mut builder, 2);
        assert_eq!(shape(builder.bake().roots()), "1 2");

        // Pushes never popped are closed at bake.
        let mut builder = TreeBuilder::new();
        event(&mut builder, 1);
        builder.on_push_marker("a");
        event(&mut builder, 2);
        builder.on_push_marker("b");
        event(&mut builder, 3);
        let tree = builder.bake();
        assert_eq!(shape(tree.roots()), "1[2[3]]");
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_pop_from_other_context_closes_all() {
        let mut builder = TreeBuilder::new();
        event(&mut builder, 1);
        builder.on_push_marker("a");
        event(&mut builder, 2);
        builder.on_push_marker("b");
        builder.on_event(3, "pop".to_owned(), ContextId(2), 300);
        builder.on_pop_marker();
        event(&mut builder, 4);
        assert_eq!(shape(builder.bake().roots()), "1[2[3]] 4");
    }

    #[test]
    fn test_debug_messages_follow_their_event() {
        let message = DebugMessage { message: "slow path".to_owned(), ..Default::default() };
        let mut builder = TreeBuilder::new();
        event(&mut builder, 1);
        builder.on_push_marker("group");
        builder.on_debug_messages(1, &[message.clone()]);
        builder.on_debug_messages(9, &[message.clone()]);
        let tree = builder.bake();
        assert_eq!(tree.find(1).unwrap().debug_messages, [message]);
    }
}
