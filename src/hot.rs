//! Spotting high-traffic resources.
//!
//! Some applications rewrite the same piece of object state before nearly
//! every draw: re-pointing a vertex array, swapping a framebuffer
//! attachment. Recording each of those mutations bloats the log for no
//! benefit, since only the state at each draw matters. The tracker counts,
//! over a frame, how many draws were preceded by a state mutation of each
//! resource. Resources mutated before at least `mutation_ratio` of the
//! frame's draws are flagged, and from then on the recorder elides their
//! state mutations and writes a single refresh before the next draw.
//!
//! Flags are sticky for the life of the resource. A misjudged flag costs log
//! size, never correctness: the refresh always carries the full state.

use crate::config::HotResourceOptions;
use crate::resource::ResourceId;

use std::collections::{BTreeSet, HashMap};

/// How a call changes a resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MutationKind {
    /// Contents: buffer data, texels. Never elided.
    Contents,
    /// Object state that a full-state refresh can reproduce.
    State,
}

#[derive(Debug)]
pub struct HotResourceTracker {
    options: HotResourceOptions,
    /// Resources mutated since the last draw.
    pending: BTreeSet<ResourceId>,
    /// Draws this frame preceded by a mutation of each resource.
    counts: HashMap<ResourceId, u64>,
    draws: u64,
    hot: BTreeSet<ResourceId>,
}

impl HotResourceTracker {
    pub fn new(options: HotResourceOptions) -> HotResourceTracker {
        HotResourceTracker {
            options,
            pending: BTreeSet::new(),
            counts: HashMap::new(),
            draws: 0,
            hot: BTreeSet::new(),
        }
    }

    pub fn observe(&mut self, id: ResourceId, kind: MutationKind) {
        if !self.options.enabled || id.is_null() || kind != MutationKind::State {
            return;
        }
        self.pending.insert(id);
    }

    pub fn note_draw(&mut self) {
        self.draws += 1;
        for id in std::mem::take(&mut self.pending) {
            *self.counts.entry(id).or_insert(0) += 1;
        }
    }

    /// Close the frame's statistics. Return the resources newly flagged.
    pub fn end_frame(&mut self) -> Vec<ResourceId> {
        let draws = std::mem::take(&mut self.draws);
        let counts = std::mem::take(&mut self.counts);
        self.pending.clear();
        if !self.options.enabled || draws < self.options.min_draws.max(1) {
            return Vec::new();
        }

        let threshold = self.options.mutation_ratio * draws as f64;
        let mut flagged: Vec<ResourceId> = counts
            .into_iter()
            .filter(|&(id, count)| count as f64 >= threshold && !self.hot.contains(&id))
            .map(|(id, _)| id)
            .collect();
        flagged.sort();
        for &id in &flagged {
            tracing::debug!(%id, draws, "flagging high-traffic resource");
            self.hot.insert(id);
        }
        flagged
    }

    pub fn is_hot(&self, id: ResourceId) -> bool {
        self.hot.contains(&id)
    }

    /// Drop everything known about a released resource.
    pub fn forget(&mut self, id: ResourceId) {
        self.hot.remove(&id);
        self.pending.remove(&id);
        self.counts.remove(&id);
    }

    pub fn hot_resources(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.hot.iter().copied()
    }
}

#[cfg(test)]
fn options(min_draws: u64) -> HotResourceOptions {
    HotResourceOptions { enabled: true, mutation_ratio: 0.75, min_draws }
}

#[test]
fn test_flags_resources_mutated_before_most_draws() {
    let (vao, fb) = (ResourceId::from_raw(1), ResourceId::from_raw(2));
    let mut tracker = HotResourceTracker::new(options(4));

    for draw in 0..8 {
        tracker.observe(vao, MutationKind::State);
        // Mutated twice before one draw still counts once.
        tracker.observe(vao, MutationKind::State);
        if draw % 4 == 0 {
            tracker.observe(fb, MutationKind::State);
        }
        tracker.note_draw();
    }

    assert_eq!(tracker.end_frame(), [vao]);
    assert!(tracker.is_hot(vao));
    assert!(!tracker.is_hot(fb));

    // Flags persist, and are not reported again.
    tracker.observe(vao, MutationKind::State);
    tracker.note_draw();
    assert!(tracker.end_frame().is_empty());
    assert!(tracker.is_hot(vao));

    tracker.forget(vao);
    assert!(!tracker.is_hot(vao));
}

#[test]
fn test_ignores_contents_and_short_frames() {
    let buffer = ResourceId::from_raw(3);
    let mut tracker = HotResourceTracker::new(options(4));
    for _ in 0..10 {
        tracker.observe(buffer, MutationKind::Contents);
        tracker.note_draw();
    }
    assert!(tracker.end_frame().is_empty());

    for _ in 0..3 {
        tracker.observe(buffer, MutationKind::State);
        tracker.note_draw();
    }
    assert!(tracker.end_frame().is_empty());
}

#[test]
fn test_disabled() {
    let mut tracker = HotResourceTracker::new(HotResourceOptions { enabled: false, ..options(1) });
    tracker.observe(ResourceId::from_raw(1), MutationKind::State);
    tracker.note_draw();
    assert!(tracker.end_frame().is_empty());
}
