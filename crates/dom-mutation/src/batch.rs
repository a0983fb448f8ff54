use dom_forest::{Forest, NodeId};
use indexmap::IndexMap;

use crate::dom::{AnimationId, ObserverId};

/// Coalesces a burst of child-list edits under one parent into a single
/// record per interested observer. Constructed by
/// [`Dom::with_child_list_batch`](crate::Dom::with_child_list_batch).
pub(crate) struct ChildListBatch {
    pub target: NodeId,
    /// Removals ran sibling-by-sibling from the first child to the last.
    pub from_first_to_last: bool,
    /// Set by the caller once the removal phase of the bulk operation is
    /// over; later removals under the target are internal shuffling and
    /// are not recorded.
    pub removal_done: bool,
    /// Siblings framing the edited run. Grown removal by removal unless
    /// pinned explicitly.
    pub previous_sibling: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
    pinned: bool,
    seen_removal: bool,
    pub removed: Vec<NodeId>,
    pub added: Vec<NodeId>,
    /// Observers that saw a child-list mutation inside the batch, with
    /// whether any of their receivers wants a child-list record.
    pub observers: IndexMap<ObserverId, bool>,
}

impl ChildListBatch {
    pub fn new(target: NodeId, from_first_to_last: bool) -> Self {
        ChildListBatch {
            target,
            from_first_to_last,
            removal_done: false,
            previous_sibling: None,
            next_sibling: None,
            pinned: false,
            seen_removal: false,
            removed: Vec::new(),
            added: Vec::new(),
            observers: IndexMap::new(),
        }
    }

    /// Pins the sibling frame explicitly; later removals will not
    /// overwrite it.
    pub fn set_siblings(&mut self, previous: Option<NodeId>, next: Option<NodeId>) {
        self.previous_sibling = previous;
        self.next_sibling = next;
        self.pinned = true;
    }

    pub fn update_observer(&mut self, observer: ObserverId, wants_child_list: bool) {
        let entry = self.observers.entry(observer).or_insert(false);
        *entry |= wants_child_list;
    }

    /// `previous` and `next` are the child's siblings as they were right
    /// before the detach. The outer edge of the frame is fixed by the
    /// first removal, the inner edge follows the removal direction.
    pub fn node_removed(
        &mut self,
        child: NodeId,
        previous: Option<NodeId>,
        next: Option<NodeId>,
    ) {
        if !self.pinned {
            if self.from_first_to_last {
                if !self.seen_removal {
                    self.previous_sibling = previous;
                }
                self.next_sibling = next;
            } else {
                if !self.seen_removal {
                    self.next_sibling = next;
                }
                self.previous_sibling = previous;
            }
        }
        self.seen_removal = true;
        if !self.removed.contains(&child) {
            self.removed.push(child);
        }
    }

    pub fn node_added(&mut self, child: NodeId) {
        if !self.added.contains(&child) {
            self.added.push(child);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AnimationState {
    /// Present before the batch and still present.
    RemainedPresent,
    /// Absent before the batch and still absent.
    RemainedAbsent,
    Added,
    Removed,
}

struct AnimationEntry {
    animation: AnimationId,
    state: AnimationState,
    changed: bool,
}

/// Folds add/change/remove notifications for the animations of each target
/// node into their net effect over the batch. An add that cancels a prior
/// remove (or vice versa) collapses back to a "remained" state and produces
/// no added/removed entry; a change is reported only for animations that
/// were present before the batch and still are.
pub(crate) struct AnimationBatch {
    entries: IndexMap<NodeId, Vec<AnimationEntry>>,
    pub observers: Vec<ObserverId>,
}

impl AnimationBatch {
    pub fn new() -> Self {
        AnimationBatch {
            entries: IndexMap::new(),
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: ObserverId) {
        if !self.observers.contains(&observer) {
            self.observers.push(observer);
        }
    }

    fn entry(&mut self, target: NodeId, animation: AnimationId) -> Option<&mut AnimationEntry> {
        self.entries
            .entry(target)
            .or_default()
            .iter_mut()
            .find(|e| e.animation == animation)
    }

    fn push(&mut self, target: NodeId, animation: AnimationId, state: AnimationState) {
        self.entries.entry(target).or_default().push(AnimationEntry {
            animation,
            state,
            changed: false,
        });
    }

    pub fn animation_added(&mut self, animation: AnimationId, target: NodeId) {
        match self.entry(target, animation) {
            Some(e) => {
                debug_assert!(
                    matches!(e.state, AnimationState::Removed | AnimationState::RemainedAbsent),
                    "animation added twice in one batch"
                );
                e.state = match e.state {
                    // Removed then re-added: net effect is none.
                    AnimationState::Removed => AnimationState::RemainedPresent,
                    _ => AnimationState::Added,
                };
            }
            None => self.push(target, animation, AnimationState::Added),
        }
    }

    pub fn animation_changed(&mut self, animation: AnimationId, target: NodeId) {
        match self.entry(target, animation) {
            Some(e) => e.changed = true,
            None => {
                self.push(target, animation, AnimationState::RemainedPresent);
                if let Some(e) = self.entry(target, animation) {
                    e.changed = true;
                }
            }
        }
    }

    pub fn animation_removed(&mut self, animation: AnimationId, target: NodeId) {
        match self.entry(target, animation) {
            Some(e) => {
                debug_assert!(
                    matches!(e.state, AnimationState::Added | AnimationState::RemainedPresent),
                    "animation removed twice in one batch"
                );
                e.state = match e.state {
                    // Added then removed inside the batch: net effect is none.
                    AnimationState::Added => AnimationState::RemainedAbsent,
                    _ => AnimationState::Removed,
                };
            }
            None => self.push(target, animation, AnimationState::Removed),
        }
    }

    /// Net (added, changed, removed) animations per target, in tree order.
    /// Targets whose entries all collapsed to no net effect are skipped.
    pub fn results(
        self,
        forest: &Forest,
    ) -> Vec<(NodeId, Vec<AnimationId>, Vec<AnimationId>, Vec<AnimationId>)> {
        let mut targets: Vec<NodeId> = self.entries.keys().copied().collect();
        targets.sort_by(|a, b| forest.tree_order(*a, *b));
        let mut out = Vec::new();
        for target in targets {
            let entries = &self.entries[&target];
            let mut added = Vec::new();
            let mut changed = Vec::new();
            let mut removed = Vec::new();
            for e in entries {
                match e.state {
                    AnimationState::Added => added.push(e.animation),
                    AnimationState::Removed => removed.push(e.animation),
                    AnimationState::RemainedPresent | AnimationState::RemainedAbsent => {}
                }
                if e.state == AnimationState::RemainedPresent && e.changed {
                    changed.push(e.animation);
                }
            }
            if !added.is_empty() || !changed.is_empty() || !removed.is_empty() {
                out.push((target, added, changed, removed));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_remove_cancels_out() {
        let mut forest = Forest::new();
        let target = forest.new_element("div");
        let mut batch = AnimationBatch::new();
        batch.animation_added(AnimationId(1), target);
        batch.animation_removed(AnimationId(1), target);
        assert!(batch.results(&forest).is_empty());
    }

    #[test]
    fn remove_then_add_reports_only_a_change() {
        let mut forest = Forest::new();
        let target = forest.new_element("div");
        let mut batch = AnimationBatch::new();
        batch.animation_removed(AnimationId(7), target);
        batch.animation_added(AnimationId(7), target);
        batch.animation_changed(AnimationId(7), target);
        let results = batch.results(&forest);
        assert_eq!(results.len(), 1);
        let (node, added, changed, removed) = &results[0];
        assert_eq!(*node, target);
        assert!(added.is_empty());
        assert_eq!(changed, &[AnimationId(7)]);
        assert!(removed.is_empty());
    }

    #[test]
    fn added_then_changed_reports_only_the_add() {
        let mut forest = Forest::new();
        let target = forest.new_element("div");
        let mut batch = AnimationBatch::new();
        batch.animation_added(AnimationId(5), target);
        batch.animation_changed(AnimationId(5), target);
        let results = batch.results(&forest);
        assert_eq!(results.len(), 1);
        let (_, added, changed, removed) = &results[0];
        assert_eq!(added, &[AnimationId(5)]);
        assert!(changed.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn add_change_remove_nets_out_to_nothing() {
        let mut forest = Forest::new();
        let target = forest.new_element("div");
        let mut batch = AnimationBatch::new();
        batch.animation_added(AnimationId(4), target);
        batch.animation_changed(AnimationId(4), target);
        batch.animation_removed(AnimationId(4), target);
        assert!(batch.results(&forest).is_empty());
    }

    #[test]
    fn change_on_removed_animation_is_dropped() {
        let mut forest = Forest::new();
        let target = forest.new_element("div");
        let mut batch = AnimationBatch::new();
        batch.animation_changed(AnimationId(3), target);
        batch.animation_removed(AnimationId(3), target);
        let results = batch.results(&forest);
        assert_eq!(results.len(), 1);
        let (_, added, changed, removed) = &results[0];
        assert!(added.is_empty());
        assert!(changed.is_empty());
        assert_eq!(removed, &[AnimationId(3)]);
    }

    #[test]
    fn targets_come_out_in_tree_order() {
        let mut forest = Forest::new();
        let root = forest.new_element("root");
        let first = forest.new_element("a");
        let second = forest.new_element("b");
        forest.append_child(root, first).unwrap();
        forest.append_child(root, second).unwrap();
        let mut batch = AnimationBatch::new();
        batch.animation_added(AnimationId(2), second);
        batch.animation_added(AnimationId(1), first);
        let results = batch.results(&forest);
        assert_eq!(results[0].0, first);
        assert_eq!(results[1].0, second);
    }

    #[test]
    fn sibling_frame_follows_removal_direction() {
        let mut forest = Forest::new();
        let parent = forest.new_element("ul");
        let nodes: Vec<_> = (0..4).map(|_| forest.new_element("li")).collect();
        for &n in &nodes {
            forest.append_child(parent, n).unwrap();
        }
        let (a, b, c, d) = (nodes[0], nodes[1], nodes[2], nodes[3]);

        let mut forward = ChildListBatch::new(parent, true);
        forward.node_removed(b, Some(a), Some(c));
        forward.node_removed(c, Some(a), Some(d));
        assert_eq!(forward.previous_sibling, Some(a));
        assert_eq!(forward.next_sibling, Some(d));

        let mut backward = ChildListBatch::new(parent, false);
        backward.node_removed(c, Some(b), Some(d));
        backward.node_removed(b, Some(a), Some(d));
        assert_eq!(backward.previous_sibling, Some(a));
        assert_eq!(backward.next_sibling, Some(d));
        assert_eq!(backward.removed, vec![c, b]);
    }

    #[test]
    fn pinned_frame_survives_removals() {
        let mut forest = Forest::new();
        let parent = forest.new_element("ul");
        let a = forest.new_element("li");
        let b = forest.new_element("li");
        let c = forest.new_element("li");
        for n in [a, b, c] {
            forest.append_child(parent, n).unwrap();
        }
        let mut batch = ChildListBatch::new(parent, true);
        batch.set_siblings(Some(a), Some(c));
        batch.node_removed(b, Some(a), Some(c));
        batch.node_added(b);
        batch.node_added(b);
        assert_eq!(batch.previous_sibling, Some(a));
        assert_eq!(batch.next_sibling, Some(c));
        assert_eq!(batch.added, vec![b]);
    }
}
