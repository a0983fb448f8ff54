use std::cell::RefCell;
use std::rc::Rc;

use dom_forest::{AttrName, Forest, NodeId};

use crate::batch::{AnimationBatch, ChildListBatch};
use crate::engine::{Engine, MutationError, ObservingInfo, ReceiverId};
use crate::options::ObserveOptions;
use crate::receiver::{self, AnimationMutation};
use crate::record::{MutationRecord, RecordKind};

/// Handle to one observer registered with a [`Dom`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u32);

impl ObserverId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to one execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u32);

impl ContextId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to one registered animation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AnimationId(pub(crate) u32);

struct Animation {
    target: Option<NodeId>,
    pseudo: bool,
}

/// A mutable tree plus its mutation notification machinery. All tree edits
/// that should be observable go through the methods here; the underlying
/// [`Forest`] is reachable read-only via [`Dom::forest`].
///
/// Single-threaded by construction. Callbacks run to completion and get
/// `&mut Dom`, so a delivery may mutate the tree again; those mutations are
/// queued for a later checkpoint.
pub struct Dom {
    forest: Forest,
    engine: Engine,
    animations: Vec<Option<Animation>>,
    free_animations: Vec<u32>,
}

impl Dom {
    pub fn new() -> Self {
        Dom {
            forest: Forest::new(),
            engine: Engine::new(),
            animations: Vec::new(),
            free_animations: Vec::new(),
        }
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    // ---- non-observable setup ----

    pub fn new_document(&mut self) -> NodeId {
        self.forest.new_document()
    }

    pub fn new_element(&mut self, tag: &str) -> NodeId {
        self.forest.new_element(tag)
    }

    pub fn new_text(&mut self, text: &str) -> NodeId {
        self.forest.new_text(text)
    }

    pub fn set_chrome_only(&mut self, node: NodeId, value: bool) -> Result<(), MutationError> {
        self.forest.set_chrome_only(node, value)?;
        Ok(())
    }

    pub fn set_native_anonymous(&mut self, node: NodeId, value: bool) -> Result<(), MutationError> {
        self.forest.set_native_anonymous(node, value)?;
        Ok(())
    }

    // ---- contexts and observers ----

    pub fn new_context(&mut self, chrome: bool) -> ContextId {
        self.engine.new_context(chrome)
    }

    /// A context that is no longer current has navigated away; pending
    /// records of its observers are dropped at delivery time.
    pub fn set_context_current(&mut self, context: ContextId, value: bool) {
        self.engine.set_context_current(context, value);
    }

    /// Suppressed contexts keep queueing but are skipped by checkpoints
    /// until unsuppressed.
    pub fn set_context_suppressed(&mut self, context: ContextId, value: bool) {
        self.engine.set_context_suppressed(context, value);
    }

    pub fn new_observer<F>(
        &mut self,
        context: ContextId,
        callback: F,
    ) -> Result<ObserverId, MutationError>
    where
        F: FnMut(&mut Dom, ObserverId, Vec<MutationRecord>) + 'static,
    {
        self.engine.new_observer(context, Rc::new(RefCell::new(callback)))
    }

    pub fn observe(
        &mut self,
        observer: ObserverId,
        node: NodeId,
        options: &ObserveOptions,
    ) -> Result<(), MutationError> {
        if !self.forest.is_alive(node) {
            return Err(MutationError::UnknownNode);
        }
        self.engine.observe(observer, node, options)
    }

    /// Drops every receiver and every pending record. The observer stays
    /// usable for a later `observe`.
    pub fn disconnect(&mut self, observer: ObserverId) {
        self.engine.disconnect(observer);
    }

    pub fn destroy_observer(&mut self, observer: ObserverId) {
        self.engine.destroy_observer(observer);
    }

    pub fn take_records(&mut self, observer: ObserverId) -> Vec<MutationRecord> {
        self.engine.take_records(observer)
    }

    pub fn observing_info(
        &self,
        observer: ObserverId,
    ) -> Result<Vec<ObservingInfo>, MutationError> {
        self.engine.observing_info(observer)
    }

    pub fn set_merge_attribute_records(
        &mut self,
        observer: ObserverId,
        value: bool,
    ) -> Result<(), MutationError> {
        self.engine.set_merge_attribute_records(observer, value)
    }

    // ---- observable tree edits ----

    /// Runs `f` for every receiver bound to `start` or one of its
    /// ancestors, inside a fresh mutation level.
    fn dispatch(&mut self, start: NodeId, mut f: impl FnMut(&mut Engine, &Forest, ReceiverId)) {
        self.engine.enter_level();
        let mut cur = Some(start);
        while let Some(n) = cur {
            for rid in self.engine.bound_receivers(n) {
                f(&mut self.engine, &self.forest, rid);
            }
            cur = self.forest.parent(n);
        }
        self.engine.leave_level();
    }

    /// Remembers `child` in the innermost open batch when the batch owns
    /// `parent`.
    fn note_batch_insertion(&mut self, parent: NodeId, child: NodeId) {
        if let Some(batch) = self.engine.current_child_batch_mut() {
            if batch.target == parent {
                batch.node_added(child);
            }
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), MutationError> {
        self.forest.append_child(parent, child)?;
        self.note_batch_insertion(parent, child);
        self.dispatch(parent, |engine, forest, rid| {
            receiver::content_appended(engine, forest, rid, parent, child);
        });
        Ok(())
    }

    /// Appends a run of siblings and reports them as one insertion, the way
    /// a parser append does.
    pub fn append_children(
        &mut self,
        parent: NodeId,
        children: &[NodeId],
    ) -> Result<(), MutationError> {
        let Some(&first) = children.first() else {
            return Ok(());
        };
        for &child in children {
            if !self.forest.is_alive(child) {
                return Err(MutationError::UnknownNode);
            }
            if self.forest.parent(child).is_some() {
                return Err(MutationError::Forest(dom_forest::ForestError::NotDetached));
            }
        }
        for &child in children {
            self.forest.append_child(parent, child)?;
            self.note_batch_insertion(parent, child);
        }
        self.dispatch(parent, |engine, forest, rid| {
            receiver::content_appended(engine, forest, rid, parent, first);
        });
        Ok(())
    }

    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), MutationError> {
        self.forest.insert_before(parent, child, reference)?;
        self.note_batch_insertion(parent, child);
        self.dispatch(parent, |engine, forest, rid| {
            receiver::content_inserted(engine, forest, rid, parent, child);
        });
        Ok(())
    }

    /// Detaches `child`; the subtree stays alive and may be reinserted.
    /// Receivers that covered the removed subtree grow transient clones so
    /// it stays observed until the next delivery to their observer.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), MutationError> {
        let prev = self.forest.prev_sibling(child);
        let next = self.forest.next_sibling(child);
        self.forest.remove_child(parent, child)?;
        self.dispatch(parent, |engine, forest, rid| {
            receiver::content_removed(engine, forest, rid, parent, child, prev, next);
        });
        Ok(())
    }

    pub fn set_attribute(
        &mut self,
        element: NodeId,
        name: &AttrName,
        value: &str,
    ) -> Result<(), MutationError> {
        self.forest.ensure_element(element)?;
        self.dispatch(element, |engine, forest, rid| {
            receiver::attribute_will_change(engine, forest, rid, element, name);
        });
        self.forest.set_attr(element, name.clone(), value)?;
        Ok(())
    }

    pub fn remove_attribute(
        &mut self,
        element: NodeId,
        name: &AttrName,
    ) -> Result<Option<String>, MutationError> {
        self.forest.ensure_element(element)?;
        if self.forest.attr(element, name).is_none() {
            return Ok(None);
        }
        self.dispatch(element, |engine, forest, rid| {
            receiver::attribute_will_change(engine, forest, rid, element, name);
        });
        Ok(self.forest.remove_attr(element, name)?)
    }

    pub fn set_character_data(&mut self, node: NodeId, text: &str) -> Result<(), MutationError> {
        self.forest.ensure_text(node)?;
        self.dispatch(node, |engine, forest, rid| {
            receiver::character_data_will_change(engine, forest, rid, node);
        });
        self.forest.set_text(node, text)?;
        Ok(())
    }

    /// Reports an anonymous child about to be attached or detached under
    /// `content`'s parent. Call while `content` is still linked.
    pub fn native_anonymous_child_list_change(
        &mut self,
        content: NodeId,
        is_remove: bool,
    ) -> Result<(), MutationError> {
        let Some(parent) = self.forest.parent(content) else {
            return Err(MutationError::UnknownNode);
        };
        self.dispatch(parent, |engine, forest, rid| {
            receiver::native_anonymous_child_list_change(engine, forest, rid, content, is_remove);
        });
        Ok(())
    }

    /// Frees a detached subtree. Receivers bound inside it are disconnected
    /// first and animations targeting it lose their target.
    pub fn destroy_subtree(&mut self, root: NodeId) -> Result<(), MutationError> {
        if !self.forest.is_alive(root) {
            return Err(MutationError::UnknownNode);
        }
        let nodes = self.forest.descendants(root);
        for &node in &nodes {
            for rid in self.engine.bound_receivers(node) {
                receiver::node_will_be_destroyed(&mut self.engine, rid);
            }
        }
        for slot in self.animations.iter_mut().flatten() {
            if slot.target.is_some_and(|t| nodes.contains(&t)) {
                slot.target = None;
            }
        }
        self.forest.free_subtree(root)?;
        Ok(())
    }

    // ---- animations ----

    pub fn new_animation(
        &mut self,
        target: NodeId,
        pseudo: bool,
    ) -> Result<AnimationId, MutationError> {
        if !self.forest.is_alive(target) {
            return Err(MutationError::UnknownNode);
        }
        let animation = Animation {
            target: Some(target),
            pseudo,
        };
        if let Some(index) = self.free_animations.pop() {
            self.animations[index as usize] = Some(animation);
            return Ok(AnimationId(index));
        }
        self.animations.push(Some(animation));
        Ok(AnimationId((self.animations.len() - 1) as u32))
    }

    pub fn drop_animation(&mut self, id: AnimationId) {
        if self
            .animations
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.take())
            .is_some()
        {
            self.free_animations.push(id.0);
        }
    }

    pub fn animation_added(&mut self, id: AnimationId) -> Result<(), MutationError> {
        self.animation_event(id, AnimationMutation::Added)
    }

    pub fn animation_changed(&mut self, id: AnimationId) -> Result<(), MutationError> {
        self.animation_event(id, AnimationMutation::Changed)
    }

    pub fn animation_removed(&mut self, id: AnimationId) -> Result<(), MutationError> {
        self.animation_event(id, AnimationMutation::Removed)
    }

    fn animation_event(
        &mut self,
        id: AnimationId,
        mutation: AnimationMutation,
    ) -> Result<(), MutationError> {
        let Some(animation) = self.animations.get(id.0 as usize).and_then(|s| s.as_ref()) else {
            return Err(MutationError::UnknownAnimation);
        };
        // An animation without a live target mutates silently.
        let Some(target) = animation.target else {
            return Ok(());
        };
        let pseudo = animation.pseudo;
        self.dispatch(target, |engine, forest, rid| {
            receiver::animation_mutated(engine, forest, rid, id, target, pseudo, mutation);
        });
        Ok(())
    }

    // ---- batches ----

    /// Runs `f` with a child-list batch open on `target`: every child-list
    /// mutation under `target` inside `f` coalesces into one record per
    /// interested observer, emitted when the batch closes. Nested batches
    /// stack; the innermost one captures. `from_first_to_last` states the
    /// direction `f` removes children in; it steers the sibling-frame capture
    /// and the final removed-node ordering. The frame may be pinned up front
    /// with [`Dom::batch_set_siblings`].
    pub fn with_child_list_batch<T>(
        &mut self,
        target: NodeId,
        from_first_to_last: bool,
        f: impl FnOnce(&mut Dom) -> T,
    ) -> Result<T, MutationError> {
        if !self.forest.is_alive(target) {
            return Err(MutationError::UnknownNode);
        }
        self.engine.enter_level();
        self.engine
            .child_batches
            .push(ChildListBatch::new(target, from_first_to_last));
        // The guard closes the batch even when `f` unwinds.
        let mut guard = ChildBatchGuard { dom: self };
        let out = f(&mut *guard.dom);
        Ok(out)
    }

    /// Pins the sibling frame of the innermost open child-list batch.
    pub fn batch_set_siblings(&mut self, previous: Option<NodeId>, next: Option<NodeId>) {
        if let Some(batch) = self.engine.current_child_batch_mut() {
            batch.set_siblings(previous, next);
        }
    }

    /// Marks the removal phase of the innermost batch as finished; later
    /// removals under the batch target are treated as internal shuffling
    /// and not recorded.
    pub fn batch_mark_removal_done(&mut self) {
        if let Some(batch) = self.engine.current_child_batch_mut() {
            batch.removal_done = true;
        }
    }

    fn close_child_batch(&mut self) {
        let Some(mut batch) = self.engine.child_batches.pop() else {
            self.engine.leave_level();
            return;
        };
        if !batch.from_first_to_last {
            batch.removed.reverse();
        }
        for (&observer, &wants) in batch.observers.iter() {
            // Keep the removed subtrees in the observation set of every
            // subtree receiver that covered the batch target.
            let origins =
                self.engine.all_subtree_receivers_for(&self.forest, observer, batch.target);
            for &removed in &batch.removed {
                for &origin in &origins {
                    if self.engine.find_receiver(observer, removed) != Some(origin) {
                        self.engine.create_transient(origin, removed);
                    }
                }
            }
            if wants && !(batch.removed.is_empty() && batch.added.is_empty()) {
                let mut rec = MutationRecord::new(RecordKind::ChildList);
                rec.target = Some(batch.target);
                rec.removed_nodes = batch.removed.clone();
                rec.added_nodes = batch.added.clone();
                rec.previous_sibling = batch.previous_sibling;
                rec.next_sibling = batch.next_sibling;
                self.engine.append_record(observer, rec);
            }
            // Scheduled even without a record so transient bookkeeping is
            // cleared at the next checkpoint.
            self.engine.schedule_for_run(observer);
        }
        self.engine.leave_level();
    }

    /// Runs `f` with the animation batch open: add/change/remove events fold
    /// into their net effect per (animation, target) and are emitted as one
    /// record per target per observer at close, targets in tree order. A
    /// nested call joins the outer batch.
    pub fn with_animation_batch<T>(&mut self, f: impl FnOnce(&mut Dom) -> T) -> T {
        if self.engine.animation_batch.is_some() {
            return f(self);
        }
        self.engine.enter_level();
        self.engine.animation_batch = Some(AnimationBatch::new());
        // The guard closes the batch even when `f` unwinds.
        let mut guard = AnimationBatchGuard { dom: self };
        f(&mut *guard.dom)
    }

    fn close_animation_batch(&mut self) {
        let Some(mut batch) = self.engine.animation_batch.take() else {
            self.engine.leave_level();
            return;
        };
        let observers = std::mem::take(&mut batch.observers);
        let results = batch.results(&self.forest);
        if results.is_empty() {
            self.engine.leave_level();
            return;
        }
        for observer in observers {
            for (target, added, changed, removed) in &results {
                let mut rec = MutationRecord::new(RecordKind::Animations);
                rec.target = Some(*target);
                rec.added_animations = added.clone();
                rec.changed_animations = changed.clone();
                rec.removed_animations = removed.clone();
                self.engine.append_record(observer, rec);
            }
            self.engine.schedule_for_run(observer);
        }
        self.engine.leave_level();
    }

    // ---- checkpoints ----

    /// Delivers pending records: drains the wait list in registration
    /// order, repeatedly, until no observer reschedules itself. Suppressed
    /// observers are skipped and put back for a later checkpoint. Reentrant
    /// calls from inside a callback are no-ops.
    pub fn run_checkpoint(&mut self) {
        if !self.engine.safe_to_run {
            self.engine.drain_deferred = true;
            return;
        }
        if let Some(current) = self.engine.current_observer {
            if !self.engine.observer_suppressed(current) {
                return;
            }
        }
        let mut suppressed: Vec<ObserverId> = Vec::new();
        while !self.engine.scheduled.is_empty() {
            let wave = std::mem::take(&mut self.engine.scheduled);
            for observer in wave {
                if self.engine.observer(observer).is_none() {
                    continue;
                }
                if self.engine.observer_suppressed(observer) {
                    if !suppressed.contains(&observer) {
                        suppressed.push(observer);
                    }
                    continue;
                }
                self.engine.current_observer = Some(observer);
                self.handle_mutation(observer);
            }
        }
        for observer in suppressed {
            // Still waiting for run; only the wait-list position is gone.
            self.engine.reschedule_for_run(observer);
        }
        self.engine.current_observer = None;
    }

    fn handle_mutation(&mut self, observer: ObserverId) {
        if let Some(ob) = self.engine.observer_mut(observer) {
            ob.waiting_for_run = false;
        }
        self.engine.clear_transient_receivers(observer);
        let deliverable = self
            .engine
            .observer(observer)
            .is_some_and(|ob| ob.pending_count > 0)
            && self.engine.observer_context_current(observer);
        if !deliverable {
            self.engine.clear_pending(observer);
            return;
        }
        let records = self.engine.take_records(observer);
        let Some(callback) = self.engine.observer(observer).map(|ob| ob.callback.clone()) else {
            return;
        };
        (callback.borrow_mut())(self, observer, records);
    }

    /// While unsafe, checkpoints queue up instead of running; restoring
    /// safety retries a deferred drain immediately.
    pub fn set_safe_to_run(&mut self, safe: bool) {
        self.engine.safe_to_run = safe;
        if safe && self.engine.drain_deferred {
            self.engine.drain_deferred = false;
            self.run_checkpoint();
        }
    }

    /// Tears down scheduling state. Idempotent; safe with nothing pending.
    pub fn shutdown(&mut self) {
        self.engine.shutdown();
    }
}

impl Default for Dom {
    fn default() -> Self {
        Self::new()
    }
}

struct ChildBatchGuard<'a> {
    dom: &'a mut Dom,
}

impl Drop for ChildBatchGuard<'_> {
    fn drop(&mut self) {
        self.dom.close_child_batch();
    }
}

struct AnimationBatchGuard<'a> {
    dom: &'a mut Dom,
}

impl Drop for AnimationBatchGuard<'_> {
    fn drop(&mut self) {
        self.dom.close_animation_batch();
    }
}
