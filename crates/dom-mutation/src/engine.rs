use std::cell::RefCell;
use std::rc::Rc;

use dom_forest::{Forest, ForestError, NodeId};
use indexmap::IndexMap;
use thiserror::Error;

use crate::batch::{AnimationBatch, ChildListBatch};
use crate::dom::{AnimationId, ContextId, Dom, ObserverId};
use crate::options::ObserveOptions;
use crate::receiver::{AnimationMutation, Receiver, ReceiverConfig, ReceiverKind};
use crate::record::{MutationRecord, RecordKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("observe() options do not request any mutation kind")]
    NoKindsRequested,
    #[error("attributeOldValue requires attributes")]
    OldValueWithoutAttributes,
    #[error("attributeFilter requires attributes")]
    FilterWithoutAttributes,
    #[error("characterDataOldValue requires characterData")]
    OldTextWithoutCharacterData,
    #[error("unknown execution context")]
    InvalidContext,
    #[error("unknown or freed node")]
    UnknownNode,
    #[error("unknown observer")]
    UnknownObserver,
    #[error("unknown animation")]
    UnknownAnimation,
    #[error("allocation failed while materializing observing info")]
    OutOfMemory,
    #[error("tree operation failed: {0}")]
    Forest(#[from] ForestError),
}

/// Active configuration of one receiver, as reported by `observing_info`.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservingInfo {
    pub node: NodeId,
    pub child_list: bool,
    pub attributes: bool,
    pub character_data: bool,
    pub subtree: bool,
    pub attribute_old_value: bool,
    pub character_data_old_value: bool,
    pub native_anonymous_child_list: bool,
    pub animations: bool,
    pub attribute_filter: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ReceiverId(u32);

impl ReceiverId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RecordId(u32);

impl RecordId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) type DeliveryCallback = dyn FnMut(&mut Dom, ObserverId, Vec<MutationRecord>);

pub(crate) struct Observer {
    /// Monotonic registration id; delivery order at a checkpoint.
    pub reg_id: u64,
    pub context: ContextId,
    pub callback: Rc<RefCell<DeliveryCallback>>,
    /// Owning list of non-transient receivers.
    pub receivers: Vec<ReceiverId>,
    /// Removed node -> transient clones attached to it.
    pub transient: IndexMap<NodeId, Vec<ReceiverId>>,
    head: Option<RecordId>,
    tail: Option<RecordId>,
    pub pending_count: usize,
    /// Per-level current-record slots; index = level - 1.
    pub current_slots: Vec<Option<RecordId>>,
    pub waiting_for_run: bool,
    pub merge_attribute_records: bool,
}

struct QueuedRecord {
    rec: MutationRecord,
    next: Option<RecordId>,
    /// Still linked into the pending queue.
    queued: bool,
    /// Still referenced by a current-record slot.
    in_slot: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ContextState {
    pub current: bool,
    pub suppressed: bool,
    pub chrome: bool,
}

/// Process-wide mutation state: slabs, the node binding registry, the
/// mutation level stack, and the checkpoint scheduler. One instance per
/// [`Dom`]; tests get isolation for free.
pub(crate) struct Engine {
    observers: Vec<Option<Observer>>,
    free_observers: Vec<u32>,
    receivers: Vec<Option<Receiver>>,
    free_receivers: Vec<u32>,
    records: Vec<Option<QueuedRecord>>,
    free_records: Vec<u32>,
    contexts: Vec<ContextState>,
    /// Node-side back-reference set: node -> receivers bound to it.
    /// Lookup-only; ownership stays with the observers.
    bindings: IndexMap<NodeId, Vec<ReceiverId>>,
    level: u32,
    /// Observers that touched each active level; index = level - 1.
    currently_handling: Vec<Vec<ObserverId>>,
    /// Wait list for the next checkpoint, sorted by registration id.
    pub scheduled: Vec<ObserverId>,
    /// Reentrancy guard for checkpoint drains.
    pub current_observer: Option<ObserverId>,
    pub safe_to_run: bool,
    pub drain_deferred: bool,
    next_reg_id: u64,
    pub child_batches: Vec<ChildListBatch>,
    pub animation_batch: Option<AnimationBatch>,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            observers: Vec::new(),
            free_observers: Vec::new(),
            receivers: Vec::new(),
            free_receivers: Vec::new(),
            records: Vec::new(),
            free_records: Vec::new(),
            contexts: Vec::new(),
            bindings: IndexMap::new(),
            level: 0,
            currently_handling: Vec::new(),
            scheduled: Vec::new(),
            current_observer: None,
            safe_to_run: true,
            drain_deferred: false,
            next_reg_id: 0,
            child_batches: Vec::new(),
            animation_batch: None,
        }
    }

    /// Releases scheduling and level-tracking state. Safe to call even if
    /// nothing was ever scheduled.
    pub fn shutdown(&mut self) {
        self.scheduled.clear();
        self.currently_handling.clear();
        self.current_observer = None;
        self.drain_deferred = false;
    }

    // ---- contexts ----

    pub fn new_context(&mut self, chrome: bool) -> ContextId {
        self.contexts.push(ContextState {
            current: true,
            suppressed: false,
            chrome,
        });
        ContextId((self.contexts.len() - 1) as u32)
    }

    fn context(&self, id: ContextId) -> Option<&ContextState> {
        self.contexts.get(id.index())
    }

    pub fn context_exists(&self, id: ContextId) -> bool {
        self.context(id).is_some()
    }

    pub fn set_context_current(&mut self, id: ContextId, value: bool) {
        if let Some(ctx) = self.contexts.get_mut(id.index()) {
            ctx.current = value;
        }
    }

    pub fn set_context_suppressed(&mut self, id: ContextId, value: bool) {
        if let Some(ctx) = self.contexts.get_mut(id.index()) {
            ctx.suppressed = value;
        }
    }

    // ---- observers ----

    pub fn new_observer(
        &mut self,
        context: ContextId,
        callback: Rc<RefCell<DeliveryCallback>>,
    ) -> Result<ObserverId, MutationError> {
        if !self.context_exists(context) {
            return Err(MutationError::InvalidContext);
        }
        let reg_id = self.next_reg_id;
        self.next_reg_id += 1;
        let observer = Observer {
            reg_id,
            context,
            callback,
            receivers: Vec::new(),
            transient: IndexMap::new(),
            head: None,
            tail: None,
            pending_count: 0,
            current_slots: Vec::new(),
            waiting_for_run: false,
            merge_attribute_records: false,
        };
        let id = if let Some(index) = self.free_observers.pop() {
            self.observers[index as usize] = Some(observer);
            ObserverId(index)
        } else {
            self.observers.push(Some(observer));
            ObserverId((self.observers.len() - 1) as u32)
        };
        Ok(id)
    }

    pub fn observer(&self, id: ObserverId) -> Option<&Observer> {
        self.observers.get(id.index()).and_then(|s| s.as_ref())
    }

    pub fn observer_mut(&mut self, id: ObserverId) -> Option<&mut Observer> {
        self.observers.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    pub fn observer_is_chrome(&self, id: ObserverId) -> bool {
        self.observer(id)
            .and_then(|ob| self.context(ob.context))
            .is_some_and(|ctx| ctx.chrome)
    }

    pub fn observer_suppressed(&self, id: ObserverId) -> bool {
        self.observer(id)
            .and_then(|ob| self.context(ob.context))
            .is_some_and(|ctx| ctx.suppressed)
    }

    pub fn observer_context_current(&self, id: ObserverId) -> bool {
        self.observer(id)
            .and_then(|ob| self.context(ob.context))
            .is_some_and(|ctx| ctx.current)
    }

    pub fn set_merge_attribute_records(
        &mut self,
        id: ObserverId,
        value: bool,
    ) -> Result<(), MutationError> {
        let ob = self
            .observer_mut(id)
            .ok_or(MutationError::UnknownObserver)?;
        ob.merge_attribute_records = value;
        Ok(())
    }

    pub fn disconnect(&mut self, id: ObserverId) {
        let Some(ob) = self.observer_mut(id) else {
            return;
        };
        let receivers = std::mem::take(&mut ob.receivers);
        ob.current_slots.clear();
        for rid in receivers {
            self.disconnect_receiver(rid, false);
        }
        self.clear_pending(id);
    }

    pub fn destroy_observer(&mut self, id: ObserverId) {
        if self.observer(id).is_none() {
            return;
        }
        self.disconnect(id);
        self.scheduled.retain(|o| *o != id);
        self.observers[id.index()] = None;
        self.free_observers.push(id.index() as u32);
    }

    // ---- receivers ----

    pub fn receiver(&self, id: ReceiverId) -> Option<&Receiver> {
        self.receivers.get(id.index()).and_then(|s| s.as_ref())
    }

    fn receiver_mut(&mut self, id: ReceiverId) -> Option<&mut Receiver> {
        self.receivers.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    fn alloc_receiver(&mut self, receiver: Receiver) -> ReceiverId {
        if let Some(index) = self.free_receivers.pop() {
            self.receivers[index as usize] = Some(receiver);
            return ReceiverId(index);
        }
        self.receivers.push(Some(receiver));
        ReceiverId((self.receivers.len() - 1) as u32)
    }

    pub fn observer_of(&self, rid: ReceiverId) -> Option<ObserverId> {
        self.receiver(rid).map(|r| r.observer)
    }

    pub fn parent_of(&self, rid: ReceiverId) -> Option<ReceiverId> {
        self.receiver(rid).and_then(|r| r.parent)
    }

    pub fn kind_of(&self, rid: ReceiverId) -> Option<ReceiverKind> {
        self.receiver(rid).map(|r| r.kind)
    }

    /// (observed target, register target). The target of a transient clone
    /// resolves through its origin.
    pub fn receiver_targets(&self, rid: ReceiverId) -> Option<(NodeId, NodeId)> {
        let r = self.receiver(rid)?;
        let mut origin = r;
        while let Some(p) = origin.parent {
            origin = self.receiver(p)?;
        }
        Some((origin.target, r.register_target))
    }

    /// Resolves the authoritative configuration (climbing to the origin for
    /// transient clones) and applies `f` to it.
    pub fn with_config<T>(&self, rid: ReceiverId, f: impl FnOnce(&ReceiverConfig) -> T) -> Option<T> {
        let mut r = self.receiver(rid)?;
        while let Some(p) = r.parent {
            r = self.receiver(p)?;
        }
        Some(f(&r.config))
    }

    /// Non-transient receiver of `observer` observing `node`, if any.
    pub fn find_receiver(&self, observer: ObserverId, node: NodeId) -> Option<ReceiverId> {
        // Fast path: nothing is bound to this node at all.
        if !self.bindings.contains_key(&node) {
            return None;
        }
        self.observer(observer)?
            .receivers
            .iter()
            .copied()
            .find(|rid| {
                self.receiver(*rid)
                    .is_some_and(|r| r.register_target == node)
            })
    }

    fn bind(&mut self, node: NodeId, rid: ReceiverId) {
        self.bindings.entry(node).or_default().push(rid);
    }

    fn unbind(&mut self, node: NodeId, rid: ReceiverId) {
        if let Some(list) = self.bindings.get_mut(&node) {
            list.retain(|x| *x != rid);
            if list.is_empty() {
                self.bindings.shift_remove(&node);
            }
        }
    }

    /// Snapshot of the receivers bound to `node`.
    pub fn bound_receivers(&self, node: NodeId) -> Vec<ReceiverId> {
        self.bindings.get(&node).cloned().unwrap_or_default()
    }

    pub fn create_receiver(
        &mut self,
        observer: ObserverId,
        node: NodeId,
        kind: ReceiverKind,
    ) -> ReceiverId {
        let rid = self.alloc_receiver(Receiver {
            observer,
            register_target: node,
            target: node,
            parent: None,
            clones: Vec::new(),
            kind,
            config: ReceiverConfig::default(),
        });
        self.bind(node, rid);
        if let Some(ob) = self.observer_mut(observer) {
            ob.receivers.push(rid);
        }
        rid
    }

    /// Clones `origin` onto a node removed from its observed subtree, so the
    /// detached subtree stays in the same observation set until the next
    /// delivery.
    pub fn create_transient(&mut self, origin: ReceiverId, node: NodeId) -> Option<ReceiverId> {
        let observer = self.observer_of(origin)?;
        let kind = if self.with_config(origin, |cfg| cfg.animations)? {
            ReceiverKind::AnimationAware
        } else {
            ReceiverKind::Plain
        };
        let rid = self.alloc_receiver(Receiver {
            observer,
            register_target: node,
            target: node,
            parent: Some(origin),
            clones: Vec::new(),
            kind,
            config: ReceiverConfig::default(),
        });
        self.bind(node, rid);
        if let Some(orig) = self.receiver_mut(origin) {
            orig.clones.push(rid);
        }
        if let Some(ob) = self.observer_mut(observer) {
            ob.transient.entry(node).or_default().push(rid);
        }
        Some(rid)
    }

    pub fn transient_exists(
        &self,
        observer: ObserverId,
        node: NodeId,
        origin: ReceiverId,
    ) -> bool {
        self.observer(observer)
            .and_then(|ob| ob.transient.get(&node))
            .is_some_and(|list| {
                list.iter()
                    .any(|rid| self.parent_of(*rid) == Some(origin))
            })
    }

    /// Delivery-time cleanup: every transient clone of the observer is
    /// dropped and the removed-node table emptied.
    pub fn clear_transient_receivers(&mut self, observer: ObserverId) {
        let receivers = match self.observer(observer) {
            Some(ob) => ob.receivers.clone(),
            None => return,
        };
        for rid in receivers {
            self.remove_clones(rid);
        }
        // Clones whose origin vanished are still in the table; unbind them.
        let leftovers: Vec<ReceiverId> = self
            .observer(observer)
            .map(|ob| ob.transient.values().flatten().copied().collect())
            .unwrap_or_default();
        for rid in leftovers {
            self.disconnect_receiver(rid, false);
        }
    }

    pub fn remove_clones(&mut self, rid: ReceiverId) {
        let clones = match self.receiver_mut(rid) {
            Some(r) => std::mem::take(&mut r.clones),
            None => return,
        };
        for clone in clones {
            self.disconnect_receiver(clone, false);
        }
    }

    /// Unbinds a receiver from the tree and the observer, drops its clones
    /// and frees its slot. Idempotent: a stale id is a no-op.
    pub fn disconnect_receiver(&mut self, rid: ReceiverId, remove_from_observer: bool) {
        let Some(receiver) = self
            .receivers
            .get_mut(rid.index())
            .and_then(|slot| slot.take())
        else {
            return;
        };
        self.free_receivers.push(rid.index() as u32);
        self.unbind(receiver.register_target, rid);
        for clone in receiver.clones {
            self.disconnect_receiver(clone, false);
        }
        if let Some(parent) = receiver.parent {
            if let Some(p) = self.receiver_mut(parent) {
                p.clones.retain(|x| *x != rid);
            }
            if let Some(ob) = self.observer_mut(receiver.observer) {
                if let Some(list) = ob.transient.get_mut(&receiver.register_target) {
                    list.retain(|x| *x != rid);
                    if list.is_empty() {
                        ob.transient.shift_remove(&receiver.register_target);
                    }
                }
            }
        }
        if remove_from_observer {
            if let Some(ob) = self.observer_mut(receiver.observer) {
                ob.receivers.retain(|x| *x != rid);
            }
        }
    }

    /// Every subtree receiver of `observer` whose observation set covers
    /// `node`, walking the ancestor chain; transient clones contribute
    /// their origin.
    pub fn all_subtree_receivers_for(
        &self,
        forest: &Forest,
        observer: ObserverId,
        node: NodeId,
    ) -> Vec<ReceiverId> {
        let mut out = Vec::new();
        let Some(ob) = self.observer(observer) else {
            return out;
        };
        let total = ob.receivers.len();
        let mut cur = Some(node);
        while let Some(n) = cur {
            if self.bindings.contains_key(&n) {
                if let Some(rid) = self.find_receiver(observer, n) {
                    if self.with_config(rid, |cfg| cfg.subtree).unwrap_or(false)
                        && !out.contains(&rid)
                    {
                        out.push(rid);
                        if out.len() == total {
                            return out;
                        }
                    }
                }
                if let Some(list) = ob.transient.get(&n) {
                    for &t in list {
                        if let Some(origin) = self.parent_of(t) {
                            if self.with_config(t, |cfg| cfg.subtree).unwrap_or(false)
                                && !out.contains(&origin)
                            {
                                out.push(origin);
                            }
                        }
                    }
                    if out.len() == total {
                        return out;
                    }
                }
            }
            cur = forest.parent(n);
        }
        out
    }

    // ---- observe / introspection ----

    pub fn observe(
        &mut self,
        observer: ObserverId,
        node: NodeId,
        options: &ObserveOptions,
    ) -> Result<(), MutationError> {
        let config = options.resolve()?;
        if self.observer(observer).is_none() {
            return Err(MutationError::UnknownObserver);
        }
        let rid = match self.find_receiver(observer, node) {
            Some(rid) => rid,
            None => {
                let kind = if config.animations {
                    ReceiverKind::AnimationAware
                } else {
                    ReceiverKind::Plain
                };
                self.create_receiver(observer, node, kind)
            }
        };
        if let Some(r) = self.receiver_mut(rid) {
            r.config = config;
        }
        self.remove_clones(rid);
        Ok(())
    }

    pub fn observing_info(&self, observer: ObserverId) -> Result<Vec<ObservingInfo>, MutationError> {
        let ob = self
            .observer(observer)
            .ok_or(MutationError::UnknownObserver)?;
        let mut out = Vec::new();
        out.try_reserve(ob.receivers.len())
            .map_err(|_| MutationError::OutOfMemory)?;
        for &rid in &ob.receivers {
            let Some(r) = self.receiver(rid) else {
                continue;
            };
            let cfg = &r.config;
            let attribute_filter = if cfg.attribute_filter.is_empty() {
                None
            } else {
                let mut filter: Vec<String> = Vec::new();
                filter
                    .try_reserve(cfg.attribute_filter.len())
                    .map_err(|_| MutationError::OutOfMemory)?;
                filter.extend(cfg.attribute_filter.iter().cloned());
                Some(filter)
            };
            out.push(ObservingInfo {
                node: r.register_target,
                child_list: cfg.child_list,
                attributes: cfg.attributes,
                character_data: cfg.character_data,
                subtree: cfg.subtree,
                attribute_old_value: cfg.attribute_old_value,
                character_data_old_value: cfg.character_data_old_value,
                native_anonymous_child_list: cfg.native_anonymous_child_list,
                animations: cfg.animations,
                attribute_filter,
            });
        }
        Ok(out)
    }

    // ---- mutation level stack ----

    pub fn enter_level(&mut self) {
        self.level += 1;
    }

    /// Leaves the most recently entered level. Every observer that touched
    /// it has its current-record slot for the level finalized, closing the
    /// record to further field writes.
    pub fn leave_level(&mut self) {
        let level = self.level as usize;
        debug_assert!(level > 0, "unbalanced level exit");
        if self.currently_handling.len() == level {
            let touched = self.currently_handling.pop().unwrap_or_default();
            for obs in touched {
                let popped = match self.observer_mut(obs) {
                    Some(ob) if ob.current_slots.len() == level => ob.current_slots.pop(),
                    _ => None,
                };
                if let Some(Some(rid)) = popped {
                    self.release_slot(rid);
                }
            }
        }
        self.level = self.level.saturating_sub(1);
    }

    /// Registers the observer as handling every level from 1 up to `level`;
    /// nested reentrancy requires ancestor levels to be tracked too.
    fn add_currently_handling(&mut self, observer: ObserverId, level: u32) {
        debug_assert!(level > 0, "unexpected mutation level");
        while self.currently_handling.len() < level as usize {
            self.currently_handling.push(Vec::new());
        }
        for l in 0..level as usize {
            if !self.currently_handling[l].contains(&observer) {
                self.currently_handling[l].push(observer);
            }
        }
    }

    /// Fetches or creates the current record of the active level. A fresh
    /// record reserves its pending-queue position immediately and schedules
    /// the observer.
    pub fn current_record(
        &mut self,
        observer: ObserverId,
        kind: RecordKind,
    ) -> Option<RecordId> {
        debug_assert!(self.level > 0, "unexpected mutation level");
        if self.level == 0 {
            return None;
        }
        let level = self.level as usize;
        {
            let ob = self.observer_mut(observer)?;
            while ob.current_slots.len() < level {
                ob.current_slots.push(None);
            }
        }
        let existing = self.observer(observer)?.current_slots[level - 1];
        let rid = match existing {
            Some(rid) => rid,
            None => {
                let rid = self.append_record(observer, MutationRecord::new(kind))?;
                if let Some(slot) = self.records.get_mut(rid.index()).and_then(|s| s.as_mut()) {
                    slot.in_slot = true;
                }
                self.observer_mut(observer)?.current_slots[level - 1] = Some(rid);
                self.schedule_for_run(observer);
                rid
            }
        };
        #[cfg(debug_assertions)]
        {
            assert_eq!(self.currently_handling.len(), level);
            for l in 0..level {
                assert!(
                    self.currently_handling[l].contains(&observer),
                    "observer must be registered at every nested level"
                );
            }
            if let Some(q) = self.records.get(rid.index()).and_then(|s| s.as_ref()) {
                assert_eq!(q.rec.kind, kind, "unexpected record kind in current slot");
            }
        }
        Some(rid)
    }

    // ---- pending queue ----

    fn alloc_record(&mut self, record: QueuedRecord) -> RecordId {
        if let Some(index) = self.free_records.pop() {
            self.records[index as usize] = Some(record);
            return RecordId(index);
        }
        self.records.push(Some(record));
        RecordId((self.records.len() - 1) as u32)
    }

    fn free_record(&mut self, rid: RecordId) {
        if self.records[rid.index()].take().is_some() {
            self.free_records.push(rid.index() as u32);
        }
    }

    /// A slot finalized by `leave_level`; free the record now if it was
    /// already drained out of the queue.
    fn release_slot(&mut self, rid: RecordId) {
        let free = match self.records.get_mut(rid.index()).and_then(|s| s.as_mut()) {
            Some(q) => {
                q.in_slot = false;
                !q.queued
            }
            None => false,
        };
        if free {
            self.free_record(rid);
        }
    }

    pub fn record_mut(&mut self, rid: RecordId) -> Option<&mut MutationRecord> {
        self.records
            .get_mut(rid.index())
            .and_then(|s| s.as_mut())
            .map(|q| &mut q.rec)
    }

    pub fn append_record(
        &mut self,
        observer: ObserverId,
        record: MutationRecord,
    ) -> Option<RecordId> {
        self.observer(observer)?;
        let rid = self.alloc_record(QueuedRecord {
            rec: record,
            next: None,
            queued: true,
            in_slot: false,
        });
        let tail = self.observer(observer)?.tail;
        match tail {
            Some(t) => {
                if let Some(q) = self.records.get_mut(t.index()).and_then(|s| s.as_mut()) {
                    q.next = Some(rid);
                }
            }
            None => self.observer_mut(observer)?.head = Some(rid),
        }
        let ob = self.observer_mut(observer)?;
        ob.tail = Some(rid);
        ob.pending_count += 1;
        Some(rid)
    }

    /// Unlinks one record from the queue. Records still referenced by a
    /// current-record slot are snapshotted instead of freed; the slot copy
    /// is released when its level exits.
    fn detach_record(&mut self, rid: RecordId) -> Option<(MutationRecord, Option<RecordId>)> {
        let keep_slot_copy = {
            let q = self.records.get_mut(rid.index()).and_then(|s| s.as_mut())?;
            q.queued = false;
            q.in_slot
        };
        if keep_slot_copy {
            let q = self.records.get_mut(rid.index()).and_then(|s| s.as_mut())?;
            let next = q.next.take();
            Some((q.rec.clone(), next))
        } else {
            let q = self.records[rid.index()].take()?;
            self.free_records.push(rid.index() as u32);
            Some((q.rec, q.next))
        }
    }

    /// Drains the whole pending queue in finalization order, applying the
    /// adjacent attribute-record merge when enabled.
    pub fn take_records(&mut self, observer: ObserverId) -> Vec<MutationRecord> {
        let (mut cur, merge, count) = match self.observer_mut(observer) {
            Some(ob) => {
                let head = ob.head.take();
                ob.tail = None;
                let count = ob.pending_count;
                ob.pending_count = 0;
                (head, ob.merge_attribute_records, count)
            }
            None => return Vec::new(),
        };
        let mut out = Vec::with_capacity(count);
        while let Some(rid) = cur {
            let Some((rec, next)) = self.detach_record(rid) else {
                break;
            };
            cur = next;
            if !merge || !Self::mergeable_attribute_record(out.last(), &rec) {
                out.push(rec);
            }
        }
        out
    }

    pub fn clear_pending(&mut self, observer: ObserverId) {
        let mut cur = match self.observer_mut(observer) {
            Some(ob) => {
                let head = ob.head.take();
                ob.tail = None;
                ob.pending_count = 0;
                head
            }
            None => return,
        };
        while let Some(rid) = cur {
            match self.detach_record(rid) {
                Some((_, next)) => cur = next,
                None => break,
            }
        }
    }

    /// A new attributes record collapses into the previous output record
    /// when type, target, attribute name and namespace all match; the
    /// surviving record keeps the first seen previous value.
    fn mergeable_attribute_record(
        previous: Option<&MutationRecord>,
        record: &MutationRecord,
    ) -> bool {
        previous.is_some_and(|prev| {
            prev.kind == RecordKind::Attributes
                && prev.kind == record.kind
                && prev.target == record.target
                && prev.attr_name == record.attr_name
                && prev.attr_namespace == record.attr_namespace
        })
    }

    // ---- scheduler ----

    pub fn schedule_for_run(&mut self, observer: ObserverId) {
        if self.level > 0 {
            self.add_currently_handling(observer, self.level);
        }
        let Some(ob) = self.observer_mut(observer) else {
            return;
        };
        if ob.waiting_for_run {
            return;
        }
        ob.waiting_for_run = true;
        self.reschedule_for_run(observer);
    }

    /// Sorted insert by registration id; never re-sorts the wait list.
    pub fn reschedule_for_run(&mut self, observer: ObserverId) {
        let Some(reg_id) = self.observer(observer).map(|ob| ob.reg_id) else {
            return;
        };
        let mut insert_at = self.scheduled.len();
        for (i, other) in self.scheduled.iter().enumerate() {
            if self.observer(*other).is_some_and(|ob| ob.reg_id > reg_id) {
                insert_at = i;
                break;
            }
        }
        self.scheduled.insert(insert_at, observer);
    }

    // ---- batches ----

    pub fn is_batching(&self) -> bool {
        !self.child_batches.is_empty()
    }

    pub fn current_child_batch_mut(&mut self) -> Option<&mut ChildListBatch> {
        self.child_batches.last_mut()
    }

    pub fn batch_target(&self) -> Option<NodeId> {
        self.child_batches.last().map(|b| b.target)
    }

    pub fn batch_removal_done(&self) -> bool {
        self.child_batches
            .last()
            .is_some_and(|b| b.removal_done)
    }

    pub fn batch_node_removed(
        &mut self,
        child: NodeId,
        previous: Option<NodeId>,
        next: Option<NodeId>,
    ) {
        if let Some(b) = self.child_batches.last_mut() {
            b.node_removed(child, previous, next);
        }
    }

    pub fn batch_update_observer(&mut self, observer: ObserverId, wants_child_list: bool) {
        if let Some(b) = self.child_batches.last_mut() {
            b.update_observer(observer, wants_child_list);
        }
    }

    pub fn is_animation_batching(&self) -> bool {
        self.animation_batch.is_some()
    }

    pub fn animation_batch_record(
        &mut self,
        animation: AnimationId,
        target: NodeId,
        mutation: AnimationMutation,
    ) {
        if let Some(b) = self.animation_batch.as_mut() {
            match mutation {
                AnimationMutation::Added => b.animation_added(animation, target),
                AnimationMutation::Changed => b.animation_changed(animation, target),
                AnimationMutation::Removed => b.animation_removed(animation, target),
            }
        }
    }

    pub fn animation_batch_add_observer(&mut self, observer: ObserverId) {
        if let Some(b) = self.animation_batch.as_mut() {
            b.add_observer(observer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> Rc<RefCell<DeliveryCallback>> {
        Rc::new(RefCell::new(|_: &mut Dom, _, _| {}))
    }

    fn engine_with_observer() -> (Engine, ObserverId) {
        let mut engine = Engine::new();
        let ctx = engine.new_context(false);
        let obs = engine.new_observer(ctx, noop_callback()).unwrap();
        (engine, obs)
    }

    #[test]
    fn pending_queue_preserves_append_order() {
        let (mut engine, obs) = engine_with_observer();
        for kind in [RecordKind::ChildList, RecordKind::CharacterData] {
            engine.append_record(obs, MutationRecord::new(kind)).unwrap();
        }
        let records = engine.take_records(obs);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, RecordKind::ChildList);
        assert_eq!(records[1].kind, RecordKind::CharacterData);
        assert!(engine.take_records(obs).is_empty());
    }

    #[test]
    fn adjacent_attribute_records_merge_keeping_first_prev_value() {
        let (mut engine, obs) = engine_with_observer();
        engine.set_merge_attribute_records(obs, true).unwrap();
        let target = {
            let mut forest = Forest::new();
            forest.new_element("x")
        };
        for value in ["a", "b", "c"] {
            let mut rec = MutationRecord::new(RecordKind::Attributes);
            rec.target = Some(target);
            rec.attr_name = Some("class".into());
            rec.prev_value = Some(value.into());
            engine.append_record(obs, rec).unwrap();
        }
        let records = engine.take_records(obs);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].prev_value.as_deref(), Some("a"));
    }

    #[test]
    fn merge_only_looks_at_the_adjacent_record() {
        let (mut engine, obs) = engine_with_observer();
        engine.set_merge_attribute_records(obs, true).unwrap();
        let target = {
            let mut forest = Forest::new();
            forest.new_element("x")
        };
        let mut attr = MutationRecord::new(RecordKind::Attributes);
        attr.target = Some(target);
        attr.attr_name = Some("id".into());
        engine.append_record(obs, attr.clone()).unwrap();
        engine
            .append_record(obs, MutationRecord::new(RecordKind::ChildList))
            .unwrap();
        engine.append_record(obs, attr).unwrap();
        let records = engine.take_records(obs);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn scheduled_list_stays_sorted_by_registration_order() {
        let mut engine = Engine::new();
        let ctx = engine.new_context(false);
        let first = engine.new_observer(ctx, noop_callback()).unwrap();
        let second = engine.new_observer(ctx, noop_callback()).unwrap();
        let third = engine.new_observer(ctx, noop_callback()).unwrap();
        engine.enter_level();
        engine.schedule_for_run(third);
        engine.schedule_for_run(first);
        engine.schedule_for_run(second);
        engine.leave_level();
        assert_eq!(engine.scheduled, vec![first, second, third]);
    }

    #[test]
    fn leave_level_finalizes_current_slots() {
        let (mut engine, obs) = engine_with_observer();
        engine.enter_level();
        let rid = engine.current_record(obs, RecordKind::ChildList).unwrap();
        assert_eq!(
            engine.current_record(obs, RecordKind::ChildList).unwrap(),
            rid
        );
        engine.leave_level();
        engine.enter_level();
        let fresh = engine.current_record(obs, RecordKind::ChildList).unwrap();
        assert_ne!(fresh, rid);
        engine.leave_level();
        assert_eq!(engine.observer(obs).unwrap().pending_count, 2);
    }

    #[test]
    fn shutdown_is_safe_without_activity() {
        let mut engine = Engine::new();
        engine.shutdown();
        let (mut engine, obs) = engine_with_observer();
        engine.enter_level();
        engine.schedule_for_run(obs);
        engine.leave_level();
        engine.shutdown();
        assert!(engine.scheduled.is_empty());
    }
}
