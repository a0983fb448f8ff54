use dom_forest::{AttrName, Forest, NodeId};

use crate::dom::{AnimationId, ObserverId};
use crate::engine::{Engine, ReceiverId};
use crate::record::RecordKind;

/// Which extra event channel a receiver subscribes to. Fixed at creation;
/// transient clones inherit it from the animations flag of their origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReceiverKind {
    Plain,
    AnimationAware,
}

/// Resolved observation configuration. An empty `attribute_filter` together
/// with `all_attributes = true` means every attribute is in scope.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ReceiverConfig {
    pub child_list: bool,
    pub attributes: bool,
    pub character_data: bool,
    pub subtree: bool,
    pub attribute_old_value: bool,
    pub character_data_old_value: bool,
    pub native_anonymous_child_list: bool,
    pub animations: bool,
    pub attribute_filter: Vec<String>,
    pub all_attributes: bool,
}

/// One (observer, node) subscription. Non-transient receivers own their
/// configuration; transient clones resolve target and configuration through
/// `parent`, so a re-observe of the origin is visible to live clones.
#[derive(Debug)]
pub(crate) struct Receiver {
    pub observer: ObserverId,
    /// Node this receiver is bound to in the node registry. For transient
    /// clones this is the removed node.
    pub register_target: NodeId,
    /// Observed node; authoritative only when `parent` is `None`.
    pub target: NodeId,
    pub parent: Option<ReceiverId>,
    pub clones: Vec<ReceiverId>,
    pub kind: ReceiverKind,
    pub config: ReceiverConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AnimationMutation {
    Added,
    Changed,
    Removed,
}

/// Observability predicate: restricted-access nodes are never reported, and
/// anonymous-subtree content only to observers with elevated visibility.
fn is_observable(engine: &Engine, forest: &Forest, rid: ReceiverId, node: NodeId) -> bool {
    let Some(obs) = engine.observer_of(rid) else {
        return false;
    };
    !forest.chrome_only_access(node)
        && (engine.observer_is_chrome(obs) || !forest.in_anonymous_subtree(node))
}

fn observes_attr(
    engine: &Engine,
    forest: &Forest,
    rid: ReceiverId,
    element: NodeId,
    name: &AttrName,
) -> bool {
    let Some((target, register_target)) = engine.receiver_targets(rid) else {
        return false;
    };
    let in_scope = engine
        .with_config(rid, |cfg| {
            cfg.attributes
                && ((cfg.subtree
                    && forest.subtree_root(register_target) == forest.subtree_root(element))
                    || (!cfg.subtree && element == target))
        })
        .unwrap_or(false);
    if !in_scope || !is_observable(engine, forest, rid, element) {
        return false;
    }
    engine
        .with_config(rid, |cfg| {
            if cfg.all_attributes {
                return true;
            }
            // A namespaced attribute never matches an allow-list.
            if name.ns.is_some() {
                return false;
            }
            cfg.attribute_filter.iter().any(|f| f == &name.local)
        })
        .unwrap_or(false)
}

pub(crate) fn attribute_will_change(
    engine: &mut Engine,
    forest: &Forest,
    rid: ReceiverId,
    element: NodeId,
    name: &AttrName,
) {
    if engine.is_batching() || !observes_attr(engine, forest, rid, element, name) {
        return;
    }
    let Some(obs) = engine.observer_of(rid) else {
        return;
    };
    let snapshot_old = engine
        .with_config(rid, |cfg| cfg.attribute_old_value)
        .unwrap_or(false);
    let current = forest.attr(element, name).map(str::to_string);

    let Some(record) = engine.current_record(obs, RecordKind::Attributes) else {
        return;
    };
    let Some(m) = engine.record_mut(record) else {
        return;
    };
    debug_assert!(
        m.target.is_none() || m.target == Some(element),
        "wrong target"
    );
    debug_assert!(
        m.attr_name.is_none() || m.attr_name.as_deref() == Some(name.local.as_str()),
        "wrong attribute"
    );
    if m.target.is_none() {
        m.target = Some(element);
        m.attr_name = Some(name.local.clone());
        m.attr_namespace = name.ns.clone();
    }
    if snapshot_old && m.prev_value.is_none() {
        m.prev_value = current;
    }
}

pub(crate) fn character_data_will_change(
    engine: &mut Engine,
    forest: &Forest,
    rid: ReceiverId,
    content: NodeId,
) {
    let Some((target, register_target)) = engine.receiver_targets(rid) else {
        return;
    };
    let in_scope = engine
        .with_config(rid, |cfg| {
            cfg.character_data
                && ((cfg.subtree
                    && forest.subtree_root(register_target) == forest.subtree_root(content))
                    || (!cfg.subtree && content == target))
        })
        .unwrap_or(false);
    if engine.is_batching() || !in_scope || !is_observable(engine, forest, rid, content) {
        return;
    }
    let Some(obs) = engine.observer_of(rid) else {
        return;
    };
    let snapshot_old = engine
        .with_config(rid, |cfg| cfg.character_data_old_value)
        .unwrap_or(false);
    let current = forest.text(content).unwrap_or_default().to_string();

    let Some(record) = engine.current_record(obs, RecordKind::CharacterData) else {
        return;
    };
    let Some(m) = engine.record_mut(record) else {
        return;
    };
    debug_assert!(
        m.target.is_none() || m.target == Some(content),
        "wrong target"
    );
    if m.target.is_none() {
        m.target = Some(content);
    }
    if snapshot_old && m.prev_value.is_none() {
        m.prev_value = Some(current);
    }
}

fn wants_child_list(
    engine: &Engine,
    forest: &Forest,
    rid: ReceiverId,
    parent: NodeId,
) -> bool {
    let Some((target, register_target)) = engine.receiver_targets(rid) else {
        return false;
    };
    engine
        .with_config(rid, |cfg| {
            cfg.child_list
                && ((cfg.subtree
                    && forest.subtree_root(register_target) == forest.subtree_root(parent))
                    || parent == target)
        })
        .unwrap_or(false)
}

pub(crate) fn content_appended(
    engine: &mut Engine,
    forest: &Forest,
    rid: ReceiverId,
    parent: NodeId,
    first_new: NodeId,
) {
    let wants = wants_child_list(engine, forest, rid, parent);
    if !wants || !is_observable(engine, forest, rid, first_new) {
        return;
    }
    let Some(obs) = engine.observer_of(rid) else {
        return;
    };
    if engine.is_batching() {
        if engine.batch_target() == Some(parent) {
            engine.batch_update_observer(obs, wants);
        }
        return;
    }
    let mut added = Vec::new();
    let mut next = Some(first_new);
    while let Some(n) = next {
        added.push(n);
        next = forest.next_sibling(n);
    }
    let prev_sibling = forest.prev_sibling(first_new);

    let Some(record) = engine.current_record(obs, RecordKind::ChildList) else {
        return;
    };
    let Some(m) = engine.record_mut(record) else {
        return;
    };
    debug_assert!(
        m.target.is_none() || m.target == Some(parent),
        "wrong target"
    );
    if m.target.is_some() {
        // Already handled at this level.
        return;
    }
    m.target = Some(parent);
    m.added_nodes = added;
    m.previous_sibling = prev_sibling;
}

pub(crate) fn content_inserted(
    engine: &mut Engine,
    forest: &Forest,
    rid: ReceiverId,
    parent: NodeId,
    child: NodeId,
) {
    let wants = wants_child_list(engine, forest, rid, parent);
    if !wants || !is_observable(engine, forest, rid, child) {
        return;
    }
    let Some(obs) = engine.observer_of(rid) else {
        return;
    };
    if engine.is_batching() {
        if engine.batch_target() == Some(parent) {
            engine.batch_update_observer(obs, wants);
        }
        return;
    }
    let prev_sibling = forest.prev_sibling(child);
    let next_sibling = forest.next_sibling(child);

    let Some(record) = engine.current_record(obs, RecordKind::ChildList) else {
        return;
    };
    let Some(m) = engine.record_mut(record) else {
        return;
    };
    if m.target.is_some() {
        // Already handled at this level.
        return;
    }
    m.target = Some(parent);
    m.added_nodes.push(child);
    m.previous_sibling = prev_sibling;
    m.next_sibling = next_sibling;
}

/// Removal is evaluated even when `childList` is off: it may have to create
/// a transient receiver, and it always schedules the observer so the
/// transient table is cleaned up after the next delivery.
pub(crate) fn content_removed(
    engine: &mut Engine,
    forest: &Forest,
    rid: ReceiverId,
    parent: NodeId,
    child: NodeId,
    prev_sibling: Option<NodeId>,
    next_sibling: Option<NodeId>,
) {
    if !is_observable(engine, forest, rid, child) {
        return;
    }
    let Some((target, register_target)) = engine.receiver_targets(rid) else {
        return;
    };
    let (subtree, child_list) = engine
        .with_config(rid, |cfg| (cfg.subtree, cfg.child_list))
        .unwrap_or((false, false));
    if subtree && forest.subtree_root(parent) != forest.subtree_root(register_target) {
        return;
    }
    let Some(obs) = engine.observer_of(rid) else {
        return;
    };
    if engine.is_batching() {
        if engine.batch_removal_done() {
            // Bulk operations may shuffle nodes around after the removal
            // phase; those moves are not additional removals.
            return;
        }
        if engine.batch_target() != Some(parent) {
            return;
        }
        let wants = child_list && (subtree || parent == target);
        if wants || subtree {
            engine.batch_node_removed(child, prev_sibling, next_sibling);
            engine.batch_update_observer(obs, wants);
        }
        return;
    }

    if subtree {
        // Avoid a transient clone when the node is already covered by the
        // same observation set.
        let orig = engine.parent_of(rid).unwrap_or(rid);
        if engine.find_receiver(obs, child) != Some(orig)
            && !engine.transient_exists(obs, child, orig)
        {
            engine.create_transient(orig, child);
        }
    }

    if child_list && (subtree || parent == target) {
        let Some(record) = engine.current_record(obs, RecordKind::ChildList) else {
            return;
        };
        let Some(m) = engine.record_mut(record) else {
            return;
        };
        if m.target.is_some() {
            // Already handled at this level.
            return;
        }
        m.target = Some(parent);
        m.removed_nodes.push(child);
        m.previous_sibling = prev_sibling;
        m.next_sibling = next_sibling;
    }
    // Schedule even without a record so transient bookkeeping is cleared
    // at the next checkpoint.
    engine.schedule_for_run(obs);
}

pub(crate) fn native_anonymous_child_list_change(
    engine: &mut Engine,
    forest: &Forest,
    rid: ReceiverId,
    content: NodeId,
    is_remove: bool,
) {
    let enabled = engine
        .with_config(rid, |cfg| cfg.native_anonymous_child_list)
        .unwrap_or(false);
    if !enabled {
        return;
    }
    let Some(parent) = forest.parent(content) else {
        return;
    };
    let Some((target, register_target)) = engine.receiver_targets(rid) else {
        return;
    };
    let subtree = engine.with_config(rid, |cfg| cfg.subtree).unwrap_or(false);
    if (!subtree && target != parent)
        || (subtree && forest.subtree_root(register_target) != forest.subtree_root(parent))
    {
        return;
    }
    let Some(obs) = engine.observer_of(rid) else {
        return;
    };
    let Some(record) = engine.current_record(obs, RecordKind::NativeAnonymousChildList) else {
        return;
    };
    let Some(m) = engine.record_mut(record) else {
        return;
    };
    if m.target.is_some() {
        return;
    }
    m.target = Some(parent);
    if is_remove {
        m.removed_nodes.push(content);
    } else {
        m.added_nodes.push(content);
    }
}

pub(crate) fn node_will_be_destroyed(engine: &mut Engine, rid: ReceiverId) {
    engine.disconnect_receiver(rid, true);
}

pub(crate) fn animation_mutated(
    engine: &mut Engine,
    forest: &Forest,
    rid: ReceiverId,
    animation: AnimationId,
    element: NodeId,
    pseudo: bool,
    mutation: AnimationMutation,
) {
    if engine.kind_of(rid) != Some(ReceiverKind::AnimationAware) {
        return;
    }
    let Some((target, _)) = engine.receiver_targets(rid) else {
        return;
    };
    let (animations, subtree) = engine
        .with_config(rid, |cfg| (cfg.animations, cfg.subtree))
        .unwrap_or((false, false));
    if !animations || !(subtree || element == target) || forest.chrome_only_access(element) {
        return;
    }
    // Pseudo-element targets are reported only under subtree observation.
    if pseudo && !subtree {
        return;
    }
    let Some(obs) = engine.observer_of(rid) else {
        return;
    };
    if engine.is_animation_batching() {
        engine.animation_batch_record(animation, element, mutation);
        engine.animation_batch_add_observer(obs);
        return;
    }
    let Some(record) = engine.current_record(obs, RecordKind::Animations) else {
        return;
    };
    let Some(m) = engine.record_mut(record) else {
        return;
    };
    debug_assert!(m.target.is_none(), "animations record reused across calls");
    m.target = Some(element);
    match mutation {
        AnimationMutation::Added => m.added_animations.push(animation),
        AnimationMutation::Changed => m.changed_animations.push(animation),
        AnimationMutation::Removed => m.removed_animations.push(animation),
    }
}
