use dom_forest::NodeId;

use crate::dom::AnimationId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    ChildList,
    Attributes,
    CharacterData,
    NativeAnonymousChildList,
    Animations,
}

/// One unit of reported change. Append-only while it sits in an observer's
/// current-record slot; immutable once the owning mutation level exits.
///
/// Node fields hold ids, not references: a record may outlive the nodes it
/// describes (a removed subtree can be freed before delivery).
#[derive(Clone, Debug, PartialEq)]
pub struct MutationRecord {
    pub kind: RecordKind,
    pub target: Option<NodeId>,
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
    pub previous_sibling: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
    pub attr_name: Option<String>,
    pub attr_namespace: Option<String>,
    /// Previous attribute value or previous text, depending on `kind`.
    pub prev_value: Option<String>,
    pub added_animations: Vec<AnimationId>,
    pub changed_animations: Vec<AnimationId>,
    pub removed_animations: Vec<AnimationId>,
}

impl MutationRecord {
    pub(crate) fn new(kind: RecordKind) -> Self {
        MutationRecord {
            kind,
            target: None,
            added_nodes: Vec::new(),
            removed_nodes: Vec::new(),
            previous_sibling: None,
            next_sibling: None,
            attr_name: None,
            attr_namespace: None,
            prev_value: None,
            added_animations: Vec::new(),
            changed_animations: Vec::new(),
            removed_animations: Vec::new(),
        }
    }
}
