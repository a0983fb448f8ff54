use indexmap::IndexMap;

use crate::NodeId;

/// Qualified attribute name. `ns: None` is the null namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttrName {
    pub ns: Option<String>,
    pub local: String,
}

impl AttrName {
    pub fn local(name: impl Into<String>) -> Self {
        AttrName {
            ns: None,
            local: name.into(),
        }
    }

    pub fn namespaced(ns: impl Into<String>, name: impl Into<String>) -> Self {
        AttrName {
            ns: Some(ns.into()),
            local: name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element(String),
    Text,
}

#[derive(Clone, Debug)]
pub(crate) struct NodeData {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub first_child: Option<NodeId>,
    pub last_child: Option<NodeId>,
    pub prev_sibling: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
    pub attrs: IndexMap<AttrName, String>,
    pub text: String,
    pub chrome_only: bool,
    pub native_anonymous: bool,
}

impl NodeData {
    pub fn new(kind: NodeKind) -> Self {
        NodeData {
            kind,
            parent: None,
            first_child: None,
            last_child: None,
            prev_sibling: None,
            next_sibling: None,
            attrs: IndexMap::new(),
            text: String::new(),
            chrome_only: false,
            native_anonymous: false,
        }
    }
}
