use std::cmp::Ordering;

use thiserror::Error;

use crate::node::NodeData;
use crate::{AttrName, NodeId, NodeKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForestError {
    #[error("unknown or freed node id")]
    UnknownNode,
    #[error("node already has a parent")]
    NotDetached,
    #[error("node is not a child of the given parent")]
    NotAChild,
    #[error("reference node is not a child of the given parent")]
    BadReference,
    #[error("insertion would create a cycle")]
    WouldCycle,
    #[error("node kind does not support this operation")]
    WrongKind,
}

/// Arena of tree nodes. Multiple disconnected trees may coexist; a detached
/// subtree is simply a node with no parent.
#[derive(Default)]
pub struct Forest {
    arena: Vec<Option<NodeData>>,
    free: Vec<u32>,
    alive: usize,
}

impl Forest {
    pub fn new() -> Self {
        Forest::default()
    }

    fn alloc(&mut self, data: NodeData) -> NodeId {
        self.alive += 1;
        if let Some(index) = self.free.pop() {
            self.arena[index as usize] = Some(data);
            return NodeId::new(index);
        }
        self.arena.push(Some(data));
        NodeId::new((self.arena.len() - 1) as u32)
    }

    fn node(&self, id: NodeId) -> Option<&NodeData> {
        self.arena.get(id.index()).and_then(|slot| slot.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        self.arena
            .get_mut(id.index())
            .and_then(|slot| slot.as_mut())
    }

    fn get(&self, id: NodeId) -> Result<&NodeData, ForestError> {
        self.node(id).ok_or(ForestError::UnknownNode)
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut NodeData, ForestError> {
        self.node_mut(id).ok_or(ForestError::UnknownNode)
    }

    pub fn new_document(&mut self) -> NodeId {
        self.alloc(NodeData::new(NodeKind::Document))
    }

    pub fn new_element(&mut self, tag: impl Into<String>) -> NodeId {
        self.alloc(NodeData::new(NodeKind::Element(tag.into())))
    }

    pub fn new_text(&mut self, text: impl Into<String>) -> NodeId {
        let mut data = NodeData::new(NodeKind::Text);
        data.text = text.into();
        self.alloc(data)
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn node_count(&self) -> usize {
        self.alive
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.node(id).map(|n| &n.kind)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.first_child)
    }

    pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.last_child)
    }

    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.prev_sibling)
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.next_sibling)
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut next = self.first_child(id);
        std::iter::from_fn(move || {
            let cur = next?;
            next = self.next_sibling(cur);
            Some(cur)
        })
    }

    /// Topmost inclusive ancestor. For an attached node this is its document
    /// (or detached tree root); for a detached node, the node itself.
    pub fn subtree_root(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            cur = p;
        }
        cur
    }

    pub fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if n == ancestor {
                return true;
            }
            cur = self.parent(n);
        }
        false
    }

    /// Document order of two nodes. Nodes in different trees compare by
    /// root id, which is arbitrary but consistent.
    pub fn tree_order(&self, a: NodeId, b: NodeId) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let path_a = self.ancestor_path(a);
        let path_b = self.ancestor_path(b);
        if path_a[0] != path_b[0] {
            return path_a[0].cmp(&path_b[0]);
        }
        for depth in 1..path_a.len().min(path_b.len()) {
            if path_a[depth] != path_b[depth] {
                return self
                    .sibling_index(path_a[depth])
                    .cmp(&self.sibling_index(path_b[depth]));
            }
        }
        // One is an ancestor of the other; the ancestor comes first.
        path_a.len().cmp(&path_b.len())
    }

    fn ancestor_path(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            path.push(p);
            cur = p;
        }
        path.reverse();
        path
    }

    fn sibling_index(&self, id: NodeId) -> usize {
        let mut index = 0;
        let mut cur = self.prev_sibling(id);
        while let Some(p) = cur {
            index += 1;
            cur = self.prev_sibling(p);
        }
        index
    }

    fn check_insertable(
        &self,
        parent: NodeId,
        child: NodeId,
    ) -> Result<(), ForestError> {
        self.get(parent)?;
        let c = self.get(child)?;
        if c.parent.is_some() {
            return Err(ForestError::NotDetached);
        }
        if self.is_inclusive_ancestor(child, parent) {
            return Err(ForestError::WouldCycle);
        }
        Ok(())
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), ForestError> {
        self.check_insertable(parent, child)?;
        let old_last = self.get(parent)?.last_child;
        {
            let c = self.get_mut(child)?;
            c.parent = Some(parent);
            c.prev_sibling = old_last;
            c.next_sibling = None;
        }
        if let Some(last) = old_last {
            self.get_mut(last)?.next_sibling = Some(child);
        }
        let p = self.get_mut(parent)?;
        if p.first_child.is_none() {
            p.first_child = Some(child);
        }
        p.last_child = Some(child);
        Ok(())
    }

    /// Inserts `child` before `reference`; `None` appends.
    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), ForestError> {
        let reference = match reference {
            Some(r) => r,
            None => return self.append_child(parent, child),
        };
        self.check_insertable(parent, child)?;
        if self.get(reference)?.parent != Some(parent) {
            return Err(ForestError::BadReference);
        }
        let before = self.get(reference)?.prev_sibling;
        {
            let c = self.get_mut(child)?;
            c.parent = Some(parent);
            c.prev_sibling = before;
            c.next_sibling = Some(reference);
        }
        self.get_mut(reference)?.prev_sibling = Some(child);
        match before {
            Some(b) => self.get_mut(b)?.next_sibling = Some(child),
            None => self.get_mut(parent)?.first_child = Some(child),
        }
        Ok(())
    }

    /// Unlinks `child` from `parent`. The child becomes the root of its own
    /// detached subtree; its descendants stay attached to it.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), ForestError> {
        self.get(parent)?;
        if self.get(child)?.parent != Some(parent) {
            return Err(ForestError::NotAChild);
        }
        let (prev, next) = {
            let c = self.get(child)?;
            (c.prev_sibling, c.next_sibling)
        };
        match prev {
            Some(p) => self.get_mut(p)?.next_sibling = next,
            None => self.get_mut(parent)?.first_child = next,
        }
        match next {
            Some(n) => self.get_mut(n)?.prev_sibling = prev,
            None => self.get_mut(parent)?.last_child = prev,
        }
        let c = self.get_mut(child)?;
        c.parent = None;
        c.prev_sibling = None;
        c.next_sibling = None;
        Ok(())
    }

    /// Frees `id` and all of its descendants. The node must already be
    /// detached (no parent); attached nodes are removed first by callers.
    pub fn free_subtree(&mut self, id: NodeId) -> Result<(), ForestError> {
        if self.get(id)?.parent.is_some() {
            return Err(ForestError::NotDetached);
        }
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            stack.extend(self.children(cur));
            if self.arena[cur.index()].take().is_some() {
                self.alive -= 1;
                self.free.push(cur.index() as u32);
            }
        }
        Ok(())
    }

    /// Every node of the subtree rooted at `id`, in depth-first order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            out.push(cur);
            let mut kids: Vec<NodeId> = self.children(cur).collect();
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    pub fn ensure_element(&self, id: NodeId) -> Result<(), ForestError> {
        match &self.get(id)?.kind {
            NodeKind::Element(_) => Ok(()),
            _ => Err(ForestError::WrongKind),
        }
    }

    pub fn ensure_text(&self, id: NodeId) -> Result<(), ForestError> {
        match &self.get(id)?.kind {
            NodeKind::Text => Ok(()),
            _ => Err(ForestError::WrongKind),
        }
    }

    pub fn attr(&self, id: NodeId, name: &AttrName) -> Option<&str> {
        self.node(id)
            .and_then(|n| n.attrs.get(name))
            .map(|v| v.as_str())
    }

    pub fn attrs(&self, id: NodeId) -> impl Iterator<Item = (&AttrName, &str)> + '_ {
        self.node(id)
            .into_iter()
            .flat_map(|n| n.attrs.iter().map(|(k, v)| (k, v.as_str())))
    }

    pub fn set_attr(
        &mut self,
        id: NodeId,
        name: AttrName,
        value: impl Into<String>,
    ) -> Result<(), ForestError> {
        self.ensure_element(id)?;
        self.get_mut(id)?.attrs.insert(name, value.into());
        Ok(())
    }

    /// Removes an attribute; returns the previous value, `None` when absent.
    pub fn remove_attr(
        &mut self,
        id: NodeId,
        name: &AttrName,
    ) -> Result<Option<String>, ForestError> {
        self.ensure_element(id)?;
        Ok(self.get_mut(id)?.attrs.shift_remove(name))
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.node(id).map(|n| n.text.as_str())
    }

    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) -> Result<(), ForestError> {
        self.ensure_text(id)?;
        self.get_mut(id)?.text = text.into();
        Ok(())
    }

    pub fn set_chrome_only(&mut self, id: NodeId, value: bool) -> Result<(), ForestError> {
        self.get_mut(id)?.chrome_only = value;
        Ok(())
    }

    pub fn set_native_anonymous(&mut self, id: NodeId, value: bool) -> Result<(), ForestError> {
        self.get_mut(id)?.native_anonymous = value;
        Ok(())
    }

    /// Restricted-access check: set on the node itself or any ancestor.
    pub fn chrome_only_access(&self, id: NodeId) -> bool {
        let mut cur = Some(id);
        while let Some(n) = cur {
            if self.node(n).is_some_and(|d| d.chrome_only) {
                return true;
            }
            cur = self.parent(n);
        }
        false
    }

    /// True when the node or any ancestor is a native-anonymous root.
    pub fn in_anonymous_subtree(&self, id: NodeId) -> bool {
        let mut cur = Some(id);
        while let Some(n) = cur {
            if self.node(n).is_some_and(|d| d.native_anonymous) {
                return true;
            }
            cur = self.parent(n);
        }
        false
    }
}
