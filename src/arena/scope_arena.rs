// Scope arena - storage for the nodes of one scope tree
//
// Every node of a tree lives in a single slab owned by the tree. Parent and
// child links are ScopeIds into that slab, so a node never owns another node
// and handles to a destroyed node stay valid (they just point at a detached
// entry). Entries are never freed while the tree is alive.
//
// FIELD LOOKUP:
// - Inheriting nodes resolve a missing field through their parent, recursively
// - Isolated nodes (and the root) stop at their own storage
// - Writes always land in the node's own storage, shadowing any ancestor

use super::WatchKey;
use crate::value::{Fields, Value};
use parking_lot::RwLock;
use slab::Slab;
use std::sync::Arc;

/// Identifier of a scope within its tree.
///
/// Only meaningful together with the tree it came from; see
/// [`Scope::id`](crate::Scope::id).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ScopeId(u32);

impl ScopeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct ScopeNode {
    pub(crate) parent: Option<ScopeId>,
    pub(crate) children: Vec<ScopeId>,
    /// Registration order; sweeps walk it back to front.
    pub(crate) watches: Vec<WatchKey>,
    pub(crate) fields: Fields,
    pub(crate) isolated: bool,
    pub(crate) destroyed: bool,
}

impl ScopeNode {
    fn new(parent: Option<ScopeId>, isolated: bool) -> Self {
        Self {
            parent,
            children: Vec::new(),
            watches: Vec::new(),
            fields: Fields::default(),
            isolated,
            destroyed: false,
        }
    }
}

pub(crate) struct ScopeArena {
    nodes: RwLock<Slab<ScopeNode>>,
}

impl ScopeArena {
    /// Create an arena holding only a root node.
    pub(crate) fn with_root() -> (Self, ScopeId) {
        let mut nodes = Slab::new();
        let root = ScopeId(nodes.insert(ScopeNode::new(None, true)) as u32);
        let arena = Self {
            nodes: RwLock::new(nodes),
        };
        (arena, root)
    }

    /// Access a node with a closure (read-only).
    pub(crate) fn with<F, R>(&self, id: ScopeId, f: F) -> Option<R>
    where
        F: FnOnce(&ScopeNode) -> R,
    {
        self.nodes.read().get(id.index()).map(f)
    }

    fn with_mut<F, R>(&self, id: ScopeId, f: F) -> Option<R>
    where
        F: FnOnce(&mut ScopeNode) -> R,
    {
        self.nodes.write().get_mut(id.index()).map(f)
    }

    /// Insert a new node and append it to `parent`'s children.
    pub(crate) fn spawn(&self, parent: ScopeId, isolated: bool) -> ScopeId {
        let mut nodes = self.nodes.write();
        let id = ScopeId(nodes.insert(ScopeNode::new(Some(parent), isolated)) as u32);
        if let Some(node) = nodes.get_mut(parent.index()) {
            node.children.push(id);
        }
        id
    }

    /// Detach `id` from its parent and empty its watch list.
    ///
    /// Returns the watches that were registered on the node, or `None` if it
    /// was already destroyed.
    pub(crate) fn destroy(&self, id: ScopeId) -> Option<Vec<WatchKey>> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(id.index())?;
        if node.destroyed {
            return None;
        }
        node.destroyed = true;
        let watches = std::mem::take(&mut node.watches);
        let parent = node.parent;

        if let Some(parent) = parent.and_then(|p| nodes.get_mut(p.index())) {
            parent.children.retain(|&child| child != id);
        }
        Some(watches)
    }

    pub(crate) fn is_destroyed(&self, id: ScopeId) -> bool {
        self.with(id, |node| node.destroyed).unwrap_or(true)
    }

    pub(crate) fn parent_of(&self, id: ScopeId) -> Option<ScopeId> {
        self.with(id, |node| node.parent).flatten()
    }

    pub(crate) fn children_of(&self, id: ScopeId) -> Vec<ScopeId> {
        self.with(id, |node| node.children.clone())
            .unwrap_or_default()
    }

    pub(crate) fn watches_of(&self, id: ScopeId) -> Vec<WatchKey> {
        self.with(id, |node| node.watches.clone())
            .unwrap_or_default()
    }

    /// Register a watch on a live node. Returns `false` for destroyed nodes.
    pub(crate) fn push_watch(&self, id: ScopeId, key: WatchKey) -> bool {
        self.with_mut(id, |node| {
            if node.destroyed {
                return false;
            }
            node.watches.push(key);
            true
        })
        .unwrap_or(false)
    }

    pub(crate) fn remove_watch(&self, id: ScopeId, key: WatchKey) {
        self.with_mut(id, |node| node.watches.retain(|&k| k != key));
    }

    /// Resolve a field through the inheritance chain.
    pub(crate) fn lookup(&self, id: ScopeId, name: &str) -> Value {
        let nodes = self.nodes.read();
        let mut current = nodes.get(id.index());
        while let Some(node) = current {
            if let Some(value) = node.fields.get(name) {
                return value.clone();
            }
            if node.isolated {
                break;
            }
            current = node.parent.and_then(|p| nodes.get(p.index()));
        }
        Value::Undefined
    }

    pub(crate) fn has_own(&self, id: ScopeId, name: &str) -> bool {
        self.with(id, |node| node.fields.contains_key(name))
            .unwrap_or(false)
    }

    pub(crate) fn assign(&self, id: ScopeId, name: Arc<str>, value: Value) {
        self.with_mut(id, |node| {
            node.fields.insert(name, value);
        });
    }
}
