// Arena-based storage for one scope tree
//
// This module provides two arenas, both owned by the tree:
// - Scope arena: stores ScopeNode (links, field storage, watch keys)
// - Watch arena: stores WatchEntry (callbacks, equality, last value)
//
// ScopeId and WatchKey are lightweight ids that index into the slabs.

pub mod scope_arena;
pub mod watch_arena;

pub use scope_arena::ScopeId;
pub(crate) use scope_arena::ScopeArena;
pub(crate) use watch_arena::{
    Recorded, WatchArena, WatchKey, evaluate_slot, listener_slot,
};
