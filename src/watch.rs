//! Watch registration types.
//!
//! A watch is two capabilities: something that evaluates a value from a
//! scope ([`WatchFn`]) and something that reacts when that value changes
//! ([`Listener`]). Both are implemented for plain closures.

use crate::Scope;
use crate::arena::WatchKey;
use crate::tree::Tree;
use crate::value::{Equality, Value};
use std::fmt;
use std::sync::Weak;

/// Produces the watched value. Runs on every sweep, so it should be cheap and
/// free of side effects on the value it observes.
pub trait WatchFn: Send + 'static {
    /// Evaluate the watched value against `scope`.
    fn evaluate(&mut self, scope: &Scope) -> Value;
}

impl<F> WatchFn for F
where
    F: FnMut(&Scope) -> Value + Send + 'static,
{
    fn evaluate(&mut self, scope: &Scope) -> Value {
        self(scope)
    }
}

/// Reacts to a change of the watched value.
pub trait Listener: Send + 'static {
    /// Called with the new value, the previous value and the owning scope.
    ///
    /// On the first evaluation of a watch `old` is the new value itself.
    fn on_change(&mut self, new: &Value, old: &Value, scope: &Scope);
}

impl<F> Listener for F
where
    F: FnMut(&Value, &Value, &Scope) + Send + 'static,
{
    fn on_change(&mut self, new: &Value, old: &Value, scope: &Scope) {
        self(new, old, scope)
    }
}

/// A watch registration under construction, for types implementing
/// [`WatchFn`]/[`Listener`] directly.
///
/// ```ignore
/// let handle = scope.register(
///     Watcher::new(Path::from("user.name"))
///         .on_change(Log::default())
///         .equality(Equality::Structural),
/// );
/// ```
pub struct Watcher {
    pub(crate) evaluate: Box<dyn WatchFn>,
    pub(crate) listener: Option<Box<dyn Listener>>,
    pub(crate) equality: Equality,
}

impl Watcher {
    /// Start a registration with reference equality and no listener.
    pub fn new(evaluate: impl WatchFn) -> Self {
        Self {
            evaluate: Box::new(evaluate),
            listener: None,
            equality: Equality::Reference,
        }
    }

    /// Set the listener.
    pub fn on_change(mut self, listener: impl Listener) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Set the equality strategy.
    pub fn equality(mut self, equality: Equality) -> Self {
        self.equality = equality;
        self
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("listener", &self.listener.is_some())
            .field("equality", &self.equality)
            .finish_non_exhaustive()
    }
}

/// Removes a watch registration.
///
/// Dropping the handle does not remove the watch; call [`remove`](Self::remove).
/// The handle does not keep the tree alive.
#[derive(Clone)]
pub struct WatchHandle {
    tree: Weak<Tree>,
    /// `None` for registrations refused by a destroyed scope.
    key: Option<WatchKey>,
}

impl WatchHandle {
    pub(crate) fn new(tree: Weak<Tree>, key: Option<WatchKey>) -> Self {
        Self { tree, key }
    }

    /// Remove the watch. Calling it again is a no-op.
    ///
    /// Every call also resets the tree's short-circuit marker, whether or not
    /// anything was removed.
    pub fn remove(&self) {
        let Some(tree) = self.tree.upgrade() else {
            return;
        };
        if let Some(key) = self.key {
            if let Some(scope) = tree.watches.remove(key) {
                tree.scopes.remove_watch(scope, key);
            }
        }
        tree.reset_last_dirty();
    }

    /// Whether the watch is still registered.
    pub fn is_active(&self) -> bool {
        match (self.tree.upgrade(), self.key) {
            (Some(tree), Some(key)) => tree.watches.contains(key),
            _ => false,
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("key", &self.key)
            .finish()
    }
}
