use crate::arena::ScopeId;
use crate::digest;
use crate::error::{Fault, FaultOrigin, Result};
use crate::executor::EventLoop;
use crate::phase::Phase;
use crate::queue;
use crate::tree::{ScopeBuilder, Tree};
use crate::value::{Equality, Value};
use crate::watch::{WatchHandle, Watcher};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{trace, warn};

/// Handle to one node of a scope tree.
///
/// A scope holds named fields and a list of watches. Every scope of a tree
/// shares the root's phase flag and task queues, so a digest started from
/// any scope sweeps the whole tree.
///
/// Cloning a `Scope` clones the handle; both point at the same node.
///
/// # Example
/// ```ignore
/// let root = Scope::new();
/// root.set("value", "a");
/// root.set("counter", 0);
///
/// root.watch(
///     |s: &Scope| s.get("value"),
///     |_: &Value, _: &Value, s: &Scope| {
///         s.update("counter", |c| Value::from(c.as_f64().unwrap_or(0.0) + 1.0));
///     },
/// );
///
/// root.digest()?;                       // counter == 1
/// root.digest()?;                       // still 1, nothing changed
/// root.set("value", "b");
/// root.digest()?;                       // counter == 2
/// ```
#[derive(Clone)]
pub struct Scope {
    pub(crate) tree: Arc<Tree>,
    id: ScopeId,
}

impl Scope {
    /// Create the root scope of a new tree with default settings.
    pub fn new() -> Self {
        ScopeBuilder::new().build()
    }

    /// Configure a new root scope.
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::new()
    }

    pub(crate) fn from_parts(tree: Arc<Tree>, id: ScopeId) -> Self {
        Self { tree, id }
    }

    /// This scope's id within its tree.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    // =========================================================================
    // Fields
    // =========================================================================

    /// Read a field, falling back to ancestors for inheriting scopes.
    ///
    /// Missing fields read as [`Value::Undefined`].
    pub fn get(&self, name: &str) -> Value {
        self.tree.scopes.lookup(self.id, name)
    }

    /// Write a field to this scope's own storage, shadowing any ancestor's.
    pub fn set(&self, name: impl Into<Arc<str>>, value: impl Into<Value>) {
        self.tree.scopes.assign(self.id, name.into(), value.into());
    }

    /// Read a field (through the inheritance chain) and write `f`'s result locally.
    pub fn update(&self, name: &str, f: impl FnOnce(Value) -> Value) {
        let current = self.get(name);
        self.set(name, f(current));
    }

    /// Whether the field is stored on this scope itself.
    pub fn has_own(&self, name: &str) -> bool {
        self.tree.scopes.has_own(self.id, name)
    }

    // =========================================================================
    // Watches
    // =========================================================================

    /// Watch a value with reference equality.
    ///
    /// `listener` receives `(new, old, scope)`; on the first digest `old` is
    /// the new value itself.
    pub fn watch<W, L>(&self, evaluate: W, listener: L) -> WatchHandle
    where
        W: FnMut(&Scope) -> Value + Send + 'static,
        L: FnMut(&Value, &Value, &Scope) + Send + 'static,
    {
        self.register(Watcher::new(evaluate).on_change(listener))
    }

    /// Watch a value with structural equality.
    ///
    /// In-place changes to lists and records are detected, at the cost of a
    /// deep comparison per sweep and a deep copy per change.
    pub fn watch_deep<W, L>(&self, evaluate: W, listener: L) -> WatchHandle
    where
        W: FnMut(&Scope) -> Value + Send + 'static,
        L: FnMut(&Value, &Value, &Scope) + Send + 'static,
    {
        self.register(
            Watcher::new(evaluate)
                .on_change(listener)
                .equality(Equality::Structural),
        )
    }

    /// Register a watch without a listener. The evaluate function still runs
    /// on every sweep.
    pub fn watch_only<W>(&self, evaluate: W) -> WatchHandle
    where
        W: FnMut(&Scope) -> Value + Send + 'static,
    {
        self.register(Watcher::new(evaluate))
    }

    /// Register a fully specified watch.
    ///
    /// Watches on a destroyed scope are refused; the returned handle is inert.
    pub fn register(&self, watcher: Watcher) -> WatchHandle {
        let tree = &self.tree;
        let Watcher {
            evaluate,
            listener,
            equality,
        } = watcher;

        if tree.scopes.is_destroyed(self.id) {
            cov_mark::hit!(watch_on_destroyed_scope);
            warn!(scope = ?self.id, "watch registered on destroyed scope ignored");
            return WatchHandle::new(Arc::downgrade(tree), None);
        }

        let key = tree.watches.insert(self.id, equality, evaluate, listener);
        if !tree.scopes.push_watch(self.id, key) {
            tree.watches.remove(key);
            return WatchHandle::new(Arc::downgrade(tree), None);
        }
        tree.reset_last_dirty();
        WatchHandle::new(Arc::downgrade(tree), Some(key))
    }

    /// Number of watches registered on this scope (not its children).
    pub fn watch_count(&self) -> usize {
        self.tree.scopes.watches_of(self.id).len()
    }

    // =========================================================================
    // Digest and evaluation
    // =========================================================================

    /// Run a digest over the whole tree.
    ///
    /// # Errors
    /// - [`DigestError::PhaseConflict`](crate::DigestError::PhaseConflict) if a
    ///   digest or apply is already running on this tree.
    /// - [`DigestError::NonTerminating`](crate::DigestError::NonTerminating) if
    ///   the tree is still dirty after the configured number of sweeps.
    pub fn digest(&self) -> Result<()> {
        digest::digest(&self.tree)
    }

    /// Evaluate `expr` against this scope with no phase or digest involved.
    pub fn eval<R>(&self, expr: impl FnOnce(&Scope) -> R) -> R {
        expr(self)
    }

    /// Like [`eval`](Self::eval), passing extra `locals` to the expression.
    pub fn eval_with<T, R>(&self, locals: T, expr: impl FnOnce(&Scope, T) -> R) -> R {
        expr(self, locals)
    }

    /// Evaluate `expr` in the apply phase, then digest the whole tree.
    ///
    /// The digest runs even if `expr` panics; the panic is then resumed.
    ///
    /// # Errors
    /// A phase conflict if a digest or apply is already running (`expr` is
    /// not evaluated), or any error of the following digest.
    pub fn apply<R>(&self, expr: impl FnOnce(&Scope) -> R) -> Result<R> {
        let outcome = {
            let _phase = self.tree.phase.begin(Phase::Apply)?;
            panic::catch_unwind(AssertUnwindSafe(|| expr(self)))
        };
        let digested = self.digest();
        match outcome {
            Ok(value) => digested.map(|()| value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Like [`apply`](Self::apply), passing extra `locals` to the expression.
    pub fn apply_with<T, R>(&self, locals: T, expr: impl FnOnce(&Scope, T) -> R) -> Result<R> {
        self.apply(|scope| expr(scope, locals))
    }

    // =========================================================================
    // Deferred work
    // =========================================================================

    /// Queue `expr` to run during the current digest, or the next one.
    ///
    /// If no digest is running and nothing was queued yet, a timer is armed
    /// that digests the tree on the next turn of the event loop.
    pub fn eval_async<F>(&self, expr: F)
    where
        F: FnOnce(&Scope) + Send + 'static,
    {
        if self.refuse_deferred("eval_async") {
            return;
        }
        let tree = &self.tree;
        let arm = tree
            .queues
            .push_eval(self.id, Box::new(expr), || tree.phase.is_idle());
        if arm {
            let weak = Arc::downgrade(tree);
            tree.event_loop.set_timeout(move || {
                let Some(tree) = weak.upgrade() else {
                    return;
                };
                if !tree.queues.eval_is_empty() {
                    if let Err(err) = digest::digest(&tree) {
                        tree.report(Fault {
                            origin: FaultOrigin::Scheduler,
                            message: err.to_string(),
                        });
                    }
                }
            });
            trace!(scope = ?self.id, "eval_async digest armed");
        }
    }

    /// Queue `expr` to run in a batched apply on the next turn of the event loop.
    ///
    /// All applies queued before the timer fires run inside one apply, followed
    /// by a single digest. A digest that starts earlier runs them immediately
    /// and cancels the timer.
    pub fn apply_async<F>(&self, expr: F)
    where
        F: FnOnce(&Scope) + Send + 'static,
    {
        if self.refuse_deferred("apply_async") {
            return;
        }
        let tree = &self.tree;
        tree.queues.push_apply(self.id, Box::new(expr));

        let armed = tree.queues.arm_apply_timer(|| {
            let weak = Arc::downgrade(tree);
            let id = self.id;
            tree.event_loop.set_timeout(move || {
                let Some(tree) = weak.upgrade() else {
                    return;
                };
                let scope = Scope::from_parts(tree, id);
                if let Err(err) = scope.apply(|s| queue::flush_apply_queue(&s.tree)) {
                    scope.tree.report(Fault {
                        origin: FaultOrigin::Scheduler,
                        message: err.to_string(),
                    });
                }
            })
        });
        if armed {
            trace!(scope = ?self.id, "apply_async flush armed");
        }
    }

    /// Queue `task` to run after the next digest has settled.
    pub fn post_digest<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.refuse_deferred("post_digest") {
            return;
        }
        self.tree.queues.push_post_digest(Box::new(task));
    }

    fn refuse_deferred(&self, operation: &'static str) -> bool {
        if self.is_destroyed() {
            cov_mark::hit!(deferred_on_destroyed_scope);
            warn!(scope = ?self.id, operation, "deferred work on destroyed scope ignored");
            return true;
        }
        false
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    /// Create a child that inherits this scope's fields until it shadows them.
    pub fn spawn_child(&self) -> Scope {
        self.spawn(false)
    }

    /// Create a child with its own field storage. It still belongs to this
    /// tree: digests and queued work are shared with the root.
    pub fn spawn_isolated(&self) -> Scope {
        self.spawn(true)
    }

    fn spawn(&self, isolated: bool) -> Scope {
        let id = self.tree.scopes.spawn(self.id, isolated);
        trace!(parent = ?self.id, child = ?id, isolated, "scope spawned");
        Scope::from_parts(self.tree.clone(), id)
    }

    /// Detach this scope from its parent and drop its watches.
    ///
    /// Descendants are not destroyed but are no longer reached by digests.
    /// Destroying the root only drops its own watches; its children are
    /// still swept. Calling it twice is a no-op.
    pub fn destroy(&self) {
        let Some(watches) = self.tree.scopes.destroy(self.id) else {
            return;
        };
        for key in watches {
            self.tree.watches.remove(key);
        }
        trace!(scope = ?self.id, "scope destroyed");
    }

    /// Whether [`destroy`](Self::destroy) was called on this scope.
    pub fn is_destroyed(&self) -> bool {
        self.tree.scopes.is_destroyed(self.id)
    }

    /// Whether this is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.id == self.tree.root
    }

    /// The root of this scope's tree.
    pub fn root(&self) -> Scope {
        Scope::from_parts(self.tree.clone(), self.tree.root)
    }

    /// The scope this one was spawned from; `None` for the root.
    pub fn parent(&self) -> Option<Scope> {
        self.tree
            .scopes
            .parent_of(self.id)
            .map(|id| Scope::from_parts(self.tree.clone(), id))
    }

    /// Live children in spawn order.
    pub fn children(&self) -> Vec<Scope> {
        self.tree
            .scopes
            .children_of(self.id)
            .into_iter()
            .map(|id| Scope::from_parts(self.tree.clone(), id))
            .collect()
    }

    // =========================================================================
    // Tree state
    // =========================================================================

    /// The tree's current phase.
    pub fn phase(&self) -> Phase {
        self.tree.phase.get()
    }

    /// The event loop deferred work is armed on.
    pub fn event_loop(&self) -> &EventLoop {
        &self.tree.event_loop
    }

    /// Drain the contained faults recorded so far, oldest first.
    pub fn take_faults(&self) -> Vec<Fault> {
        self.tree.take_faults()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// Two handles are equal if they point at the same node of the same tree.
impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.id == other.id
    }
}

impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("root", &self.is_root())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
