use crate::Scope;
use crate::arena::{ScopeArena, ScopeId, WatchArena, WatchKey};
use crate::error::{Fault, FaultOrigin};
use crate::executor::EventLoop;
use crate::phase::PhaseCell;
use crate::queue::TaskQueues;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Default number of sweeps a digest may perform before it gives up.
pub const DEFAULT_TTL: usize = 10;

/// Default number of contained faults a tree retains for [`Scope::take_faults`].
pub const DEFAULT_FAULT_CAPACITY: usize = 64;

/// State shared by every scope of one tree.
///
/// Only the root owns this; every [`Scope`] handle reaches it through an
/// `Arc`, whichever node it points at.
pub(crate) struct Tree {
    pub(crate) scopes: ScopeArena,
    pub(crate) watches: WatchArena,
    pub(crate) root: ScopeId,
    pub(crate) phase: PhaseCell,
    /// The watch found dirty most recently in the current digest.
    last_dirty: Mutex<Option<WatchKey>>,
    pub(crate) queues: TaskQueues,
    pub(crate) event_loop: EventLoop,
    pub(crate) ttl: usize,
    faults: Mutex<VecDeque<Fault>>,
    fault_capacity: usize,
}

impl Tree {
    pub(crate) fn last_dirty(&self) -> Option<WatchKey> {
        *self.last_dirty.lock()
    }

    pub(crate) fn set_last_dirty(&self, key: WatchKey) {
        *self.last_dirty.lock() = Some(key);
    }

    pub(crate) fn reset_last_dirty(&self) {
        self.last_dirty.lock().take();
    }

    /// Run a user callback, turning a panic into a recorded [`Fault`].
    pub(crate) fn contain<R>(&self, origin: FaultOrigin, f: impl FnOnce() -> R) -> Option<R> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                self.report(Fault::from_panic(origin, payload));
                None
            }
        }
    }

    pub(crate) fn report(&self, fault: Fault) {
        error!(origin = %fault.origin, message = %fault.message, "callback fault contained");
        if self.fault_capacity == 0 {
            return;
        }
        let mut faults = self.faults.lock();
        if faults.len() == self.fault_capacity {
            faults.pop_front();
        }
        faults.push_back(fault);
    }

    pub(crate) fn take_faults(&self) -> Vec<Fault> {
        self.faults.lock().drain(..).collect()
    }
}

/// Builder for a root [`Scope`].
///
/// # Example
///
/// ```ignore
/// let event_loop = EventLoop::new();
/// let root = Scope::builder()
///     .ttl(20)
///     .fault_capacity(16)
///     .event_loop(event_loop.clone())
///     .build();
/// ```
#[derive(Debug)]
pub struct ScopeBuilder {
    ttl: usize,
    fault_capacity: usize,
    event_loop: Option<EventLoop>,
}

impl Default for ScopeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeBuilder {
    /// Create a builder with default settings.
    ///
    /// Defaults:
    /// - `ttl`: 10 sweeps
    /// - `fault_capacity`: 64 faults
    /// - `event_loop`: a fresh, unshared [`EventLoop`]
    pub fn new() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            fault_capacity: DEFAULT_FAULT_CAPACITY,
            event_loop: None,
        }
    }

    /// Maximum number of sweeps per digest. Values below 1 are raised to 1.
    pub fn ttl(mut self, ttl: usize) -> Self {
        self.ttl = ttl.max(1);
        self
    }

    /// Number of contained faults to retain. Zero disables retention; faults
    /// are still logged.
    pub fn fault_capacity(mut self, capacity: usize) -> Self {
        self.fault_capacity = capacity;
        self
    }

    /// Arm deferred work on this loop instead of a private one.
    ///
    /// Several trees may share one loop.
    pub fn event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    /// Create the root scope of a new tree.
    pub fn build(self) -> Scope {
        let (scopes, root) = ScopeArena::with_root();
        let tree = Tree {
            scopes,
            watches: WatchArena::new(),
            root,
            phase: PhaseCell::new(),
            last_dirty: Mutex::new(None),
            queues: TaskQueues::new(),
            event_loop: self.event_loop.unwrap_or_default(),
            ttl: self.ttl,
            faults: Mutex::new(VecDeque::new()),
            fault_capacity: self.fault_capacity,
        };
        Scope::from_parts(Arc::new(tree), root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_log_is_bounded() {
        let root = Scope::builder().fault_capacity(2).build();
        for origin in [FaultOrigin::Watch, FaultOrigin::Listener, FaultOrigin::EvalTask] {
            root.tree.report(Fault {
                origin,
                message: String::new(),
            });
        }

        let origins: Vec<_> = root.take_faults().into_iter().map(|f| f.origin).collect();
        assert_eq!(origins, vec![FaultOrigin::Listener, FaultOrigin::EvalTask]);
        assert!(root.take_faults().is_empty());
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let root = Scope::builder().fault_capacity(0).build();
        let contained = root
            .tree
            .contain(FaultOrigin::PostDigest, || panic!("dropped on the floor"));
        assert!(contained.is_none());
        assert!(root.take_faults().is_empty());
    }

    #[test]
    fn ttl_is_at_least_one() {
        let root = Scope::builder().ttl(0).build();
        assert_eq!(root.tree.ttl, 1);
    }
}
