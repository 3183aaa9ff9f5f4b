//! Deferred task queues.
//!
//! Three FIFO queues live on the tree root:
//!
//! - **eval queue**: drained at the start of every sweep of a digest, so work
//!   queued there runs within the current digest if one is active.
//! - **apply queue**: coalesced behind a single timer; when it fires the whole
//!   queue is flushed inside one apply, which then digests once.
//! - **post-digest queue**: drained after the next digest has settled and
//!   the phase is idle again.
//!
//! Every task runs with fault containment: a panicking task is recorded and
//! the remaining tasks still run.

use crate::Scope;
use crate::arena::ScopeId;
use crate::error::FaultOrigin;
use crate::executor::TimerId;
use crate::tree::Tree;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) type ScopeTask = Box<dyn FnOnce(&Scope) + Send>;
pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

pub(crate) struct TaskQueues {
    eval: Mutex<VecDeque<(ScopeId, ScopeTask)>>,
    apply: Mutex<VecDeque<(ScopeId, ScopeTask)>>,
    /// Set while an apply flush is armed on the event loop.
    apply_timer: Mutex<Option<TimerId>>,
    post_digest: Mutex<VecDeque<Deferred>>,
}

impl TaskQueues {
    pub(crate) fn new() -> Self {
        Self {
            eval: Mutex::new(VecDeque::new()),
            apply: Mutex::new(VecDeque::new()),
            apply_timer: Mutex::new(None),
            post_digest: Mutex::new(VecDeque::new()),
        }
    }

    /// Append to the eval queue. Returns whether a digest should be armed:
    /// the queue was empty before and `idle` holds.
    ///
    /// `idle` is checked under the queue lock, so it cannot interleave with
    /// [`settle_eval`](Self::settle_eval).
    pub(crate) fn push_eval(
        &self,
        scope: ScopeId,
        task: ScopeTask,
        idle: impl FnOnce() -> bool,
    ) -> bool {
        let mut eval = self.eval.lock();
        let was_empty = eval.is_empty();
        eval.push_back((scope, task));
        was_empty && idle()
    }

    /// Run `release` if the eval queue is empty, under the queue lock.
    ///
    /// A digest ends its phase through this, so a task pushed concurrently
    /// either lands before the check (and keeps the digest going) or sees the
    /// released phase (and arms its own digest).
    pub(crate) fn settle_eval(&self, release: impl FnOnce()) -> bool {
        let eval = self.eval.lock();
        if !eval.is_empty() {
            return false;
        }
        release();
        true
    }

    pub(crate) fn pop_eval(&self) -> Option<(ScopeId, ScopeTask)> {
        self.eval.lock().pop_front()
    }

    pub(crate) fn eval_is_empty(&self) -> bool {
        self.eval.lock().is_empty()
    }

    pub(crate) fn push_apply(&self, scope: ScopeId, task: ScopeTask) {
        self.apply.lock().push_back((scope, task));
    }

    pub(crate) fn pop_apply(&self) -> Option<(ScopeId, ScopeTask)> {
        self.apply.lock().pop_front()
    }

    /// Arm the apply timer with `arm` unless one is already pending.
    ///
    /// Returns whether a timer was armed.
    pub(crate) fn arm_apply_timer(&self, arm: impl FnOnce() -> TimerId) -> bool {
        let mut timer = self.apply_timer.lock();
        if timer.is_some() {
            return false;
        }
        *timer = Some(arm());
        true
    }

    pub(crate) fn apply_timer(&self) -> Option<TimerId> {
        *self.apply_timer.lock()
    }

    fn clear_apply_timer(&self) {
        self.apply_timer.lock().take();
    }

    pub(crate) fn push_post_digest(&self, task: Deferred) {
        self.post_digest.lock().push_back(task);
    }

    fn pop_post_digest(&self) -> Option<Deferred> {
        self.post_digest.lock().pop_front()
    }

    #[cfg(test)]
    pub(crate) fn lens(&self) -> (usize, usize, usize) {
        (
            self.eval.lock().len(),
            self.apply.lock().len(),
            self.post_digest.lock().len(),
        )
    }
}

/// Run eval tasks until the queue is empty, including tasks queued by tasks.
pub(crate) fn drain_eval_queue(tree: &Arc<Tree>) {
    while let Some((id, task)) = tree.queues.pop_eval() {
        let scope = Scope::from_parts(tree.clone(), id);
        tree.contain(FaultOrigin::EvalTask, || task(&scope));
    }
}

/// Run every queued apply task, then allow a new apply timer to be armed.
pub(crate) fn flush_apply_queue(tree: &Arc<Tree>) {
    while let Some((id, task)) = tree.queues.pop_apply() {
        let scope = Scope::from_parts(tree.clone(), id);
        tree.contain(FaultOrigin::ApplyTask, || task(&scope));
    }
    tree.queues.clear_apply_timer();
}

pub(crate) fn drain_post_digest(tree: &Tree) {
    while let Some(task) = tree.queues.pop_post_digest() {
        tree.contain(FaultOrigin::PostDigest, task);
    }
}
