//! The convergence loop.
//!
//! A digest sweeps the whole tree, pre-order from the root, evaluating every
//! watch of every scope (newest watch first). Sweeps repeat until one finds
//! nothing dirty and no eval task is waiting, or until the tree's TTL is
//! used up.
//!
//! Within a sweep, the watch that was found dirty most recently is
//! remembered. Reaching it again without it being dirty means a full lap of
//! the tree happened without any change, so the rest of the sweep is skipped.

use crate::Scope;
use crate::arena::{Recorded, ScopeId, WatchKey, evaluate_slot, listener_slot};
use crate::error::{DigestError, FaultOrigin, Result};
use crate::phase::Phase;
use crate::queue;
use crate::tree::Tree;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, debug_span, trace};

enum WatchOutcome {
    Clean,
    Dirty,
    /// Clean, and it was the last dirty watch: the tree is stable.
    ShortCircuit,
    /// Removed before or while it was evaluated.
    Gone,
}

/// Run a digest over the whole tree.
pub(crate) fn digest(tree: &Arc<Tree>) -> Result<()> {
    let mut phase = Some(tree.phase.begin(Phase::Digest)?);
    let span = debug_span!("digest");
    let _enter = span.enter();
    tree.reset_last_dirty();

    if let Some(timer) = tree.queues.apply_timer() {
        cov_mark::hit!(digest_flushes_pending_apply);
        tree.event_loop.clear_timeout(timer);
        queue::flush_apply_queue(tree);
    }

    let mut iterations = 0;
    loop {
        queue::drain_eval_queue(tree);
        let dirty = sweep(tree);
        iterations += 1;

        if !dirty && tree.queues.settle_eval(|| drop(phase.take())) {
            break;
        }
        if iterations >= tree.ttl {
            drop(phase);
            debug!(iterations, "digest did not settle");
            return Err(DigestError::NonTerminating { iterations });
        }
    }
    trace!(iterations, "digest settled");

    queue::drain_post_digest(tree);
    Ok(())
}

/// One pass over the tree. Returns whether any watch was dirty.
fn sweep(tree: &Arc<Tree>) -> bool {
    let mut dirty = false;
    let flow = every_scope(tree, tree.root, &mut |id| {
        let scope = Scope::from_parts(tree.clone(), id);
        for key in tree.scopes.watches_of(id).into_iter().rev() {
            match check_watch(tree, &scope, key) {
                WatchOutcome::Dirty => dirty = true,
                WatchOutcome::ShortCircuit => return ControlFlow::Break(()),
                WatchOutcome::Clean | WatchOutcome::Gone => {}
            }
        }
        ControlFlow::Continue(())
    });
    if flow.is_break() {
        cov_mark::hit!(sweep_short_circuited);
        trace!("sweep short-circuited at last dirty watch");
    }
    dirty
}

/// Pre-order walk from `id`, stopping the whole walk on `Break`.
///
/// Children are read once per node, so scopes spawned during the visit of a
/// node are first seen by the next sweep. Scopes destroyed in the meantime
/// are skipped with their subtree. The root is never skipped: destroying it
/// only empties its own watch list.
fn every_scope<F>(tree: &Tree, id: ScopeId, visit: &mut F) -> ControlFlow<()>
where
    F: FnMut(ScopeId) -> ControlFlow<()>,
{
    if id != tree.root && tree.scopes.is_destroyed(id) {
        return ControlFlow::Continue(());
    }
    visit(id)?;
    for child in tree.scopes.children_of(id) {
        every_scope(tree, child, visit)?;
    }
    ControlFlow::Continue(())
}

fn check_watch(tree: &Tree, scope: &Scope, key: WatchKey) -> WatchOutcome {
    let new_value = {
        let Some(mut evaluate) = tree.watches.take(key, evaluate_slot) else {
            return WatchOutcome::Gone;
        };
        let Some(f) = evaluate.get_mut() else {
            return WatchOutcome::Gone;
        };
        match tree.contain(FaultOrigin::Watch, || f.evaluate(scope)) {
            Some(value) => value,
            None => return WatchOutcome::Clean,
        }
    };

    let Some(recorded) = tree.watches.with(key, |entry| entry.record(&new_value)) else {
        return WatchOutcome::Gone;
    };

    match recorded {
        Recorded::Unchanged if tree.last_dirty() == Some(key) => WatchOutcome::ShortCircuit,
        Recorded::Unchanged => WatchOutcome::Clean,
        Recorded::Changed { previous } => {
            tree.set_last_dirty(key);
            let old_value = previous.unwrap_or_else(|| new_value.clone());
            let Some(mut listener) = tree.watches.take(key, listener_slot) else {
                return WatchOutcome::Dirty;
            };
            let Some(f) = listener.get_mut() else {
                return WatchOutcome::Dirty;
            };
            // A failed listener leaves the value recorded but the sweep clean.
            match tree.contain(FaultOrigin::Listener, || f.on_change(&new_value, &old_value, scope)) {
                Some(()) => WatchOutcome::Dirty,
                None => WatchOutcome::Clean,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{DigestError, Phase, Scope, Value};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (count.clone(), count)
    }

    #[test]
    fn sweep_short_circuits_at_last_dirty_watch() {
        cov_mark::check!(sweep_short_circuited);
        let root = Scope::new();
        let evaluations = Arc::new(AtomicUsize::new(0));

        for i in 0..20 {
            root.set(format!("v{i}"), i);
            let evaluations = evaluations.clone();
            let name = format!("v{i}");
            root.watch(
                move |s: &Scope| {
                    evaluations.fetch_add(1, Ordering::Relaxed);
                    s.get(&name)
                },
                |_: &Value, _: &Value, _: &Scope| {},
            );
        }

        root.digest().unwrap();
        assert_eq!(evaluations.load(Ordering::Relaxed), 40);

        // The first-evaluated watch changes; the second sweep stops as soon
        // as it comes back around to it.
        root.set("v19", 100);
        root.digest().unwrap();
        assert_eq!(evaluations.load(Ordering::Relaxed), 61);
    }

    #[test]
    fn new_watch_registered_by_listener_is_evaluated_in_same_digest() {
        let root = Scope::new();
        root.set("a", "x");
        let (seen, seen_clone) = counter();

        root.watch(
            |s: &Scope| s.get("a"),
            move |_: &Value, _: &Value, s: &Scope| {
                let seen = seen_clone.clone();
                s.watch(
                    |s: &Scope| s.get("a"),
                    move |_: &Value, _: &Value, _: &Scope| {
                        seen.fetch_add(1, Ordering::Relaxed);
                    },
                );
            },
        );

        root.digest().unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn digest_inside_listener_is_a_phase_conflict() {
        let root = Scope::new();
        let result = Arc::new(parking_lot::Mutex::new(None));

        let result_clone = result.clone();
        root.watch(
            |_: &Scope| Value::from(1),
            move |_: &Value, _: &Value, s: &Scope| {
                *result_clone.lock() = Some(s.digest());
            },
        );

        root.digest().unwrap();
        assert_eq!(
            *result.lock(),
            Some(Err(DigestError::PhaseConflict {
                active: Phase::Digest
            }))
        );
        assert_eq!(root.phase(), Phase::Idle);
    }

    #[test]
    fn watches_in_destroyed_subtree_are_not_swept() {
        let root = Scope::new();
        let parent = root.spawn_child();
        let child = parent.spawn_child();
        let (runs, runs_clone) = counter();

        child.watch_only(move |_: &Scope| {
            runs_clone.fetch_add(1, Ordering::Relaxed);
            Value::Null
        });

        root.digest().unwrap();
        let after_first = runs.load(Ordering::Relaxed);
        assert!(after_first > 0);

        parent.destroy();
        root.digest().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), after_first);
        assert!(!child.is_destroyed());
    }
}
