// Watch arena - storage for watch registrations of one scope tree
//
// A WatchEntry holds the evaluate function, the optional listener, the
// equality strategy and the last recorded value. Scopes only keep WatchKeys.
//
// Callbacks are taken out of the arena before they run and put back by a
// drop guard afterwards. No arena lock is held while user code runs, so a
// callback may register or remove watches, spawn scopes or schedule tasks.
//
// Slots are reused after removal, so every key carries the serial number of
// the registration it was issued for. A stale key never matches a newer
// registration in the same slot.

use crate::value::{Equality, Value};
use crate::watch::{Listener, WatchFn};
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ScopeId;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct WatchKey {
    slot: u32,
    serial: u64,
}

pub(crate) type EvaluateBox = Box<dyn WatchFn>;
pub(crate) type ListenerBox = Box<dyn Listener>;

/// Outcome of comparing a fresh value with the recorded one.
pub(crate) enum Recorded {
    Unchanged,
    /// `previous` is `None` on the first evaluation.
    Changed { previous: Option<Value> },
}

pub(crate) struct WatchEntry {
    serial: u64,
    pub(crate) scope: ScopeId,
    pub(crate) equality: Equality,
    /// `None` until the first evaluation; distinct from every real value.
    last: Mutex<Option<Value>>,
    evaluate: Mutex<Option<EvaluateBox>>,
    listener: Mutex<Option<ListenerBox>>,
}

impl WatchEntry {
    /// Compare `new` with the last value and record it if it changed.
    pub(crate) fn record(&self, new: &Value) -> Recorded {
        let mut last = self.last.lock();
        let changed = match &*last {
            None => true,
            Some(previous) => !self.equality.equal(new, previous),
        };
        if changed {
            let previous = last.replace(self.equality.snapshot(new));
            Recorded::Changed { previous }
        } else {
            Recorded::Unchanged
        }
    }
}

pub(crate) fn evaluate_slot(entry: &WatchEntry) -> &Mutex<Option<EvaluateBox>> {
    &entry.evaluate
}

pub(crate) fn listener_slot(entry: &WatchEntry) -> &Mutex<Option<ListenerBox>> {
    &entry.listener
}

pub(crate) struct WatchArena {
    slots: RwLock<Slab<WatchEntry>>,
    next_serial: AtomicU64,
}

impl WatchArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Slab::new()),
            next_serial: AtomicU64::new(0),
        }
    }

    pub(crate) fn insert(
        &self,
        scope: ScopeId,
        equality: Equality,
        evaluate: EvaluateBox,
        listener: Option<ListenerBox>,
    ) -> WatchKey {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let entry = WatchEntry {
            serial,
            scope,
            equality,
            last: Mutex::new(None),
            evaluate: Mutex::new(Some(evaluate)),
            listener: Mutex::new(listener),
        };
        let slot = self.slots.write().insert(entry);
        WatchKey {
            slot: slot as u32,
            serial,
        }
    }

    /// Access a live registration. Returns `None` for removed or stale keys.
    pub(crate) fn with<F, R>(&self, key: WatchKey, f: F) -> Option<R>
    where
        F: FnOnce(&WatchEntry) -> R,
    {
        let slots = self.slots.read();
        slots
            .get(key.slot as usize)
            .filter(|entry| entry.serial == key.serial)
            .map(f)
    }

    pub(crate) fn contains(&self, key: WatchKey) -> bool {
        self.with(key, |_| ()).is_some()
    }

    /// Remove a registration, returning the scope it belonged to.
    pub(crate) fn remove(&self, key: WatchKey) -> Option<ScopeId> {
        let mut slots = self.slots.write();
        match slots.get(key.slot as usize) {
            Some(entry) if entry.serial == key.serial => {
                Some(slots.remove(key.slot as usize).scope)
            }
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Take a callback out of its slot for the duration of the returned guard.
    ///
    /// Returns `None` if the watch is gone, has no such callback, or the
    /// callback is already running further up the stack.
    pub(crate) fn take<C>(
        &self,
        key: WatchKey,
        slot: fn(&WatchEntry) -> &Mutex<Option<C>>,
    ) -> Option<Taken<'_, C>> {
        let callback = self.with(key, |entry| slot(entry).lock().take()).flatten()?;
        Some(Taken {
            arena: self,
            key,
            slot,
            callback: Some(callback),
        })
    }
}

/// A callback checked out of the arena. Dropping it puts the callback back,
/// unless the watch was removed while it ran.
pub(crate) struct Taken<'a, C> {
    arena: &'a WatchArena,
    key: WatchKey,
    slot: fn(&WatchEntry) -> &Mutex<Option<C>>,
    callback: Option<C>,
}

impl<C> Taken<'_, C> {
    pub(crate) fn get_mut(&mut self) -> Option<&mut C> {
        self.callback.as_mut()
    }
}

impl<C> Drop for Taken<'_, C> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            let slot = self.slot;
            self.arena.with(self.key, |entry| {
                *slot(entry).lock() = Some(callback);
            });
        }
    }
}
