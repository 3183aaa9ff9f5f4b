//! Timer primitive for deferred digests
//!
//! Scopes never spawn threads or sleep. When work is scheduled for "later"
//! (`eval_async`, `apply_async`) the tree arms a zero-delay timer on its
//! [`EventLoop`]. Something outside the tree then has to turn the loop:
//!
//! - **Manually**: call [`EventLoop::turn`] from your own event loop, or in tests.
//!   Only timers that were armed before the turn started run in that turn, so
//!   a timer armed by a timer runs on the next turn.
//!
//! - **Runner thread**: [`Runner`] spawns a thread that sleeps until a timer is
//!   armed, waits a short debounce window so bursts of scheduling coalesce,
//!   then turns the loop until it is idle.
//!
//! ## Usage
//!
//! ```ignore
//! // Deterministic, driven by the caller
//! let scope = Scope::new();
//! scope.apply_async(|s| s.set("x", 1));
//! scope.event_loop().turn();
//!
//! // Background thread
//! let handle = Runner::new(scope.event_loop().clone())
//!     .debounce(Duration::from_millis(2))
//!     .spawn();
//! // ...
//! handle.stop();
//! ```

use crate::error::panic_message;
use foldhash::fast::FixedState;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Default debounce delay of the [`Runner`].
///
/// After a timer is armed the runner waits this long before turning the loop.
/// Timers armed during this period reset the wait.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1);

/// Maximum time the [`Runner`] keeps debouncing under constant scheduling.
pub const DEFAULT_MAX_DEBOUNCE: Duration = Duration::from_millis(16);

/// Upper bound on turns per wake-up, so self-rearming timers cannot pin the runner.
const MAX_TURNS_PER_WAKE: usize = 64;

type Task = Box<dyn FnOnce() + Send>;

/// Identifies an armed timer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Default)]
struct EventLoopInner {
    next_id: AtomicU64,
    /// Armed timers in arming order.
    timers: Mutex<IndexMap<TimerId, Task, FixedState>>,
    /// Wakes the runner thread, if one is attached.
    notifier: Mutex<Option<Sender<()>>>,
}

/// A queue of zero-delay timers.
///
/// Cloning yields another handle to the same loop.
#[derive(Clone, Default)]
pub struct EventLoop {
    inner: Arc<EventLoopInner>,
}

impl EventLoop {
    /// Create an empty loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer that runs `task` on a later turn.
    pub fn set_timeout<F>(&self, task: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TimerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.timers.lock().insert(id, Box::new(task));
        trace!(timer = id.0, "timer armed");

        if let Some(sender) = self.inner.notifier.lock().as_ref() {
            // A closed channel means the runner has stopped; the timer waits for a manual turn.
            let _ = sender.send(());
        }
        id
    }

    /// Disarm a timer. Returns `false` if it already ran or was cleared.
    pub fn clear_timeout(&self, id: TimerId) -> bool {
        let cleared = self.inner.timers.lock().shift_remove(&id).is_some();
        if cleared {
            trace!(timer = id.0, "timer cleared");
        }
        cleared
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.inner.timers.lock().len()
    }

    /// Run every timer that was armed when the turn started, in arming order.
    ///
    /// Timers cleared by an earlier task of the same turn are skipped. A
    /// panicking task is logged and does not stop the turn.
    ///
    /// Returns the number of tasks that ran.
    pub fn turn(&self) -> usize {
        let due: Vec<TimerId> = self.inner.timers.lock().keys().copied().collect();
        let mut ran = 0;
        for id in due {
            // Lock released before the task runs; tasks arm and clear timers.
            let Some(task) = self.inner.timers.lock().shift_remove(&id) else {
                continue;
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                let message = panic_message(payload.as_ref());
                error!(timer = id.0, %message, "timer task panicked");
            }
            ran += 1;
        }
        ran
    }

    /// Turn the loop until no timers are armed or `max_turns` is reached.
    ///
    /// Returns the total number of tasks that ran.
    pub fn run_until_idle(&self, max_turns: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_turns {
            let ran = self.turn();
            if ran == 0 {
                break;
            }
            total += ran;
        }
        total
    }

    fn attach(&self, sender: Sender<()>) {
        // Replacing a previous sender disconnects (and so stops) its runner.
        *self.inner.notifier.lock() = Some(sender);
    }

    fn detach(&self) {
        self.inner.notifier.lock().take();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Builder for a background thread that turns an [`EventLoop`].
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
///
/// let handle = Runner::new(event_loop)
///     .debounce(Duration::from_millis(2))
///     .max_debounce(Duration::from_millis(10))
///     .spawn_fn(|f| {
///         std::thread::Builder::new()
///             .name("digest-runner".into())
///             .spawn(f)
///             .unwrap()
///     })
///     .spawn();
/// ```
#[allow(clippy::type_complexity)]
pub struct Runner {
    event_loop: EventLoop,
    debounce: Duration,
    max_debounce: Duration,
    spawn_fn: Option<Box<dyn FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send>>,
}

impl Runner {
    /// Create a runner builder for `event_loop` with default settings.
    ///
    /// Defaults:
    /// - `debounce`: 1ms
    /// - `max_debounce`: 16ms
    /// - `spawn_fn`: `std::thread::spawn`
    pub fn new(event_loop: EventLoop) -> Self {
        Self {
            event_loop,
            debounce: DEFAULT_DEBOUNCE,
            max_debounce: DEFAULT_MAX_DEBOUNCE,
            spawn_fn: None,
        }
    }

    /// Set the debounce delay.
    pub fn debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Set the maximum debounce wait time.
    pub fn max_debounce(mut self, duration: Duration) -> Self {
        self.max_debounce = duration;
        self
    }

    /// Set a custom thread spawning function.
    pub fn spawn_fn<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send + 'static,
    {
        self.spawn_fn = Some(Box::new(f));
        self
    }

    /// Attach to the loop and start the thread.
    ///
    /// Attaching a second runner to the same loop stops the first one.
    pub fn spawn(self) -> RunnerHandle {
        let (tx, rx) = mpsc::channel::<()>();
        self.event_loop.attach(tx);

        let event_loop = self.event_loop.clone();
        let debounce = self.debounce;
        let max_debounce = self.max_debounce;
        let loop_fn: Box<dyn FnOnce() + Send> = Box::new(move || {
            run_loop(rx, event_loop, debounce, max_debounce);
        });

        let thread = match self.spawn_fn {
            Some(spawn_fn) => spawn_fn(loop_fn),
            None => thread::spawn(loop_fn),
        };
        RunnerHandle {
            event_loop: self.event_loop,
            thread,
        }
    }
}

/// Handle to a running [`Runner`] thread.
pub struct RunnerHandle {
    event_loop: EventLoop,
    thread: JoinHandle<()>,
}

impl RunnerHandle {
    /// Detach the runner from its loop and wait for the thread to exit.
    ///
    /// Timers still armed afterwards stay in the loop.
    pub fn stop(self) -> thread::Result<()> {
        self.event_loop.detach();
        self.thread.join()
    }
}

fn run_loop(
    rx: mpsc::Receiver<()>,
    event_loop: EventLoop,
    debounce: Duration,
    max_debounce: Duration,
) {
    // Timers armed before the runner attached.
    event_loop.run_until_idle(MAX_TURNS_PER_WAKE);

    loop {
        if rx.recv().is_err() {
            break;
        }

        let debounce_start = Instant::now();
        loop {
            if debounce_start.elapsed() >= max_debounce {
                break;
            }
            let remaining_max = max_debounce.saturating_sub(debounce_start.elapsed());
            match rx.recv_timeout(debounce.min(remaining_max)) {
                Ok(()) => {}
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }

        loop {
            match rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        event_loop.run_until_idle(MAX_TURNS_PER_WAKE);
    }
}
