#![deny(missing_docs)]

//! Hierarchical dirty-checking for application state.
//!
//! A tree of [`Scope`]s holds named [`Value`]s. Watches registered on any
//! scope evaluate a value each time the tree is digested and call their
//! listener when it differs from the last evaluation. Listeners may change
//! state, so a digest repeats its sweep until nothing is dirty, giving up
//! after a fixed number of sweeps.
//!
//! # Quick Start
//!
//! ```ignore
//! use dirtywatch::{Scope, Value};
//!
//! let root = Scope::new();
//! root.set("name", "ada");
//!
//! root.watch(
//!     |s: &Scope| s.get("name"),
//!     |new: &Value, old: &Value, s: &Scope| {
//!         s.set("greeting", format!("hello {}", new.as_str().unwrap_or("")));
//!     },
//! );
//!
//! root.digest()?;
//! assert_eq!(root.get("greeting").as_str(), Some("hello ada"));
//! ```
//!
//! # Core Types
//!
//! - [`Scope`] - Node of the tree. Fields, watches, digests and deferred work.
//! - [`Value`] - Dynamic value. Lists and records are shared containers.
//! - [`Equality`] - Reference or structural change detection per watch.
//! - [`WatchHandle`] - Removes a registered watch.
//! - [`EventLoop`] - Zero-delay timers deferred digests are armed on.
//!
//! # Phases
//!
//! ```ignore
//! root.digest()?;                      // sweep until stable
//! root.apply(|s| s.set("x", 1))?;      // evaluate, then digest
//! root.eval(|s| s.get("x"));           // evaluate only
//! ```
//!
//! A digest or apply started while another is running fails with
//! [`DigestError::PhaseConflict`]. A tree that keeps changing fails with
//! [`DigestError::NonTerminating`] after [`DEFAULT_TTL`] sweeps.
//!
//! # Deferred Work
//!
//! ```ignore
//! root.eval_async(|s| s.set("x", 2));  // within the current or next digest
//! root.apply_async(|s| s.set("y", 3)); // batched into one apply
//! root.post_digest(|| println!("settled"));
//!
//! root.event_loop().turn();            // fire the armed timers
//! ```
//!
//! # Faults
//!
//! Panics in watches, listeners and queued tasks are contained. Each one is
//! logged through `tracing` and kept for [`Scope::take_faults`]; the digest
//! carries on with the next callback.

pub(crate) mod arena;
mod digest;
mod error;
mod executor;
mod phase;
mod queue;
mod scope;
mod tree;
mod value;
mod watch;

// Core types
pub use arena::ScopeId;
pub use scope::Scope;
pub use tree::{DEFAULT_FAULT_CAPACITY, DEFAULT_TTL, ScopeBuilder};
pub use value::{Equality, Fields, Index, Shared, Value};
pub use watch::{Listener, WatchFn, WatchHandle, Watcher};

// Errors and phases
pub use error::{DigestError, Fault, FaultOrigin, Result};
pub use phase::Phase;

// Event loop integration
pub use executor::{DEFAULT_DEBOUNCE, DEFAULT_MAX_DEBOUNCE, EventLoop, Runner, RunnerHandle, TimerId};
