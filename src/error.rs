//! Error and fault types.
//!
//! Only two conditions ever reach the caller of an entry point: a phase
//! conflict and a digest that does not settle. Everything a user callback
//! raises is contained and recorded as a [`Fault`] instead.

use crate::phase::Phase;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Errors returned by [`Scope::digest`](crate::Scope::digest) and
/// [`Scope::apply`](crate::Scope::apply).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// A digest or apply was started while another one is active on the same tree.
    #[error("{active} already in progress")]
    PhaseConflict {
        /// The phase that was active when the new one was requested.
        active: Phase,
    },

    /// The tree was still dirty after the configured number of sweeps.
    #[error("{iterations} digest iterations reached")]
    NonTerminating {
        /// Number of sweeps performed before giving up.
        iterations: usize,
    },
}

/// Result alias used by the digest entry points.
pub type Result<T> = std::result::Result<T, DigestError>;

/// Where a contained callback fault came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultOrigin {
    /// A watch's evaluate function.
    Watch,
    /// A watch listener.
    Listener,
    /// A task queued with `eval_async`.
    EvalTask,
    /// A task queued with `apply_async`.
    ApplyTask,
    /// A closure queued with `post_digest`.
    PostDigest,
    /// A digest triggered by a timer, which has no caller to report to.
    Scheduler,
}

impl fmt::Display for FaultOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultOrigin::Watch => "watch",
            FaultOrigin::Listener => "listener",
            FaultOrigin::EvalTask => "eval task",
            FaultOrigin::ApplyTask => "apply task",
            FaultOrigin::PostDigest => "post-digest task",
            FaultOrigin::Scheduler => "scheduler",
        };
        f.write_str(name)
    }
}

/// A contained failure of a user callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Which kind of callback failed.
    pub origin: FaultOrigin,
    /// The panic payload (or error) rendered as text.
    pub message: String,
}

impl Fault {
    pub(crate) fn from_panic(origin: FaultOrigin, payload: Box<dyn Any + Send>) -> Self {
        Self {
            origin,
            message: panic_message(payload.as_ref()),
        }
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.origin, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_condition() {
        let conflict = DigestError::PhaseConflict {
            active: Phase::Digest,
        };
        assert_eq!(conflict.to_string(), "$digest already in progress");

        let runaway = DigestError::NonTerminating { iterations: 10 };
        assert_eq!(runaway.to_string(), "10 digest iterations reached");
    }

    #[test]
    fn fault_from_panic_keeps_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 7))
            .err()
            .expect("closure panics");
        let fault = Fault::from_panic(FaultOrigin::Listener, payload);
        assert_eq!(fault.message, "boom 7");
        assert_eq!(fault.to_string(), "listener failed: boom 7");
    }
}
