use crate::error::{DigestError, Result};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Which exclusive operation a tree is currently running.
///
/// The only legal transitions are `Idle -> Digest` and `Idle -> Apply`; the
/// return to `Idle` happens when the phase guard is dropped, including
/// during unwinding.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Nothing is running.
    Idle = 0,
    /// A digest (convergence run) is sweeping the tree.
    Digest = 1,
    /// An apply is evaluating its expression.
    Apply = 2,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Idle,
            1 => Phase::Digest,
            _ => Phase::Apply,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::Digest => "$digest",
            Phase::Apply => "$apply",
        })
    }
}

/// Root-level phase flag shared by every scope of a tree.
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(Phase::Idle as u8))
    }

    pub(crate) fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.get() == Phase::Idle
    }

    /// Enter `phase`, failing without touching the flag if another phase is active.
    pub(crate) fn begin(&self, phase: Phase) -> Result<PhaseGuard<'_>> {
        debug_assert_ne!(phase, Phase::Idle);
        match self.0.compare_exchange(
            Phase::Idle as u8,
            phase as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(PhaseGuard { cell: self }),
            Err(active) => Err(DigestError::PhaseConflict {
                active: Phase::from_u8(active),
            }),
        }
    }
}

/// RAII guard that clears the phase when dropped, even on panic.
pub(crate) struct PhaseGuard<'a> {
    cell: &'a PhaseCell,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.cell.0.store(Phase::Idle as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_and_drop_round_trips_to_idle() {
        let cell = PhaseCell::new();
        {
            let _guard = cell.begin(Phase::Digest).unwrap();
            assert_eq!(cell.get(), Phase::Digest);
        }
        assert!(cell.is_idle());
    }

    #[test]
    fn nested_begin_is_a_conflict_and_leaves_state() {
        let cell = PhaseCell::new();
        let _guard = cell.begin(Phase::Apply).unwrap();

        let err = cell.begin(Phase::Digest).err();
        assert_eq!(
            err,
            Some(DigestError::PhaseConflict {
                active: Phase::Apply
            })
        );
        assert_eq!(cell.get(), Phase::Apply);
    }

    #[test]
    fn guard_clears_phase_on_panic() {
        let cell = PhaseCell::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = cell.begin(Phase::Apply).unwrap();
            panic!("expression failed");
        }));
        assert!(result.is_err());
        assert!(cell.is_idle());
    }
}
