#![forbid(unsafe_code)]

//! Admin state machine and the process-wide read-only latch.
//!
//! Every long-lived resource (slab, allocator, depot, volume) carries an
//! [`AdminState`]. Operations are started and finished explicitly; invalid
//! transitions fail rather than being silently absorbed, so a stray drain
//! during load surfaces as an error instead of corruption.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::types::{BasaltError, Result};

/// How a load operation should treat on-disk state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadType {
    /// Normal load after a clean shutdown.
    Load,
    /// Load after a crash; slab journals will be replayed.
    LoadForRecovery,
    /// Load that discards slab journals and rebuilds from the block map.
    LoadForRebuild,
}

/// What a drain operation is allowed to discard or must preserve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainType {
    /// Flush dirty metadata but keep operating.
    Flush,
    /// Persist everything for a clean shutdown.
    Saving,
    /// Stop activity without persisting beyond what is already queued.
    Suspending,
    /// Drain performed as part of crash recovery.
    Recovering,
    /// Drain performed as part of a forced rebuild.
    Rebuilding,
}

/// Lifecycle state of an administrable resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminStateCode {
    /// Freshly constructed; not yet loaded.
    New,
    /// Normal operation.
    Normal,
    /// A load is in progress.
    Loading(LoadType),
    /// A drain is in progress.
    Draining(DrainType),
    /// Drained and quiet; nothing in flight.
    Suspended,
    /// Fully saved and quiet.
    Saved,
    /// Returning from suspended to normal operation.
    Resuming,
}

/// An admin state cell with explicit, checked transitions.
#[derive(Clone, Copy, Debug)]
pub struct AdminState {
    code: AdminStateCode,
}

impl Default for AdminState {
    fn default() -> Self {
        Self {
            code: AdminStateCode::New,
        }
    }
}

impl AdminState {
    /// Current state code.
    pub fn code(&self) -> AdminStateCode {
        self.code
    }

    /// True during normal operation.
    pub fn is_normal(&self) -> bool {
        self.code == AdminStateCode::Normal
    }

    /// True while any load is in progress.
    pub fn is_loading(&self) -> bool {
        matches!(self.code, AdminStateCode::Loading(_))
    }

    /// True while any drain is in progress.
    pub fn is_draining(&self) -> bool {
        matches!(self.code, AdminStateCode::Draining(_))
    }

    /// True while returning from a suspension.
    pub fn is_resuming(&self) -> bool {
        self.code == AdminStateCode::Resuming
    }

    /// True when the resource is quiet (suspended, saved, or never loaded).
    pub fn is_quiescent(&self) -> bool {
        matches!(
            self.code,
            AdminStateCode::New | AdminStateCode::Suspended | AdminStateCode::Saved
        )
    }

    /// Begins a load. Valid only from `New` or `Suspended`.
    pub fn start_loading(&mut self, load_type: LoadType) -> Result<()> {
        match self.code {
            AdminStateCode::New | AdminStateCode::Suspended => {
                self.code = AdminStateCode::Loading(load_type);
                Ok(())
            }
            _ => Err(BasaltError::InvalidAdminState("load from non-quiescent state")),
        }
    }

    /// Completes a load, entering normal operation.
    pub fn finish_loading(&mut self) -> Result<()> {
        match self.code {
            AdminStateCode::Loading(_) => {
                self.code = AdminStateCode::Normal;
                Ok(())
            }
            _ => Err(BasaltError::InvalidAdminState("finish of load never started")),
        }
    }

    /// Begins a drain. Re-entering the same drain type is idempotent so a
    /// retried step is harmless.
    pub fn start_draining(&mut self, drain_type: DrainType) -> Result<()> {
        match self.code {
            AdminStateCode::Normal => {
                self.code = AdminStateCode::Draining(drain_type);
                Ok(())
            }
            AdminStateCode::Draining(current) if current == drain_type => Ok(()),
            _ => Err(BasaltError::InvalidAdminState("drain from invalid state")),
        }
    }

    /// Completes a drain, entering the matching quiescent state.
    pub fn finish_draining(&mut self) -> Result<()> {
        match self.code {
            AdminStateCode::Draining(DrainType::Saving) => {
                self.code = AdminStateCode::Saved;
                Ok(())
            }
            AdminStateCode::Draining(DrainType::Flush)
            | AdminStateCode::Draining(DrainType::Recovering)
            | AdminStateCode::Draining(DrainType::Rebuilding) => {
                self.code = AdminStateCode::Normal;
                Ok(())
            }
            AdminStateCode::Draining(DrainType::Suspending) => {
                self.code = AdminStateCode::Suspended;
                Ok(())
            }
            _ => Err(BasaltError::InvalidAdminState("finish of drain never started")),
        }
    }

    /// Begins resuming from a quiescent state. Idempotent while resuming.
    pub fn start_resuming(&mut self) -> Result<()> {
        match self.code {
            AdminStateCode::Suspended | AdminStateCode::Saved => {
                self.code = AdminStateCode::Resuming;
                Ok(())
            }
            AdminStateCode::Resuming => Ok(()),
            _ => Err(BasaltError::InvalidAdminState("resume from non-quiescent state")),
        }
    }

    /// Completes a resume, entering normal operation.
    pub fn finish_resuming(&mut self) -> Result<()> {
        match self.code {
            AdminStateCode::Resuming => {
                self.code = AdminStateCode::Normal;
                Ok(())
            }
            _ => Err(BasaltError::InvalidAdminState("finish of resume never started")),
        }
    }

    /// Forces normal operation. Used when a freshly built resource is
    /// brought up without a disk load (formatting, tests).
    pub fn make_normal(&mut self) {
        self.code = AdminStateCode::Normal;
    }
}

/// Process-wide read-only latch.
///
/// Entry is monotone and idempotent: once the volume goes read-only it
/// stays read-only until a forced rebuild. Listeners registered here are
/// reported in the transition log line; the owning structures react by
/// aborting their waiters when notified through the depot.
#[derive(Debug, Default)]
pub struct ReadOnlyNotifier {
    read_only: AtomicBool,
    listeners: Mutex<Vec<String>>,
}

impl ReadOnlyNotifier {
    /// Creates a writable notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once any component has entered read-only mode.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Registers a listener name for diagnostics.
    pub fn register_listener(&self, name: impl Into<String>) {
        self.listeners.lock().push(name.into());
    }

    /// Enters read-only mode. Returns true on the first transition only.
    pub fn enter(&self, reason: &str) -> bool {
        let first = !self.read_only.swap(true, Ordering::AcqRel);
        if first {
            let listeners = self.listeners.lock();
            error!(
                reason,
                listeners = listeners.len(),
                "entering read-only mode"
            );
        } else {
            info!(reason, "already in read-only mode");
        }
        first
    }

    /// Fails with `ReadOnly` when the latch is set.
    pub fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(BasaltError::ReadOnly);
        }
        Ok(())
    }
}
