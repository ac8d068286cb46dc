#![forbid(unsafe_code)]

//! Scrub scheduling: which unrecovered slabs to repair, and in what order.
//!
//! The scrubber holds two FIFOs; high-priority slabs always pop first.
//! Scrubbing itself is strictly sequential within a zone, one slab at a
//! time. The scrubber is quiescent until activated by an admin-state
//! transition.

use std::collections::VecDeque;

use crate::admin::{AdminState, DrainType};
use crate::types::Result;

/// Per-allocator scrub queues and state.
#[derive(Debug)]
pub struct SlabScrubber {
    high_priority_slabs: VecDeque<usize>,
    slabs: VecDeque<usize>,
    /// Lifecycle state; scrubbing only proceeds while normal.
    pub admin_state: AdminState,
}

impl Default for SlabScrubber {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabScrubber {
    /// Creates a quiescent scrubber with empty queues.
    pub fn new() -> Self {
        Self {
            high_priority_slabs: VecDeque::new(),
            slabs: VecDeque::new(),
            admin_state: AdminState::default(),
        }
    }

    /// Queues a slab, moving it between lists if already registered.
    pub fn register_slab(&mut self, slab_number: usize, high_priority: bool) {
        self.high_priority_slabs.retain(|&s| s != slab_number);
        self.slabs.retain(|&s| s != slab_number);
        if high_priority {
            self.high_priority_slabs.push_back(slab_number);
        } else {
            self.slabs.push_back(slab_number);
        }
    }

    /// True when any slab is waiting to be scrubbed.
    pub fn has_slabs(&self) -> bool {
        !self.high_priority_slabs.is_empty() || !self.slabs.is_empty()
    }

    /// Number of queued slabs.
    pub fn slab_count(&self) -> usize {
        self.high_priority_slabs.len() + self.slabs.len()
    }

    /// Pops the next slab to scrub, high priority first.
    pub fn next_slab(&mut self) -> Option<usize> {
        self.high_priority_slabs
            .pop_front()
            .or_else(|| self.slabs.pop_front())
    }

    /// True while the scrubber may make progress.
    pub fn is_active(&self) -> bool {
        self.admin_state.is_normal()
    }

    /// True when the scrubber is stopped.
    pub fn is_quiescent(&self) -> bool {
        self.admin_state.is_quiescent()
    }

    /// Activates scrubbing.
    pub fn start(&mut self) -> Result<()> {
        match self.admin_state.code() {
            crate::admin::AdminStateCode::Normal => Ok(()),
            crate::admin::AdminStateCode::New => {
                self.admin_state.make_normal();
                Ok(())
            }
            _ => {
                self.admin_state.start_resuming()?;
                self.admin_state.finish_resuming()
            }
        }
    }

    /// Stops scrubbing; queued slabs stay queued.
    pub fn stop(&mut self) -> Result<()> {
        if self.admin_state.is_quiescent() {
            return Ok(());
        }
        self.admin_state.start_draining(DrainType::Suspending)?;
        self.admin_state.finish_draining()
    }
}
