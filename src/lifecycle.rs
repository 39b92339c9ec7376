//! Disposal guard shared by every disposable component.
//!
//! Each component owns a [`Lifecycle`] and checks it at the top of every
//! public mutating operation. Transitions go through compare-and-swap so a
//! racing `dispose` and an operation entry agree on a single winner.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};

const ACTIVE: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

/// Observable disposal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeState {
    Active,
    Disposing,
    Disposed,
}

#[derive(Debug)]
pub struct Lifecycle {
    component: &'static str,
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            state: AtomicU8::new(ACTIVE),
        }
    }

    pub fn state(&self) -> DisposeState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => DisposeState::Active,
            DISPOSING => DisposeState::Disposing,
            _ => DisposeState::Disposed,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state() != DisposeState::Active
    }

    /// Fails with [`Error::Disposed`] unless the component is still active.
    pub fn ensure_active(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == ACTIVE {
            Ok(())
        } else {
            Err(Error::Disposed(self.component))
        }
    }

    /// Moves Active -> Disposing. Returns `false` if another caller already
    /// started (or finished) disposal.
    pub fn begin_dispose(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, DISPOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves Disposing -> Disposed.
    pub fn finish_dispose(&self) {
        self.state.store(DISPOSED, Ordering::Release);
    }
}
