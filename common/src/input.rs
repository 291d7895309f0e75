use core::sync::atomic::{AtomicBool, Ordering};

use crate::clock::Millis;

/// Single-word flag an interrupt handler raises and the main loop consumes.
#[derive(Debug, Default)]
pub struct InputFlag(AtomicBool);

impl InputFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Safe to call from an ISR: one store, no allocation, no locks.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consumes the flag, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Debounce {
    window_ms: u32,
    last: Option<Millis>,
}

impl Debounce {
    pub fn new(window_ms: u32) -> Self {
        Self {
            window_ms,
            last: None,
        }
    }

    /// Accepts an edge unless the previous accepted one is within the window.
    pub fn accept(&mut self, now: Millis) -> bool {
        match self.last {
            Some(last) if !now.has_elapsed(last, self.window_ms) => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
