//! Shared accounting for bytes received but not yet resolved into frames.
//!
//! One budget per source instance, shared by reference between the stdout and
//! stderr readers. Reservations are check-and-add in a single CAS so combined
//! buffering can never pass the cap.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct BufferBudget {
    max: usize,
    used: AtomicUsize,
}

impl BufferBudget {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            used: AtomicUsize::new(0),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.max.saturating_sub(self.used())
    }

    /// Reserve exactly `bytes`, or nothing.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.max)
            })
            .is_ok()
    }

    /// Reserve as many of `wanted` bytes as currently fit. Returns the amount reserved.
    pub fn reserve_up_to(&self, wanted: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                granted = wanted.min(self.max.saturating_sub(used));
                Some(used + granted)
            });
        granted
    }

    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let result = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
        if let Ok(previous) = result
            && previous < bytes
        {
            tracing::error!(previous, released = bytes, "Buffer budget released more than reserved");
        }
    }
}
