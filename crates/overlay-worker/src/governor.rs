//! Bounded admission gate for render slots.
//!
//! Wraps tokio's semaphore, which hands permits out in request order. The
//! scheduler's single dispatcher is the only caller of [`Governor::acquire`],
//! so admission order is submission order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const SLOTS_IN_USE: &str = "overlay_render_slots_in_use";

/// Fixed-capacity pool of render slots.
#[derive(Debug, Clone)]
pub struct Governor {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    waiting: Arc<AtomicUsize>,
}

/// Permission to run one render. The slot is freed when this is dropped.
#[derive(Debug)]
pub struct RenderSlot {
    _permit: OwnedSemaphorePermit,
}

impl RenderSlot {
    /// Give the slot back explicitly.
    pub fn release(self) {}
}

impl Drop for RenderSlot {
    fn drop(&mut self) {
        metrics::gauge!(SLOTS_IN_USE).decrement(1.0);
    }
}

/// Keeps the waiter count right even if an `acquire` future is dropped.
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Governor {
    /// Create a governor with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot. Returns `None` once the governor is closed.
    pub async fn acquire(&self) -> Option<RenderSlot> {
        let _waiting = WaitGuard::enter(&self.waiting);
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        Some(Self::grant(permit))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<RenderSlot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(Self::grant)
    }

    fn grant(permit: OwnedSemaphorePermit) -> RenderSlot {
        metrics::gauge!(SLOTS_IN_USE).increment(1.0);
        RenderSlot { _permit: permit }
    }

    /// Stop handing out slots. Pending and future `acquire` calls return `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Callers blocked in `acquire`.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}
