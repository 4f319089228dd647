// =============================================================================
// Update Coalescer — bounded batching of classified stream updates
// =============================================================================
//
// Every classified update lands on one pending queue. The first enqueue of
// an idle period arms a single flush timer; when it fires the whole queue
// drains in arrival order. This bounds callback frequency under bursts
// without reordering or dropping anything — a batching boundary, not a rate
// limiter.
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;

use crate::binance::frame::StreamUpdate;

struct Inner {
    items: Vec<StreamUpdate>,
    armed: bool,
}

/// Pending-update queue with a fixed flush window.
pub struct UpdateQueue {
    inner: Mutex<Inner>,
    window: Duration,
}

impl UpdateQueue {
    pub fn new(window_ms: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                armed: false,
            }),
            window: Duration::from_millis(window_ms),
        }
    }

    /// How long a batch accumulates before the flush timer fires.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Enqueue one update. Returns `true` when this push must arm the flush
    /// timer (the queue was idle); `false` when a timer is already pending.
    pub fn push(&self, update: StreamUpdate) -> bool {
        let mut inner = self.inner.lock();
        inner.items.push(update);
        if inner.armed {
            false
        } else {
            inner.armed = true;
            true
        }
    }

    /// Take the whole batch in arrival order and disarm the timer.
    pub fn drain(&self) -> Vec<StreamUpdate> {
        let mut inner = self.inner.lock();
        inner.armed = false;
        std::mem::take(&mut inner.items)
    }

    /// Discard everything pending.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.armed = false;
        inner.items.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}
