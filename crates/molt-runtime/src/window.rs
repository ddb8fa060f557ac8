//! Escape window: batched buffering of raw escape addresses
//!
//! Escape hooks are on the instrumented program's hot path, so recording
//! an escape is a single buffered push. Resolution against the allocation
//! table happens in batches: when the window fills, or on demand before a
//! relocation.

/// Fixed-capacity buffer of pending raw escape addresses.
///
/// The buffer's full capacity is reserved up front; a context flushes the
/// window before pushing into a full one, so `pending` never reallocates
/// in steady state.
#[derive(Debug)]
pub struct EscapeWindow {
    pending: Vec<u64>,
    capacity: usize,
}

impl EscapeWindow {
    /// Create a window holding up to `capacity` pending addresses.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a raw escape address.
    pub fn push(&mut self, addr: u64) {
        self.pending.push(addr);
    }

    /// Whether the window has reached capacity and must be processed
    /// before the next push.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    /// Number of pending addresses.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the pending buffer for processing, leaving the window empty.
    ///
    /// Pair with [`EscapeWindow::recycle`] to hand the allocation back.
    pub(crate) fn take(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.pending)
    }

    /// Return a processed buffer, cleared, so its reserved capacity is
    /// kept for future pushes.
    pub(crate) fn recycle(&mut self, mut buf: Vec<u64>) {
        buf.clear();
        self.pending = buf;
    }
}
