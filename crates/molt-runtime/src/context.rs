//! Allocation context: the table, the escape window, and the hooks
//!
//! One [`Context`] owns everything the compiler-injected hooks mutate.
//! All hook state sits behind a single mutex; statistics counters are
//! atomics outside it so snapshots never contend with the hot path.
//!
//! Hooks honor a readiness flag. While the context is not ready
//! (startup, teardown, or mid-relocation) an arriving hook returns
//! without touching the table, so the runtime's own work is never
//! self-instrumented. Each hook also holds the flag down for its own
//! duration.

use crate::config::RuntimeConfig;
use crate::mem::MemoryImage;
use crate::table::{AllocationEntry, AllocationTable};
use crate::window::EscapeWindow;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashSet;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hook-visible state, all behind the context mutex.
pub(crate) struct ContextInner {
    pub(crate) table: AllocationTable,
    pub(crate) window: EscapeWindow,
    pub(crate) ready: bool,
}

impl ContextInner {
    /// Enter a hook. Returns false if hooks are suppressed; on true the
    /// readiness flag is held down until [`ContextInner::end_hook`].
    fn begin_hook(&mut self) -> bool {
        if !self.ready {
            return false;
        }
        self.ready = false;
        true
    }

    fn end_hook(&mut self) {
        self.ready = true;
    }

    /// Drain the escape window against the live table. Returns how many
    /// locations were recorded as escapes and how many were dropped.
    ///
    /// A location is dropped when it is null, unreadable, or holds a
    /// value no live allocation covers. Duplicate locations in the same
    /// batch are skipped without counting either way.
    pub(crate) fn process_window(&mut self, mem: &MemoryImage) -> (u64, u64) {
        let pending = self.window.take();
        let mut seen: FxHashSet<u64> = FxHashSet::default();
        seen.reserve(pending.len());

        let mut resolved = 0u64;
        let mut dropped = 0u64;
        for &loc in &pending {
            if loc == 0 {
                dropped += 1;
                continue;
            }
            if !seen.insert(loc) {
                continue;
            }
            let Some(value) = mem.load_word(loc) else {
                dropped += 1;
                continue;
            };
            match self.table.find_entry_mut(value) {
                Some(entry) => {
                    entry.escape_set.insert(loc);
                    resolved += 1;
                }
                None => dropped += 1,
            }
        }

        self.window.recycle(pending);
        (resolved, dropped)
    }
}

/// Summary of a single tracked allocation, as returned by
/// [`Context::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Base address of the allocation
    pub base: u64,
    /// Size in bytes
    pub size: u64,
    /// Number of recorded escape locations
    pub escape_count: u64,
    /// Whether the allocation is pinned against relocation
    pub pinned: bool,
}

/// Point-in-time snapshot of context activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Live allocations in the table
    pub live_entries: u64,
    /// Total bytes covered by live allocations
    pub tracked_bytes: u64,
    /// Escape locations waiting in the window
    pub pending_escapes: u64,
    /// Escape locations resolved into entries so far
    pub escapes_recorded: u64,
    /// Escape locations dropped as null, unreadable, or untracked
    pub escapes_dropped: u64,
    /// Window drain passes completed
    pub windows_processed: u64,
    /// Allocations relocated successfully
    pub moves_completed: u64,
}

/// The allocation-tracking context for one instrumented address space.
pub struct Context {
    inner: Mutex<ContextInner>,
    escapes_recorded: AtomicU64,
    escapes_dropped: AtomicU64,
    windows_processed: AtomicU64,
    moves_completed: AtomicU64,
}

impl Context {
    /// Create a context and seed it with the boot thread's stack.
    ///
    /// The stack is tracked as one allocation reaching from
    /// `stack_pointer` down through the configured reserve, so stack
    /// addresses resolve in lookups from the first hook on. Hooks are
    /// live once this returns.
    pub fn new(config: RuntimeConfig, stack_pointer: u64) -> Self {
        let mut inner = ContextInner {
            table: AllocationTable::new(),
            window: EscapeWindow::with_capacity(config.escape_window_capacity),
            ready: false,
        };

        let stack_base = stack_pointer.saturating_sub(config.stack_reserve_bytes);
        inner
            .table
            .insert(AllocationEntry::new(stack_base, stack_pointer - stack_base));
        inner.ready = true;

        Self {
            inner: Mutex::new(inner),
            escapes_recorded: AtomicU64::new(0),
            escapes_dropped: AtomicU64::new(0),
            windows_processed: AtomicU64::new(0),
            moves_completed: AtomicU64::new(0),
        }
    }

    /// Lock the hook state. Crate-internal; the relocation engine holds
    /// this across a whole stop-the-world window.
    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock()
    }

    /// Turn hook processing on or off. Returns the previous setting.
    pub fn set_ready(&self, ready: bool) -> bool {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.ready, ready)
    }

    /// Track a fresh allocation.
    ///
    /// # Panics
    /// Panics if `addr` is already tracked.
    pub fn on_alloc(&self, addr: u64, size: u64) {
        let mut inner = self.inner.lock();
        if !inner.begin_hook() {
            return;
        }
        inner.table.insert(AllocationEntry::new(addr, size));
        #[cfg(feature = "reloc_logging")]
        tracing::trace!(target: "molt::rt", addr, size, "allocation tracked");
        inner.end_hook();
    }

    /// Track a counted allocation of `count` elements of `elem_size`
    /// bytes.
    ///
    /// # Panics
    /// Panics if the total size overflows or `addr` is already tracked.
    pub fn on_calloc(&self, addr: u64, count: u64, elem_size: u64) {
        let mut inner = self.inner.lock();
        if !inner.begin_hook() {
            return;
        }
        let Some(size) = count.checked_mul(elem_size) else {
            panic!("counted allocation overflows: {count} elements of {elem_size} bytes");
        };
        inner.table.insert(AllocationEntry::new(addr, size));
        inner.end_hook();
    }

    /// Retrack an allocation that moved from `old_addr` to `new_addr`.
    ///
    /// The old entry's escape set is discarded: locations that still
    /// point at the new block will be rediscovered through future escape
    /// reports, and locations that don't are stale by definition.
    ///
    /// # Panics
    /// Panics if `old_addr` is not tracked or `new_addr` is already
    /// tracked.
    pub fn on_realloc(&self, old_addr: u64, new_addr: u64, new_size: u64) {
        let mut inner = self.inner.lock();
        if !inner.begin_hook() {
            return;
        }
        inner.table.remove(old_addr);
        inner
            .table
            .insert(AllocationEntry::new(new_addr, new_size));
        inner.end_hook();
    }

    /// Drop a freed allocation from the table.
    ///
    /// # Panics
    /// Panics if `addr` is not tracked.
    pub fn on_free(&self, addr: u64) {
        let mut inner = self.inner.lock();
        if !inner.begin_hook() {
            return;
        }
        inner.table.remove(addr);
        inner.end_hook();
    }

    /// Track a global or static region discovered at load time.
    ///
    /// Unlike [`Context::on_alloc`] a duplicate base is tolerated: module
    /// initialization passes report the same globals more than once.
    pub fn on_global(&self, addr: u64, size: u64, module_id: u64) {
        let mut inner = self.inner.lock();
        if !inner.begin_hook() {
            return;
        }
        let fresh = inner.table.insert_tolerant(AllocationEntry::new(addr, size));
        #[cfg(feature = "reloc_logging")]
        tracing::trace!(target: "molt::rt", addr, size, module_id, fresh, "global tracked");
        #[cfg(not(feature = "reloc_logging"))]
        let _ = (module_id, fresh);
        inner.end_hook();
    }

    /// Record that a pointer was stored at `location`.
    ///
    /// The location is only queued; resolution against the table happens
    /// in batches. A full window is drained in place before queueing so
    /// it never exceeds its capacity.
    pub fn on_escape(&self, location: u64, mem: &MemoryImage) {
        let mut inner = self.inner.lock();
        if !inner.begin_hook() {
            return;
        }
        if inner.window.is_full() {
            let (resolved, dropped) = inner.process_window(mem);
            self.note_window(resolved, dropped);
        }
        inner.window.push(location);
        inner.end_hook();
    }

    /// Drain the escape window now.
    ///
    /// This is maintenance, not instrumentation: it runs even while
    /// hooks are suppressed.
    pub fn process_escape_window(&self, mem: &MemoryImage) {
        let mut inner = self.inner.lock();
        let (resolved, dropped) = inner.process_window(mem);
        self.note_window(resolved, dropped);
    }

    /// Describe the allocation covering `addr`, if any.
    pub fn lookup(&self, addr: u64) -> Option<AllocationInfo> {
        let inner = self.inner.lock();
        inner.table.find_entry(addr).map(|entry| AllocationInfo {
            base: entry.base,
            size: entry.size,
            escape_count: entry.escape_set.len() as u64,
            pinned: entry.pinned,
        })
    }

    /// Whether `location` is recorded as an escape of the allocation
    /// based at `base`.
    pub fn has_escape(&self, base: u64, location: u64) -> bool {
        let inner = self.inner.lock();
        inner
            .table
            .get(base)
            .is_some_and(|entry| entry.escape_set.contains(&location))
    }

    /// Bases and sizes of every live allocation, in address order.
    pub fn live_allocations(&self) -> Vec<(u64, u64)> {
        let inner = self.inner.lock();
        inner
            .table
            .iter()
            .map(|entry| (entry.base, entry.size))
            .collect()
    }

    /// Pin the allocation covering `addr` so relocation refuses to move
    /// it.
    ///
    /// # Panics
    /// Panics if no live allocation covers `addr`.
    pub fn pin_pointer(&self, addr: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.table.find_entry_mut(addr) else {
            panic!("pin request for untracked address {addr:#x}");
        };
        entry.pinned = true;
    }

    /// Pin the allocation that the pointer stored at `location` points
    /// to.
    ///
    /// # Panics
    /// Panics if `location` is unreadable or the loaded pointer is
    /// untracked.
    pub fn pin_escaped_pointer(&self, location: u64, mem: &MemoryImage) {
        let Some(value) = mem.load_word(location) else {
            panic!("pin request through unreadable location {location:#x}");
        };
        self.pin_pointer(value);
    }

    /// Crate-internal: count completed relocations.
    pub(crate) fn note_moves(&self, n: u64) {
        self.moves_completed.fetch_add(n, Ordering::Relaxed);
    }

    /// Crate-internal: fold one window drain into the counters.
    pub(crate) fn note_window(&self, resolved: u64, dropped: u64) {
        self.escapes_recorded.fetch_add(resolved, Ordering::Relaxed);
        self.escapes_dropped.fetch_add(dropped, Ordering::Relaxed);
        self.windows_processed.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "reloc_logging")]
        tracing::debug!(target: "molt::rt", resolved, dropped, "escape window drained");
    }

    /// Snapshot context activity.
    pub fn statistics(&self) -> ContextStats {
        let inner = self.inner.lock();
        ContextStats {
            live_entries: inner.table.len() as u64,
            tracked_bytes: inner.table.tracked_bytes(),
            pending_escapes: inner.window.len() as u64,
            escapes_recorded: self.escapes_recorded.load(Ordering::Relaxed),
            escapes_dropped: self.escapes_dropped.load(Ordering::Relaxed),
            windows_processed: self.windows_processed.load(Ordering::Relaxed),
            moves_completed: self.moves_completed.load(Ordering::Relaxed),
        }
    }

    /// Render the live table as text, one allocation per line.
    pub fn dump_table(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        let _ = writeln!(out, "live allocations: {}", inner.table.len());
        for entry in inner.table.iter() {
            let _ = writeln!(
                out,
                "  [{:#x}, {:#x}) size {} escapes {}{}",
                entry.base,
                entry.end(),
                entry.size,
                entry.escape_set.len(),
                if entry.pinned { " pinned" } else { "" },
            );
        }
        out
    }
}
