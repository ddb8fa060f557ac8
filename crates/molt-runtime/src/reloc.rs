//! Stop-the-world relocation of tracked allocations
//!
//! Moving an allocation rewrites every reference the runtime knows
//! about: recorded escape locations, saved registers, and live stack
//! words. Then the bytes are carried over and the table reindexed. The
//! protocol is validate-then-commit: every check that can fail runs
//! before the first write, so a refused move leaves memory, threads,
//! and the table exactly as they were.
//!
//! Inside the stopped world the order is fixed: drain the escape
//! window, patch escape locations, patch each paused thread, copy the
//! bytes, reindex. Escape locations inside the moving block are patched
//! at their old position and carried by the copy, and the escape set is
//! re-homed to their destination position.

use crate::context::{Context, ContextInner};
use crate::error::{RelocResult, RelocationError};
use crate::mem::{MemoryImage, WORD_BYTES};
use crate::sched::{Scheduler, ThreadState};
use crate::table::AllocationEntry;
use rustc_hash::FxHashSet;

/// RAII stop-the-world window. Acquiring pauses every other thread;
/// dropping resumes them, on success and error paths alike.
pub struct WorldPause<'a> {
    sched: &'a dyn Scheduler,
}

impl<'a> WorldPause<'a> {
    /// Pause the world, or report [`RelocationError::PauseFailed`]
    /// without having paused anything.
    pub fn acquire(sched: &'a dyn Scheduler) -> RelocResult<Self> {
        if !sched.pause_all() {
            return Err(RelocationError::PauseFailed);
        }
        Ok(Self { sched })
    }
}

impl Drop for WorldPause<'_> {
    fn drop(&mut self) {
        self.sched.resume_all();
    }
}

/// Relocate the allocation covering `old_addr` to `new_addr`.
///
/// The whole operation happens under one pause. On error nothing has
/// moved and the world is running again.
pub fn move_allocation(
    ctx: &Context,
    mem: &mut MemoryImage,
    sched: &dyn Scheduler,
    old_addr: u64,
    new_addr: u64,
) -> RelocResult<()> {
    let _pause = WorldPause::acquire(sched)?;
    let mut inner = ctx.lock_inner();

    // Hooks stay suppressed for the whole stopped-world window, and the
    // escape set must be current before staging
    let was_ready = std::mem::replace(&mut inner.ready, false);
    let (resolved, dropped) = inner.process_window(mem);
    ctx.note_window(resolved, dropped);

    let result = move_one(&mut inner, mem, sched, old_addr, new_addr);
    inner.ready = was_ready;
    drop(inner);

    if result.is_ok() {
        ctx.note_moves(1);
    }
    result.map(|_| ())
}

/// Relocate a batch of allocations under a single pause.
///
/// Moves commit one at a time in the given order. The first failure
/// stops the batch: earlier moves stay committed, later ones are never
/// attempted.
pub fn move_allocations(
    ctx: &Context,
    mem: &mut MemoryImage,
    sched: &dyn Scheduler,
    moves: &[(u64, u64)],
) -> RelocResult<()> {
    if moves.is_empty() {
        return Ok(());
    }
    let _pause = WorldPause::acquire(sched)?;
    let mut inner = ctx.lock_inner();
    let was_ready = std::mem::replace(&mut inner.ready, false);
    let (resolved, dropped) = inner.process_window(mem);
    ctx.note_window(resolved, dropped);

    let mut completed = 0u64;
    let mut failure = None;
    for &(old_addr, new_addr) in moves {
        match move_one(&mut inner, mem, sched, old_addr, new_addr) {
            Ok(_) => completed += 1,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    inner.ready = was_ready;
    drop(inner);

    ctx.note_moves(completed);
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Pack every allocation whose base lies inside `[src_base, src_base +
/// src_len)` into consecutive placement starting at `dst_base`, in
/// ascending address order. Returns the first free address past the
/// packed block.
///
/// Packing in place (`dst_base` inside the source window) compacts the
/// region toward its start. As with [`move_allocations`], a failure
/// leaves earlier moves committed.
pub fn move_region(
    ctx: &Context,
    mem: &mut MemoryImage,
    sched: &dyn Scheduler,
    src_base: u64,
    src_len: u64,
    dst_base: u64,
) -> RelocResult<u64> {
    let _pause = WorldPause::acquire(sched)?;
    let mut inner = ctx.lock_inner();
    let was_ready = std::mem::replace(&mut inner.ready, false);
    let (resolved, dropped) = inner.process_window(mem);
    ctx.note_window(resolved, dropped);

    let src_end = src_base.saturating_add(src_len);
    let candidates: Vec<u64> = inner
        .table
        .iter()
        .filter(|entry| entry.base >= src_base && entry.base < src_end)
        .map(|entry| entry.base)
        .collect();

    let mut cursor = dst_base;
    let mut completed = 0u64;
    let mut failure = None;
    for base in candidates {
        match move_one(&mut inner, mem, sched, base, cursor) {
            Ok(size) => {
                cursor += size;
                completed += 1;
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    inner.ready = was_ready;
    drop(inner);

    ctx.note_moves(completed);
    #[cfg(feature = "reloc_logging")]
    tracing::debug!(
        target: "molt::reloc",
        src = src_base,
        dst = dst_base,
        packed = completed,
        cursor,
        "region packed"
    );
    match failure {
        Some(e) => Err(e),
        None => Ok(cursor),
    }
}

/// Exercise the relocation path with random moves, debug builds only.
///
/// Each round picks a random live allocation and asks `alloc_dest` for
/// a destination of its size. `alloc_dest` must hand out raw, untracked
/// space; returning `None` skips the round, which is how oversized
/// entries such as the boot stack sit the stress out.
#[cfg(debug_assertions)]
pub fn random_move_stress(
    ctx: &Context,
    mem: &mut MemoryImage,
    sched: &dyn Scheduler,
    rounds: usize,
    mut alloc_dest: impl FnMut(u64) -> Option<u64>,
) -> RelocResult<()> {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    for _ in 0..rounds {
        let live = ctx.live_allocations();
        if live.is_empty() {
            break;
        }
        let (base, size) = live[rng.gen_range(0..live.len())];
        let Some(dest) = alloc_dest(size) else {
            continue;
        };
        move_allocation(ctx, mem, sched, base, dest)?;
    }
    Ok(())
}

/// Move one allocation. Caller holds the context lock inside a pause.
/// Returns the size moved.
fn move_one(
    inner: &mut ContextInner,
    mem: &mut MemoryImage,
    sched: &dyn Scheduler,
    old_addr: u64,
    new_addr: u64,
) -> RelocResult<u64> {
    // Validation: nothing below this block may write
    let Some(entry) = inner.table.find_entry(old_addr) else {
        return Err(RelocationError::EntryNotFound(old_addr));
    };
    if entry.pinned {
        return Err(RelocationError::PinnedAllocation(entry.base));
    }
    let old_base = entry.base;
    let size = entry.size;
    if !mem.contains_range(old_base, size) {
        return Err(RelocationError::BackingUnavailable {
            addr: old_base,
            size,
        });
    }
    if !mem.contains_range(new_addr, size) {
        return Err(RelocationError::BackingUnavailable {
            addr: new_addr,
            size,
        });
    }

    // Pull the entry out so the overlap check sees everything else
    let entry = inner.table.remove(old_base);
    if inner.table.overlaps_range(new_addr, size) {
        inner.table.insert(entry);
        return Err(RelocationError::DestinationOverlaps {
            addr: new_addr,
            size,
        });
    }

    // Stage escape patches. Locations inside the moving block are
    // patched at their old position and carried over by the copy, so
    // the escape set records their destination position instead.
    let mut new_escapes = FxHashSet::default();
    new_escapes.reserve(entry.escape_set.len());
    let mut patches: Vec<(u64, u64)> = Vec::with_capacity(entry.escape_set.len());
    for &loc in &entry.escape_set {
        let tracked_loc = match entry.offset_of(loc) {
            Some(off) => new_addr + off,
            None => loc,
        };
        new_escapes.insert(tracked_loc);

        let Some(value) = mem.load_word(loc) else {
            continue; // Location no longer readable, leave it alone
        };
        let Some(off) = entry.offset_of(value) else {
            continue; // Stale: the slot was overwritten since it escaped
        };
        patches.push((loc, new_addr + off));
    }

    // Commit. Every store below targets a range validated above, so
    // from here the move cannot fail.
    for &(loc, value) in &patches {
        let _ = mem.store_word(loc, value);
    }

    sched.for_each_thread(&mut |thread| {
        for slot in thread.registers.iter_mut() {
            if let Some(off) = entry.offset_of(*slot) {
                *slot = new_addr + off;
            }
        }
        sweep_stack(mem, thread, &entry, new_addr);
    });

    let copied = mem.copy_region(old_base, new_addr, size);
    debug_assert!(copied, "relocation copy failed after validation");

    let mut moved = AllocationEntry::new(new_addr, size);
    moved.escape_set = new_escapes;
    inner.table.insert(moved);

    #[cfg(feature = "reloc_logging")]
    tracing::debug!(
        target: "molt::reloc",
        old = old_base,
        new = new_addr,
        size,
        patched = patches.len(),
        "allocation relocated"
    );
    Ok(size)
}

/// Conservative word sweep of one thread's whole stack extent. Any word
/// that reads as a pointer into the moving block is patched; words
/// without readable backing are skipped. Dead words below the stack
/// pointer are swept too, which is harmless and avoids trusting a
/// possibly stale `sp`.
fn sweep_stack(mem: &mut MemoryImage, thread: &ThreadState, entry: &AllocationEntry, new_addr: u64) {
    let mut addr = thread.stack.base;
    while addr.saturating_add(WORD_BYTES) <= thread.stack.top {
        if let Some(word) = mem.load_word(addr) {
            if let Some(off) = entry.offset_of(word) {
                let _ = mem.store_word(addr, new_addr + off);
            }
        }
        addr += WORD_BYTES;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::sched::{RegisterSnapshot, StackExtent};
    use std::cell::{Cell, RefCell};

    const IMAGE_BASE: u64 = 0x10000;
    const IMAGE_LEN: u64 = 0x10000;
    const STACK_SP: u64 = 0x1F000;

    /// Scripted world: counts pauses and resumes and exposes a fixed
    /// set of thread states for patching.
    struct StubWorld {
        threads: RefCell<Vec<ThreadState>>,
        pauses: Cell<u32>,
        resumes: Cell<u32>,
        fail_pause: Cell<bool>,
    }

    impl StubWorld {
        fn new() -> Self {
            Self {
                threads: RefCell::new(Vec::new()),
                pauses: Cell::new(0),
                resumes: Cell::new(0),
                fail_pause: Cell::new(false),
            }
        }

        fn with_thread(thread: ThreadState) -> Self {
            let world = Self::new();
            world.threads.borrow_mut().push(thread);
            world
        }
    }

    impl Scheduler for StubWorld {
        fn pause_all(&self) -> bool {
            if self.fail_pause.get() {
                return false;
            }
            self.pauses.set(self.pauses.get() + 1);
            true
        }

        fn resume_all(&self) {
            self.resumes.set(self.resumes.get() + 1);
        }

        fn for_each_thread(&self, f: &mut dyn FnMut(&mut ThreadState)) {
            for thread in self.threads.borrow_mut().iter_mut() {
                f(thread);
            }
        }

        fn current_stack(&self) -> Option<(u64, StackExtent)> {
            self.threads.borrow().first().map(|t| (t.sp, t.stack))
        }
    }

    fn fixture() -> (Context, MemoryImage, StubWorld) {
        let cfg = RuntimeConfig {
            escape_window_capacity: 8,
            stack_reserve_bytes: 0x800,
        };
        (
            Context::new(cfg, STACK_SP),
            MemoryImage::new(IMAGE_BASE, IMAGE_LEN),
            StubWorld::new(),
        )
    }

    #[test]
    fn test_move_rewrites_escape_table_and_bytes() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x10100, 0x40);
        assert!(mem.store_word(0x10100, 0xFEED));
        assert!(mem.store_word(0x10400, 0x10110)); // Escaped interior pointer
        ctx.on_escape(0x10400, &mem);
        ctx.process_escape_window(&mem);

        move_allocation(&ctx, &mut mem, &world, 0x10100, 0x10A00).unwrap();

        // Table reindexed
        assert!(ctx.lookup(0x10100).is_none());
        let info = ctx.lookup(0x10A00).unwrap();
        assert_eq!(info.size, 0x40);
        assert_eq!(info.escape_count, 1);

        // Escape location patched, bytes carried, counters advanced
        assert_eq!(mem.load_word(0x10400), Some(0x10A10));
        assert!(ctx.has_escape(0x10A00, 0x10400));
        assert_eq!(mem.load_word(0x10A00), Some(0xFEED));
        assert_eq!(ctx.statistics().moves_completed, 1);

        // One pause, one resume
        assert_eq!(world.pauses.get(), 1);
        assert_eq!(world.resumes.get(), 1);
    }

    #[test]
    fn test_move_unknown_fails_and_resumes() {
        let (ctx, mut mem, world) = fixture();
        let err = move_allocation(&ctx, &mut mem, &world, 0x10100, 0x10A00).unwrap_err();
        assert_eq!(err, RelocationError::EntryNotFound(0x10100));
        // The pause was still released
        assert_eq!(world.resumes.get(), 1);
        assert_eq!(ctx.statistics().moves_completed, 0);
    }

    #[test]
    fn test_pause_failure_pauses_nothing() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x10100, 0x40);
        world.fail_pause.set(true);

        let err = move_allocation(&ctx, &mut mem, &world, 0x10100, 0x10A00).unwrap_err();
        assert_eq!(err, RelocationError::PauseFailed);
        // A failed pause needs no matching resume
        assert_eq!(world.resumes.get(), 0);
        assert!(ctx.lookup(0x10100).is_some());
    }

    #[test]
    fn test_pinned_allocation_refused() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x10100, 0x40);
        ctx.pin_pointer(0x10100);

        let err = move_allocation(&ctx, &mut mem, &world, 0x10110, 0x10A00).unwrap_err();
        assert_eq!(err, RelocationError::PinnedAllocation(0x10100));
        assert!(ctx.lookup(0x10100).is_some());
    }

    #[test]
    fn test_destination_overlap_refused() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x10100, 0x40);
        ctx.on_alloc(0x10A20, 0x40);

        let err = move_allocation(&ctx, &mut mem, &world, 0x10100, 0x10A00).unwrap_err();
        assert_eq!(
            err,
            RelocationError::DestinationOverlaps {
                addr: 0x10A00,
                size: 0x40
            }
        );
        // The refused entry is back where it was
        assert_eq!(ctx.lookup(0x10110).unwrap().base, 0x10100);
        // Moving on top of itself is not an overlap
        move_allocation(&ctx, &mut mem, &world, 0x10100, 0x10100).unwrap();
    }

    #[test]
    fn test_unbacked_destination_refused() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x10100, 0x40);

        let err = move_allocation(&ctx, &mut mem, &world, 0x10100, IMAGE_BASE + IMAGE_LEN)
            .unwrap_err();
        assert_eq!(
            err,
            RelocationError::BackingUnavailable {
                addr: IMAGE_BASE + IMAGE_LEN,
                size: 0x40
            }
        );
    }

    #[test]
    fn test_stale_escape_left_untouched() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x10100, 0x40);
        assert!(mem.store_word(0x10400, 0x10100));
        ctx.on_escape(0x10400, &mem);
        ctx.process_escape_window(&mem);

        // The slot moved on to an untracked value after escaping
        assert!(mem.store_word(0x10400, 0x9999));

        move_allocation(&ctx, &mut mem, &world, 0x10100, 0x10A00).unwrap();

        assert_eq!(mem.load_word(0x10400), Some(0x9999));
        // The set still carries the stale location for future moves
        assert!(ctx.has_escape(0x10A00, 0x10400));
    }

    #[test]
    fn test_registers_patched_in_paused_threads() {
        let (ctx, mut mem, _) = fixture();
        let mut regs = RegisterSnapshot::default();
        regs.set(2, 0x10120); // Interior pointer
        regs.set(5, 0x4444); // Untracked value
        let mut thread = ThreadState::new(
            0,
            StackExtent {
                base: 0x5000,
                top: 0x6000,
            },
            0x5800,
        );
        thread.registers = regs;
        let world = StubWorld::with_thread(thread);

        ctx.on_alloc(0x10100, 0x40);
        move_allocation(&ctx, &mut mem, &world, 0x10100, 0x10A00).unwrap();

        let threads = world.threads.borrow();
        assert_eq!(threads[0].registers.get(2), 0x10A20);
        assert_eq!(threads[0].registers.get(5), 0x4444);
    }

    #[test]
    fn test_stack_words_swept_across_whole_extent() {
        let (ctx, mut mem, _) = fixture();
        let world = StubWorld::with_thread(ThreadState::new(
            0,
            StackExtent {
                base: 0x1E000,
                top: 0x1F000,
            },
            0x1E800,
        ));

        ctx.on_alloc(0x10100, 0x40);
        // A live frame word, a dead word below sp, and a word just
        // outside the extent
        assert!(mem.store_word(0x1E808, 0x10130));
        assert!(mem.store_word(0x1E7F8, 0x10130));
        assert!(mem.store_word(0x1DFF8, 0x10130));

        move_allocation(&ctx, &mut mem, &world, 0x10100, 0x10A00).unwrap();

        assert_eq!(mem.load_word(0x1E808), Some(0x10A30));
        assert_eq!(mem.load_word(0x1E7F8), Some(0x10A30));
        assert_eq!(mem.load_word(0x1DFF8), Some(0x10130));
    }

    #[test]
    fn test_contained_escape_rehomed() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x10100, 0x40);
        // The block points at itself: the slot at +0x8 holds the base
        assert!(mem.store_word(0x10108, 0x10100));
        ctx.on_escape(0x10108, &mem);
        ctx.process_escape_window(&mem);

        move_allocation(&ctx, &mut mem, &world, 0x10100, 0x10A00).unwrap();

        // The carried slot points at the new base
        assert_eq!(mem.load_word(0x10A08), Some(0x10A00));
        // And the escape set followed the slot to its new position
        assert!(ctx.has_escape(0x10A00, 0x10A08));
        assert!(!ctx.has_escape(0x10A00, 0x10108));
    }

    #[test]
    fn test_batch_moves_share_one_pause() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x10100, 0x40);
        ctx.on_alloc(0x10200, 0x40);

        move_allocations(
            &ctx,
            &mut mem,
            &world,
            &[(0x10100, 0x10A00), (0x10200, 0x10B00)],
        )
        .unwrap();

        assert_eq!(world.pauses.get(), 1);
        assert_eq!(world.resumes.get(), 1);
        assert!(ctx.lookup(0x10A00).is_some());
        assert!(ctx.lookup(0x10B00).is_some());
        assert_eq!(ctx.statistics().moves_completed, 2);
    }

    #[test]
    fn test_batch_failure_keeps_committed_prefix() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x10100, 0x40);

        let err = move_allocations(
            &ctx,
            &mut mem,
            &world,
            &[(0x10100, 0x10A00), (0x10200, 0x10B00)],
        )
        .unwrap_err();

        assert_eq!(err, RelocationError::EntryNotFound(0x10200));
        // The first move committed before the batch stopped
        assert!(ctx.lookup(0x10A00).is_some());
        assert_eq!(ctx.statistics().moves_completed, 1);
        assert_eq!(world.resumes.get(), 1);
    }

    #[test]
    fn test_move_region_packs_ascending() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x11000, 0x20);
        ctx.on_alloc(0x11100, 0x30);
        ctx.on_alloc(0x11800, 0x10);
        ctx.on_alloc(0x13000, 0x40); // Outside the source window
        assert!(mem.store_word(0x11100, 0xBEEF));

        let cursor = move_region(&ctx, &mut mem, &world, 0x11000, 0x1000, 0x14000).unwrap();
        assert_eq!(cursor, 0x14060);

        assert_eq!(ctx.lookup(0x14000).unwrap().size, 0x20);
        assert_eq!(ctx.lookup(0x14020).unwrap().size, 0x30);
        assert_eq!(ctx.lookup(0x14050).unwrap().size, 0x10);
        assert_eq!(mem.load_word(0x14020), Some(0xBEEF));

        // Entries outside the window stay put
        assert_eq!(ctx.lookup(0x13000).unwrap().base, 0x13000);
        assert!(ctx.lookup(0x11000).is_none());
        assert_eq!(world.pauses.get(), 1);
    }

    #[test]
    fn test_move_region_compacts_in_place() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x11000, 0x20);
        ctx.on_alloc(0x11100, 0x30);

        let cursor = move_region(&ctx, &mut mem, &world, 0x11000, 0x1000, 0x11000).unwrap();
        assert_eq!(cursor, 0x11050);
        assert_eq!(ctx.lookup(0x11000).unwrap().size, 0x20);
        assert_eq!(ctx.lookup(0x11020).unwrap().size, 0x30);
    }

    #[test]
    fn test_move_region_stops_at_pinned_entry() {
        let (ctx, mut mem, world) = fixture();
        ctx.on_alloc(0x11000, 0x20);
        ctx.on_alloc(0x11100, 0x30);
        ctx.pin_pointer(0x11100);

        let err = move_region(&ctx, &mut mem, &world, 0x11000, 0x1000, 0x14000).unwrap_err();
        assert_eq!(err, RelocationError::PinnedAllocation(0x11100));
        // The unpinned entry ahead of it already moved
        assert!(ctx.lookup(0x14000).is_some());
        assert_eq!(ctx.lookup(0x11110).unwrap().base, 0x11100);
    }
}
