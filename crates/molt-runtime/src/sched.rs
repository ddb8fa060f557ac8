//! Scheduler capability: pausing, enumerating, and patching threads
//!
//! Relocation rewrites saved registers and stack words, which is only
//! sound while every thread is stopped. The engine never talks to a
//! thread subsystem directly: it goes through the [`Scheduler`] trait,
//! so tests drive it with a scripted world and embedders plug in their
//! own stop-the-world mechanism.
//!
//! ## Design
//!
//! - [`HandshakeScheduler`] is the built-in implementation: cooperative
//!   safepoints with a condvar park and a backoff-with-timeout pause
//! - Threads publish a [`ThreadState`] snapshot when they park; the
//!   engine patches the snapshot and [`MutatorHandle::poll`] hands the
//!   patched registers back to the thread on resume
//! - A pause that cannot be obtained reports failure instead of blocking
//!   forever

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Saved general-purpose register slots per thread: the x86-64 GP file
/// minus `rsp` and `rip`. `rsp` is carried separately as the thread's
/// stack pointer and `rip` is never a data pointer.
pub const GP_REGISTER_COUNT: usize = 15;

/// How long [`HandshakeScheduler`] waits for every mutator to park
/// before giving up on a pause.
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_millis(100);

/// A thread's saved general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterSnapshot {
    regs: [u64; GP_REGISTER_COUNT],
}

impl RegisterSnapshot {
    /// Read one slot.
    ///
    /// # Panics
    /// Panics if `slot >= GP_REGISTER_COUNT`.
    pub fn get(&self, slot: usize) -> u64 {
        self.regs[slot]
    }

    /// Write one slot.
    ///
    /// # Panics
    /// Panics if `slot >= GP_REGISTER_COUNT`.
    pub fn set(&mut self, slot: usize, value: u64) {
        self.regs[slot] = value;
    }

    /// Iterate all slots mutably. This is the patch engine's view: every
    /// slot is a candidate pointer.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut u64> + '_ {
        self.regs.iter_mut()
    }
}

/// A thread's stack region `[base, top)`. Stacks grow from `top` down
/// toward `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackExtent {
    /// Lowest address of the region
    pub base: u64,
    /// One past the highest address of the region
    pub top: u64,
}

/// Everything the patch engine may rewrite for one paused thread.
#[derive(Debug, Clone)]
pub struct ThreadState {
    /// Scheduler-assigned thread id, for diagnostics
    pub id: u64,
    /// Saved general-purpose registers
    pub registers: RegisterSnapshot,
    /// The thread's stack region
    pub stack: StackExtent,
    /// Saved stack pointer
    pub sp: u64,
}

impl ThreadState {
    /// Create a state with zeroed registers.
    pub fn new(id: u64, stack: StackExtent, sp: u64) -> Self {
        Self {
            id,
            registers: RegisterSnapshot::default(),
            stack,
            sp,
        }
    }
}

/// Thread-subsystem capability the relocation engine is injected with.
///
/// Contract: a `pause_all` that returns false has paused nothing and
/// needs no matching resume. After a successful pause, every live
/// thread's state is visible through `for_each_thread` and stays frozen
/// until `resume_all`.
pub trait Scheduler {
    /// Bring every thread except the caller to a stop. Returns false if
    /// the world could not be paused.
    fn pause_all(&self) -> bool;

    /// Set the world running again. Idempotent.
    fn resume_all(&self);

    /// Visit every live thread's saved state. Only meaningful while the
    /// world is paused; mutations are handed back to threads on resume.
    fn for_each_thread(&self, f: &mut dyn FnMut(&mut ThreadState));

    /// The calling thread's saved stack pointer and stack region, if the
    /// scheduler knows the thread.
    fn current_stack(&self) -> Option<(u64, StackExtent)>;
}

/// Run state of a registered mutator thread.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Normal execution
    Running = 0,
    /// A pause has been requested; the thread parks at its next poll
    PauseRequested = 1,
    /// Parked at a safepoint with a published snapshot
    Parked = 2,
}

impl From<u8> for RunState {
    fn from(v: u8) -> Self {
        match v {
            1 => RunState::PauseRequested,
            2 => RunState::Parked,
            _ => RunState::Running,
        }
    }
}

/// Per-thread handle issued by [`HandshakeScheduler::register_current`].
///
/// The owning thread calls [`MutatorHandle::poll`] at safepoints; all
/// other methods are driven by the scheduler.
pub struct MutatorHandle {
    id: u64,
    state: AtomicU8,
    condvar: Condvar,
    mutex: Mutex<()>,
    snapshot: Mutex<ThreadState>,
}

impl MutatorHandle {
    fn new(id: u64, stack: StackExtent, sp: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(RunState::Running as u8),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            snapshot: Mutex::new(ThreadState::new(id, stack, sp)),
        }
    }

    /// Scheduler-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        RunState::from(self.state.load(Ordering::Acquire))
    }

    fn request_pause(&self) {
        self.state
            .store(RunState::PauseRequested as u8, Ordering::Release);
    }

    fn is_parked(&self) -> bool {
        self.state.load(Ordering::Acquire) == RunState::Parked as u8
    }

    fn resume(&self) {
        // The mutex orders this against a poll that has passed its state
        // check but not yet entered the wait; without it the notify could
        // fall between the two and be lost.
        let _guard = self.mutex.lock();
        self.state.store(RunState::Running as u8, Ordering::Release);
        self.condvar.notify_one();
    }

    /// Safepoint poll, called periodically by the owning thread with its
    /// live register values and stack pointer.
    ///
    /// Without a pending pause this is a cheap passthrough. With one, the
    /// thread publishes its snapshot, parks until resumed, and adopts the
    /// snapshot's registers on wake, since they may have been patched
    /// while the world was stopped. A request withdrawn by a timed-out
    /// pause is treated as no request.
    pub fn poll(&self, registers: RegisterSnapshot, sp: u64) -> RegisterSnapshot {
        if self.state.load(Ordering::Acquire) != RunState::PauseRequested as u8 {
            return registers;
        }

        {
            let mut snap = self.snapshot.lock();
            snap.registers = registers;
            snap.sp = sp;
        }

        let mut guard = self.mutex.lock();
        // Park only if the request is still standing. A timed-out pause
        // withdraws its requests, and parking over the withdrawal would
        // strand this thread against a pauser that already gave up.
        if self
            .state
            .compare_exchange(
                RunState::PauseRequested as u8,
                RunState::Parked as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return registers;
        }
        while self.state.load(Ordering::Acquire) == RunState::Parked as u8 {
            self.condvar.wait(&mut guard);
        }
        drop(guard);

        self.snapshot.lock().registers
    }
}

/// Cooperative stop-the-world scheduler.
///
/// Threads register themselves and poll their handle at safepoints. A
/// pause requests every other registered thread to park, then waits with
/// backoff until they all have; threads that never reach a safepoint
/// within the timeout fail the pause, and every request is withdrawn so
/// no thread is left parked against a pauser that gave up.
pub struct HandshakeScheduler {
    mutators: Mutex<FxHashMap<ThreadId, Arc<MutatorHandle>>>,
    next_id: AtomicU64,
    paused: AtomicBool,
    pause_timeout: Duration,
}

impl HandshakeScheduler {
    /// Create a scheduler with the default pause timeout.
    pub fn new() -> Self {
        Self::with_pause_timeout(DEFAULT_PAUSE_TIMEOUT)
    }

    /// Create a scheduler with a specific pause timeout.
    pub fn with_pause_timeout(pause_timeout: Duration) -> Self {
        Self {
            mutators: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            pause_timeout,
        }
    }

    /// Register the calling thread as a mutator. Re-registering replaces
    /// the thread's previous handle.
    pub fn register_current(&self, stack: StackExtent, sp: u64) -> Arc<MutatorHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(MutatorHandle::new(id, stack, sp));
        self.mutators
            .lock()
            .insert(thread::current().id(), handle.clone());
        handle
    }

    /// Remove the calling thread from the mutator set.
    pub fn deregister_current(&self) {
        self.mutators.lock().remove(&thread::current().id());
    }

    /// Number of registered mutator threads.
    pub fn mutator_count(&self) -> usize {
        self.mutators.lock().len()
    }
}

impl Default for HandshakeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for HandshakeScheduler {
    fn pause_all(&self) -> bool {
        // A second pauser while the world is stopped is a failed pause,
        // not a nested one.
        if self.paused.swap(true, Ordering::AcqRel) {
            return false;
        }

        let me = thread::current().id();
        let targets: Vec<Arc<MutatorHandle>> = {
            let mutators = self.mutators.lock();
            mutators
                .iter()
                .filter(|(tid, _)| **tid != me)
                .map(|(_, handle)| handle.clone())
                .collect()
        };

        for handle in &targets {
            handle.request_pause();
        }

        let deadline = Instant::now() + self.pause_timeout;
        let backoff = Backoff::new();
        while !targets.iter().all(|handle| handle.is_parked()) {
            if Instant::now() >= deadline {
                // Withdraw the request so no thread stays parked against
                // a pause that never happened.
                for handle in &targets {
                    handle.resume();
                }
                self.paused.store(false, Ordering::Release);
                return false;
            }
            backoff.snooze();
        }
        true
    }

    fn resume_all(&self) {
        let mutators = self.mutators.lock();
        for handle in mutators.values() {
            handle.resume();
        }
        drop(mutators);
        self.paused.store(false, Ordering::Release);
    }

    fn for_each_thread(&self, f: &mut dyn FnMut(&mut ThreadState)) {
        let mutators = self.mutators.lock();
        for handle in mutators.values() {
            let mut snap = handle.snapshot.lock();
            f(&mut snap);
        }
    }

    fn current_stack(&self) -> Option<(u64, StackExtent)> {
        let mutators = self.mutators.lock();
        let handle = mutators.get(&thread::current().id())?;
        let snap = handle.snapshot.lock();
        Some((snap.sp, snap.stack))
    }
}
