//! Guard checks injected before memory and stack accesses
//!
//! Instrumented programs call [`AccessGuard::guard_address`] before
//! loads and stores and [`AccessGuard::guard_callee_stack`] on function
//! entry. Both are verdict checks: a refused access is a fatal bug in
//! the instrumented program, so they panic rather than return an error.

use crate::sched::Scheduler;
use std::sync::atomic::{AtomicU64, Ordering};

/// Poison pattern planted in freed or unmapped regions. Any guarded
/// access that presents this address is a use of reclaimed memory.
pub const GUARD_SENTINEL: u64 = 0x22DEADBEEF22;

/// Policy consulted for every guarded address.
pub trait Permissions {
    /// Whether the access is permitted.
    fn allows(&self, addr: u64, is_write: bool) -> bool;
}

/// Permissions that admit every access. Guarding still rejects the
/// poison sentinel.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Permissions for AllowAll {
    fn allows(&self, _addr: u64, _is_write: bool) -> bool {
        true
    }
}

/// Counts of guard checks performed, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStats {
    /// Address guards executed
    pub address_checks: u64,
    /// Stack-frame guards executed
    pub stack_checks: u64,
}

/// Access verdict engine.
///
/// Counters are atomic so threads can guard concurrently without
/// serializing on the allocation context.
pub struct AccessGuard<P = AllowAll> {
    perms: P,
    address_checks: AtomicU64,
    stack_checks: AtomicU64,
}

impl<P: Permissions> AccessGuard<P> {
    /// Create a guard over the given permissions policy.
    pub fn new(perms: P) -> Self {
        Self {
            perms,
            address_checks: AtomicU64::new(0),
            stack_checks: AtomicU64::new(0),
        }
    }

    /// Check one memory access.
    ///
    /// # Panics
    /// Panics if `addr` is the poison sentinel or the permissions policy
    /// refuses the access.
    pub fn guard_address(&self, addr: u64, is_write: bool) {
        self.address_checks.fetch_add(1, Ordering::Relaxed);
        if addr == GUARD_SENTINEL {
            panic!("access guard: {addr:#x} is the poison sentinel");
        }
        if !self.perms.allows(addr, is_write) {
            let kind = if is_write { "write" } else { "read" };
            panic!("access guard: {kind} to {addr:#x} refused");
        }
    }

    /// Check that the calling thread can push a frame of `frame_size`
    /// bytes without running off the bottom of its stack.
    ///
    /// # Panics
    /// Panics if the thread is not registered with the scheduler or the
    /// frame would land below the stack's base.
    pub fn guard_callee_stack(&self, sched: &dyn Scheduler, frame_size: u64) {
        self.stack_checks.fetch_add(1, Ordering::Relaxed);
        let Some((sp, stack)) = sched.current_stack() else {
            panic!("stack guard: calling thread is not registered with the scheduler");
        };
        match sp.checked_sub(frame_size) {
            Some(new_sp) if new_sp >= stack.base => {}
            _ => panic!(
                "stack guard: frame of {frame_size:#x} bytes overruns stack base {:#x} (sp {sp:#x})",
                stack.base
            ),
        }
    }

    /// Snapshot the check counters.
    pub fn statistics(&self) -> GuardStats {
        GuardStats {
            address_checks: self.address_checks.load(Ordering::Relaxed),
            stack_checks: self.stack_checks.load(Ordering::Relaxed),
        }
    }
}

impl Default for AccessGuard<AllowAll> {
    fn default() -> Self {
        Self::new(AllowAll)
    }
}
