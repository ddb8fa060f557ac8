//! # molt-runtime
//!
//! Allocation tracking and stop-the-world relocation for
//! compiler-instrumented programs.
//!
//! An instrumented program reports its allocation lifecycle and pointer
//! stores through hooks on a [`Context`]. The runtime keeps an ordered
//! table of live allocations and a batched window of escaped pointer
//! locations, and can relocate any tracked allocation while the program
//! runs: [`reloc::move_allocation`] stops the world, rewrites every
//! reference the table knows about (escape locations, saved registers,
//! live stack words), carries the bytes, and reindexes the table.
//!
//! ## Components
//!
//! - [`table`]: ordered allocation table with interior-pointer lookup
//! - [`window`]: batched buffering of reported pointer stores
//! - [`context`]: the hook surface, pinning, and statistics
//! - [`reloc`]: the stop-the-world relocation engine
//! - [`guard`]: address and stack-frame access verdicts
//! - [`sched`]: thread pause, patch, and resume capability
//! - [`mem`]: bounds-checked backing memory

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod mem;
pub mod reloc;
pub mod sched;
pub mod table;
pub mod window;

pub use config::{DEFAULT_ESCAPE_WINDOW_CAPACITY, DEFAULT_STACK_RESERVE, RuntimeConfig};
pub use context::{AllocationInfo, Context, ContextStats};
pub use error::{RelocResult, RelocationError};
pub use guard::{AccessGuard, AllowAll, GUARD_SENTINEL, GuardStats, Permissions};
pub use mem::{MemoryImage, WORD_BYTES};
#[cfg(debug_assertions)]
pub use reloc::random_move_stress;
pub use reloc::{WorldPause, move_allocation, move_allocations, move_region};
pub use sched::{
    DEFAULT_PAUSE_TIMEOUT, GP_REGISTER_COUNT, HandshakeScheduler, MutatorHandle, RegisterSnapshot,
    RunState, Scheduler, StackExtent, ThreadState,
};
pub use table::{AllocationEntry, AllocationTable};
pub use window::EscapeWindow;
