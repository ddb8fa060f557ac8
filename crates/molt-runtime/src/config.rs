//! Runtime configuration

/// Default escape window capacity, in pending addresses (1Mi entries).
pub const DEFAULT_ESCAPE_WINDOW_CAPACITY: usize = 1 << 20;

/// Default span of the synthetic stack entry seeded at context creation
/// (32 GiB below the creating thread's stack pointer).
pub const DEFAULT_STACK_RESERVE: u64 = 32 * 1024 * 1024 * 1024;

/// Tunables for a tracking context.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Pending escapes buffered before a forced batch resolution
    /// (default: 1Mi entries)
    pub escape_window_capacity: usize,
    /// Bytes reserved below the stack pointer by the synthetic stack
    /// entry (default: 32 GiB)
    pub stack_reserve_bytes: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            escape_window_capacity: DEFAULT_ESCAPE_WINDOW_CAPACITY,
            stack_reserve_bytes: DEFAULT_STACK_RESERVE,
        }
    }
}
