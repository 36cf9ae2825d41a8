//! Platform abstraction layer for host operations.
//!
//! The engine needs a monotonic clock and the current CPU id for event
//! records. The host registers both at boot; until then a counting clock
//! and CPU 0 are used so the engine stays usable in user-space tests.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

/// Platform operations trait.
pub trait PlatformOps {
    /// Get current monotonic time in nanoseconds.
    fn time_ns() -> u64;

    /// Get current CPU ID.
    fn cpu_id() -> u32;
}

type ClockFn = fn() -> u64;
type CpuIdFn = fn() -> u32;

static CLOCK_HOOK: Once<ClockFn> = Once::new();
static CPU_ID_HOOK: Once<CpuIdFn> = Once::new();

/// Fallback clock: strictly increasing, one tick per read.
static FALLBACK_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000);

/// Register the host's monotonic clock. Only the first registration counts.
pub fn register_clock_hook(hook: ClockFn) {
    CLOCK_HOOK.call_once(|| hook);
}

/// Register the host's CPU id source. Only the first registration counts.
pub fn register_cpu_id_hook(hook: CpuIdFn) {
    CPU_ID_HOOK.call_once(|| hook);
}

/// Platform backed by the registered hooks.
pub struct HookPlatform;

impl PlatformOps for HookPlatform {
    fn time_ns() -> u64 {
        match CLOCK_HOOK.get() {
            Some(hook) => hook(),
            None => FALLBACK_TIME_NS.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn cpu_id() -> u32 {
        CPU_ID_HOOK.get().map_or(0, |hook| hook())
    }
}

/// The active platform implementation.
pub type Platform = HookPlatform;

/// Get current time in nanoseconds.
#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}

/// Get current CPU ID.
#[inline]
pub fn cpu_id() -> u32 {
    Platform::cpu_id()
}
