//! Host glue the engine needs from the surrounding kernel.
//!
//! Every call takes `pid`: `None` addresses kernel text, `Some(pid)` the
//! user address space of that process. Implementations decide how to
//! reach the memory (page-table walks, temporary writable aliases, ...).

use axerrno::AxResult;

/// Process identifier used by the host.
pub type Pid = u32;
/// Thread identifier used by the host.
pub type Tid = u32;

/// Identity of a backing storage object (e.g. an inode number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

/// Memory and mapping operations provided by the host.
pub trait AuxiliaryOps: Send + Sync {
    /// Read instruction bytes at `addr`.
    fn read_text(&self, pid: Option<Pid>, addr: u64, buf: &mut [u8]) -> AxResult<()>;

    /// Replace instruction bytes at `addr` as one store. Fails if the page is
    /// not resident or cannot be made writable.
    fn write_text(&self, pid: Option<Pid>, addr: u64, data: &[u8]) -> AxResult<()>;

    /// Invalidate instruction cache lines covering `[start, end)`.
    fn flush_icache(&self, pid: Option<Pid>, start: u64, end: u64);

    /// Read data memory (literal pools, stacks, jump tables).
    fn read_data(&self, pid: Option<Pid>, addr: u64, buf: &mut [u8]) -> AxResult<()>;

    /// Write data memory.
    fn write_data(&self, pid: Option<Pid>, addr: u64, data: &[u8]) -> AxResult<()>;

    /// Map an executable area of `len` bytes for out-of-line instructions.
    /// Returns its base address, or `None` if it cannot be mapped.
    fn alloc_exec_memory(&self, pid: Option<Pid>, len: usize) -> Option<u64>;

    /// Release an area returned by [`AuxiliaryOps::alloc_exec_memory`].
    fn free_exec_memory(&self, pid: Option<Pid>, base: u64, len: usize);

    /// Load base of `file` in `pid`, if it is currently mapped there.
    fn image_base(&self, pid: Pid, file: FileId) -> Option<u64>;
}
