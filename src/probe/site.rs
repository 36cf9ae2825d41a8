//! Probe sites and the descriptors shared between them.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::RwLock;

use super::{ActionHint, ProbeContext, ProbeHandler};
use crate::decode::{Decoded, ProbeAddress};
use crate::error::{Error, Result};
use crate::ops::{FileId, Pid};
use crate::platform;
use crate::regs::PtRegs;
use crate::retprobe::ReturnProbe;

/// Fixed-up copy of the displaced instruction living in an out-of-line slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchInsnCopy {
    /// Slot address; the step trap follows the instruction.
    pub slot: u64,
    /// Encoding placed in the slot, PC fields replaced by `scratch`.
    pub insn: u32,
    /// Register standing in for the PC, if the instruction uses it.
    pub scratch: Option<u8>,
    /// The instruction writes the PC through `scratch`.
    pub writes_pc: bool,
    /// A PC write switches instruction set on bit 0.
    pub interworking: bool,
}

/// One patched (or to-be-patched) instruction in one address space.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSite {
    pub addr: ProbeAddress,
    /// `None` for kernel text.
    pub pid: Option<Pid>,
    /// Backing image, for user sites.
    pub file: Option<FileId>,
    pub hint: ActionHint,
    /// Original bytes; the first `decoded.len()` are meaningful.
    pub orig: [u8; 4],
    pub decoded: Option<Decoded>,
    /// Present when the instruction is stepped out of line.
    pub copy: Option<ArchInsnCopy>,
    pub installed: bool,
}

impl ProbeSite {
    pub fn new(addr: ProbeAddress, pid: Option<Pid>, file: Option<FileId>, hint: ActionHint) -> Self {
        Self {
            addr,
            pid,
            file,
            hint,
            orig: [0; 4],
            decoded: None,
            copy: None,
            installed: false,
        }
    }

    /// Length of the displaced instruction, 0 before install.
    pub fn len(&self) -> usize {
        self.decoded.map_or(0, |d| d.len())
    }
}

/// Hit statistics of one descriptor.
#[derive(Debug, Default)]
pub struct ProbeStats {
    hits: AtomicU64,
    handler_ns: AtomicU64,
    last_hit_ns: AtomicU64,
    last_cpu: AtomicU32,
}

impl ProbeStats {
    pub fn record(&self, timestamp: u64, duration_ns: u64, cpu: u32) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.handler_ns.fetch_add(duration_ns, Ordering::Relaxed);
        self.last_hit_ns.store(timestamp, Ordering::Relaxed);
        self.last_cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total time spent in entry handlers.
    pub fn handler_ns(&self) -> u64 {
        self.handler_ns.load(Ordering::Relaxed)
    }

    pub fn last_hit_ns(&self) -> u64 {
        self.last_hit_ns.load(Ordering::Relaxed)
    }

    /// CPU of the most recent hit.
    pub fn last_cpu(&self) -> u32 {
        self.last_cpu.load(Ordering::Relaxed)
    }
}

/// Consumers of one probe address: entry handlers and at most one return probe.
///
/// Shared by every [`ProbeSite`] planted for the address; for image probes
/// that is one site per process mapping the image. The reference count
/// tracks registrations, and the last release tears the sites down.
pub struct ProbeDescriptor {
    /// Kernel address, or image-relative address for image probes.
    pub addr: ProbeAddress,
    /// Fixed by the first registration.
    pub hint: ActionHint,
    handlers: RwLock<Vec<(u64, ProbeHandler)>>,
    ret: RwLock<Option<Arc<ReturnProbe>>>,
    refs: AtomicUsize,
    stats: ProbeStats,
}

impl ProbeDescriptor {
    pub fn new(addr: ProbeAddress, hint: ActionHint) -> Self {
        Self {
            addr,
            hint,
            handlers: RwLock::new(Vec::new()),
            ret: RwLock::new(None),
            refs: AtomicUsize::new(0),
            stats: ProbeStats::default(),
        }
    }

    /// Accept a registration asking for `hint` (`None` accepts any).
    pub fn check_hint(&self, hint: Option<ActionHint>) -> Result<()> {
        match hint {
            Some(h) if h != self.hint => Err(Error::Conflict),
            _ => Ok(()),
        }
    }

    pub fn acquire(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference; true when it was the last.
    pub fn release(&self) -> bool {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(n) => n == 1,
            Err(_) => {
                error!("probe: descriptor at {:#x} released with no references", self.addr.addr);
                false
            }
        }
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn add_handler(&self, id: u64, handler: ProbeHandler) {
        self.handlers.write().push((id, handler));
    }

    pub fn remove_handler(&self, id: u64) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn set_return(&self, probe: Arc<ReturnProbe>) -> Result<()> {
        let mut ret = self.ret.write();
        if ret.is_some() {
            return Err(Error::AlreadyInstalled);
        }
        *ret = Some(probe);
        Ok(())
    }

    /// Detach the return probe registered as `id`.
    pub fn take_return(&self, id: u64) -> Option<Arc<ReturnProbe>> {
        let mut ret = self.ret.write();
        match ret.as_ref() {
            Some(p) if p.id() == id => ret.take(),
            _ => None,
        }
    }

    pub fn return_probe(&self) -> Option<Arc<ReturnProbe>> {
        self.ret.read().clone()
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    /// Run entry handlers in registration order.
    pub fn fire(&self, ctx: &ProbeContext<'_>, regs: &mut PtRegs) {
        let start = platform::time_ns();
        for (_, handler) in self.handlers.read().iter() {
            handler(ctx, regs);
        }
        let end = platform::time_ns();
        self.stats.record(end, end.saturating_sub(start), platform::cpu_id());
    }
}

impl core::fmt::Debug for ProbeDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProbeDescriptor")
            .field("addr", &self.addr)
            .field("hint", &self.hint)
            .field("refs", &self.refs())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
