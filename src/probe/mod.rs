//! Probe framework: sites, patching, registry and trap entry helpers.

use alloc::sync::Arc;

use crate::decode::{Isa, ProbeAddress};
use crate::ops::{FileId, Pid, Tid};
use crate::regs::PtRegs;
use crate::transport::Transport;

pub mod handler;
pub mod manager;
pub mod patcher;
pub mod site;

pub use manager::{ProbeListing, ProbeRegistry};
pub use patcher::Patcher;
pub use site::{ArchInsnCopy, ProbeDescriptor, ProbeSite, ProbeStats};

/// Probe type classification by address space and direction.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    /// Kernel function entry
    Kprobe = 0,
    /// Kernel function return
    Kretprobe = 1,
    /// User image entry
    Uprobe = 2,
    /// User image return
    Uretprobe = 3,
}

impl ProbeType {
    pub fn new(user: bool, ret: bool) -> Self {
        match (user, ret) {
            (false, false) => ProbeType::Kprobe,
            (false, true) => ProbeType::Kretprobe,
            (true, false) => ProbeType::Uprobe,
            (true, true) => ProbeType::Uretprobe,
        }
    }

    /// Whether this probe targets a user image (vs kernel text).
    pub fn is_user_probe(&self) -> bool {
        matches!(self, ProbeType::Uprobe | ProbeType::Uretprobe)
    }

    /// Whether this is a return probe.
    pub fn is_return_probe(&self) -> bool {
        matches!(self, ProbeType::Kretprobe | ProbeType::Uretprobe)
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            ProbeType::Kprobe => "kprobe",
            ProbeType::Kretprobe => "kretprobe",
            ProbeType::Uprobe => "uprobe",
            ProbeType::Uretprobe => "uretprobe",
        }
    }
}

/// How the displaced instruction may be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionHint {
    /// Simulate when the classifier allows it, otherwise step a copy out of line.
    Auto,
    /// Only accept instructions that can be simulated; never step a copy.
    SimulateOnly,
}

/// Where a probe is planted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeTarget {
    /// Kernel text at an absolute address.
    Kernel(ProbeAddress),
    /// An image file; `addr` is relative to the image load base and the
    /// probe is installed lazily in every process that maps the file.
    Image { file: FileId, addr: ProbeAddress },
}

impl ProbeTarget {
    pub fn addr(&self) -> ProbeAddress {
        match self {
            ProbeTarget::Kernel(addr) | ProbeTarget::Image { addr, .. } => *addr,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, ProbeTarget::Image { .. })
    }
}

/// Who hit a trap, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapContext {
    /// `None` for kernel text.
    pub pid: Option<Pid>,
    pub tid: Tid,
}

impl TrapContext {
    pub fn kernel(tid: Tid) -> Self {
        Self { pid: None, tid }
    }

    pub fn user(pid: Pid, tid: Tid) -> Self {
        Self {
            pid: Some(pid),
            tid,
        }
    }
}

/// Passed to probe handlers.
pub struct ProbeContext<'a> {
    pub pid: Option<Pid>,
    pub tid: Tid,
    /// Runtime address of the probed instruction (function entry for return probes).
    pub addr: u64,
    pub isa: Isa,
    pub transport: &'a Transport,
}

/// Callback run when a probe fires.
pub type ProbeHandler = Arc<dyn Fn(&ProbeContext<'_>, &mut PtRegs) + Send + Sync>;

/// Returned by probe registration; pass back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeHandle {
    pub id: u64,
    pub target: ProbeTarget,
}

/// Returned by return-probe registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetprobeHandle {
    pub id: u64,
    pub target: ProbeTarget,
}
