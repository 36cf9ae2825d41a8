//! Probe patcher: plants trap opcodes and restores the displaced bytes.

use crate::decode::{self, ExecMode, Isa, insn_bytes, read_insn};
use crate::emulate::{self, Route, xol};
use crate::error::{Error, Result};
use crate::insn_slot::{SLOT_SIZE, SlotAllocator};
use crate::ops::AuxiliaryOps;

use super::{ActionHint, ProbeSite};

/// A32 probe trap (permanently undefined space).
pub const ARM_TRAP: u32 = 0xE7F0_01F8;
/// A32 single-step trap.
pub const ARM_STEP_TRAP: u32 = 0xE7F0_01F9;
/// Thumb 16-bit probe trap.
pub const THUMB16_TRAP: u16 = 0xDE18;
/// Thumb 16-bit single-step trap.
pub const THUMB16_STEP_TRAP: u16 = 0xDE19;
/// Thumb 32-bit probe trap, `hw1 << 16 | hw2`.
pub const THUMB32_TRAP: u32 = 0xF7F0_A018;
/// A64 probe trap, BRK #4.
pub const A64_TRAP: u32 = 0xD420_0080;
/// A64 single-step trap, BRK #6.
pub const A64_STEP_TRAP: u32 = 0xD420_00C0;

/// Trap encoding replacing an instruction of `mode`; same width as the original.
pub fn trap_insn(mode: ExecMode) -> u32 {
    match mode {
        ExecMode::Arm => ARM_TRAP,
        ExecMode::Thumb16 => THUMB16_TRAP as u32,
        ExecMode::Thumb32 => THUMB32_TRAP,
        ExecMode::A64 => A64_TRAP,
    }
}

/// Single-step trap following an out-of-line copy.
pub fn step_trap(isa: Isa) -> ([u8; 4], usize) {
    match isa {
        Isa::Arm => insn_bytes(ARM_STEP_TRAP, ExecMode::Arm),
        Isa::Thumb => insn_bytes(THUMB16_STEP_TRAP as u32, ExecMode::Thumb16),
        Isa::A64 => insn_bytes(A64_STEP_TRAP, ExecMode::A64),
    }
}

/// Whether `bytes` already hold one of the probe traps.
fn is_trap(bytes: &[u8], isa: Isa) -> bool {
    match read_insn(bytes, isa) {
        Some((word, mode)) => word == trap_insn(mode),
        None => false,
    }
}

/// Install and remove probe sites in one engine.
pub struct Patcher<'a> {
    ops: &'a dyn AuxiliaryOps,
    slots: &'a SlotAllocator,
}

impl<'a> Patcher<'a> {
    pub fn new(ops: &'a dyn AuxiliaryOps, slots: &'a SlotAllocator) -> Self {
        Self { ops, slots }
    }

    fn read_original(&self, site: &ProbeSite) -> Result<[u8; 4]> {
        let mut orig = [0u8; 4];
        let pid = site.pid;
        let addr = site.addr.addr;
        self.ops.read_text(pid, addr, &mut orig[..2])?;
        let len = match site.addr.isa {
            Isa::Thumb => ExecMode::detect(Isa::Thumb, u16::from_le_bytes([orig[0], orig[1]])).len(),
            _ => 4,
        };
        if len == 4 {
            self.ops.read_text(pid, addr + 2, &mut orig[2..])?;
        }
        Ok(orig)
    }

    /// Decode the original instruction, prepare its out-of-line copy if
    /// needed and write the trap. Leaves no partial state on failure.
    pub fn install(&self, site: &mut ProbeSite) -> Result<()> {
        if site.installed {
            return Err(Error::AlreadyInstalled);
        }
        site.addr.check_alignment()?;

        let orig = self.read_original(site)?;
        if is_trap(&orig, site.addr.isa) {
            return Err(Error::AlreadyInstalled);
        }
        let decoded = decode::classify_bytes(&orig, site.addr.isa).ok_or(Error::MemoryFault)?;
        if decoded.is_rejected() {
            debug!(
                "probe: rejecting {:#010x} at {:#x} ({:?})",
                decoded.raw, site.addr.addr, decoded.mode
            );
            return Err(Error::DecodeUnsupported);
        }

        let route = emulate::route(&decoded.action);
        if route == Route::OutOfLine && site.hint == ActionHint::SimulateOnly {
            return Err(Error::DecodeUnsupported);
        }

        let copy = match route {
            Route::Simulate => None,
            Route::OutOfLine => Some(self.place_copy(site, &decoded)?),
        };

        let (trap, len) = insn_bytes(trap_insn(decoded.mode), decoded.mode);
        if let Err(e) = self.ops.write_text(site.pid, site.addr.addr, &trap[..len]) {
            if let Some(copy) = copy {
                self.slots.free(site.pid, copy.slot);
            }
            warn!("probe: failed to patch {:#x}: {:?}", site.addr.addr, e);
            return Err(Error::MemoryFault);
        }
        let end = site.addr.addr + len as u64;
        self.ops.flush_icache(site.pid, site.addr.addr, end);

        site.orig = orig;
        site.decoded = Some(decoded);
        site.copy = copy;
        site.installed = true;
        info!(
            "probe: installed at {:#x} ({:?}, {:?}, {})",
            site.addr.addr,
            site.pid,
            decoded.category(),
            if copy.is_some() { "out-of-line" } else { "simulated" }
        );
        Ok(())
    }

    fn place_copy(
        &self,
        site: &ProbeSite,
        decoded: &decode::Decoded,
    ) -> Result<super::ArchInsnCopy> {
        let slot = self.slots.alloc(self.ops, site.pid)?;
        let copy = xol::build(decoded, slot);
        let (image, used) = xol::slot_image(&copy, decoded.mode);
        debug_assert!(used <= SLOT_SIZE);
        if let Err(e) = self.ops.write_text(site.pid, slot, &image[..used]) {
            self.slots.free(site.pid, slot);
            return Err(e.into());
        }
        self.ops.flush_icache(site.pid, slot, slot + used as u64);
        Ok(copy)
    }

    /// Write the original bytes back over the trap. On failure the site
    /// stays installed and its slot stays allocated.
    pub fn restore(&self, site: &ProbeSite) -> Result<()> {
        if !site.installed {
            return Err(Error::NotInstalled);
        }
        let len = site.len();
        if let Err(e) = self.ops.write_text(site.pid, site.addr.addr, &site.orig[..len]) {
            warn!(
                "probe: cannot restore {:#x} ({:?}): {:?}",
                site.addr.addr, site.pid, e
            );
            return Err(Error::MemoryFault);
        }
        self.ops
            .flush_icache(site.pid, site.addr.addr, site.addr.addr + len as u64);
        info!("probe: restored {:#x} ({:?})", site.addr.addr, site.pid);
        Ok(())
    }

    /// Restore the original bytes and free the slot.
    ///
    /// A page that is gone (torn-down address space) is logged and skipped.
    pub fn uninstall(&self, site: &mut ProbeSite) -> Result<()> {
        if !site.installed {
            return Err(Error::NotInstalled);
        }
        if self.restore(site).is_err() {
            debug!("probe: {:#x} page already gone", site.addr.addr);
        }
        self.discard(site);
        Ok(())
    }

    /// Forget an installed site without touching its text, for unmapped pages.
    pub fn discard(&self, site: &mut ProbeSite) {
        if let Some(copy) = site.copy.take() {
            self.slots.free(site.pid, copy.slot);
        }
        site.installed = false;
    }
}
