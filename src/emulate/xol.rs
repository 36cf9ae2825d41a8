//! Out-of-line copies: PC substitution, slot layout and step completion.
//!
//! Every PC field of the copy is replaced by one scratch register that is
//! loaded with the PC value the original would have read. A PC destination
//! therefore lands in the scratch register and is moved to the PC once the
//! step trap fires.

use super::{PendingStep, SINGLE_AL_ITSTATE};
use crate::decode::{Action, Decoded, ExecMode, Isa, RegFields, insn_bytes};
use crate::insn_slot::SLOT_SIZE;
use crate::probe::patcher::step_trap;
use crate::probe::{ArchInsnCopy, ProbeSite};
use crate::regs::PtRegs;

/// Highest register usable as scratch (r12).
const MAX_SCRATCH: u8 = 12;

fn pick_scratch(mask: u16) -> u8 {
    (0..=MAX_SCRATCH)
        .find(|r| mask & (1 << r) == 0)
        .unwrap_or(MAX_SCRATCH)
}

/// Build the copy of `decoded` to run from `slot`.
pub fn build(decoded: &Decoded, slot: u64) -> ArchInsnCopy {
    let (fields, load) = match decoded.action {
        Action::EmuLoadStore(f) => (f, true),
        Action::EmuArith(f) => (f, false),
        _ => (RegFields::new(), false),
    };
    let isa = decoded.mode.isa();
    let mut copy = ArchInsnCopy {
        slot,
        insn: decoded.raw,
        scratch: None,
        writes_pc: false,
        interworking: isa == Isa::Arm || load,
    };
    if isa == Isa::A64 || !fields.uses_pc() {
        return copy;
    }

    let scratch = pick_scratch(fields.mask());
    for f in fields.iter().filter(|f| f.reg == 15) {
        copy.insn = (copy.insn & !(0xf << f.shift)) | ((scratch as u32) << f.shift);
    }
    copy.scratch = Some(scratch);
    copy.writes_pc = fields.writes_pc();
    copy
}

/// Bytes to place in the slot: the copy followed by the step trap.
pub fn slot_image(copy: &ArchInsnCopy, mode: ExecMode) -> ([u8; SLOT_SIZE], usize) {
    let mut image = [0u8; SLOT_SIZE];
    let (insn, len) = insn_bytes(copy.insn, mode);
    image[..len].copy_from_slice(&insn[..len]);
    let (trap, trap_len) = step_trap(mode.isa());
    image[len..len + trap_len].copy_from_slice(&trap[..trap_len]);
    (image, len + trap_len)
}

/// Redirect `regs` into the slot of `site`.
pub fn begin(site: &ProbeSite, copy: &ArchInsnCopy, regs: &mut PtRegs, in_it: bool) -> PendingStep {
    let addr = site.addr;
    let len = site.len() as u8;

    let scratch = copy.scratch.map(|r| {
        let saved = regs.a32(r);
        let pc_read = addr.addr + addr.isa.pc_offset();
        regs.set_a32(r, pc_read as u32);
        (r, saved)
    });

    let itstate = if in_it {
        let it = regs.itstate();
        regs.set_itstate(SINGLE_AL_ITSTATE);
        Some(it)
    } else {
        None
    };

    regs.pc = copy.slot;
    PendingStep {
        pid: site.pid,
        addr,
        len,
        slot: copy.slot,
        step_pc: copy.slot + len as u64,
        scratch,
        writes_pc: copy.writes_pc,
        interworking: copy.interworking,
        itstate,
    }
}

/// Undo the substitution and move the PC past the probe (or to the written PC).
pub fn finish(step: &PendingStep, regs: &mut PtRegs) {
    let mut target = None;
    if let Some((r, saved)) = step.scratch {
        if step.writes_pc {
            target = Some(regs.a32(r));
        }
        regs.set_a32(r, saved);
    }

    if let Some(it) = step.itstate {
        regs.set_itstate(it);
        regs.advance_itstate();
    }

    match target {
        Some(value) if step.interworking => regs.bx_write_pc(value),
        Some(value) => regs.pc = (value & !1) as u64,
        None => regs.pc = step.addr.addr + step.len as u64,
    }
}
