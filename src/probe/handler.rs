//! Trap entry helpers and ready-made probe handlers.
//!
//! The host's exception path decodes the trapping opcode (AArch32
//! undefined instruction) or the BRK immediate (A64) and routes it through
//! [`dispatch_trap`].

use alloc::sync::Arc;

use super::patcher::{
    A64_STEP_TRAP, A64_TRAP, ARM_STEP_TRAP, ARM_TRAP, THUMB16_STEP_TRAP, THUMB16_TRAP, THUMB32_TRAP,
};
use super::{ProbeContext, ProbeHandler, TrapContext};
use crate::decode::Isa;
use crate::engine::Engine;
use crate::event::{Event, MAX_ARGS};
use crate::regs::PtRegs;
use crate::transport::Delivery;

/// Which engine trap fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Probe trap, also used by the return trampolines.
    Probe,
    /// Trap after an out-of-line copy.
    SingleStep,
}

/// BRK immediate of an A64 trap instruction.
const fn brk_imm(insn: u32) -> u16 {
    ((insn >> 5) & 0xffff) as u16
}

/// Classify an A64 BRK by its immediate (ESR ISS).
pub fn classify_brk(imm: u16) -> Option<TrapKind> {
    match imm {
        i if i == brk_imm(A64_TRAP) => Some(TrapKind::Probe),
        i if i == brk_imm(A64_STEP_TRAP) => Some(TrapKind::SingleStep),
        _ => None,
    }
}

/// Classify an AArch32 undefined instruction. Thumb encodings are passed
/// as the halfword (16-bit) or `hw1 << 16 | hw2` (32-bit).
pub fn classify_aarch32(insn: u32) -> Option<TrapKind> {
    match insn {
        ARM_TRAP | THUMB32_TRAP => Some(TrapKind::Probe),
        i if i == THUMB16_TRAP as u32 => Some(TrapKind::Probe),
        ARM_STEP_TRAP => Some(TrapKind::SingleStep),
        i if i == THUMB16_STEP_TRAP as u32 => Some(TrapKind::SingleStep),
        _ => None,
    }
}

/// Route a classified trap to `engine`. Returns false if the trap is not
/// the engine's, in which case the host handles it as a normal fault.
pub fn dispatch_trap(engine: &Engine, ctx: TrapContext, kind: TrapKind, regs: &mut PtRegs) -> bool {
    match kind {
        TrapKind::Probe => engine.handle_breakpoint(ctx, regs),
        TrapKind::SingleStep => engine.handle_single_step(ctx, regs),
    }
}

fn call_args(isa: Isa, regs: &PtRegs, nr_args: u16) -> (u16, [u64; MAX_ARGS]) {
    let mut args = [0u64; MAX_ARGS];
    let n = match isa {
        Isa::A64 => {
            args.copy_from_slice(&regs.regs[..MAX_ARGS]);
            nr_args.min(MAX_ARGS as u16)
        }
        Isa::Arm | Isa::Thumb => {
            args[..4].copy_from_slice(&regs.args());
            nr_args.min(4)
        }
    };
    (n, args)
}

/// Handler recording a `FunctionEntry` event with the first `nr_args`
/// call arguments, labelled `name`.
pub fn record_entry(name: &'static str, nr_args: u16) -> ProbeHandler {
    Arc::new(move |ctx: &ProbeContext<'_>, regs: &mut PtRegs| {
        let (nr_args, args) = call_args(ctx.isa, regs, nr_args);
        let event = Event::FunctionEntry {
            pid: ctx.pid.unwrap_or(0),
            tid: ctx.tid,
            addr: ctx.addr,
            nr_args,
            args,
            name: name.as_bytes(),
        };
        if let Err(e) = ctx.transport.emit(&event, Delivery::Immediate) {
            debug!("probe: entry record at {:#x} dropped: {:?}", ctx.addr, e);
        }
    })
}

/// Return handler recording a `FunctionExit` event. Runs after the return
/// address has been restored, so the PC is the caller's resume point.
pub fn record_exit() -> ProbeHandler {
    Arc::new(|ctx: &ProbeContext<'_>, regs: &mut PtRegs| {
        let ret_addr = match ctx.isa {
            Isa::A64 => regs.pc,
            Isa::Arm | Isa::Thumb if regs.is_thumb() => regs.pc | 1,
            Isa::Arm | Isa::Thumb => regs.pc,
        };
        let event = Event::FunctionExit {
            pid: ctx.pid.unwrap_or(0),
            tid: ctx.tid,
            addr: ctx.addr,
            ret_addr,
            retval: regs.return_value(),
        };
        if let Err(e) = ctx.transport.emit(&event, Delivery::Immediate) {
            debug!("retprobe: exit record for {:#x} dropped: {:?}", ctx.addr, e);
        }
    })
}
