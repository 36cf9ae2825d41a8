//! Emulation executor.
//!
//! When a probe fires, the displaced instruction is either simulated
//! directly on the saved registers or its fixed-up copy is stepped out of
//! line. Either way the registers seen by the code after the probe match
//! what executing the original in place would have produced.

pub mod simulate;
pub mod xol;

use crate::decode::{Action, Isa, ProbeAddress, cond};
use crate::error::{Error, Result};
use crate::ops::{AuxiliaryOps, Pid};
use crate::probe::ProbeSite;
use crate::regs::PtRegs;

/// How a decoded instruction is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Simulate,
    OutOfLine,
}

/// Pick the route for `action`. Block transfers that load or store the PC
/// are simulated; every other block transfer is stepped.
pub fn route(action: &Action) -> Route {
    match action {
        Action::EmuLoadStore(_) | Action::EmuArith(_) => Route::OutOfLine,
        Action::EmuMultiple(block) if !block.includes_pc() => Route::OutOfLine,
        _ => Route::Simulate,
    }
}

/// ITSTATE of a one-instruction block with condition AL.
pub const SINGLE_AL_ITSTATE: u8 = 0xE8;

/// State carried from the probe trap to the single-step trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStep {
    pub pid: Option<Pid>,
    pub addr: ProbeAddress,
    pub len: u8,
    pub slot: u64,
    /// Address of the step trap inside the slot.
    pub step_pc: u64,
    /// Scratch register and the value it held before the step.
    pub scratch: Option<(u8, u32)>,
    pub writes_pc: bool,
    pub interworking: bool,
    /// ITSTATE at the probe, when it fired inside an IT block.
    pub itstate: Option<u8>,
}

/// Outcome of running a probed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Registers now reflect the instruction; resume at `regs.pc`.
    Done,
    /// Resume at the slot; the step trap completes the instruction.
    Step(PendingStep),
}

/// Data memory of one address space.
pub struct DataAccess<'a> {
    ops: &'a dyn AuxiliaryOps,
    pid: Option<Pid>,
}

impl<'a> DataAccess<'a> {
    pub fn new(ops: &'a dyn AuxiliaryOps, pid: Option<Pid>) -> Self {
        Self { ops, pid }
    }

    fn read<const N: usize>(&self, addr: u64) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.ops.read_data(self.pid, addr, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        Ok(self.read::<1>(addr)?[0])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read(addr)?))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read(addr)?))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read(addr)?))
    }

    /// Read `size` bytes (1, 2, 4 or 8) zero-extended.
    pub fn read_sized(&self, addr: u64, size: u8) -> Result<u64> {
        match size {
            1 => self.read_u8(addr).map(u64::from),
            2 => self.read_u16(addr).map(u64::from),
            4 => self.read_u32(addr).map(u64::from),
            8 => self.read_u64(addr),
            _ => Err(Error::DecodeUnsupported),
        }
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.ops.write_data(self.pid, addr, &value.to_le_bytes())?;
        Ok(())
    }
}

/// Runs probed instructions for one address space.
pub struct Executor<'a> {
    mem: DataAccess<'a>,
}

impl<'a> Executor<'a> {
    pub fn new(ops: &'a dyn AuxiliaryOps, pid: Option<Pid>) -> Self {
        Self {
            mem: DataAccess::new(ops, pid),
        }
    }

    /// Execute the instruction displaced at `site` against `regs`.
    pub fn execute(&self, site: &ProbeSite, regs: &mut PtRegs) -> Result<Outcome> {
        let decoded = site.decoded.ok_or(Error::NotInstalled)?;
        let in_it = site.addr.isa == Isa::Thumb && cond::in_it_block(regs);

        if !decoded.check.passes(regs) {
            regs.pc = site.addr.addr + decoded.len() as u64;
            if in_it {
                regs.advance_itstate();
            }
            return Ok(Outcome::Done);
        }

        match site.copy {
            None => {
                simulate::run(&decoded, site.addr, regs, &self.mem)?;
                if in_it {
                    regs.advance_itstate();
                }
                Ok(Outcome::Done)
            }
            Some(copy) => Ok(Outcome::Step(xol::begin(site, &copy, regs, in_it))),
        }
    }

    /// Finish an out-of-line step once the step trap fires.
    pub fn complete(step: &PendingStep, regs: &mut PtRegs) {
        xol::finish(step, regs);
    }
}
