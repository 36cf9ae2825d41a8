//! Direct simulation of instructions the classifier marks as simulatable.

use super::DataAccess;
use crate::decode::{Action, Block, Branch, Decoded, HiRegOp, Isa, ProbeAddress};
use crate::error::{Error, Result};
use crate::regs::{A32_LR, A32_PC, A64_LR, PSR_C, PSR_N, PSR_V, PSR_Z, PtRegs};

/// APSR bits visible to MRS in User mode: N Z C V Q and GE[3:0].
const APSR_MASK: u64 = 0xF80F_0000;
/// CPSR bits visible to MRS in privileged modes: all but IT, J and T.
const CPSR_READ_MASK: u64 = 0xF8FF_03DF;
/// NZCV bits visible to A64 MRS.
const NZCV_MASK: u64 = 0xF000_0000;

fn a32(addr: u64) -> u64 {
    addr & 0xffff_ffff
}

/// PC value the instruction at `at` reads.
fn pc_value(at: ProbeAddress) -> u64 {
    at.addr + at.isa.pc_offset()
}

/// Read an A32/Thumb register, with r15 reading the PC value.
fn reg(at: ProbeAddress, regs: &PtRegs, n: u8) -> u32 {
    if n == A32_PC {
        pc_value(at) as u32
    } else {
        regs.a32(n)
    }
}

/// Value `MRS Rd, CPSR` reads in the current mode.
fn mrs_value(regs: &PtRegs) -> u32 {
    let mask = if regs.is_privileged() {
        CPSR_READ_MASK
    } else {
        APSR_MASK
    };
    (regs.pstate & mask) as u32
}

/// Apply the effect of `decoded`, fetched from `at`, to `regs`.
pub fn run(decoded: &Decoded, at: ProbeAddress, regs: &mut PtRegs, mem: &DataAccess<'_>) -> Result<()> {
    let len = decoded.len() as u64;
    let next = at.addr + len;
    match decoded.action {
        Action::SimNop => regs.pc = next,
        Action::SimBranch(branch) => run_branch(branch, at, len, regs, mem)?,
        Action::SimStatusRead { rd } => {
            match at.isa {
                Isa::A64 => regs.set_x(rd, regs.pstate & NZCV_MASK),
                _ => regs.set_a32(rd, mrs_value(regs)),
            }
            regs.pc = next;
        }
        Action::SimAdr { rd, offset, page } => {
            match at.isa {
                Isa::A64 => {
                    let base = if page { at.addr & !0xfff } else { at.addr };
                    regs.set_x(rd, base.wrapping_add_signed(offset));
                }
                _ => {
                    let base = pc_value(at) & !3;
                    regs.set_a32(rd, base.wrapping_add_signed(offset) as u32);
                }
            }
            regs.pc = next;
        }
        Action::SimLoadLiteral {
            rt,
            offset,
            size,
            signed,
        } => {
            let base = match at.isa {
                Isa::A64 => at.addr,
                Isa::Thumb => pc_value(at) & !3,
                Isa::Arm => pc_value(at),
            };
            let raw = mem.read_sized(base.wrapping_add_signed(offset), size)?;
            let value = if signed { sign_extend(raw, size) } else { raw };
            match at.isa {
                Isa::A64 => {
                    regs.set_x(rt, value);
                    regs.pc = next;
                }
                _ if rt == A32_PC => regs.bx_write_pc(value as u32),
                _ => {
                    regs.set_a32(rt, value as u32);
                    regs.pc = next;
                }
            }
        }
        Action::SimHiReg { op, rd, rm } => run_hireg(op, rd, rm, at, next, regs),
        Action::EmuMultiple(block) => run_block(block, at, next, regs, mem)?,
        Action::Reject | Action::EmuLoadStore(_) | Action::EmuArith(_) => {
            return Err(Error::DecodeUnsupported);
        }
    }
    Ok(())
}

fn sign_extend(raw: u64, size: u8) -> u64 {
    let shift = 64 - 8 * size as u32;
    (((raw << shift) as i64) >> shift) as u64
}

fn run_branch(
    branch: Branch,
    at: ProbeAddress,
    len: u64,
    regs: &mut PtRegs,
    mem: &DataAccess<'_>,
) -> Result<()> {
    let next = at.addr + len;
    match branch {
        Branch::Imm {
            offset,
            link,
            exchange,
        } => match at.isa {
            Isa::A64 => {
                if link {
                    regs.set_x(A64_LR, next);
                }
                regs.pc = at.addr.wrapping_add_signed(offset);
            }
            Isa::Arm => {
                if link {
                    regs.set_a32(A32_LR, next as u32);
                }
                if exchange {
                    regs.set_thumb(true);
                }
                regs.pc = a32(pc_value(at).wrapping_add_signed(offset));
            }
            Isa::Thumb => {
                if link {
                    regs.set_a32(A32_LR, (next | 1) as u32);
                }
                if exchange {
                    regs.set_thumb(false);
                    regs.pc = a32((pc_value(at) & !3).wrapping_add_signed(offset));
                } else {
                    regs.pc = a32(pc_value(at).wrapping_add_signed(offset));
                }
            }
        },
        Branch::Reg { rm, link, exchange } => match at.isa {
            Isa::A64 => {
                let target = regs.x(rm);
                if link {
                    regs.set_x(A64_LR, next);
                }
                regs.pc = target;
            }
            isa => {
                let target = reg(at, regs, rm);
                if link {
                    let ret = if isa == Isa::Thumb { next | 1 } else { next };
                    regs.set_a32(A32_LR, ret as u32);
                }
                if exchange {
                    regs.bx_write_pc(target);
                } else {
                    regs.pc = target as u64;
                }
            }
        },
        Branch::CompareZero {
            rn,
            offset,
            nonzero,
            wide,
        } => {
            let (value, base) = match at.isa {
                Isa::A64 if wide => (regs.x(rn), at.addr),
                Isa::A64 => (regs.x(rn) & 0xffff_ffff, at.addr),
                _ => (regs.a32(rn) as u64, pc_value(at)),
            };
            regs.pc = if (value != 0) == nonzero {
                base.wrapping_add_signed(offset)
            } else {
                next
            };
        }
        Branch::TestBit {
            rt,
            bit,
            offset,
            nonzero,
        } => {
            let set = (regs.x(rt) >> bit) & 1 != 0;
            regs.pc = if set == nonzero {
                at.addr.wrapping_add_signed(offset)
            } else {
                next
            };
        }
        Branch::Table { rn, rm, half } => {
            let base = reg(at, regs, rn) as u64;
            let index = regs.a32(rm) as u64;
            let entry = if half {
                mem.read_u16(a32(base + 2 * index))? as u64
            } else {
                mem.read_u8(a32(base + index))? as u64
            };
            regs.pc = a32(pc_value(at) + 2 * entry);
        }
    }
    Ok(())
}

fn run_hireg(op: HiRegOp, rd: u8, rm: u8, at: ProbeAddress, next: u64, regs: &mut PtRegs) {
    let dst = reg(at, regs, rd);
    let src = reg(at, regs, rm);
    let result = match op {
        HiRegOp::Add => dst.wrapping_add(src),
        HiRegOp::Mov => src,
        HiRegOp::Cmp => {
            let diff = dst.wrapping_sub(src);
            let mut flags = 0;
            if diff & 0x8000_0000 != 0 {
                flags |= PSR_N;
            }
            if diff == 0 {
                flags |= PSR_Z;
            }
            if dst >= src {
                flags |= PSR_C;
            }
            if (dst ^ src) & (dst ^ diff) & 0x8000_0000 != 0 {
                flags |= PSR_V;
            }
            regs.pstate = (regs.pstate & !(PSR_N | PSR_Z | PSR_C | PSR_V)) | flags;
            regs.pc = next;
            return;
        }
    };
    if rd == A32_PC {
        // Thumb ALU writes to the PC do not interwork.
        regs.pc = (result & !1) as u64;
    } else {
        regs.set_a32(rd, result);
        regs.pc = next;
    }
}

/// LDM/STM/PUSH/POP whose register list includes the PC.
fn run_block(
    block: Block,
    at: ProbeAddress,
    next: u64,
    regs: &mut PtRegs,
    mem: &DataAccess<'_>,
) -> Result<()> {
    let count = block.list.count_ones();
    let base = regs.a32(block.rn);
    let span = 4 * count;
    let start = match (block.increment, block.before) {
        (true, false) => base,
        (true, true) => base.wrapping_add(4),
        (false, false) => base.wrapping_sub(span).wrapping_add(4),
        (false, true) => base.wrapping_sub(span),
    };

    let mut values = [0u32; 16];
    let mut address = start;
    for r in (0..16u8).filter(|r| block.list & (1 << r) != 0) {
        if block.load {
            values[r as usize] = mem.read_u32(address as u64)?;
        } else {
            mem.write_u32(address as u64, reg(at, regs, r))?;
        }
        address = address.wrapping_add(4);
    }

    if block.writeback {
        let new_base = if block.increment {
            base.wrapping_add(span)
        } else {
            base.wrapping_sub(span)
        };
        regs.set_a32(block.rn, new_base);
    }

    if !block.load {
        regs.pc = next;
        return Ok(());
    }
    for r in (0..15u8).filter(|r| block.list & (1 << r) != 0) {
        regs.set_a32(r, values[r as usize]);
    }
    if block.includes_pc() {
        regs.bx_write_pc(values[15]);
    } else {
        regs.pc = next;
    }
    Ok(())
}
