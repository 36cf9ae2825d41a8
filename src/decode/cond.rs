//! Condition codes and the runtime condition-check routines.

use crate::regs::{PSR_C, PSR_N, PSR_V, PSR_Z, PtRegs};

/// Condition field shared by A32, Thumb and A64 encodings.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Cs = 2,
    Cc = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
    /// `0b1111`: always-true in A64 and Thumb IT, unconditional space in A32.
    Nv = 15,
}

impl Cond {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0xf {
            0 => Self::Eq,
            1 => Self::Ne,
            2 => Self::Cs,
            3 => Self::Cc,
            4 => Self::Mi,
            5 => Self::Pl,
            6 => Self::Vs,
            7 => Self::Vc,
            8 => Self::Hi,
            9 => Self::Ls,
            10 => Self::Ge,
            11 => Self::Lt,
            12 => Self::Gt,
            13 => Self::Le,
            14 => Self::Al,
            _ => Self::Nv,
        }
    }

    /// Evaluate against the N/Z/C/V flags in `pstate`.
    pub fn passes(self, pstate: u64) -> bool {
        let n = pstate & PSR_N != 0;
        let z = pstate & PSR_Z != 0;
        let c = pstate & PSR_C != 0;
        let v = pstate & PSR_V != 0;
        match self {
            Self::Eq => z,
            Self::Ne => !z,
            Self::Cs => c,
            Self::Cc => !c,
            Self::Mi => n,
            Self::Pl => !n,
            Self::Vs => v,
            Self::Vc => !v,
            Self::Hi => c && !z,
            Self::Ls => !c || z,
            Self::Ge => n == v,
            Self::Lt => n != v,
            Self::Gt => !z && n == v,
            Self::Le => z || n != v,
            Self::Al | Self::Nv => true,
        }
    }
}

/// Condition-check routine attached to a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondCheck {
    /// Executes unconditionally.
    Always,
    /// Condition encoded in the instruction itself.
    Cond(Cond),
    /// Thumb instruction gated by the live ITSTATE, if inside an IT block.
    ItState,
}

impl CondCheck {
    /// Whether the instruction executes given the current register state.
    pub fn passes(self, regs: &PtRegs) -> bool {
        match self {
            Self::Always => true,
            Self::Cond(c) => c.passes(regs.pstate),
            Self::ItState => {
                let it = regs.itstate();
                if it & 0xf == 0 {
                    true
                } else {
                    Cond::from_bits((it >> 4) as u32).passes(regs.pstate)
                }
            }
        }
    }
}

/// Whether `regs` is currently inside a Thumb IT block.
pub fn in_it_block(regs: &PtRegs) -> bool {
    regs.itstate() & 0xf != 0
}
