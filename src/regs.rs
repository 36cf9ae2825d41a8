//! Saved register state handed to the engine by the trap path.
//!
//! One layout serves both 32-bit and 64-bit targets. In A32/Thumb state
//! r0-r12 and r14 live in `regs[0..15]`, r13 is `sp` and r15 is `pc`;
//! upper halves are kept zero. In A64 state `regs[0..31]` are x0-x30.

/// PSR flag bits (identical positions in CPSR and PSTATE).
pub const PSR_N: u64 = 1 << 31;
pub const PSR_Z: u64 = 1 << 30;
pub const PSR_C: u64 = 1 << 29;
pub const PSR_V: u64 = 1 << 28;
/// Thumb execution state bit (AArch32 only).
pub const PSR_T: u64 = 1 << 5;
/// AArch32 mode field and the User mode encoding.
pub const PSR_MODE_MASK: u64 = 0x1f;
pub const PSR_MODE_USR: u64 = 0x10;
/// IT[1:0] at bits 26:25, IT[7:2] at bits 15:10.
const PSR_IT_LO_SHIFT: u32 = 25;
const PSR_IT_HI_SHIFT: u32 = 10;
const PSR_IT_MASK: u64 = (0b11 << PSR_IT_LO_SHIFT) | (0b11_1111 << PSR_IT_HI_SHIFT);

/// Register index of the A32 stack pointer.
pub const A32_SP: u8 = 13;
/// Register index of the A32 link register.
pub const A32_LR: u8 = 14;
/// Register index of the A32 program counter.
pub const A32_PC: u8 = 15;
/// Register index of the A64 link register.
pub const A64_LR: u8 = 30;
/// Register number 31 encodes XZR or SP in A64.
pub const A64_ZR: u8 = 31;

/// Saved register file.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtRegs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl PtRegs {
    /// Read an A32 register by number; r15 reads the raw PC.
    pub fn a32(&self, n: u8) -> u32 {
        match n {
            A32_SP => self.sp as u32,
            A32_PC => self.pc as u32,
            n => self.regs[n as usize] as u32,
        }
    }

    /// Write an A32 register by number.
    pub fn set_a32(&mut self, n: u8, value: u32) {
        match n {
            A32_SP => self.sp = value as u64,
            A32_PC => self.pc = value as u64,
            n => self.regs[n as usize] = value as u64,
        }
    }

    /// Read an A64 general register; number 31 reads as zero.
    pub fn x(&self, n: u8) -> u64 {
        if n >= A64_ZR { 0 } else { self.regs[n as usize] }
    }

    /// Write an A64 general register; writes to number 31 are discarded.
    pub fn set_x(&mut self, n: u8, value: u64) {
        if n < A64_ZR {
            self.regs[n as usize] = value;
        }
    }

    /// Read an A64 base register, where number 31 is SP.
    pub fn x_or_sp(&self, n: u8) -> u64 {
        if n >= A64_ZR { self.sp } else { self.regs[n as usize] }
    }

    pub fn is_thumb(&self) -> bool {
        self.pstate & PSR_T != 0
    }

    pub fn set_thumb(&mut self, thumb: bool) {
        if thumb {
            self.pstate |= PSR_T;
        } else {
            self.pstate &= !PSR_T;
        }
    }

    /// AArch32 state in a privileged mode (any valid mode but User).
    pub fn is_privileged(&self) -> bool {
        let mode = self.pstate & PSR_MODE_MASK;
        mode & 0x10 != 0 && mode != PSR_MODE_USR
    }

    /// Current ITSTATE byte.
    pub fn itstate(&self) -> u8 {
        let lo = (self.pstate >> PSR_IT_LO_SHIFT) & 0b11;
        let hi = (self.pstate >> PSR_IT_HI_SHIFT) & 0b11_1111;
        ((hi << 2) | lo) as u8
    }

    pub fn set_itstate(&mut self, it: u8) {
        let it = it as u64;
        self.pstate &= !PSR_IT_MASK;
        self.pstate |= (it & 0b11) << PSR_IT_LO_SHIFT;
        self.pstate |= ((it >> 2) & 0b11_1111) << PSR_IT_HI_SHIFT;
    }

    /// Advance ITSTATE past one instruction.
    pub fn advance_itstate(&mut self) {
        let it = self.itstate();
        let next = if it & 0b111 == 0 {
            0
        } else {
            (it & 0b1110_0000) | ((it << 1) & 0b1_1111)
        };
        self.set_itstate(next);
    }

    /// Branch with interworking: bit 0 of `target` selects Thumb state.
    pub fn bx_write_pc(&mut self, target: u32) {
        if target & 1 != 0 {
            self.set_thumb(true);
            self.pc = (target & !1) as u64;
        } else {
            self.set_thumb(false);
            self.pc = (target & !3) as u64;
        }
    }

    /// First four argument registers.
    pub fn args(&self) -> [u64; 4] {
        [self.regs[0], self.regs[1], self.regs[2], self.regs[3]]
    }

    /// Function return value register.
    pub fn return_value(&self) -> u64 {
        self.regs[0]
    }
}
