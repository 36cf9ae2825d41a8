//! Instruction classifier.
//!
//! Maps a raw encoding to the action the executor takes when a probe on that
//! instruction fires. One decode table per execution mode, each ordered from
//! the most specific mask to the least specific; the first match wins and
//! anything unmatched is rejected.

pub mod a64;
pub mod arm;
pub mod cond;
pub mod thumb;

pub use cond::{Cond, CondCheck};

use crate::error::{Error, Result};

/// Instruction set state a probe address runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Isa {
    /// 32-bit native encoding.
    Arm,
    /// Compact encoding (16- and 32-bit Thumb instructions).
    Thumb,
    /// 64-bit encoding.
    A64,
}

impl Isa {
    /// Required alignment of an instruction address.
    pub fn align(self) -> u64 {
        match self {
            Isa::Arm | Isa::A64 => 4,
            Isa::Thumb => 2,
        }
    }

    /// Offset of the PC value an instruction reads from its own address.
    pub fn pc_offset(self) -> u64 {
        match self {
            Isa::Arm => 8,
            Isa::Thumb => 4,
            Isa::A64 => 0,
        }
    }
}

/// A probe target address together with its instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeAddress {
    pub addr: u64,
    pub isa: Isa,
}

impl ProbeAddress {
    pub fn new(addr: u64, isa: Isa) -> Self {
        Self { addr, isa }
    }

    /// Decode an entry address whose two lowest bits carry the mode tag.
    ///
    /// Bit 0 set selects Thumb; otherwise bit 1 set selects A64; both clear
    /// selects A32.
    pub fn from_tagged(entry: u64) -> Self {
        if entry & 0b01 != 0 {
            Self::new(entry & !0b01, Isa::Thumb)
        } else if entry & 0b10 != 0 {
            Self::new(entry & !0b11, Isa::A64)
        } else {
            Self::new(entry, Isa::Arm)
        }
    }

    /// Inverse of [`ProbeAddress::from_tagged`].
    pub fn tagged(&self) -> u64 {
        match self.isa {
            Isa::Arm => self.addr,
            Isa::Thumb => self.addr | 0b01,
            Isa::A64 => self.addr | 0b10,
        }
    }

    pub fn check_alignment(&self) -> Result<()> {
        if self.addr % self.isa.align() != 0 {
            return Err(Error::Misaligned);
        }
        Ok(())
    }
}

/// Decoding mode of a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecMode {
    Arm,
    Thumb16,
    Thumb32,
    A64,
}

impl ExecMode {
    /// Instruction length in bytes.
    pub fn len(self) -> usize {
        match self {
            ExecMode::Thumb16 => 2,
            _ => 4,
        }
    }

    pub fn isa(self) -> Isa {
        match self {
            ExecMode::Arm => Isa::Arm,
            ExecMode::Thumb16 | ExecMode::Thumb32 => Isa::Thumb,
            ExecMode::A64 => Isa::A64,
        }
    }

    /// Pick the decoding mode from the instruction set and first halfword.
    pub fn detect(isa: Isa, first_halfword: u16) -> Self {
        match isa {
            Isa::Arm => ExecMode::Arm,
            Isa::A64 => ExecMode::A64,
            Isa::Thumb => {
                if thumb::is_wide(first_halfword) {
                    ExecMode::Thumb32
                } else {
                    ExecMode::Thumb16
                }
            }
        }
    }
}

/// Register field inside an encoding, used to pick and substitute scratch registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegField {
    /// Bit position of the 4-bit field.
    pub shift: u8,
    pub reg: u8,
    pub written: bool,
}

/// Up to four encoded register fields plus registers used implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegFields {
    fields: [Option<RegField>; 4],
    /// Registers touched but not encoded (e.g. the second register of a dual load).
    pub implicit: u16,
}

impl RegFields {
    pub const fn new() -> Self {
        Self {
            fields: [None; 4],
            implicit: 0,
        }
    }

    /// Add a field read by the instruction.
    pub fn read(self, shift: u8, word: u32) -> Self {
        self.push(shift, word, false)
    }

    /// Add a field written by the instruction.
    pub fn written(self, shift: u8, word: u32) -> Self {
        self.push(shift, word, true)
    }

    pub fn with_implicit(mut self, reg: u8) -> Self {
        self.implicit |= 1 << reg;
        self
    }

    fn push(mut self, shift: u8, word: u32, written: bool) -> Self {
        let reg = ((word >> shift) & 0xf) as u8;
        if let Some(slot) = self.fields.iter_mut().find(|f| f.is_none()) {
            *slot = Some(RegField { shift, reg, written });
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegField> {
        self.fields.iter().flatten()
    }

    /// Bitmask of every register the instruction touches.
    pub fn mask(&self) -> u16 {
        self.iter().fold(self.implicit, |m, f| m | (1 << f.reg))
    }

    pub fn uses(&self, reg: u8) -> bool {
        self.mask() & (1 << reg) != 0
    }

    /// Whether the PC appears in an encoded field.
    pub fn uses_pc(&self) -> bool {
        self.iter().any(|f| f.reg == 15)
    }

    /// Whether the PC is written through an encoded field.
    pub fn writes_pc(&self) -> bool {
        self.iter().any(|f| f.reg == 15 && f.written)
    }
}

/// Block (multiple register) transfer operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub rn: u8,
    pub list: u16,
    pub load: bool,
    pub writeback: bool,
    /// Addresses ascend from the base.
    pub increment: bool,
    /// Base is adjusted before the first transfer.
    pub before: bool,
}

impl Block {
    pub fn includes_pc(&self) -> bool {
        self.list & (1 << 15) != 0
    }
}

/// Branch operands. Immediate offsets are relative to the PC value the
/// instruction reads (address + 8 in A32, + 4 in Thumb, + 0 in A64).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// B, BL, BLX(imm). `exchange` switches instruction set.
    Imm { offset: i64, link: bool, exchange: bool },
    /// BX, BLX(reg), BR, BLR, RET.
    Reg { rm: u8, link: bool, exchange: bool },
    /// CBZ/CBNZ. `wide` selects a 64-bit register compare.
    CompareZero { rn: u8, offset: i64, nonzero: bool, wide: bool },
    /// TBZ/TBNZ.
    TestBit { rt: u8, bit: u8, offset: i64, nonzero: bool },
    /// TBB/TBH.
    Table { rn: u8, rm: u8, half: bool },
}

/// High-register data processing simulated in Thumb state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiRegOp {
    Add,
    Cmp,
    Mov,
}

/// Broad action class; what the probe patcher and stats report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Reject,
    SimulateNop,
    SimulateBranch,
    SimulateStatusRead,
    SimulateAddress,
    SimulateLoad,
    SimulateAlu,
    EmulateLoadStore,
    EmulateArithmetic,
    EmulateMultiple,
}

impl Category {
    pub fn is_simulated(self) -> bool {
        matches!(
            self,
            Category::SimulateNop
                | Category::SimulateBranch
                | Category::SimulateStatusRead
                | Category::SimulateAddress
                | Category::SimulateLoad
                | Category::SimulateAlu
        )
    }
}

/// Decoded action and the operands the executor needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Cannot be probed.
    Reject,
    /// No architectural effect beyond advancing the PC.
    SimNop,
    SimBranch(Branch),
    /// Copy the flags word into `rd` (MRS).
    SimStatusRead { rd: u8 },
    /// ADR/ADRP. `page` aligns the base down to 4KiB.
    SimAdr { rd: u8, offset: i64, page: bool },
    /// PC-relative load of `size` bytes.
    SimLoadLiteral { rt: u8, offset: i64, size: u8, signed: bool },
    SimHiReg { op: HiRegOp, rd: u8, rm: u8 },
    EmuLoadStore(RegFields),
    EmuArith(RegFields),
    EmuMultiple(Block),
}

impl Action {
    pub fn category(&self) -> Category {
        match self {
            Action::Reject => Category::Reject,
            Action::SimNop => Category::SimulateNop,
            Action::SimBranch(_) => Category::SimulateBranch,
            Action::SimStatusRead { .. } => Category::SimulateStatusRead,
            Action::SimAdr { .. } => Category::SimulateAddress,
            Action::SimLoadLiteral { .. } => Category::SimulateLoad,
            Action::SimHiReg { .. } => Category::SimulateAlu,
            Action::EmuLoadStore(_) => Category::EmulateLoadStore,
            Action::EmuArith(_) => Category::EmulateArithmetic,
            Action::EmuMultiple(_) => Category::EmulateMultiple,
        }
    }
}

/// Immutable classification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Raw encoding; Thumb-32 is `hw1 << 16 | hw2`.
    pub raw: u32,
    pub mode: ExecMode,
    pub action: Action,
    pub check: CondCheck,
}

impl Decoded {
    pub fn len(&self) -> usize {
        self.mode.len()
    }

    pub fn category(&self) -> Category {
        self.action.category()
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.action, Action::Reject)
    }
}

/// One row of a decode table.
pub(crate) struct DecodeEntry {
    pub mask: u32,
    pub value: u32,
    pub decode: fn(u32) -> Action,
}

/// Walk `table` and return the first matching row's action.
pub(crate) fn lookup(table: &[DecodeEntry], word: u32) -> Action {
    table
        .iter()
        .find(|e| word & e.mask == e.value)
        .map(|e| (e.decode)(word))
        .unwrap_or(Action::Reject)
}

pub(crate) fn reject(_: u32) -> Action {
    Action::Reject
}

pub(crate) fn nop(_: u32) -> Action {
    Action::SimNop
}

/// Sign-extend the low `bits` bits of `value`.
pub(crate) fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    (((value as u64) << shift) as i64) >> shift
}

/// Classify one instruction. Total over each mode's bit space.
pub fn classify(word: u32, mode: ExecMode) -> Decoded {
    let (action, check) = match mode {
        ExecMode::Arm => arm::decode(word),
        ExecMode::Thumb16 => thumb::decode16(word as u16),
        ExecMode::Thumb32 => thumb::decode32(word),
        ExecMode::A64 => a64::decode(word),
    };
    let check = if matches!(action, Action::Reject) {
        CondCheck::Always
    } else {
        check
    };
    Decoded {
        raw: word,
        mode,
        action,
        check,
    }
}

/// Classify the instruction held in `bytes` (little-endian) for `isa`.
///
/// Returns `None` if `bytes` is too short for the detected width.
pub fn classify_bytes(bytes: &[u8], isa: Isa) -> Option<Decoded> {
    let (word, mode) = read_insn(bytes, isa)?;
    Some(classify(word, mode))
}

/// Assemble the raw encoding from little-endian code bytes.
pub fn read_insn(bytes: &[u8], isa: Isa) -> Option<(u32, ExecMode)> {
    let hw1 = u16::from_le_bytes([*bytes.first()?, *bytes.get(1)?]);
    let mode = ExecMode::detect(isa, hw1);
    let word = match mode {
        ExecMode::Thumb16 => hw1 as u32,
        ExecMode::Thumb32 => {
            let hw2 = u16::from_le_bytes([*bytes.get(2)?, *bytes.get(3)?]);
            ((hw1 as u32) << 16) | hw2 as u32
        }
        ExecMode::Arm | ExecMode::A64 => {
            u32::from_le_bytes([bytes[0], bytes[1], *bytes.get(2)?, *bytes.get(3)?])
        }
    };
    Some((word, mode))
}

/// Encode an instruction back to little-endian bytes.
pub fn insn_bytes(word: u32, mode: ExecMode) -> ([u8; 4], usize) {
    let mut out = [0u8; 4];
    match mode {
        ExecMode::Thumb16 => {
            out[..2].copy_from_slice(&(word as u16).to_le_bytes());
            (out, 2)
        }
        ExecMode::Thumb32 => {
            out[..2].copy_from_slice(&((word >> 16) as u16).to_le_bytes());
            out[2..].copy_from_slice(&(word as u16).to_le_bytes());
            (out, 4)
        }
        ExecMode::Arm | ExecMode::A64 => (word.to_le_bytes(), 4),
    }
}
