//! Thumb decode tables, 16-bit and 32-bit.
//!
//! A 32-bit instruction is presented as `hw1 << 16 | hw2`, which puts the
//! usual register fields at bit 16 (Rn), 12 (Rt), 8 (Rd) and 0 (Rm).

use super::{
    Action, Block, Branch, Cond, CondCheck, DecodeEntry, HiRegOp, RegFields, lookup, nop,
    reject, sign_extend,
};

const PC: u32 = 15;

/// Whether `hw1` starts a 32-bit instruction.
pub fn is_wide(hw1: u16) -> bool {
    matches!(hw1 >> 11, 0b11101..=0b11111)
}

fn bit(word: u32, n: u32) -> bool {
    word & (1 << n) != 0
}

const TABLE16: &[DecodeEntry] = &[
    // NOP, YIELD
    DecodeEntry { mask: 0xFFFF, value: 0xBF00, decode: nop },
    DecodeEntry { mask: 0xFFFF, value: 0xBF10, decode: nop },
    // IT and the remaining hints
    DecodeEntry { mask: 0xFF00, value: 0xBF00, decode: reject },
    // BKPT
    DecodeEntry { mask: 0xFF00, value: 0xBE00, decode: reject },
    // CPS, SETEND
    DecodeEntry { mask: 0xFFE0, value: 0xB660, decode: reject },
    DecodeEntry { mask: 0xFFF7, value: 0xB650, decode: reject },
    // BX / BLX (register)
    DecodeEntry { mask: 0xFF87, value: 0x4700, decode: bx16 },
    DecodeEntry { mask: 0xFF87, value: 0x4780, decode: bx16 },
    // ADD/CMP/MOV (high registers)
    DecodeEntry { mask: 0xFF00, value: 0x4400, decode: hireg },
    DecodeEntry { mask: 0xFF00, value: 0x4500, decode: hireg },
    DecodeEntry { mask: 0xFF00, value: 0x4600, decode: hireg },
    // LDR (literal)
    DecodeEntry { mask: 0xF800, value: 0x4800, decode: ldr_literal16 },
    // ADR
    DecodeEntry { mask: 0xF800, value: 0xA000, decode: adr16 },
    // CBZ/CBNZ
    DecodeEntry { mask: 0xF500, value: 0xB100, decode: cbz },
    // PUSH, POP
    DecodeEntry { mask: 0xFE00, value: 0xB400, decode: push },
    DecodeEntry { mask: 0xFE00, value: 0xBC00, decode: pop },
    // UDF (includes the probe traps), SVC
    DecodeEntry { mask: 0xFF00, value: 0xDE00, decode: reject },
    DecodeEntry { mask: 0xFF00, value: 0xDF00, decode: reject },
    // B<cond>
    DecodeEntry { mask: 0xF000, value: 0xD000, decode: bcond16 },
    // B
    DecodeEntry { mask: 0xF800, value: 0xE000, decode: b16 },
    // Shift, add, subtract, move, compare (immediate)
    DecodeEntry { mask: 0xC000, value: 0x0000, decode: arith16 },
    // Data processing (low registers)
    DecodeEntry { mask: 0xFC00, value: 0x4000, decode: arith16 },
    // Load/store (register offset, immediate, halfword, SP-relative)
    DecodeEntry { mask: 0xF000, value: 0x5000, decode: load_store16 },
    DecodeEntry { mask: 0xE000, value: 0x6000, decode: load_store16 },
    DecodeEntry { mask: 0xF000, value: 0x8000, decode: load_store16 },
    DecodeEntry { mask: 0xF000, value: 0x9000, decode: load_store16 },
    // ADD Rd, SP, #imm
    DecodeEntry { mask: 0xF800, value: 0xA800, decode: arith16 },
    // ADD/SUB SP, SXTH/SXTB/UXTH/UXTB, REV family
    DecodeEntry { mask: 0xFF00, value: 0xB000, decode: arith16 },
    DecodeEntry { mask: 0xFF00, value: 0xB200, decode: arith16 },
    // HLT sits inside the REV block
    DecodeEntry { mask: 0xFFC0, value: 0xBA80, decode: reject },
    DecodeEntry { mask: 0xFF00, value: 0xBA00, decode: arith16 },
    // STM, LDM
    DecodeEntry { mask: 0xF800, value: 0xC000, decode: stm16 },
    DecodeEntry { mask: 0xF800, value: 0xC800, decode: ldm16 },
];

const TABLE32: &[DecodeEntry] = &[
    // NOP.W, YIELD.W
    DecodeEntry { mask: 0xFFFF_FFFF, value: 0xF3AF_8000, decode: nop },
    DecodeEntry { mask: 0xFFFF_FFFF, value: 0xF3AF_8001, decode: nop },
    // MRS Rd, APSR
    DecodeEntry { mask: 0xFFFF_F0FF, value: 0xF3EF_8000, decode: mrs32 },
    // TBB/TBH
    DecodeEntry { mask: 0xFFF0_FFE0, value: 0xE8D0_F000, decode: table_branch },
    // Load/store exclusive
    DecodeEntry { mask: 0xFFE0_0000, value: 0xE840_0000, decode: reject },
    DecodeEntry { mask: 0xFFE0_00C0, value: 0xE8C0_0040, decode: reject },
    // LDRD/STRD
    DecodeEntry { mask: 0xFE40_0000, value: 0xE840_0000, decode: load_store_dual },
    // LDM/STM (IA and DB)
    DecodeEntry { mask: 0xFFD0_0000, value: 0xE880_0000, decode: block32 },
    DecodeEntry { mask: 0xFFD0_0000, value: 0xE890_0000, decode: block32 },
    DecodeEntry { mask: 0xFFD0_0000, value: 0xE900_0000, decode: block32 },
    DecodeEntry { mask: 0xFFD0_0000, value: 0xE910_0000, decode: block32 },
    // Data processing (shifted register)
    DecodeEntry { mask: 0xFE00_0000, value: 0xEA00_0000, decode: arith32 },
    // Coprocessor, SIMD
    DecodeEntry { mask: 0xEC00_0000, value: 0xEC00_0000, decode: reject },
    // BL, BLX (immediate), B.W
    DecodeEntry { mask: 0xF800_D000, value: 0xF000_D000, decode: branch32 },
    DecodeEntry { mask: 0xF800_D000, value: 0xF000_C000, decode: branch32 },
    DecodeEntry { mask: 0xF800_D000, value: 0xF000_9000, decode: branch32 },
    // Miscellaneous control (cond field 111x)
    DecodeEntry { mask: 0xFB80_D000, value: 0xF380_8000, decode: reject },
    // B<cond>.W
    DecodeEntry { mask: 0xF800_D000, value: 0xF000_8000, decode: bcond32 },
    // ADR.W
    DecodeEntry { mask: 0xFBFF_8000, value: 0xF20F_0000, decode: adr32 },
    DecodeEntry { mask: 0xFBFF_8000, value: 0xF2AF_0000, decode: adr32 },
    // Data processing (modified immediate, plain binary immediate)
    DecodeEntry { mask: 0xF800_8000, value: 0xF000_0000, decode: arith32 },
    // PC-relative loads
    DecodeEntry { mask: 0xFE1F_0000, value: 0xF81F_0000, decode: ldr_literal32 },
    // Load/store single
    DecodeEntry { mask: 0xFE00_0000, value: 0xF800_0000, decode: load_store32 },
    // Data processing (register), multiply, divide
    DecodeEntry { mask: 0xFF00_F000, value: 0xFA00_F000, decode: arith32 },
    DecodeEntry { mask: 0xFF00_0000, value: 0xFB00_0000, decode: arith32 },
];

/// Decode one 16-bit Thumb instruction.
pub fn decode16(hw: u16) -> (Action, CondCheck) {
    let word = hw as u32;
    let action = lookup(TABLE16, word);
    let check = if word & 0xF000 == 0xD000 {
        CondCheck::Cond(Cond::from_bits(word >> 8))
    } else {
        CondCheck::ItState
    };
    (action, check)
}

/// Decode one 32-bit Thumb instruction (`hw1 << 16 | hw2`).
pub fn decode32(word: u32) -> (Action, CondCheck) {
    let action = lookup(TABLE32, word);
    let check = if word & 0xF800_D000 == 0xF000_8000 {
        CondCheck::Cond(Cond::from_bits(word >> 22))
    } else {
        CondCheck::ItState
    };
    (action, check)
}

fn bx16(word: u32) -> Action {
    let rm = ((word >> 3) & 0xf) as u8;
    let link = bit(word, 7);
    if link && rm as u32 == PC {
        return Action::Reject;
    }
    Action::SimBranch(Branch::Reg {
        rm,
        link,
        exchange: true,
    })
}

fn hireg(word: u32) -> Action {
    let rd = (((word >> 4) & 0x8) | (word & 0x7)) as u8;
    let rm = ((word >> 3) & 0xf) as u8;
    let op = match (word >> 8) & 0b11 {
        0b00 => HiRegOp::Add,
        0b01 => HiRegOp::Cmp,
        _ => HiRegOp::Mov,
    };
    if op == HiRegOp::Cmp && (rd as u32 == PC || rm as u32 == PC) {
        return Action::Reject;
    }
    Action::SimHiReg { op, rd, rm }
}

fn ldr_literal16(word: u32) -> Action {
    Action::SimLoadLiteral {
        rt: ((word >> 8) & 0x7) as u8,
        offset: ((word & 0xff) << 2) as i64,
        size: 4,
        signed: false,
    }
}

fn adr16(word: u32) -> Action {
    Action::SimAdr {
        rd: ((word >> 8) & 0x7) as u8,
        offset: ((word & 0xff) << 2) as i64,
        page: false,
    }
}

fn cbz(word: u32) -> Action {
    let imm = (((word >> 9) & 1) << 6) | (((word >> 3) & 0x1f) << 1);
    Action::SimBranch(Branch::CompareZero {
        rn: (word & 0x7) as u8,
        offset: imm as i64,
        nonzero: bit(word, 11),
        wide: false,
    })
}

fn push(word: u32) -> Action {
    let list = ((word & 0xff) | (((word >> 8) & 1) << 14)) as u16;
    if list == 0 {
        return Action::Reject;
    }
    Action::EmuMultiple(Block {
        rn: 13,
        list,
        load: false,
        writeback: true,
        increment: false,
        before: true,
    })
}

fn pop(word: u32) -> Action {
    let list = ((word & 0xff) | (((word >> 8) & 1) << 15)) as u16;
    if list == 0 {
        return Action::Reject;
    }
    Action::EmuMultiple(Block {
        rn: 13,
        list,
        load: true,
        writeback: true,
        increment: true,
        before: false,
    })
}

fn bcond16(word: u32) -> Action {
    Action::SimBranch(Branch::Imm {
        offset: sign_extend((word & 0xff) << 1, 9),
        link: false,
        exchange: false,
    })
}

fn b16(word: u32) -> Action {
    Action::SimBranch(Branch::Imm {
        offset: sign_extend((word & 0x7ff) << 1, 12),
        link: false,
        exchange: false,
    })
}

fn arith16(_word: u32) -> Action {
    Action::EmuArith(RegFields::new())
}

fn load_store16(_word: u32) -> Action {
    Action::EmuLoadStore(RegFields::new())
}

fn stm16(word: u32) -> Action {
    let list = (word & 0xff) as u16;
    if list == 0 {
        return Action::Reject;
    }
    Action::EmuMultiple(Block {
        rn: ((word >> 8) & 0x7) as u8,
        list,
        load: false,
        writeback: true,
        increment: true,
        before: false,
    })
}

fn ldm16(word: u32) -> Action {
    let rn = ((word >> 8) & 0x7) as u8;
    let list = (word & 0xff) as u16;
    if list == 0 {
        return Action::Reject;
    }
    Action::EmuMultiple(Block {
        rn,
        list,
        load: true,
        writeback: list & (1 << rn) == 0,
        increment: true,
        before: false,
    })
}

fn mrs32(word: u32) -> Action {
    let rd = (word >> 8) & 0xf;
    if rd == PC || rd == 13 {
        return Action::Reject;
    }
    Action::SimStatusRead { rd: rd as u8 }
}

fn table_branch(word: u32) -> Action {
    let rn = ((word >> 16) & 0xf) as u8;
    let rm = (word & 0xf) as u8;
    if rm as u32 == PC || rm == 13 || rn == 13 {
        return Action::Reject;
    }
    Action::SimBranch(Branch::Table {
        rn,
        rm,
        half: bit(word, 4),
    })
}

fn load_store_dual(word: u32) -> Action {
    let rn = (word >> 16) & 0xf;
    let rt = (word >> 12) & 0xf;
    let rt2 = (word >> 8) & 0xf;
    let wback = bit(word, 21);
    if rn == PC || rt == PC || rt2 == PC || rt == 13 || rt2 == 13 {
        return Action::Reject;
    }
    if wback && (rn == rt || rn == rt2) {
        return Action::Reject;
    }
    let load = bit(word, 20);
    let fields = RegFields::new().read(16, word);
    let fields = if load {
        fields.written(12, word).written(8, word)
    } else {
        fields.read(12, word).read(8, word)
    };
    Action::EmuLoadStore(fields)
}

fn block32(word: u32) -> Action {
    let rn = ((word >> 16) & 0xf) as u8;
    let list = (word & 0xffff) as u16;
    let load = bit(word, 20);
    if rn as u32 == PC || list & (1 << 13) != 0 || list.count_ones() < 2 {
        return Action::Reject;
    }
    if !load && list & (1 << 15) != 0 {
        return Action::Reject;
    }
    let increment = (word >> 23) & 0b11 == 0b01;
    Action::EmuMultiple(Block {
        rn,
        list,
        load,
        writeback: bit(word, 21),
        increment,
        before: !increment,
    })
}

fn arith32(word: u32) -> Action {
    // In these spaces field value 15 selects an encoding variant
    // (TST, MOV, MUL, ...), never the PC.
    let mut fields = RegFields::new();
    for shift in [16u8, 8, 0] {
        if (word >> shift) & 0xf != PC {
            fields = fields.read(shift, word);
        }
    }
    if (word >> 12) & 0xf != PC && word & 0xFF00_0000 == 0xFB00_0000 {
        fields = fields.read(12, word);
    }
    Action::EmuArith(fields)
}

fn t32_branch_imm(word: u32) -> u32 {
    let s = (word >> 26) & 1;
    let j1 = (word >> 13) & 1;
    let j2 = (word >> 11) & 1;
    let i1 = !(j1 ^ s) & 1;
    let i2 = !(j2 ^ s) & 1;
    let imm10 = (word >> 16) & 0x3ff;
    let imm11 = word & 0x7ff;
    (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1)
}

fn branch32(word: u32) -> Action {
    let link = bit(word, 14);
    let exchange = !bit(word, 12);
    if exchange && bit(word, 0) {
        // BLX with H=1 is undefined.
        return Action::Reject;
    }
    Action::SimBranch(Branch::Imm {
        offset: sign_extend(t32_branch_imm(word), 25),
        link,
        exchange,
    })
}

fn bcond32(word: u32) -> Action {
    let s = (word >> 26) & 1;
    let imm6 = (word >> 16) & 0x3f;
    let j1 = (word >> 13) & 1;
    let j2 = (word >> 11) & 1;
    let imm11 = word & 0x7ff;
    let imm = (s << 20) | (j2 << 19) | (j1 << 18) | (imm6 << 12) | (imm11 << 1);
    Action::SimBranch(Branch::Imm {
        offset: sign_extend(imm, 21),
        link: false,
        exchange: false,
    })
}

fn adr32(word: u32) -> Action {
    let i = (word >> 26) & 1;
    let imm3 = (word >> 12) & 0x7;
    let imm8 = word & 0xff;
    let rd = ((word >> 8) & 0xf) as u8;
    if rd as u32 == PC || rd == 13 {
        return Action::Reject;
    }
    let imm = ((i << 11) | (imm3 << 8) | imm8) as i64;
    let subtract = bit(word, 23);
    Action::SimAdr {
        rd,
        offset: if subtract { -imm } else { imm },
        page: false,
    }
}

fn ldr_literal32(word: u32) -> Action {
    let rt = ((word >> 12) & 0xf) as u8;
    let signed = bit(word, 24);
    let size_bits = (word >> 21) & 0b11;
    let imm = (word & 0xfff) as i64;
    let offset = if bit(word, 23) { imm } else { -imm };
    match size_bits {
        // PLD/PLI (literal)
        0b00 | 0b01 if rt as u32 == PC => Action::SimNop,
        0b00 | 0b01 => Action::SimLoadLiteral {
            rt,
            offset,
            size: if size_bits == 0 { 1 } else { 2 },
            signed,
        },
        0b10 if !signed => Action::SimLoadLiteral {
            rt,
            offset,
            size: 4,
            signed: false,
        },
        _ => Action::Reject,
    }
}

fn load_store32(word: u32) -> Action {
    let rt = (word >> 12) & 0xf;
    let load = bit(word, 20);
    let size_bits = (word >> 21) & 0b11;
    let imm12_form = bit(word, 23);
    let reg_form = !imm12_form && (word >> 6) & 0x3f == 0;

    if size_bits == 0b11 {
        return Action::Reject;
    }
    if !imm12_form && !reg_form {
        // Imm8 form: P U W bits at 10:8; P=1 U=1 W=0 is unprivileged.
        let puw = (word >> 8) & 0b111;
        if puw == 0b110 {
            return Action::Reject;
        }
        let wback = puw & 1 != 0;
        let rn = (word >> 16) & 0xf;
        if wback && rn == rt {
            return Action::Reject;
        }
    }
    if rt == PC {
        if !load {
            return Action::Reject;
        }
        if size_bits != 0b10 {
            // PLD/PLI
            return Action::SimNop;
        }
    }
    if reg_form && matches!(word & 0xf, 13 | 15) {
        return Action::Reject;
    }

    let fields = RegFields::new().read(16, word);
    let fields = if load {
        fields.written(12, word)
    } else {
        fields.read(12, word)
    };
    let fields = if reg_form { fields.read(0, word) } else { fields };
    Action::EmuLoadStore(fields)
}
