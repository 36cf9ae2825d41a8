//! A64 decode table.

use super::{
    Action, Branch, Cond, CondCheck, DecodeEntry, RegFields, lookup, nop, reject, sign_extend,
};

const TABLE: &[DecodeEntry] = &[
    // NOP, YIELD
    DecodeEntry { mask: 0xFFFF_FFFF, value: 0xD503_201F, decode: nop },
    DecodeEntry { mask: 0xFFFF_FFFF, value: 0xD503_203F, decode: nop },
    // MRS Xt, NZCV
    DecodeEntry { mask: 0xFFFF_FFE0, value: 0xD53B_4200, decode: mrs_nzcv },
    // Remaining system instructions (hints, barriers, MSR, MRS)
    DecodeEntry { mask: 0xFFC0_0000, value: 0xD500_0000, decode: reject },
    // SVC, HVC, SMC, BRK, HLT, DCPS
    DecodeEntry { mask: 0xFF00_0000, value: 0xD400_0000, decode: reject },
    // BR, BLR, RET
    DecodeEntry { mask: 0xFFFF_FC1F, value: 0xD61F_0000, decode: branch_reg },
    DecodeEntry { mask: 0xFFFF_FC1F, value: 0xD63F_0000, decode: branch_reg },
    DecodeEntry { mask: 0xFFFF_FC1F, value: 0xD65F_0000, decode: branch_reg },
    // Other unconditional branch (register): ERET, DRPS, pointer-auth forms
    DecodeEntry { mask: 0xFE00_0000, value: 0xD600_0000, decode: reject },
    // B, BL
    DecodeEntry { mask: 0x7C00_0000, value: 0x1400_0000, decode: branch_imm },
    // B.cond
    DecodeEntry { mask: 0xFF00_0010, value: 0x5400_0000, decode: branch_cond },
    // CBZ/CBNZ
    DecodeEntry { mask: 0x7E00_0000, value: 0x3400_0000, decode: compare_branch },
    // TBZ/TBNZ
    DecodeEntry { mask: 0x7E00_0000, value: 0x3600_0000, decode: test_branch },
    // ADR/ADRP
    DecodeEntry { mask: 0x1F00_0000, value: 0x1000_0000, decode: adr },
    // LDR (literal), LDRSW (literal), PRFM (literal)
    DecodeEntry { mask: 0x3B00_0000, value: 0x1800_0000, decode: load_literal },
    // Load/store exclusive and ordered
    DecodeEntry { mask: 0x3F00_0000, value: 0x0800_0000, decode: reject },
    // Load/store pair
    DecodeEntry { mask: 0x3A00_0000, value: 0x2800_0000, decode: load_store },
    // Remaining load/store
    DecodeEntry { mask: 0x0A00_0000, value: 0x0800_0000, decode: load_store },
    // Data processing (immediate)
    DecodeEntry { mask: 0x1C00_0000, value: 0x1000_0000, decode: arith },
    // Data processing (register)
    DecodeEntry { mask: 0x0E00_0000, value: 0x0A00_0000, decode: arith },
    // SIMD and floating point
    DecodeEntry { mask: 0x0E00_0000, value: 0x0E00_0000, decode: arith },
];

/// Decode one A64 instruction.
pub fn decode(word: u32) -> (Action, CondCheck) {
    let action = lookup(TABLE, word);
    let check = if word & 0xFF00_0010 == 0x5400_0000 {
        CondCheck::Cond(Cond::from_bits(word))
    } else {
        CondCheck::Always
    };
    (action, check)
}

fn mrs_nzcv(word: u32) -> Action {
    Action::SimStatusRead {
        rd: (word & 0x1f) as u8,
    }
}

fn branch_reg(word: u32) -> Action {
    let opc = (word >> 21) & 0xf;
    Action::SimBranch(Branch::Reg {
        rm: ((word >> 5) & 0x1f) as u8,
        link: opc == 0b0001,
        exchange: false,
    })
}

fn branch_imm(word: u32) -> Action {
    Action::SimBranch(Branch::Imm {
        offset: sign_extend((word & 0x03ff_ffff) << 2, 28),
        link: word & 0x8000_0000 != 0,
        exchange: false,
    })
}

fn branch_cond(word: u32) -> Action {
    Action::SimBranch(Branch::Imm {
        offset: sign_extend(((word >> 5) & 0x7ffff) << 2, 21),
        link: false,
        exchange: false,
    })
}

fn compare_branch(word: u32) -> Action {
    Action::SimBranch(Branch::CompareZero {
        rn: (word & 0x1f) as u8,
        offset: sign_extend(((word >> 5) & 0x7ffff) << 2, 21),
        nonzero: word & (1 << 24) != 0,
        wide: word & 0x8000_0000 != 0,
    })
}

fn test_branch(word: u32) -> Action {
    let b5 = (word >> 31) & 1;
    let b40 = (word >> 19) & 0x1f;
    Action::SimBranch(Branch::TestBit {
        rt: (word & 0x1f) as u8,
        bit: ((b5 << 5) | b40) as u8,
        offset: sign_extend(((word >> 5) & 0x3fff) << 2, 16),
        nonzero: word & (1 << 24) != 0,
    })
}

fn adr(word: u32) -> Action {
    let immlo = (word >> 29) & 0b11;
    let immhi = (word >> 5) & 0x7ffff;
    let imm = sign_extend((immhi << 2) | immlo, 21);
    let page = word & 0x8000_0000 != 0;
    Action::SimAdr {
        rd: (word & 0x1f) as u8,
        offset: if page { imm << 12 } else { imm },
        page,
    }
}

fn load_literal(word: u32) -> Action {
    if word & (1 << 26) != 0 {
        // SIMD/FP register destination.
        return Action::Reject;
    }
    let offset = sign_extend(((word >> 5) & 0x7ffff) << 2, 21);
    let rt = (word & 0x1f) as u8;
    match word >> 30 {
        0b00 => Action::SimLoadLiteral { rt, offset, size: 4, signed: false },
        0b01 => Action::SimLoadLiteral { rt, offset, size: 8, signed: false },
        0b10 => Action::SimLoadLiteral { rt, offset, size: 4, signed: true },
        _ => Action::SimNop,
    }
}

fn load_store(_word: u32) -> Action {
    Action::EmuLoadStore(RegFields::new())
}

fn arith(_word: u32) -> Action {
    Action::EmuArith(RegFields::new())
}
