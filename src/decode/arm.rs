//! A32 decode tables.

use super::{
    Action, Block, Branch, Cond, CondCheck, DecodeEntry, RegFields, lookup, nop, reject,
    sign_extend,
};

const PC: u32 = 15;

fn field(word: u32, shift: u32) -> u32 {
    (word >> shift) & 0xf
}

fn bit(word: u32, n: u32) -> bool {
    word & (1 << n) != 0
}

/// Unconditional space (`cond == 0b1111`).
const UNCOND_TABLE: &[DecodeEntry] = &[
    // PLD/PLI (immediate and register)
    DecodeEntry { mask: 0xFD70_F000, value: 0xF550_F000, decode: nop },
    DecodeEntry { mask: 0xFD70_F000, value: 0xF450_F000, decode: nop },
    // BLX (immediate)
    DecodeEntry { mask: 0xFE00_0000, value: 0xFA00_0000, decode: blx_imm },
];

const TABLE: &[DecodeEntry] = &[
    // NOP, YIELD
    DecodeEntry { mask: 0x0FFF_FFFF, value: 0x0320_F000, decode: nop },
    DecodeEntry { mask: 0x0FFF_FFFF, value: 0x0320_F001, decode: nop },
    // MRS Rd, CPSR
    DecodeEntry { mask: 0x0FFF_0FFF, value: 0x010F_0000, decode: mrs },
    // BX / BLX (register)
    DecodeEntry { mask: 0x0FFF_FFF0, value: 0x012F_FF10, decode: bx },
    DecodeEntry { mask: 0x0FFF_FFF0, value: 0x012F_FF30, decode: bx },
    // CLZ
    DecodeEntry { mask: 0x0FFF_0FF0, value: 0x016F_0F10, decode: clz },
    // QADD/QSUB/QDADD/QDSUB
    DecodeEntry { mask: 0x0F90_0FF0, value: 0x0100_0050, decode: three_reg_no_pc },
    // Halfword multiplies
    DecodeEntry { mask: 0x0F90_0090, value: 0x0100_0080, decode: multiply },
    // MSR (immediate) and remaining hints
    DecodeEntry { mask: 0x0FB0_0000, value: 0x0320_0000, decode: reject },
    // Remaining miscellaneous: MSR/MRS banked, BXJ, BKPT, SMC, HVC, ERET
    DecodeEntry { mask: 0x0F90_0080, value: 0x0100_0000, decode: reject },
    // SWP/SWPB
    DecodeEntry { mask: 0x0FB0_0FF0, value: 0x0100_0090, decode: reject },
    // LDREX/STREX family
    DecodeEntry { mask: 0x0F80_00F0, value: 0x0180_0090, decode: reject },
    // MUL/MLA/UMULL/...
    DecodeEntry { mask: 0x0F00_00F0, value: 0x0000_0090, decode: multiply },
    // Unallocated synchronization primitive encodings
    DecodeEntry { mask: 0x0F00_00F0, value: 0x0100_0090, decode: reject },
    // Extra load/store (halfword, signed byte, dual)
    DecodeEntry { mask: 0x0E00_0090, value: 0x0000_0090, decode: extra_load_store },
    // Data-processing (register-shifted register)
    DecodeEntry { mask: 0x0E00_0090, value: 0x0000_0010, decode: data_processing_rsr },
    // Data-processing (register, immediate)
    DecodeEntry { mask: 0x0E00_0010, value: 0x0000_0000, decode: data_processing },
    DecodeEntry { mask: 0x0E00_0000, value: 0x0200_0000, decode: data_processing },
    // UDF (includes the probe trap opcodes)
    DecodeEntry { mask: 0x0FF0_00F0, value: 0x07F0_00F0, decode: reject },
    // Media instructions
    DecodeEntry { mask: 0x0E00_0010, value: 0x0600_0010, decode: media },
    // LDR/STR/LDRB/STRB
    DecodeEntry { mask: 0x0C00_0000, value: 0x0400_0000, decode: load_store },
    // B/BL
    DecodeEntry { mask: 0x0E00_0000, value: 0x0A00_0000, decode: branch },
    // SVC
    DecodeEntry { mask: 0x0F00_0000, value: 0x0F00_0000, decode: reject },
    // LDM/STM
    DecodeEntry { mask: 0x0E00_0000, value: 0x0800_0000, decode: block_transfer },
    // Coprocessor
    DecodeEntry { mask: 0x0C00_0000, value: 0x0C00_0000, decode: reject },
];

/// Decode one A32 instruction.
pub fn decode(word: u32) -> (Action, CondCheck) {
    let cond = word >> 28;
    if cond == 0xf {
        return (lookup(UNCOND_TABLE, word), CondCheck::Always);
    }
    let check = if cond == Cond::Al as u32 {
        CondCheck::Always
    } else {
        CondCheck::Cond(Cond::from_bits(cond))
    };
    (lookup(TABLE, word), check)
}

fn blx_imm(word: u32) -> Action {
    let h = (word >> 24) & 1;
    let imm = ((word & 0x00ff_ffff) << 2) | (h << 1);
    Action::SimBranch(Branch::Imm {
        offset: sign_extend(imm, 26),
        link: true,
        exchange: true,
    })
}

fn branch(word: u32) -> Action {
    let imm = (word & 0x00ff_ffff) << 2;
    Action::SimBranch(Branch::Imm {
        offset: sign_extend(imm, 26),
        link: bit(word, 24),
        exchange: false,
    })
}

fn mrs(word: u32) -> Action {
    let rd = field(word, 12);
    if rd == PC {
        return Action::Reject;
    }
    Action::SimStatusRead { rd: rd as u8 }
}

fn bx(word: u32) -> Action {
    let rm = field(word, 0);
    let link = bit(word, 5);
    if link && rm == PC {
        return Action::Reject;
    }
    Action::SimBranch(Branch::Reg {
        rm: rm as u8,
        link,
        exchange: true,
    })
}

fn clz(word: u32) -> Action {
    if field(word, 12) == PC || field(word, 0) == PC {
        return Action::Reject;
    }
    Action::EmuArith(RegFields::new().written(12, word).read(0, word))
}

fn three_reg_no_pc(word: u32) -> Action {
    if field(word, 16) == PC || field(word, 12) == PC || field(word, 0) == PC {
        return Action::Reject;
    }
    Action::EmuArith(RegFields::new().read(16, word).written(12, word).read(0, word))
}

fn multiply(word: u32) -> Action {
    if [16, 12, 8, 0].iter().any(|&s| field(word, s) == PC) {
        return Action::Reject;
    }
    Action::EmuArith(
        RegFields::new()
            .written(16, word)
            .written(12, word)
            .read(8, word)
            .read(0, word),
    )
}

fn data_processing_rsr(word: u32) -> Action {
    if [16, 12, 8, 0].iter().any(|&s| field(word, s) == PC) {
        return Action::Reject;
    }
    Action::EmuArith(
        RegFields::new()
            .read(16, word)
            .written(12, word)
            .read(8, word)
            .read(0, word),
    )
}

fn data_processing(word: u32) -> Action {
    let imm = bit(word, 25);
    let opcode = (word >> 21) & 0xf;
    let s = bit(word, 20);

    // MOVW/MOVT occupy the TST/CMP slots with S clear.
    if imm && !s && (opcode == 0b1000 || opcode == 0b1010) {
        if field(word, 12) == PC {
            return Action::Reject;
        }
        let fields = RegFields::new().written(12, word);
        let fields = if opcode == 0b1010 {
            // MOVT keeps the low half, so Rd is read too.
            fields.read(12, word)
        } else {
            fields
        };
        return Action::EmuArith(fields);
    }
    if !s && (opcode >> 2) == 0b10 {
        // Miscellaneous space already handled by earlier rows.
        return Action::Reject;
    }

    let has_rn = opcode != 0b1101 && opcode != 0b1111;
    let has_rd = !(opcode >> 2 == 0b10);
    let rd = field(word, 12);

    if has_rd && rd == PC && s {
        // SUBS PC, LR and friends return from exceptions.
        return Action::Reject;
    }

    let mut fields = RegFields::new();
    if has_rn {
        fields = fields.read(16, word);
    }
    if has_rd {
        fields = fields.written(12, word);
    }
    if !imm {
        fields = fields.read(0, word);
    }
    Action::EmuArith(fields)
}

fn media(word: u32) -> Action {
    // Field value 15 selects encoding variants here, never the PC, so
    // nothing is substituted; all fields still block scratch selection.
    let mut fields = RegFields::new();
    for shift in [16u8, 12, 8, 0] {
        let reg = field(word, shift as u32);
        if reg != PC {
            fields = fields.read(shift, word);
        }
    }
    if field(word, 16) == PC && field(word, 12) == PC {
        return Action::Reject;
    }
    Action::EmuArith(fields)
}

fn load_store(word: u32) -> Action {
    let reg_offset = bit(word, 25);
    let pre = bit(word, 24);
    let wback = bit(word, 21);
    let load = bit(word, 20);
    let rn = field(word, 16);
    let rt = field(word, 12);

    if !pre && wback {
        // LDRT/STRT: unprivileged access.
        return Action::Reject;
    }
    let writeback = !pre || wback;
    if writeback && (rn == PC || rn == rt) {
        return Action::Reject;
    }
    if reg_offset && field(word, 0) == PC {
        return Action::Reject;
    }
    if load && rt == PC && bit(word, 22) {
        // LDRB into PC.
        return Action::Reject;
    }

    let mut fields = RegFields::new().read(16, word);
    fields = if load {
        fields.written(12, word)
    } else {
        fields.read(12, word)
    };
    if reg_offset {
        fields = fields.read(0, word);
    }
    Action::EmuLoadStore(fields)
}

fn extra_load_store(word: u32) -> Action {
    let pre = bit(word, 24);
    let imm = bit(word, 22);
    let wback = bit(word, 21);
    let load = bit(word, 20);
    let op2 = (word >> 5) & 0b11;
    let rn = field(word, 16);
    let rt = field(word, 12);
    let rm = field(word, 0);

    let writeback = !pre || wback;
    if !pre && wback {
        return Action::Reject;
    }
    if rt == PC || (writeback && (rn == PC || rn == rt)) || (!imm && rm == PC) {
        return Action::Reject;
    }

    let dual = !load && op2 >= 0b10;
    let dual_load = dual && op2 == 0b10;
    let mut fields = RegFields::new().read(16, word);
    if dual {
        if rt & 1 != 0 || rt == 14 {
            return Action::Reject;
        }
        fields = fields.with_implicit((rt + 1) as u8);
    }
    fields = if load || dual_load {
        fields.written(12, word)
    } else {
        fields.read(12, word)
    };
    if !imm {
        fields = fields.read(0, word);
    }
    Action::EmuLoadStore(fields)
}

fn block_transfer(word: u32) -> Action {
    let rn = field(word, 16);
    let list = (word & 0xffff) as u16;
    let user_regs = bit(word, 22);
    if rn == PC || list == 0 || user_regs {
        return Action::Reject;
    }
    Action::EmuMultiple(Block {
        rn: rn as u8,
        list,
        load: bit(word, 20),
        writeback: bit(word, 21),
        increment: bit(word, 23),
        before: bit(word, 24),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Category;

    fn action(word: u32) -> Action {
        decode(word).0
    }

    #[test]
    fn nop_and_mrs_are_simulated() {
        assert_eq!(action(0xE320_F000), Action::SimNop);
        assert_eq!(action(0xE10F_3000), Action::SimStatusRead { rd: 3 });
    }

    #[test]
    fn unallocated_sync_space_is_rejected() {
        assert_eq!(action(0x0120_0090), Action::Reject);
        assert_eq!(action(0xE160_1092), Action::Reject);
        // ldrh r1, [r2] still decodes
        assert_eq!(action(0xE1D2_10B0).category(), Category::EmulateLoadStore);
    }

    #[test]
    fn bl_offset_is_sign_extended() {
        // bl .-8 : imm24 = 0xfffffc -> -16 relative to PC (addr + 8)
        match action(0xEBFF_FFFC) {
            Action::SimBranch(Branch::Imm { offset, link, exchange }) => {
                assert_eq!(offset, -16);
                assert!(link);
                assert!(!exchange);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn conditional_branch_carries_condition() {
        // bne +0
        let (a, check) = decode(0x1A00_0000);
        assert_eq!(a.category(), Category::SimulateBranch);
        assert_eq!(check, CondCheck::Cond(Cond::Ne));
    }

    #[test]
    fn pc_relative_load_is_emulated_with_pc_field() {
        // ldr r0, [pc, #8]
        match action(0xE59F_0008) {
            Action::EmuLoadStore(fields) => {
                assert!(fields.uses_pc());
                assert!(!fields.writes_pc());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn mov_pc_lr_writes_pc() {
        match action(0xE1A0_F00E) {
            Action::EmuArith(fields) => assert!(fields.writes_pc()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejected_classes() {
        assert_eq!(action(0xEF00_0000), Action::Reject); // svc #0
        assert_eq!(action(0xE120_0070), Action::Reject); // bkpt
        assert_eq!(action(0xE7F0_01F8), Action::Reject); // probe trap
        assert_eq!(action(0xE190_0F9F), Action::Reject); // ldrex
        assert_eq!(action(0xE129_F000), Action::Reject); // msr cpsr_fc, r0
        assert_eq!(action(0xEE10_0F10), Action::Reject); // mrc
        assert_eq!(action(0xE1B0_F00E), Action::Reject); // movs pc, lr
    }

    #[test]
    fn push_is_block_transfer() {
        // push {r4, lr} == stmdb sp!, {r4, lr}
        match action(0xE92D_4010) {
            Action::EmuMultiple(b) => {
                assert_eq!(b.rn, 13);
                assert_eq!(b.list, 0x4010);
                assert!(!b.load && b.writeback && !b.increment && b.before);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ldrd_reserves_pair_register() {
        // ldrd r2, r3, [r0]
        match action(0xE1C0_20D0) {
            Action::EmuLoadStore(fields) => {
                assert!(fields.uses(2));
                assert!(fields.uses(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
