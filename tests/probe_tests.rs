mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axdbi::decode::{Isa, ProbeAddress};
use axdbi::insn_slot::SlotAllocator;
use axdbi::probe::patcher::{ARM_TRAP, THUMB16_TRAP};
use axdbi::probe::{Patcher, ProbeContext, ProbeHandler, ProbeSite};
use axdbi::{ActionHint, Error, ProbeTarget, PtRegs};
use common::{Cpu, EXEC_BASE, MockOps, arm_regs, engine, thumb_regs};

const STOP: u64 = 0x3000;
const STACK_LO: u64 = 0x8000;
const STACK_TOP: u64 = 0x9000;

fn counter() -> (Arc<AtomicUsize>, ProbeHandler) {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let handler: ProbeHandler = Arc::new(move |_: &ProbeContext<'_>, _: &mut PtRegs| {
        h.fetch_add(1, Ordering::Relaxed);
    });
    (hits, handler)
}

fn kernel(addr: u64, isa: Isa) -> ProbeTarget {
    ProbeTarget::Kernel(ProbeAddress::new(addr, isa))
}

// =============================================================================
// Programs
// =============================================================================

/// A32: arithmetic, a literal load, push/pop, MRS, a conditional move and
/// a return through `bx lr`.
const ARM_PROG: u64 = 0x1000;
const ARM_WORDS: &[u32] = &[
    0xE3A0_1005, // mov r1, #5
    0xE081_2101, // add r2, r1, r1, lsl #2
    0xE59F_3004, // ldr r3, [pc, #4]
    0xE92D_400E, // push {r1-r3, lr}
    0xEA00_0000, // b 0x1018
    0xCAFE_BABE, // literal
    0xE8BD_4070, // pop {r4-r6, lr}
    0xE10F_7000, // mrs r7, apsr
    0xE352_0019, // cmp r2, #25
    0x03A0_8001, // moveq r8, #1
    0xE12F_FF1E, // bx lr
];

/// A32: stack round trip and PC writes through `mov pc, ...`.
const ARM_PC_PROG: u64 = 0x1100;
const ARM_PC_WORDS: &[u32] = &[
    0xE24D_D008, // sub sp, sp, #8
    0xE58D_0004, // str r0, [sp, #4]
    0xE59D_1004, // ldr r1, [sp, #4]
    0xE28D_D008, // add sp, sp, #8
    0xEB00_0000, // bl 0x1118
    0xE1A0_F009, // mov pc, r9
    0xE1A0_F00E, // mov pc, lr
];

/// Thumb-16: immediates, push/pop, literal load, hi-register moves from the
/// PC and a return by popping the PC.
const THUMB_PROG: u64 = 0x2000;
const THUMB_HALFWORDS: &[u16] = &[
    0x200A, // movs r0, #10
    0x1CC1, // adds r1, r0, #3
    0xB503, // push {r0, r1, lr}
    0x4A02, // ldr r2, [pc, #8]
    0x467B, // mov r3, pc
    0x4413, // add r3, r2
    0xBC30, // pop {r4, r5}
    0xBD00, // pop {pc}
    0x3344, 0x1122, // literal
];

/// Thumb-16 IT block guarded by `r0 == 0`.
const IT_PROG: u64 = 0x2100;
const IT_HALFWORDS: &[u16] = &[
    0x2800, // cmp r0, #0
    0xBF04, // itt eq
    0x2101, // movs r1, #1
    0x3201, // adds r2, #1
    0x2307, // movs r3, #7
    0x4770, // bx lr
];

/// A32 conditional execution outside an IT block, guarded by `r0 == 0`.
const COND_PROG: u64 = 0x1200;
const COND_WORDS: &[u32] = &[
    0xE350_0000, // cmp r0, #0
    0x03A0_1007, // moveq r1, #7
    0x0A00_0000, // beq 0x1210
    0xE3A0_2003, // mov r2, #3
    0xE12F_FF1E, // bx lr
];

fn load_programs(ops: &MockOps) {
    ops.map_a32(None, ARM_PROG, ARM_WORDS);
    ops.map_a32(None, ARM_PC_PROG, ARM_PC_WORDS);
    ops.map_a32(None, COND_PROG, COND_WORDS);
    ops.map_thumb(None, THUMB_PROG, THUMB_HALFWORDS);
    ops.map_thumb(None, IT_PROG, IT_HALFWORDS);
    ops.map_zero(None, STACK_LO, (STACK_TOP - STACK_LO) as usize);
}

/// Run from `regs` to [`STOP`], optionally with a probe at `probe`.
/// Returns the final registers, the stack contents and the handler hits.
fn run(regs: PtRegs, probe: Option<ProbeAddress>) -> (PtRegs, Vec<u8>, usize) {
    let ops = MockOps::new();
    load_programs(&ops);
    let engine = engine(&ops);
    let (hits, handler) = counter();
    if let Some(addr) = probe {
        engine
            .register_probe(ProbeTarget::Kernel(addr), ActionHint::Auto, handler)
            .unwrap();
    }
    let mut cpu = Cpu::new(&ops, None, regs);
    cpu.run_to(Some(&engine), STOP, 200);
    let stack = ops.bytes(None, STACK_LO, (STACK_TOP - STACK_LO) as usize);
    (cpu.regs, stack, hits.load(Ordering::Relaxed))
}

fn assert_transparent(regs: PtRegs, base: u64, count: usize, step: u64, isa: Isa) {
    let (plain, plain_stack, _) = run(regs, None);
    for i in 0..count as u64 {
        let addr = ProbeAddress::new(base + i * step, isa);
        let (probed, stack, hits) = run(regs, Some(addr));
        assert_eq!(hits, 1, "probe at {:#x} did not fire once", addr.addr);
        assert_eq!(probed, plain, "registers differ with probe at {:#x}", addr.addr);
        assert_eq!(stack, plain_stack, "stack differs with probe at {:#x}", addr.addr);
    }
}

// =============================================================================
// Install / uninstall
// =============================================================================

#[test]
fn install_patches_and_uninstall_restores() {
    let ops = MockOps::new();
    load_programs(&ops);
    let engine = engine(&ops);
    let before = ops.bytes(None, ARM_PROG, 4 * ARM_WORDS.len());

    let (_, handler) = counter();
    let h = engine
        .register_probe(kernel(ARM_PROG + 4, Isa::Arm), ActionHint::Auto, handler)
        .unwrap();
    assert_eq!(ops.u32_at(None, ARM_PROG + 4), ARM_TRAP);
    assert_eq!(engine.installed_sites(), 1);

    let (_, handler) = counter();
    let t = engine
        .register_probe(kernel(THUMB_PROG + 6, Isa::Thumb), ActionHint::Auto, handler)
        .unwrap();
    assert_eq!(ops.u16_at(None, THUMB_PROG + 6), THUMB16_TRAP);

    engine.unregister_probe(h).unwrap();
    engine.unregister_probe(t).unwrap();
    assert_eq!(ops.bytes(None, ARM_PROG, 4 * ARM_WORDS.len()), before);
    assert_eq!(ops.u16_at(None, THUMB_PROG + 6), 0x4A02);
    assert_eq!(engine.installed_sites(), 0);
    assert_eq!(engine.unregister_probe(h), Err(Error::NotFound));
}

#[test]
fn shared_site_stays_until_last_handler() {
    let ops = MockOps::new();
    load_programs(&ops);
    let engine = engine(&ops);
    let target = kernel(ARM_PROG, Isa::Arm);

    let (hits_a, a) = counter();
    let (hits_b, b) = counter();
    let ha = engine.register_probe(target, ActionHint::Auto, a).unwrap();
    let hb = engine.register_probe(target, ActionHint::Auto, b).unwrap();
    assert_eq!(engine.installed_sites(), 1);

    let mut cpu = Cpu::new(&ops, None, arm_regs(ARM_PROG, STACK_TOP));
    cpu.step(Some(&engine));
    assert_eq!(hits_a.load(Ordering::Relaxed), 1);
    assert_eq!(hits_b.load(Ordering::Relaxed), 1);

    engine.unregister_probe(ha).unwrap();
    assert_eq!(ops.u32_at(None, ARM_PROG), ARM_TRAP);
    engine.unregister_probe(hb).unwrap();
    assert_eq!(ops.u32_at(None, ARM_PROG), ARM_WORDS[0]);
}

#[test]
fn conflicting_hint_is_refused() {
    let ops = MockOps::new();
    load_programs(&ops);
    let engine = engine(&ops);
    // b 0x1018 simulates, so either hint installs.
    let target = kernel(ARM_PROG + 0x10, Isa::Arm);

    let (_, a) = counter();
    let (_, b) = counter();
    engine.register_probe(target, ActionHint::SimulateOnly, a).unwrap();
    assert_eq!(
        engine.register_probe(target, ActionHint::Auto, b).err(),
        Some(Error::Conflict)
    );
    let (_, c) = counter();
    assert_eq!(
        engine
            .register_probe(kernel(ARM_PROG + 0x10, Isa::Thumb), ActionHint::SimulateOnly, c)
            .err(),
        Some(Error::Conflict)
    );
}

#[test]
fn simulate_only_refuses_stepped_instruction() {
    let ops = MockOps::new();
    load_programs(&ops);
    let engine = engine(&ops);
    let (_, h) = counter();
    assert_eq!(
        engine
            .register_probe(kernel(ARM_PROG, Isa::Arm), ActionHint::SimulateOnly, h)
            .err(),
        Some(Error::DecodeUnsupported)
    );
    assert_eq!(ops.u32_at(None, ARM_PROG), ARM_WORDS[0]);
}

#[test]
fn rejected_and_misaligned_sites() {
    let ops = MockOps::new();
    load_programs(&ops);
    let engine = engine(&ops);

    let (_, h) = counter();
    assert_eq!(
        engine
            .register_probe(kernel(IT_PROG + 2, Isa::Thumb), ActionHint::Auto, h.clone())
            .err(),
        Some(Error::DecodeUnsupported)
    );
    assert_eq!(
        engine
            .register_probe(kernel(ARM_PROG + 2, Isa::Arm), ActionHint::Auto, h)
            .err(),
        Some(Error::Misaligned)
    );
    assert_eq!(engine.installed_sites(), 0);
}

#[test]
fn write_failure_leaves_text_untouched() {
    let ops = MockOps::new();
    load_programs(&ops);
    ops.protect(None, ARM_PROG, ARM_PROG + 0x100);
    let engine = engine(&ops);

    let (_, h) = counter();
    assert_eq!(
        engine
            .register_probe(kernel(ARM_PROG, Isa::Arm), ActionHint::Auto, h)
            .err(),
        Some(Error::MemoryFault)
    );
    assert_eq!(ops.u32_at(None, ARM_PROG), ARM_WORDS[0]);
    assert_eq!(engine.installed_sites(), 0);
}

#[test]
fn failed_restore_keeps_site_installed() {
    let ops = MockOps::new();
    load_programs(&ops);
    let slots = SlotAllocator::new(8);
    let patcher = Patcher::new(&*ops, &slots);
    let addr = ProbeAddress::new(ARM_PC_PROG + 8, Isa::Arm);
    let mut site = ProbeSite::new(addr, None, None, ActionHint::Auto);
    patcher.install(&mut site).unwrap();
    assert_eq!(slots.used(None), 1);

    ops.protect(None, ARM_PC_PROG, ARM_PC_PROG + 0x100);
    assert_eq!(patcher.restore(&site), Err(Error::MemoryFault));
    assert!(site.installed);
    assert!(site.copy.is_some());
    assert_eq!(ops.u32_at(None, ARM_PC_PROG + 8), ARM_TRAP);
    assert_eq!(slots.used(None), 1);

    // Uninstalling is best effort and always lets go of the slot.
    patcher.uninstall(&mut site).unwrap();
    assert!(!site.installed);
    assert_eq!(slots.used(None), 0);
}

#[test]
fn unmapped_text_is_a_memory_fault() {
    let ops = MockOps::new();
    load_programs(&ops);
    let engine = engine(&ops);
    let (_, h) = counter();
    assert_eq!(
        engine
            .register_probe(kernel(0xdead_0000, Isa::Arm), ActionHint::Auto, h)
            .err(),
        Some(Error::MemoryFault)
    );
}

// =============================================================================
// Execution equivalence
// =============================================================================

#[test]
fn arm_probes_are_transparent() {
    let mut regs = arm_regs(ARM_PROG, STACK_TOP);
    regs.set_a32(14, STOP as u32);
    let (plain, plain_stack, _) = run(regs, None);
    assert_eq!(plain.regs[3], 0xCAFE_BABE);
    assert_eq!(plain.regs[8], 1);

    // Every instruction; the literal at +0x14 is branched over.
    for offset in [0x0u64, 0x4, 0x8, 0xC, 0x10, 0x18, 0x1C, 0x20, 0x24, 0x28] {
        let addr = ProbeAddress::new(ARM_PROG + offset, Isa::Arm);
        let (probed, stack, hits) = run(regs, Some(addr));
        assert_eq!(hits, 1, "probe at {:#x}", addr.addr);
        assert_eq!(probed, plain, "registers differ with probe at {:#x}", addr.addr);
        assert_eq!(stack, plain_stack);
    }
}

#[test]
fn arm_pc_writes_are_transparent() {
    let mut regs = arm_regs(ARM_PC_PROG, STACK_TOP);
    regs.regs[0] = 0x1234_5678;
    regs.regs[9] = STOP as u32 as u64;
    let (plain, _, _) = run(regs, None);
    assert_eq!(plain.regs[1], 0x1234_5678);
    assert_eq!(plain.sp, STACK_TOP);

    assert_transparent(regs, ARM_PC_PROG, ARM_PC_WORDS.len(), 4, Isa::Arm);
}

#[test]
fn thumb_probes_are_transparent() {
    let mut regs = thumb_regs(THUMB_PROG, STACK_TOP);
    regs.set_a32(14, (STOP | 1) as u32);
    let (plain, _, _) = run(regs, None);
    assert!(plain.is_thumb());
    assert_eq!(plain.regs[2], 0x1122_3344);
    assert_eq!(plain.regs[3], 0x1122_3344 + 0x200C);
    assert_eq!((plain.regs[4], plain.regs[5]), (10, 13));

    // Eight instructions, then the literal.
    assert_transparent(regs, THUMB_PROG, 8, 2, Isa::Thumb);
}

#[test]
fn thumb_return_to_arm_is_transparent() {
    let mut regs = thumb_regs(THUMB_PROG, STACK_TOP);
    regs.set_a32(14, STOP as u32);
    let (plain, _, _) = run(regs, None);
    assert!(!plain.is_thumb());
    let (probed, _, _) = run(regs, Some(ProbeAddress::new(THUMB_PROG + 14, Isa::Thumb)));
    assert_eq!(probed, plain);
}

#[test]
fn it_block_skips_when_condition_fails() {
    for r0 in [0u64, 5] {
        let mut regs = thumb_regs(IT_PROG, STACK_TOP);
        regs.regs[0] = r0;
        regs.regs[2] = 40;
        regs.set_a32(14, (STOP | 1) as u32);
        let (plain, _, _) = run(regs, None);
        if r0 == 0 {
            assert_eq!((plain.regs[1], plain.regs[2]), (1, 41));
        } else {
            assert_eq!((plain.regs[1], plain.regs[2]), (0, 40));
        }
        assert_eq!(plain.regs[3], 7);
        assert_eq!(plain.itstate(), 0);

        for offset in [4u64, 6, 8] {
            let (probed, _, hits) = run(regs, Some(ProbeAddress::new(IT_PROG + offset, Isa::Thumb)));
            assert_eq!(hits, 1);
            assert_eq!(probed, plain, "r0={} probe at +{}", r0, offset);
        }
    }
}

#[test]
fn arm_condition_failure_is_transparent() {
    for r0 in [0u64, 5] {
        let mut regs = arm_regs(COND_PROG, STACK_TOP);
        regs.regs[0] = r0;
        regs.set_a32(14, STOP as u32);
        let (plain, _, _) = run(regs, None);
        if r0 == 0 {
            assert_eq!((plain.regs[1], plain.regs[2]), (7, 0));
        } else {
            assert_eq!((plain.regs[1], plain.regs[2]), (0, 3));
        }

        // Handlers run on every hit, whether or not the condition passes.
        for offset in [0x0u64, 0x4, 0x8, 0xC, 0x10] {
            let addr = ProbeAddress::new(COND_PROG + offset, Isa::Arm);
            let (probed, _, hits) = run(regs, Some(addr));
            if r0 == 0 && offset == 0xC {
                assert_eq!(hits, 0, "mov r2 is branched over");
            } else {
                assert_eq!(hits, 1, "r0={} at +{:#x}", r0, offset);
            }
            assert_eq!(probed, plain, "r0={} at +{:#x}", r0, offset);
        }
    }
}

#[test]
fn kernel_mode_mrs_reads_full_cpsr() {
    const SVC_CPSR: u64 = 0x6000_01D3;
    let mut regs = arm_regs(ARM_PROG, STACK_TOP);
    regs.pstate = SVC_CPSR;
    regs.set_a32(14, STOP as u32);
    let (plain, _, _) = run(regs, None);
    assert_eq!(plain.regs[7], SVC_CPSR);

    for offset in [0x1Cu64, 0x20, 0x24] {
        let (probed, _, hits) = run(regs, Some(ProbeAddress::new(ARM_PROG + offset, Isa::Arm)));
        assert_eq!(hits, 1);
        assert_eq!(probed, plain, "site at +{:#x}", offset);
    }
}

#[test]
fn unregister_while_stepping_keeps_slot() {
    const FIRST_SLOT: u64 = EXEC_BASE + 0x10;
    const SECOND_SLOT: u64 = EXEC_BASE + 0x20;
    let ops = MockOps::new();
    load_programs(&ops);
    ops.map(None, STACK_TOP - 4, &0xABCDu32.to_le_bytes());
    let engine = engine(&ops);

    let (_, h) = counter();
    let load = engine
        .register_probe(kernel(ARM_PC_PROG + 8, Isa::Arm), ActionHint::Auto, h)
        .unwrap();
    let mut cpu = Cpu::new(&ops, None, arm_regs(ARM_PC_PROG + 8, STACK_TOP - 8));
    cpu.step(Some(&engine));
    assert_eq!(cpu.regs.pc, FIRST_SLOT);

    // The thread is parked in the slot of the site going away.
    engine.unregister_probe(load).unwrap();
    assert_eq!(ops.u32_at(None, ARM_PC_PROG + 8), ARM_PC_WORDS[2]);
    let (_, h) = counter();
    engine
        .register_probe(kernel(ARM_PC_PROG + 4, Isa::Arm), ActionHint::Auto, h)
        .unwrap();
    assert_eq!(ops.u32_at(None, FIRST_SLOT), ARM_PC_WORDS[2]);
    assert_eq!(ops.u32_at(None, SECOND_SLOT), ARM_PC_WORDS[1]);

    cpu.run_to(Some(&engine), ARM_PC_PROG + 0xC, 4);
    assert_eq!(cpu.regs.regs[1], 0xABCD);
    assert_eq!(cpu.regs.sp, STACK_TOP - 8);

    // Once the step is over the slot is handed out again.
    let (_, h) = counter();
    engine
        .register_probe(kernel(ARM_PC_PROG + 0xC, Isa::Arm), ActionHint::Auto, h)
        .unwrap();
    assert_eq!(ops.u32_at(None, FIRST_SLOT), ARM_PC_WORDS[3]);
}

#[test]
fn handler_redirect_skips_instruction() {
    let ops = MockOps::new();
    load_programs(&ops);
    let engine = engine(&ops);
    let handler: ProbeHandler = Arc::new(|_: &ProbeContext<'_>, regs: &mut PtRegs| {
        regs.regs[0] = 99;
        regs.pc = STOP;
    });
    engine
        .register_probe(kernel(ARM_PROG, Isa::Arm), ActionHint::Auto, handler)
        .unwrap();

    let mut cpu = Cpu::new(&ops, None, arm_regs(ARM_PROG, STACK_TOP));
    cpu.run_to(Some(&engine), STOP, 4);
    assert_eq!(cpu.regs.regs[0], 99);
    assert_eq!(cpu.regs.regs[1], 0);
}

#[test]
fn listing_reports_hits() {
    let ops = MockOps::new();
    load_programs(&ops);
    let engine = engine(&ops);
    let (_, h) = counter();
    engine
        .register_probe(kernel(ARM_PROG, Isa::Arm), ActionHint::Auto, h)
        .unwrap();
    let mut cpu = Cpu::new(&ops, None, arm_regs(ARM_PROG, STACK_TOP));
    cpu.step(Some(&engine));
    cpu.step(Some(&engine));

    let flat = engine.list_probes_flat();
    assert_eq!(flat, vec![(None, ARM_PROG, 1, false, 0)]);
    let listing = engine.list_probes();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].handlers, 1);
}
