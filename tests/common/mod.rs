//! Shared test fixtures: an in-memory host and a small reference CPU.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axdbi::decode::cond::{Cond, CondCheck};
use axdbi::decode::thumb::is_wide;
use axdbi::probe::handler::{TrapKind, classify_aarch32, dispatch_trap};
use axdbi::regs::{A32_LR, A32_PC, A32_SP, PSR_C, PSR_N, PSR_V, PSR_Z};
use axdbi::{AuxiliaryOps, Control, Engine, EngineConfig, FileId, Pid, PtRegs, TrapContext};
use axerrno::AxResult;

/// Base of the first out-of-line area handed out.
pub const EXEC_BASE: u64 = 0x7000_0000;
const EXEC_STRIDE: u64 = 0x1_0000;

type Space = Option<Pid>;

/// Sparse byte-addressed memory per address space.
pub struct MockOps {
    mem: Mutex<HashMap<Space, BTreeMap<u64, u8>>>,
    bases: Mutex<HashMap<(Pid, FileId), u64>>,
    readonly: Mutex<Vec<(Space, u64, u64)>>,
    next_exec: AtomicU64,
    pub flushes: AtomicUsize,
    pub exec_areas: AtomicUsize,
}

impl MockOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mem: Mutex::new(HashMap::new()),
            bases: Mutex::new(HashMap::new()),
            readonly: Mutex::new(Vec::new()),
            next_exec: AtomicU64::new(EXEC_BASE),
            flushes: AtomicUsize::new(0),
            exec_areas: AtomicUsize::new(0),
        })
    }

    pub fn map(&self, space: Space, addr: u64, bytes: &[u8]) {
        let mut mem = self.mem.lock().unwrap();
        let space = mem.entry(space).or_default();
        for (i, b) in bytes.iter().enumerate() {
            space.insert(addr + i as u64, *b);
        }
    }

    /// Map zeroed memory.
    pub fn map_zero(&self, space: Space, addr: u64, len: usize) {
        self.map(space, addr, &vec![0u8; len]);
    }

    pub fn map_a32(&self, space: Space, addr: u64, words: &[u32]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.map(space, addr, &bytes);
    }

    pub fn map_thumb(&self, space: Space, addr: u64, halfwords: &[u16]) {
        let bytes: Vec<u8> = halfwords.iter().flat_map(|h| h.to_le_bytes()).collect();
        self.map(space, addr, &bytes);
    }

    pub fn unmap(&self, space: Space, addr: u64, len: u64) {
        if let Some(m) = self.mem.lock().unwrap().get_mut(&space) {
            let keys: Vec<u64> = m.range(addr..addr + len).map(|(k, _)| *k).collect();
            for k in keys {
                m.remove(&k);
            }
        }
    }

    pub fn drop_space(&self, pid: Pid) {
        self.mem.lock().unwrap().remove(&Some(pid));
    }

    pub fn bytes(&self, space: Space, addr: u64, len: usize) -> Vec<u8> {
        let mem = self.mem.lock().unwrap();
        let m = &mem[&space];
        (0..len as u64).map(|i| m[&(addr + i)]).collect()
    }

    pub fn u32_at(&self, space: Space, addr: u64) -> u32 {
        u32::from_le_bytes(self.bytes(space, addr, 4).try_into().unwrap())
    }

    pub fn u16_at(&self, space: Space, addr: u64) -> u16 {
        u16::from_le_bytes(self.bytes(space, addr, 2).try_into().unwrap())
    }

    pub fn set_image_base(&self, pid: Pid, file: FileId, base: u64) {
        self.bases.lock().unwrap().insert((pid, file), base);
    }

    /// Make text writes to `[lo, hi)` fail.
    pub fn protect(&self, space: Space, lo: u64, hi: u64) {
        self.readonly.lock().unwrap().push((space, lo, hi));
    }

    fn read(&self, space: Space, addr: u64, buf: &mut [u8]) -> AxResult<()> {
        let mem = self.mem.lock().unwrap();
        let m = mem
            .get(&space)
            .ok_or_else(|| axerrno::ax_err_type!(NotFound, "no address space"))?;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = *m
                .get(&(addr + i as u64))
                .ok_or_else(|| axerrno::ax_err_type!(NotFound, "page not resident"))?;
        }
        Ok(())
    }

    fn write(&self, space: Space, addr: u64, data: &[u8]) -> AxResult<()> {
        let mut mem = self.mem.lock().unwrap();
        let m = mem
            .get_mut(&space)
            .ok_or_else(|| axerrno::ax_err_type!(NotFound, "no address space"))?;
        let end = addr + data.len() as u64;
        if m.range(addr..end).count() != data.len() {
            return Err(axerrno::ax_err_type!(NotFound, "page not resident"));
        }
        for (i, b) in data.iter().enumerate() {
            m.insert(addr + i as u64, *b);
        }
        Ok(())
    }
}

impl AuxiliaryOps for MockOps {
    fn read_text(&self, pid: Option<Pid>, addr: u64, buf: &mut [u8]) -> AxResult<()> {
        self.read(pid, addr, buf)
    }

    fn write_text(&self, pid: Option<Pid>, addr: u64, data: &[u8]) -> AxResult<()> {
        let end = addr + data.len() as u64;
        let blocked = self
            .readonly
            .lock()
            .unwrap()
            .iter()
            .any(|(s, lo, hi)| *s == pid && addr < *hi && end > *lo);
        if blocked {
            return Err(axerrno::ax_err_type!(PermissionDenied, "read-only text"));
        }
        self.write(pid, addr, data)
    }

    fn flush_icache(&self, _pid: Option<Pid>, _start: u64, _end: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn read_data(&self, pid: Option<Pid>, addr: u64, buf: &mut [u8]) -> AxResult<()> {
        self.read(pid, addr, buf)
    }

    fn write_data(&self, pid: Option<Pid>, addr: u64, data: &[u8]) -> AxResult<()> {
        self.write(pid, addr, data)
    }

    fn alloc_exec_memory(&self, pid: Option<Pid>, len: usize) -> Option<u64> {
        let base = self.next_exec.fetch_add(EXEC_STRIDE, Ordering::Relaxed);
        self.map_zero(pid, base, len);
        self.exec_areas.fetch_add(1, Ordering::Relaxed);
        Some(base)
    }

    fn free_exec_memory(&self, pid: Option<Pid>, base: u64, len: usize) {
        self.unmap(pid, base, len as u64);
        self.exec_areas.fetch_sub(1, Ordering::Relaxed);
    }

    fn image_base(&self, pid: Pid, file: FileId) -> Option<u64> {
        self.bases.lock().unwrap().get(&(pid, file)).copied()
    }
}

pub fn engine(ops: &Arc<MockOps>) -> Engine {
    engine_with(ops, EngineConfig::default())
}

pub fn engine_with(ops: &Arc<MockOps>, config: EngineConfig) -> Engine {
    Engine::new(config, ops.clone()).unwrap()
}

// =============================================================================
// Reference CPU
// =============================================================================

/// APSR bits visible to MRS in User mode.
const APSR_MASK: u64 = 0xF80F_0000;
/// Execution state bits (IT, J, T) that privileged MRS reads as zero.
const EXEC_STATE_BITS: u64 = 0x0700_FC20;

/// What `MRS Rd, CPSR` returns on hardware for this PSR.
pub fn mrs_on_hardware(pstate: u64) -> u32 {
    let mode = pstate & 0x1f;
    let privileged = mode & 0x10 != 0 && mode != 0x10;
    if privileged {
        (pstate & !EXEC_STATE_BITS & 0xffff_ffff) as u32
    } else {
        (pstate & APSR_MASK) as u32
    }
}

fn add_with_carry(x: u32, y: u32, carry: bool) -> (u32, bool, bool) {
    let wide = x as u64 + y as u64 + carry as u64;
    let result = wide as u32;
    let c = wide >> 32 != 0;
    let v = ((x ^ result) & (y ^ result)) >> 31 != 0;
    (result, c, v)
}

fn sext(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    (((value as u64) << shift) as i64) >> shift
}

/// Interprets the A32 and Thumb-16 subset used by the tests, directly on
/// [`MockOps`] memory. Probe traps are handed to the engine.
pub struct Cpu<'a> {
    pub ops: &'a MockOps,
    pub space: Space,
    pub tid: u32,
    pub regs: PtRegs,
    pub traps: usize,
}

impl<'a> Cpu<'a> {
    pub fn new(ops: &'a MockOps, space: Space, regs: PtRegs) -> Self {
        Self {
            ops,
            space,
            tid: 1,
            regs,
            traps: 0,
        }
    }

    fn ctx(&self) -> TrapContext {
        match self.space {
            Some(pid) => TrapContext::user(pid, self.tid),
            None => TrapContext::kernel(self.tid),
        }
    }

    /// Run until the PC reaches `stop`. Panics after `limit` instructions.
    pub fn run_to(&mut self, engine: Option<&Engine>, stop: u64, limit: usize) {
        for _ in 0..limit {
            if self.regs.pc == stop {
                return;
            }
            self.step(engine);
        }
        panic!("did not reach {:#x}, pc {:#x}", stop, self.regs.pc);
    }

    /// Execute one instruction or hand one trap to `engine`.
    pub fn step(&mut self, engine: Option<&Engine>) {
        self.step_with(|ctx, kind, regs| {
            let engine = engine.unwrap_or_else(|| panic!("trap at {:#x} with no engine", regs.pc));
            dispatch_trap(engine, ctx, kind, regs)
        });
    }

    /// Like [`Cpu::run_to`], with traps going through the on/off switch.
    pub fn run_to_control(&mut self, control: &Control, stop: u64, limit: usize) {
        for _ in 0..limit {
            if self.regs.pc == stop {
                return;
            }
            self.step_with(|ctx, kind, regs| control.dispatch_trap(ctx, kind, regs));
        }
        panic!("did not reach {:#x}, pc {:#x}", stop, self.regs.pc);
    }

    fn step_with(&mut self, trap: impl FnOnce(TrapContext, TrapKind, &mut PtRegs) -> bool) {
        let pc = self.regs.pc;
        let raw = if self.regs.is_thumb() {
            let hw1 = self.ops.u16_at(self.space, pc);
            if is_wide(hw1) {
                ((hw1 as u32) << 16) | self.ops.u16_at(self.space, pc + 2) as u32
            } else {
                hw1 as u32
            }
        } else {
            self.ops.u32_at(self.space, pc)
        };

        if let Some(kind) = classify_aarch32(raw) {
            let ctx = self.ctx();
            assert!(trap(ctx, kind, &mut self.regs), "unclaimed trap at {:#x}", pc);
            self.traps += 1;
            return;
        }

        if self.regs.is_thumb() {
            self.exec_thumb(raw as u16);
        } else {
            self.exec_arm(raw);
        }
    }

    fn a32_read(&self, n: u8, pc_offset: u64) -> u32 {
        if n == A32_PC {
            (self.regs.pc + pc_offset) as u32
        } else {
            self.regs.a32(n)
        }
    }

    fn load(&self, addr: u32) -> u32 {
        self.ops.u32_at(self.space, addr as u64)
    }

    fn store(&self, addr: u32, value: u32) {
        self.ops
            .write_data(self.space, addr as u64, &value.to_le_bytes())
            .unwrap();
    }

    fn set_nz(&mut self, result: u32) {
        self.regs.pstate &= !(PSR_N | PSR_Z);
        if result & 0x8000_0000 != 0 {
            self.regs.pstate |= PSR_N;
        }
        if result == 0 {
            self.regs.pstate |= PSR_Z;
        }
    }

    fn set_nzcv(&mut self, result: u32, c: bool, v: bool) {
        self.set_nz(result);
        self.regs.pstate &= !(PSR_C | PSR_V);
        if c {
            self.regs.pstate |= PSR_C;
        }
        if v {
            self.regs.pstate |= PSR_V;
        }
    }

    fn block(&mut self, rn: u8, list: u16, load: bool, writeback: bool, increment: bool, before: bool) {
        let base = self.regs.a32(rn);
        let span = 4 * list.count_ones();
        let mut addr = match (increment, before) {
            (true, false) => base,
            (true, true) => base.wrapping_add(4),
            (false, false) => base.wrapping_sub(span).wrapping_add(4),
            (false, true) => base.wrapping_sub(span),
        };
        let mut loaded = [0u32; 16];
        for r in (0..16u8).filter(|r| list & (1 << r) != 0) {
            if load {
                loaded[r as usize] = self.load(addr);
            } else {
                let pc_offset = if self.regs.is_thumb() { 4 } else { 8 };
                self.store(addr, self.a32_read(r, pc_offset));
            }
            addr = addr.wrapping_add(4);
        }
        if writeback {
            let new_base = if increment {
                base.wrapping_add(span)
            } else {
                base.wrapping_sub(span)
            };
            self.regs.set_a32(rn, new_base);
        }
        let next = self.regs.pc + if self.regs.is_thumb() { 2 } else { 4 };
        if load {
            for r in (0..15u8).filter(|r| list & (1 << r) != 0) {
                self.regs.set_a32(r, loaded[r as usize]);
            }
            if list & (1 << 15) != 0 {
                self.regs.bx_write_pc(loaded[15]);
                return;
            }
        }
        self.regs.pc = next;
    }

    fn exec_arm(&mut self, w: u32) {
        let pc = self.regs.pc;
        let next = pc + 4;
        let cond = w >> 28;
        if cond != 0xE && cond != 0xF && !Cond::from_bits(cond).passes(self.regs.pstate) {
            self.regs.pc = next;
            return;
        }
        let rn = ((w >> 16) & 0xf) as u8;
        let rd = ((w >> 12) & 0xf) as u8;

        if w & 0x0FFF_FFFF == 0x0320_F000 {
            self.regs.pc = next;
        } else if w & 0x0FFF_0FFF == 0x010F_0000 {
            self.regs.set_a32(rd, mrs_on_hardware(self.regs.pstate));
            self.regs.pc = next;
        } else if w & 0x0FFF_FFD0 == 0x012F_FF10 {
            let target = self.a32_read((w & 0xf) as u8, 8);
            if w & 0x20 != 0 {
                self.regs.set_a32(A32_LR, next as u32);
            }
            self.regs.bx_write_pc(target);
        } else if (w >> 25) & 7 == 0b101 {
            if w & (1 << 24) != 0 {
                self.regs.set_a32(A32_LR, next as u32);
            }
            let offset = sext((w & 0x00ff_ffff) << 2, 26);
            self.regs.pc = ((pc + 8).wrapping_add_signed(offset)) & 0xffff_ffff;
        } else if (w >> 25) & 7 == 0b100 {
            self.block(
                rn,
                w as u16,
                w & (1 << 20) != 0,
                w & (1 << 21) != 0,
                w & (1 << 23) != 0,
                w & (1 << 24) != 0,
            );
        } else if (w >> 25) & 7 == 0b010 {
            let pre = w & (1 << 24) != 0;
            let up = w & (1 << 23) != 0;
            let wback = w & (1 << 21) != 0;
            let load = w & (1 << 20) != 0;
            assert!(w & (1 << 22) == 0, "byte access unsupported");
            let base = self.a32_read(rn, 8);
            let imm = w & 0xfff;
            let offset = if up { base.wrapping_add(imm) } else { base.wrapping_sub(imm) };
            let addr = if pre { offset } else { base };
            if load {
                let value = self.load(addr);
                if !pre || wback {
                    self.regs.set_a32(rn, offset);
                }
                if rd == A32_PC {
                    self.regs.bx_write_pc(value);
                    return;
                }
                self.regs.set_a32(rd, value);
            } else {
                self.store(addr, self.a32_read(rd, 8));
                if !pre || wback {
                    self.regs.set_a32(rn, offset);
                }
            }
            self.regs.pc = next;
        } else if (w >> 26) & 3 == 0 {
            self.data_processing(w);
        } else {
            panic!("reference cpu: unsupported A32 {:#010x} at {:#x}", w, pc);
        }
    }

    fn data_processing(&mut self, w: u32) {
        let next = self.regs.pc + 4;
        let opcode = (w >> 21) & 0xf;
        let s = w & (1 << 20) != 0;
        let rn = ((w >> 16) & 0xf) as u8;
        let rd = ((w >> 12) & 0xf) as u8;
        let carry_in = self.regs.pstate & PSR_C != 0;

        let (op2, shifter_carry) = if w & (1 << 25) != 0 {
            let rot = ((w >> 8) & 0xf) * 2;
            let value = (w & 0xff).rotate_right(rot);
            let c = if rot == 0 { carry_in } else { value >> 31 != 0 };
            (value, c)
        } else {
            assert!(w & 0x70 == 0, "only LSL #imm operands are supported");
            let amount = (w >> 7) & 0x1f;
            let rm = self.a32_read((w & 0xf) as u8, 8);
            if amount == 0 {
                (rm, carry_in)
            } else {
                (rm << amount, (rm >> (32 - amount)) & 1 != 0)
            }
        };
        let a = self.a32_read(rn, 8);

        let (result, c, v, write) = match opcode {
            0x0 => (a & op2, shifter_carry, false, true),
            0x1 => (a ^ op2, shifter_carry, false, true),
            0x2 => {
                let (r, c, v) = add_with_carry(a, !op2, true);
                (r, c, v, true)
            }
            0x3 => {
                let (r, c, v) = add_with_carry(op2, !a, true);
                (r, c, v, true)
            }
            0x4 => {
                let (r, c, v) = add_with_carry(a, op2, false);
                (r, c, v, true)
            }
            0x8 => (a & op2, shifter_carry, false, false),
            0xA => {
                let (r, c, v) = add_with_carry(a, !op2, true);
                (r, c, v, false)
            }
            0xC => (a | op2, shifter_carry, false, true),
            0xD => (op2, shifter_carry, false, true),
            0xE => (a & !op2, shifter_carry, false, true),
            0xF => (!op2, shifter_carry, false, true),
            _ => panic!("reference cpu: unsupported data-processing {:#010x}", w),
        };
        let arith = matches!(opcode, 0x2 | 0x3 | 0x4 | 0xA);
        if s || !write {
            let old_v = self.regs.pstate & PSR_V != 0;
            self.set_nzcv(result, c, if arith { v } else { old_v });
        }
        if write {
            if rd == A32_PC {
                self.regs.bx_write_pc(result);
                return;
            }
            self.regs.set_a32(rd, result);
        }
        self.regs.pc = next;
    }

    fn exec_thumb(&mut self, hw: u16) {
        let w = hw as u32;
        let pc = self.regs.pc;
        let next = pc + 2;
        let it = self.regs.itstate();
        let in_it = it & 0xf != 0;

        // IT
        if w & 0xFF00 == 0xBF00 && w & 0xF != 0 {
            self.regs.set_itstate(hw as u8);
            self.regs.pc = next;
            return;
        }
        if in_it && !CondCheck::ItState.passes(&self.regs) {
            self.regs.pc = next;
            self.regs.advance_itstate();
            return;
        }
        let setflags = !in_it;
        let rd = (w & 7) as u8;
        let rn = ((w >> 3) & 7) as u8;
        let r8 = ((w >> 8) & 7) as u8;

        match w {
            0xBF00 => self.regs.pc = next,
            _ if w >> 11 == 0b00100 => {
                let value = w & 0xff;
                self.regs.set_a32(r8, value);
                if setflags {
                    self.set_nz(value);
                }
                self.regs.pc = next;
            }
            _ if w >> 11 == 0b00101 => {
                let (r, c, v) = add_with_carry(self.regs.a32(r8), !(w & 0xff), true);
                self.set_nzcv(r, c, v);
                self.regs.pc = next;
            }
            _ if w >> 11 == 0b00110 || w >> 11 == 0b00111 => {
                let a = self.regs.a32(r8);
                let (r, c, v) = if w >> 11 == 0b00110 {
                    add_with_carry(a, w & 0xff, false)
                } else {
                    add_with_carry(a, !(w & 0xff), true)
                };
                self.regs.set_a32(r8, r);
                if setflags {
                    self.set_nzcv(r, c, v);
                }
                self.regs.pc = next;
            }
            _ if w >> 11 == 0b00011 => {
                // ADDS/SUBS register or 3-bit immediate
                let imm = w & (1 << 10) != 0;
                let sub = w & (1 << 9) != 0;
                let operand = if imm {
                    (w >> 6) & 7
                } else {
                    self.regs.a32(((w >> 6) & 7) as u8)
                };
                let a = self.regs.a32(rn);
                let (r, c, v) = if sub {
                    add_with_carry(a, !operand, true)
                } else {
                    add_with_carry(a, operand, false)
                };
                self.regs.set_a32(rd, r);
                if setflags {
                    self.set_nzcv(r, c, v);
                }
                self.regs.pc = next;
            }
            _ if w & 0xFC00 == 0x4400 => self.thumb_hireg(w),
            _ if w >> 11 == 0b01001 => {
                let base = ((pc + 4) & !3) as u32;
                let value = self.load(base + ((w & 0xff) << 2));
                self.regs.set_a32(r8, value);
                self.regs.pc = next;
            }
            _ if w & 0xFE00 == 0xB400 => {
                let list = ((w & 0xff) | (((w >> 8) & 1) << 14)) as u16;
                self.block(A32_SP, list, false, true, false, true);
            }
            _ if w & 0xFE00 == 0xBC00 => {
                let list = ((w & 0xff) | (((w >> 8) & 1) << 15)) as u16;
                self.block(A32_SP, list, true, true, true, false);
            }
            _ if w & 0xF000 == 0xD000 => {
                let cond = Cond::from_bits(w >> 8);
                self.regs.pc = if cond.passes(self.regs.pstate) {
                    (pc + 4).wrapping_add_signed(sext((w & 0xff) << 1, 9))
                } else {
                    next
                };
            }
            _ if w >> 11 == 0b11100 => {
                self.regs.pc = (pc + 4).wrapping_add_signed(sext((w & 0x7ff) << 1, 12));
            }
            _ => panic!("reference cpu: unsupported Thumb {:#06x} at {:#x}", w, pc),
        }
        if in_it {
            self.regs.advance_itstate();
        }
    }

    fn thumb_hireg(&mut self, w: u32) {
        let next = self.regs.pc + 2;
        let rd = (((w >> 4) & 8) | (w & 7)) as u8;
        let rm = ((w >> 3) & 0xf) as u8;
        let src = self.a32_read(rm, 4);
        match (w >> 8) & 3 {
            0b00 | 0b10 => {
                let result = if (w >> 8) & 3 == 0 {
                    self.a32_read(rd, 4).wrapping_add(src)
                } else {
                    src
                };
                if rd == A32_PC {
                    self.regs.pc = (result & !1) as u64;
                } else {
                    self.regs.set_a32(rd, result);
                    self.regs.pc = next;
                }
            }
            0b01 => {
                let (r, c, v) = add_with_carry(self.a32_read(rd, 4), !src, true);
                self.set_nzcv(r, c, v);
                self.regs.pc = next;
            }
            _ => {
                if w & (1 << 7) != 0 {
                    self.regs.set_a32(A32_LR, (next | 1) as u32);
                }
                self.regs.bx_write_pc(src);
            }
        }
    }
}

/// Registers for an A32 run starting at `pc` with a stack at `sp`.
pub fn arm_regs(pc: u64, sp: u64) -> PtRegs {
    let mut regs = PtRegs::default();
    regs.pc = pc;
    regs.sp = sp;
    regs
}

/// Registers for a Thumb run.
pub fn thumb_regs(pc: u64, sp: u64) -> PtRegs {
    let mut regs = arm_regs(pc, sp);
    regs.set_thumb(true);
    regs
}
