//! Instruction slot allocator for out-of-line execution.
//!
//! Every address space (the kernel, or one user process) gets its own
//! executable area mapped through [`AuxiliaryOps::alloc_exec_memory`]. The
//! area is cut into fixed-size slots. Slot 0 holds the return trampolines;
//! every other slot holds one fixed-up instruction followed by the
//! single-step trap.

use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

use crate::decode::{ExecMode, Isa, insn_bytes};
use crate::error::{Error, Result};
use crate::ops::{AuxiliaryOps, Pid};
use crate::probe::patcher::{A64_TRAP, ARM_TRAP, THUMB16_TRAP};

/// Size of each instruction slot in bytes.
/// One instruction of up to 4 bytes plus a step trap, padded.
pub const SLOT_SIZE: usize = 16;

/// Offsets of the return trampolines inside slot 0.
const TRAMPOLINE_ARM: u64 = 0;
const TRAMPOLINE_THUMB: u64 = 4;
const TRAMPOLINE_A64: u64 = 8;

/// Return trampoline addresses of one address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampolines {
    pub arm: u64,
    pub thumb: u64,
    pub a64: u64,
}

impl Trampolines {
    fn at(base: u64) -> Self {
        Self {
            arm: base + TRAMPOLINE_ARM,
            thumb: base + TRAMPOLINE_THUMB,
            a64: base + TRAMPOLINE_A64,
        }
    }

    /// Instruction set whose trampoline sits at `pc`, if any.
    pub fn isa_at(&self, pc: u64) -> Option<Isa> {
        if pc == self.arm {
            Some(Isa::Arm)
        } else if pc == self.thumb {
            Some(Isa::Thumb)
        } else if pc == self.a64 {
            Some(Isa::A64)
        } else {
            None
        }
    }
}

/// Contents of slot 0: one probe trap per instruction set.
fn trampoline_image() -> [u8; SLOT_SIZE] {
    let mut image = [0u8; SLOT_SIZE];
    let (arm, _) = insn_bytes(ARM_TRAP, ExecMode::Arm);
    let (thumb, _) = insn_bytes(THUMB16_TRAP as u32, ExecMode::Thumb16);
    let (a64, _) = insn_bytes(A64_TRAP, ExecMode::A64);
    image[0..4].copy_from_slice(&arm);
    image[4..6].copy_from_slice(&thumb[..2]);
    image[6..8].copy_from_slice(&thumb[..2]);
    image[8..12].copy_from_slice(&a64);
    image
}

/// Result of [`XolArea::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freed {
    Now,
    /// A step is still running in the slot; it is freed by the last unpin.
    Deferred,
    Invalid,
}

struct XolArea {
    base: u64,
    nslots: usize,
    /// Bit N set means slot N is in use. Slot 0 is never handed out.
    bitmap: Vec<u64>,
    /// Steps in flight per slot index.
    pins: HashMap<usize, usize>,
    /// Slots freed while pinned.
    deferred: Vec<usize>,
}

impl XolArea {
    fn new(base: u64, nslots: usize) -> Self {
        let mut bitmap = alloc::vec![0u64; nslots.div_ceil(64)];
        bitmap[0] = 1;
        Self {
            base,
            nslots,
            bitmap,
            pins: HashMap::new(),
            deferred: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.nslots * SLOT_SIZE
    }

    /// Index of the allocated slot at `addr`, never slot 0.
    fn index(&self, addr: u64) -> Option<usize> {
        if addr < self.base || addr >= self.base + self.len() as u64 {
            return None;
        }
        let idx = ((addr - self.base) as usize) / SLOT_SIZE;
        let allocated = self.bitmap[idx / 64] & (1 << (idx % 64)) != 0;
        (idx != 0 && allocated).then_some(idx)
    }

    fn alloc(&mut self) -> Option<u64> {
        let idx = (1..self.nslots).find(|&i| self.bitmap[i / 64] & (1 << (i % 64)) == 0)?;
        self.bitmap[idx / 64] |= 1 << (idx % 64);
        Some(self.base + (idx * SLOT_SIZE) as u64)
    }

    fn free(&mut self, addr: u64) -> Freed {
        let Some(idx) = self.index(addr) else {
            return Freed::Invalid;
        };
        if self.pins.contains_key(&idx) {
            if !self.deferred.contains(&idx) {
                self.deferred.push(idx);
            }
            return Freed::Deferred;
        }
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
        Freed::Now
    }

    fn pin(&mut self, addr: u64) -> bool {
        match self.index(addr) {
            Some(idx) => {
                *self.pins.entry(idx).or_insert(0) += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one pin. Returns true when this released a deferred slot.
    fn unpin(&mut self, addr: u64) -> bool {
        let Some(idx) = self.index(addr) else {
            return false;
        };
        match self.pins.get_mut(&idx) {
            Some(n) if *n > 1 => {
                *n -= 1;
                return false;
            }
            Some(_) => {
                self.pins.remove(&idx);
            }
            None => return false,
        }
        match self.deferred.iter().position(|&d| d == idx) {
            Some(pos) => {
                self.deferred.swap_remove(pos);
                self.bitmap[idx / 64] &= !(1 << (idx % 64));
                true
            }
            None => false,
        }
    }

    fn used(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum::<usize>() - 1
    }
}

/// Per-address-space slot areas.
pub struct SlotAllocator {
    slots_per_area: usize,
    areas: Mutex<HashMap<Option<Pid>, XolArea>>,
}

impl SlotAllocator {
    pub fn new(slots_per_area: usize) -> Self {
        Self {
            slots_per_area,
            areas: Mutex::new(HashMap::new()),
        }
    }

    fn map_area(&self, ops: &dyn AuxiliaryOps, pid: Option<Pid>) -> Result<XolArea> {
        let len = self.slots_per_area * SLOT_SIZE;
        let base = ops.alloc_exec_memory(pid, len).ok_or(Error::MemoryFault)?;
        let area = XolArea::new(base, self.slots_per_area);
        if let Err(e) = ops.write_text(pid, base, &trampoline_image()) {
            ops.free_exec_memory(pid, base, len);
            return Err(e.into());
        }
        ops.flush_icache(pid, base, base + SLOT_SIZE as u64);
        info!(
            "insn_slot: mapped area at {:#x} ({} slots) for {:?}",
            base, self.slots_per_area, pid
        );
        Ok(area)
    }

    fn area<'a>(
        &self,
        areas: &'a mut HashMap<Option<Pid>, XolArea>,
        ops: &dyn AuxiliaryOps,
        pid: Option<Pid>,
    ) -> Result<&'a mut XolArea> {
        if !areas.contains_key(&pid) {
            let area = self.map_area(ops, pid)?;
            areas.insert(pid, area);
        }
        areas.get_mut(&pid).ok_or(Error::NotFound)
    }

    /// Allocate a slot in the area of `pid`, mapping the area on first use.
    pub fn alloc(&self, ops: &dyn AuxiliaryOps, pid: Option<Pid>) -> Result<u64> {
        let mut areas = self.areas.lock();
        let area = self.area(&mut areas, ops, pid)?;
        match area.alloc() {
            Some(addr) => {
                debug!("insn_slot: allocated slot at {:#x} for {:?}", addr, pid);
                Ok(addr)
            }
            None => {
                warn!("insn_slot: no free slots available for {:?}", pid);
                Err(Error::NoSlot)
            }
        }
    }

    /// Free a previously allocated slot. A pinned slot stays allocated
    /// until its last pin is dropped.
    pub fn free(&self, pid: Option<Pid>, addr: u64) {
        let mut areas = self.areas.lock();
        match areas.get_mut(&pid).map(|area| area.free(addr)) {
            Some(Freed::Now) => debug!("insn_slot: freed slot at {:#x}", addr),
            Some(Freed::Deferred) => {
                debug!("insn_slot: slot at {:#x} busy, free deferred", addr)
            }
            _ => warn!("insn_slot: invalid slot address {:#x} for {:?}", addr, pid),
        }
    }

    /// Mark a step as running in the slot at `addr`.
    pub fn pin(&self, pid: Option<Pid>, addr: u64) -> bool {
        self.areas
            .lock()
            .get_mut(&pid)
            .is_some_and(|area| area.pin(addr))
    }

    /// The step running in the slot at `addr` is over.
    pub fn unpin(&self, pid: Option<Pid>, addr: u64) {
        let released = self
            .areas
            .lock()
            .get_mut(&pid)
            .is_some_and(|area| area.unpin(addr));
        if released {
            debug!("insn_slot: deferred slot at {:#x} freed", addr);
        }
    }

    /// Trampoline addresses of `pid`, mapping the area on first use.
    pub fn trampolines(&self, ops: &dyn AuxiliaryOps, pid: Option<Pid>) -> Result<Trampolines> {
        let mut areas = self.areas.lock();
        let area = self.area(&mut areas, ops, pid)?;
        Ok(Trampolines::at(area.base))
    }

    /// Instruction set of the trampoline at `pc`, if `pc` is one.
    pub fn trampoline_at(&self, pid: Option<Pid>, pc: u64) -> Option<Isa> {
        let areas = self.areas.lock();
        let area = areas.get(&pid)?;
        Trampolines::at(area.base).isa_at(pc)
    }

    /// Slots in use for `pid`, trampolines excluded.
    pub fn used(&self, pid: Option<Pid>) -> usize {
        self.areas.lock().get(&pid).map_or(0, XolArea::used)
    }

    /// Unmap the area of `pid`.
    pub fn release(&self, ops: &dyn AuxiliaryOps, pid: Option<Pid>) {
        let area = self.areas.lock().remove(&pid);
        if let Some(area) = area {
            if area.used() != 0 {
                warn!(
                    "insn_slot: releasing area at {:#x} with {} slots in use",
                    area.base,
                    area.used()
                );
            }
            ops.free_exec_memory(pid, area.base, area.len());
        }
    }

    /// Unmap every area.
    /// Address spaces with an area mapped.
    pub fn used_areas(&self) -> usize {
        self.areas.lock().len()
    }

    pub fn release_all(&self, ops: &dyn AuxiliaryOps) {
        let areas: Vec<_> = self.areas.lock().drain().collect();
        for (pid, area) in areas {
            ops.free_exec_memory(pid, area.base, area.len());
        }
    }
}
