//! Return probes: trampolines and per-thread instance stacks.
//!
//! On function entry the return address is saved in a
//! [`ReturnProbeInstance`] and replaced with the address of a trampoline
//! trap. Instances live in an arena indexed by [`InstanceId`]; each thread
//! links its pending instances into a LIFO stack, so nested and recursive
//! calls unwind in reverse entry order. Ids carry a generation so a stale
//! id never reaches a recycled slot.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::decode::Isa;
use crate::insn_slot::Trampolines;
use crate::ops::{Pid, Tid};
use crate::probe::{ProbeContext, ProbeHandler, ProbeTarget, TrapContext};
use crate::regs::{A32_LR, A64_LR, PtRegs};
use crate::transport::Transport;

/// A registered return probe.
pub struct ReturnProbe {
    id: u64,
    target: ProbeTarget,
    handler: ProbeHandler,
    maxactive: usize,
    active: AtomicUsize,
    nmissed: AtomicU64,
    retired: AtomicBool,
}

impl ReturnProbe {
    pub fn new(id: u64, target: ProbeTarget, handler: ProbeHandler, maxactive: usize) -> Self {
        Self {
            id,
            target,
            handler,
            maxactive,
            active: AtomicUsize::new(0),
            nmissed: AtomicU64::new(0),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> ProbeTarget {
        self.target
    }

    /// Calls not hooked because `maxactive` instances were pending.
    pub fn nmissed(&self) -> u64 {
        self.nmissed.load(Ordering::Relaxed)
    }

    /// Instances currently pending.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stop firing the handler; pending instances still restore their return address.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn try_activate(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.maxactive).then_some(n + 1)
            })
            .is_ok()
    }

    fn deactivate(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Generation-checked index of a [`ReturnProbeInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    Free,
    /// Return address hijacked, waiting for the trampoline.
    Pending,
    /// Taken by a trampoline fire or a teardown sweep.
    Claimed,
}

/// One hooked call.
struct ReturnProbeInstance {
    pid: Option<Pid>,
    probe: Arc<ReturnProbe>,
    /// Runtime entry address of the probed function.
    func: u64,
    /// Real return address, interworking bit included.
    ret_addr: u64,
    isa: Isa,
    /// Next older instance of the same thread.
    next: Option<InstanceId>,
}

struct Slot {
    generation: u32,
    state: InstanceState,
    instance: Option<ReturnProbeInstance>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    heads: HashMap<Tid, InstanceId>,
}

impl Arena {
    fn insert(&mut self, instance: ReturnProbeInstance) -> InstanceId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: InstanceState::Free,
                    instance: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.state = InstanceState::Pending;
        slot.instance = Some(instance);
        InstanceId {
            index,
            generation: slot.generation,
        }
    }

    /// Move a pending instance to claimed and take it out of its slot.
    fn claim(&mut self, id: InstanceId) -> Option<ReturnProbeInstance> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.state != InstanceState::Pending {
            return None;
        }
        slot.state = InstanceState::Claimed;
        slot.instance.take()
    }

    fn release(&mut self, id: InstanceId) {
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            if slot.generation == id.generation && slot.state == InstanceState::Claimed {
                slot.generation = slot.generation.wrapping_add(1);
                slot.state = InstanceState::Free;
                self.free.push(id.index);
            }
        }
    }

    fn get(&self, id: InstanceId) -> Option<&ReturnProbeInstance> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.instance.as_ref()
    }

    /// Claim and free every instance of `tid`, newest first.
    fn sweep(&mut self, tid: Tid) -> Vec<Arc<ReturnProbe>> {
        let mut probes = Vec::new();
        let mut cursor = self.heads.remove(&tid);
        while let Some(id) = cursor {
            match self.claim(id) {
                Some(instance) => {
                    cursor = instance.next;
                    probes.push(instance.probe);
                    self.release(id);
                }
                None => cursor = None,
            }
        }
        probes
    }
}

/// Per-thread return-instance stacks.
pub struct TrampolineManager {
    arena: Mutex<Arena>,
}

impl Default for TrampolineManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TrampolineManager {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
        }
    }

    /// Hook the return of the call entering at `func`.
    ///
    /// Returns `None` when the call is not hooked: the probe is retired or
    /// `maxactive` instances are already pending (counted in `nmissed`).
    pub fn prepare(
        &self,
        ctx: TrapContext,
        probe: &Arc<ReturnProbe>,
        func: u64,
        isa: Isa,
        trampolines: Trampolines,
        regs: &mut PtRegs,
    ) -> Option<InstanceId> {
        if probe.is_retired() {
            return None;
        }
        if !probe.try_activate() {
            probe.nmissed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "retprobe: maxactive {} reached at {:#x}, call not hooked",
                probe.maxactive, func
            );
            return None;
        }

        let ret_addr = match isa {
            Isa::A64 => {
                let ret = regs.x(A64_LR);
                regs.set_x(A64_LR, trampolines.a64);
                ret
            }
            Isa::Arm | Isa::Thumb => {
                let ret = regs.a32(A32_LR) as u64;
                let landing = if ret & 1 != 0 {
                    trampolines.thumb | 1
                } else {
                    trampolines.arm
                };
                regs.set_a32(A32_LR, landing as u32);
                ret
            }
        };

        let mut arena = self.arena.lock();
        let next = arena.heads.get(&ctx.tid).copied();
        let id = arena.insert(ReturnProbeInstance {
            pid: ctx.pid,
            probe: probe.clone(),
            func,
            ret_addr,
            isa,
            next,
        });
        arena.heads.insert(ctx.tid, id);
        Some(id)
    }

    /// Pop the newest instance of the trapping thread, restore its return
    /// address and run the handler. Returns false if the thread has none.
    pub fn fire(&self, ctx: TrapContext, regs: &mut PtRegs, transport: &Transport) -> bool {
        let instance = {
            let mut arena = self.arena.lock();
            let Some(id) = arena.heads.get(&ctx.tid).copied() else {
                return false;
            };
            let Some(instance) = arena.claim(id) else {
                warn!("retprobe: stale instance on thread {}", ctx.tid);
                arena.heads.remove(&ctx.tid);
                return false;
            };
            match instance.next {
                Some(next) => arena.heads.insert(ctx.tid, next),
                None => arena.heads.remove(&ctx.tid),
            };
            arena.release(id);
            instance
        };

        match instance.isa {
            Isa::A64 => regs.pc = instance.ret_addr,
            Isa::Arm | Isa::Thumb => regs.bx_write_pc(instance.ret_addr as u32),
        }
        instance.probe.deactivate();

        if !instance.probe.is_retired() {
            let pctx = ProbeContext {
                pid: instance.pid,
                tid: ctx.tid,
                addr: instance.func,
                isa: instance.isa,
                transport,
            };
            (instance.probe.handler)(&pctx, regs);
        }
        true
    }

    /// Undo [`TrampolineManager::prepare`] when the probed instruction
    /// could not run. `id` must still be the newest instance of the thread;
    /// the caller restores the return register.
    pub fn cancel(&self, tid: Tid, id: InstanceId) -> bool {
        let probe = {
            let mut arena = self.arena.lock();
            if arena.heads.get(&tid) != Some(&id) {
                return false;
            }
            let Some(instance) = arena.claim(id) else {
                return false;
            };
            match instance.next {
                Some(next) => arena.heads.insert(tid, next),
                None => arena.heads.remove(&tid),
            };
            arena.release(id);
            instance.probe
        };
        probe.deactivate();
        true
    }

    /// Discard every pending instance of `tid` without running handlers.
    pub fn discard_thread(&self, tid: Tid) -> usize {
        let probes = self.arena.lock().sweep(tid);
        for probe in &probes {
            probe.deactivate();
        }
        if !probes.is_empty() {
            debug!("retprobe: discarded {} instances of thread {}", probes.len(), tid);
        }
        probes.len()
    }

    /// Discard the instances of every thread of `pid`.
    pub fn discard_process(&self, pid: Pid) -> usize {
        let tids: Vec<Tid> = {
            let arena = self.arena.lock();
            arena
                .heads
                .iter()
                .filter(|(_, id)| arena.get(**id).is_some_and(|i| i.pid == Some(pid)))
                .map(|(tid, _)| *tid)
                .collect()
        };
        tids.into_iter().map(|tid| self.discard_thread(tid)).sum()
    }

    /// Pending instances of `tid`.
    pub fn depth(&self, tid: Tid) -> usize {
        let arena = self.arena.lock();
        let mut depth = 0;
        let mut cursor = arena.heads.get(&tid).copied();
        while let Some(instance) = cursor.and_then(|id| arena.get(id)) {
            depth += 1;
            cursor = instance.next;
        }
        depth
    }

    /// Saved return addresses of `tid`, newest first.
    pub fn return_addresses(&self, tid: Tid) -> Vec<u64> {
        let arena = self.arena.lock();
        let mut out = Vec::new();
        let mut cursor = arena.heads.get(&tid).copied();
        while let Some(instance) = cursor.and_then(|id| arena.get(id)) {
            out.push(instance.ret_addr);
            cursor = instance.next;
        }
        out
    }

    /// Pending instances across all threads.
    pub fn pending(&self) -> usize {
        let arena = self.arena.lock();
        arena.slots.len() - arena.free.len()
    }
}
