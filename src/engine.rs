//! The engine: registration API, trap entry points and process lifecycle.
//!
//! One [`Engine`] owns every piece of probe state. The host hands it traps
//! and lifecycle events; callers register probes, return probes and hooks
//! through it. [`Control`] wraps the engine behind the on/off switch.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::decode::ProbeAddress;
use crate::emulate::{Executor, Outcome, PendingStep};
use crate::error::{Error, Result};
use crate::hooks::{HookArgs, HookCallback, HookCategory, HookHandle, HookRegistry, Owner};
use crate::image::ImageTracker;
use crate::insn_slot::SlotAllocator;
use crate::ops::{AuxiliaryOps, FileId, Pid, Tid};
use crate::probe::handler::{self, TrapKind};
use crate::probe::{
    ActionHint, Patcher, ProbeContext, ProbeDescriptor, ProbeHandle, ProbeHandler, ProbeListing,
    ProbeRegistry, ProbeSite, ProbeTarget, RetprobeHandle, TrapContext,
};
use crate::regs::PtRegs;
use crate::retprobe::{ReturnProbe, TrampolineManager};
use crate::transport::Transport;

/// Instrumentation engine state.
pub struct Engine {
    config: EngineConfig,
    ops: Arc<dyn AuxiliaryOps>,
    probes: ProbeRegistry,
    images: ImageTracker,
    slots: SlotAllocator,
    retprobes: TrampolineManager,
    hooks: HookRegistry,
    transport: Transport,
    /// Out-of-line steps in flight, by thread.
    steps: Mutex<HashMap<Tid, PendingStep>>,
    /// Serializes registration, page install and teardown.
    admin: Mutex<()>,
    next_id: AtomicU64,
    /// Torn down; the out-of-line areas go once nothing runs in them.
    retired: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig, ops: Arc<dyn AuxiliaryOps>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ops,
            probes: ProbeRegistry::new(),
            images: ImageTracker::new(),
            slots: SlotAllocator::new(config.xol_slots),
            retprobes: TrampolineManager::new(),
            hooks: HookRegistry::new(),
            transport: Transport::from_config(&config),
            steps: Mutex::new(HashMap::new()),
            admin: Mutex::new(()),
            next_id: AtomicU64::new(1),
            retired: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn images(&self) -> &ImageTracker {
        &self.images
    }

    pub fn return_probes(&self) -> &TrampolineManager {
        &self.retprobes
    }

    fn patcher(&self) -> Patcher<'_> {
        Patcher::new(&*self.ops, &self.slots)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn pin_copy(&self, site: &ProbeSite) {
        if let Some(copy) = site.copy {
            self.slots.pin(site.pid, copy.slot);
        }
    }

    fn unpin_copy(&self, site: &ProbeSite) {
        if let Some(copy) = site.copy {
            self.slots.unpin(site.pid, copy.slot);
        }
    }

    /// Take back a site that was installed but never became live. If the
    /// trap cannot be removed the slot is kept, since the copy may still run.
    fn undo_install(&self, site: &mut ProbeSite) {
        let patcher = self.patcher();
        match patcher.restore(site) {
            Ok(()) => patcher.discard(site),
            Err(e) => error!(
                "probe: trap at {:#x} ({:?}) left in text: {:?}",
                site.addr.addr, site.pid, e
            ),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Take a reference on the descriptor for `target`, installing kernel
    /// sites on first use. Caller holds `admin`.
    fn attach_target(
        &self,
        target: ProbeTarget,
        hint: Option<ActionHint>,
    ) -> Result<Arc<ProbeDescriptor>> {
        match target {
            ProbeTarget::Kernel(addr) => {
                addr.check_alignment()?;
                if let Some(desc) = self.probes.descriptor(None, addr.addr) {
                    if desc.addr.isa != addr.isa {
                        return Err(Error::Conflict);
                    }
                    desc.check_hint(hint)?;
                    desc.acquire();
                    return Ok(desc);
                }
                let hint = hint.unwrap_or(ActionHint::Auto);
                let mut site = ProbeSite::new(addr, None, None, hint);
                self.patcher().install(&mut site)?;
                let desc = Arc::new(ProbeDescriptor::new(addr, hint));
                if let Err(e) = self.probes.insert(site, desc.clone()) {
                    self.undo_install(&mut site);
                    return Err(e);
                }
                desc.acquire();
                Ok(desc)
            }
            ProbeTarget::Image { file, addr } => self.images.attach(file, addr, hint),
        }
    }

    /// Drop a reference taken by [`Engine::attach_target`]; the last one
    /// removes every installed copy of the site.
    fn release_target(&self, target: ProbeTarget, desc: &ProbeDescriptor) -> Result<()> {
        match target {
            ProbeTarget::Kernel(addr) => {
                if desc.release() {
                    if let Some(mut site) = self.probes.remove(None, addr.addr) {
                        self.patcher().uninstall(&mut site)?;
                    }
                }
                Ok(())
            }
            ProbeTarget::Image { file, addr } => {
                let patcher = self.patcher();
                self.images.detach(file, addr.addr, |pid, vaddr| {
                    if let Some(mut site) = self.probes.remove(Some(pid), vaddr) {
                        if let Err(e) = patcher.uninstall(&mut site) {
                            warn!("image: uninstall {:#x} in {} failed: {:?}", vaddr, pid, e);
                        }
                    }
                })?;
                Ok(())
            }
        }
    }

    fn find_descriptor(&self, target: ProbeTarget) -> Option<Arc<ProbeDescriptor>> {
        match target {
            ProbeTarget::Kernel(addr) => self.probes.descriptor(None, addr.addr),
            ProbeTarget::Image { file, addr } => self.images.descriptor(file, addr.addr),
        }
    }

    /// Register an entry handler at `target`.
    ///
    /// Kernel probes are planted immediately; image probes are planted in
    /// each process the first time a page covering them is touched.
    pub fn register_probe(
        &self,
        target: ProbeTarget,
        hint: ActionHint,
        handler: ProbeHandler,
    ) -> Result<ProbeHandle> {
        let _guard = self.admin.lock();
        let desc = self.attach_target(target, Some(hint))?;
        let id = self.next_id();
        desc.add_handler(id, handler);
        info!("probe: registered {} at {:#x}", id, target.addr().tagged());
        Ok(ProbeHandle { id, target })
    }

    pub fn unregister_probe(&self, handle: ProbeHandle) -> Result<()> {
        let _guard = self.admin.lock();
        let desc = self.find_descriptor(handle.target).ok_or(Error::NotFound)?;
        if !desc.remove_handler(handle.id) {
            return Err(Error::NotFound);
        }
        self.release_target(handle.target, &desc)?;
        info!("probe: unregistered {}", handle.id);
        Ok(())
    }

    /// Register a return handler for the function entered at `target`,
    /// with the configured `maxactive`.
    pub fn register_return_probe(
        &self,
        target: ProbeTarget,
        handler: ProbeHandler,
    ) -> Result<RetprobeHandle> {
        self.register_return_probe_with(target, handler, self.config.default_maxactive)
    }

    pub fn register_return_probe_with(
        &self,
        target: ProbeTarget,
        handler: ProbeHandler,
        maxactive: usize,
    ) -> Result<RetprobeHandle> {
        if maxactive == 0 {
            return Err(Error::InvalidConfig("maxactive"));
        }
        let _guard = self.admin.lock();
        let desc = self.attach_target(target, None)?;
        let id = self.next_id();
        let probe = Arc::new(ReturnProbe::new(id, target, handler, maxactive));
        if let Err(e) = desc.set_return(probe) {
            self.release_target(target, &desc)?;
            return Err(e);
        }
        info!(
            "retprobe: registered {} at {:#x} (maxactive {})",
            id,
            target.addr().tagged(),
            maxactive
        );
        Ok(RetprobeHandle { id, target })
    }

    /// Unregister a return probe. Instances already pending still restore
    /// their return address but no longer run the handler.
    pub fn unregister_return_probe(&self, handle: RetprobeHandle) -> Result<()> {
        let _guard = self.admin.lock();
        let desc = self.find_descriptor(handle.target).ok_or(Error::NotFound)?;
        let probe = desc.take_return(handle.id).ok_or(Error::NotFound)?;
        probe.retire();
        if probe.nmissed() > 0 {
            info!("retprobe: {} missed {} calls", handle.id, probe.nmissed());
        }
        self.release_target(handle.target, &desc)
    }

    pub fn register_hook(
        &self,
        category: HookCategory,
        owner: &Arc<Owner>,
        callback: HookCallback,
    ) -> Result<HookHandle> {
        self.hooks.register(category, owner, callback)
    }

    pub fn unregister_hook(&self, handle: HookHandle) -> Result<()> {
        self.hooks.unregister(handle)
    }

    /// Host hook point. Returns the number of callbacks run.
    pub fn dispatch_hook(&self, args: &HookArgs) -> usize {
        self.hooks.dispatch(&self.transport, args)
    }

    // =========================================================================
    // Trap entry points
    // =========================================================================

    /// Probe trap at `regs.pc`. Returns false if no probe or trampoline of
    /// this engine lives there.
    ///
    /// When the probed instruction cannot be run, registers are put back
    /// as the handlers left them, any return hijack included, and the trap
    /// is not claimed.
    pub fn handle_breakpoint(&self, ctx: TrapContext, regs: &mut PtRegs) -> bool {
        let pc = regs.pc;
        if self.slots.trampoline_at(ctx.pid, pc).is_some() {
            return self.handle_trampoline(ctx, regs);
        }
        // The slot is pinned before the registry lock drops, so an
        // unregister racing with this trap cannot hand it out again.
        let Some((site, desc)) = self.probes.lookup_with(ctx.pid, pc, |site| self.pin_copy(site))
        else {
            return false;
        };

        let pctx = ProbeContext {
            pid: ctx.pid,
            tid: ctx.tid,
            addr: site.addr.addr,
            isa: site.addr.isa,
            transport: &self.transport,
        };
        desc.fire(&pctx, regs);
        if regs.pc != pc {
            // A handler redirected execution; the probed instruction is skipped.
            self.unpin_copy(&site);
            return true;
        }

        let entry = *regs;
        let instance = desc.return_probe().and_then(|probe| {
            match self.slots.trampolines(&*self.ops, ctx.pid) {
                Ok(trampolines) => self.retprobes.prepare(
                    ctx,
                    &probe,
                    site.addr.addr,
                    site.addr.isa,
                    trampolines,
                    regs,
                ),
                Err(e) => {
                    warn!("retprobe: no trampoline for {:?}: {:?}", ctx.pid, e);
                    None
                }
            }
        });

        match Executor::new(&*self.ops, ctx.pid).execute(&site, regs) {
            Ok(Outcome::Done) => {
                self.unpin_copy(&site);
                true
            }
            Ok(Outcome::Step(step)) => {
                if let Some(stale) = self.steps.lock().insert(ctx.tid, step) {
                    warn!(
                        "probe: thread {} trapped again before the step at {:#x} finished",
                        ctx.tid, stale.addr.addr
                    );
                    self.slots.unpin(stale.pid, stale.slot);
                }
                true
            }
            Err(e) => {
                warn!("probe: cannot execute {:#x}: {:?}", site.addr.addr, e);
                if let Some(id) = instance {
                    self.retprobes.cancel(ctx.tid, id);
                }
                *regs = entry;
                self.unpin_copy(&site);
                false
            }
        }
    }

    /// Single-step trap after an out-of-line copy.
    pub fn handle_single_step(&self, ctx: TrapContext, regs: &mut PtRegs) -> bool {
        let mut steps = self.steps.lock();
        let Some(step) = steps.get(&ctx.tid).copied() else {
            return false;
        };
        if step.step_pc != regs.pc || step.pid != ctx.pid {
            warn!(
                "probe: stray step trap at {:#x} on thread {} (expected {:#x})",
                regs.pc, ctx.tid, step.step_pc
            );
            return false;
        }
        steps.remove(&ctx.tid);
        drop(steps);
        Executor::complete(&step, regs);
        self.slots.unpin(step.pid, step.slot);
        self.reap();
        true
    }

    /// Function returned into a trampoline.
    pub fn handle_trampoline(&self, ctx: TrapContext, regs: &mut PtRegs) -> bool {
        if self.retprobes.fire(ctx, regs, &self.transport) {
            self.reap();
            return true;
        }
        warn!("retprobe: trampoline hit with no pending instance on {}", ctx.tid);
        false
    }

    // =========================================================================
    // Address-space lifecycle
    // =========================================================================

    /// Pages `[start, start + len)` of `file` became present in `pid`:
    /// plant every image site they cover. Returns the number planted.
    pub fn handle_page_touch(&self, pid: Pid, file: FileId, start: u64, len: u64) -> usize {
        let Some(base) = self.ops.image_base(pid, file) else {
            return 0;
        };
        let lo = start.saturating_sub(base);
        let hi = start.saturating_add(len).saturating_sub(base);
        let _guard = self.admin.lock();
        let mut planted = 0;
        for pending in self.images.pending_sites(file, pid, lo, hi) {
            let vaddr = ProbeAddress::new(base + pending.offset.addr, pending.offset.isa);
            let mut site = ProbeSite::new(vaddr, Some(pid), Some(file), pending.descriptor.hint);
            if let Err(e) = self.patcher().install(&mut site) {
                warn!(
                    "image: cannot probe {:?}+{:#x} in {}: {:?}",
                    file, pending.offset.addr, pid, e
                );
                continue;
            }
            if let Err(e) = self.probes.insert(site, pending.descriptor.clone()) {
                warn!("image: {:#x} in {} already probed: {:?}", vaddr.addr, pid, e);
                self.undo_install(&mut site);
                continue;
            }
            if let Err(e) = self
                .images
                .mark_installed(file, pending.offset.addr, pid, vaddr.addr)
            {
                // Only unregister a site whose trap is really gone.
                if self.patcher().restore(&site).is_ok() {
                    if let Some(mut site) = self.probes.remove(Some(pid), vaddr.addr) {
                        self.patcher().discard(&mut site);
                    }
                } else {
                    error!(
                        "image: {:#x} in {} stays trapped but untracked: {:?}",
                        vaddr.addr, pid, e
                    );
                }
                continue;
            }
            planted += 1;
        }
        if planted > 0 {
            debug!("image: planted {} sites of {:?} in {}", planted, file, pid);
        }
        planted
    }

    /// Pages of `file` were unmapped from `pid`. Their sites are forgotten
    /// without touching the (gone) text. Returns the number dropped.
    pub fn handle_unmap(&self, pid: Pid, file: FileId, start: u64, len: u64) -> usize {
        let Some(base) = self.ops.image_base(pid, file) else {
            return 0;
        };
        let lo = start.saturating_sub(base);
        let hi = start.saturating_add(len).saturating_sub(base);
        let _guard = self.admin.lock();
        let patcher = self.patcher();
        let mut dropped = 0;
        for (offset, vaddr) in self.images.installed_in_range(file, pid, lo, hi) {
            self.images.mark_removed(file, offset, pid);
            if let Some(mut site) = self.probes.remove(Some(pid), vaddr) {
                patcher.discard(&mut site);
                dropped += 1;
            }
        }
        dropped
    }

    /// Thread exit: drop its pending return instances and any step in flight.
    pub fn handle_thread_exit(&self, tid: Tid) {
        self.retprobes.discard_thread(tid);
        let step = self.steps.lock().remove(&tid);
        if let Some(step) = step {
            self.slots.unpin(step.pid, step.slot);
        }
        self.reap();
    }

    /// Process exit: drop every per-process site, installation record,
    /// return instance and the out-of-line area.
    pub fn handle_process_exit(&self, pid: Pid) {
        {
            let _guard = self.admin.lock();
            self.images.remove_process(pid);
            let patcher = self.patcher();
            let sites = self.probes.remove_process(pid);
            for mut site in sites.iter().copied() {
                patcher.discard(&mut site);
            }
            let instances = self.retprobes.discard_process(pid);
            self.steps.lock().retain(|_, s| s.pid != Some(pid));
            self.slots.release(&*self.ops, Some(pid));
            info!(
                "image: process {} gone ({} sites, {} return instances)",
                pid,
                sites.len(),
                instances
            );
        }
        self.reap();
    }

    // =========================================================================
    // Introspection and teardown
    // =========================================================================

    pub fn list_probes(&self) -> Vec<ProbeListing> {
        self.probes.list()
    }

    /// `(pid, addr, hits, is_return, nmissed)` per installed site.
    pub fn list_probes_flat(&self) -> Vec<(Option<Pid>, u64, u64, bool, u64)> {
        self.probes.list_flat()
    }

    pub fn installed_sites(&self) -> usize {
        self.probes.len()
    }

    /// No thread is parked in a slot or owes a trampoline a return.
    pub fn is_quiescent(&self) -> bool {
        self.retprobes.pending() == 0 && self.steps.lock().is_empty()
    }

    /// Torn down and quiescent: the out-of-line areas are gone.
    pub fn is_drained(&self) -> bool {
        self.retired.load(Ordering::Acquire) && self.is_quiescent()
    }

    /// Unmap the areas of a retired engine once the last thread left them.
    fn reap(&self) {
        if self.is_drained() && self.slots.used_areas() > 0 {
            self.slots.release_all(&*self.ops);
            info!("engine: retired engine drained, areas released");
        }
    }

    /// Restore every patched instruction and drop all state. Threads still
    /// stepping or owing a return keep the out-of-line areas mapped until
    /// they leave them.
    pub fn teardown(&self) {
        let _guard = self.admin.lock();
        let patcher = self.patcher();
        let sites = self.probes.take_all();
        for mut site in sites.iter().copied() {
            if let Err(e) = patcher.uninstall(&mut site) {
                warn!("probe: teardown of {:#x} failed: {:?}", site.addr.addr, e);
            }
        }
        self.images.clear();
        self.retired.store(true, Ordering::Release);
        if self.is_quiescent() {
            self.slots.release_all(&*self.ops);
        } else {
            warn!(
                "engine: {} return instances and {} steps in flight, keeping areas mapped",
                self.retprobes.pending(),
                self.steps.lock().len()
            );
        }
        info!("engine: torn down, {} sites restored", sites.len());
    }
}

/// On/off switch owning the engine.
///
/// Writing `1` builds a fresh engine from the stored configuration,
/// writing `0` tears it down. Probe traps arriving while disabled are not
/// claimed, except by a torn-down engine that still has threads stepping
/// or returning through its areas.
pub struct Control {
    config: EngineConfig,
    ops: Arc<dyn AuxiliaryOps>,
    engine: RwLock<Option<Arc<Engine>>>,
    /// Torn-down engines that are not drained yet.
    retiring: Mutex<Vec<Arc<Engine>>>,
}

impl Control {
    pub fn new(config: EngineConfig, ops: Arc<dyn AuxiliaryOps>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ops,
            engine: RwLock::new(None),
            retiring: Mutex::new(Vec::new()),
        })
    }

    /// Apply `b"1"` or `b"0"`, surrounding whitespace ignored.
    pub fn write(&self, input: &[u8]) -> Result<()> {
        match input.trim_ascii() {
            b"1" => {
                let mut engine = self.engine.write();
                if engine.is_none() {
                    *engine = Some(Arc::new(Engine::new(self.config, self.ops.clone())?));
                    info!("engine: enabled");
                }
                Ok(())
            }
            b"0" => {
                let engine = self.engine.write().take();
                if let Some(engine) = engine {
                    engine.teardown();
                    if !engine.is_drained() {
                        self.retiring.lock().push(engine);
                    }
                    info!("engine: disabled");
                }
                Ok(())
            }
            _ => Err(Error::InvalidConfig("expected 0 or 1")),
        }
    }

    /// `b'1'` when enabled, `b'0'` otherwise.
    pub fn read(&self) -> u8 {
        if self.engine.read().is_some() { b'1' } else { b'0' }
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.read().is_some()
    }

    pub fn engine(&self) -> Result<Arc<Engine>> {
        self.engine.read().clone().ok_or(Error::NotInitialized)
    }

    /// Torn-down engines still waiting for threads to leave their areas.
    pub fn retiring(&self) -> usize {
        self.retiring.lock().len()
    }

    fn retired_engines(&self) -> Vec<Arc<Engine>> {
        self.retiring.lock().clone()
    }

    fn prune(&self) {
        self.retiring.lock().retain(|engine| !engine.is_drained());
    }

    /// Host trap entry: the live engine first, then retired ones.
    pub fn dispatch_trap(&self, ctx: TrapContext, kind: TrapKind, regs: &mut PtRegs) -> bool {
        let live = self.engine.read().clone();
        if let Some(engine) = live {
            if handler::dispatch_trap(&engine, ctx, kind, regs) {
                return true;
            }
        }
        let claimed = self
            .retired_engines()
            .iter()
            .any(|engine| handler::dispatch_trap(engine, ctx, kind, regs));
        if claimed {
            self.prune();
        }
        claimed
    }

    pub fn handle_thread_exit(&self, tid: Tid) {
        let live = self.engine.read().clone();
        for engine in live.iter().chain(self.retired_engines().iter()) {
            engine.handle_thread_exit(tid);
        }
        self.prune();
    }

    pub fn handle_process_exit(&self, pid: Pid) {
        let live = self.engine.read().clone();
        for engine in live.iter().chain(self.retired_engines().iter()) {
            engine.handle_process_exit(pid);
        }
        self.prune();
    }
}
