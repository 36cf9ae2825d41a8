//! Dynamic binary instrumentation engine.
//!
//! Plants breakpoint probes in running A32, Thumb and A64 code, simulates
//! or single-steps the displaced instruction, hooks function returns
//! through trampolines, fans host events out to hook subscribers and
//! carries event records to a consumer over a bounded transport.
//!
//! # Quick Start
//!
//! ```ignore
//! use axdbi::{EngineConfig, ProbeTarget, ActionHint, decode::ProbeAddress};
//!
//! // Once during boot, with the host's memory glue
//! axdbi::init(EngineConfig::default(), Arc::new(HostOps))?;
//! axdbi::control()?.write(b"1")?;
//!
//! let engine = axdbi::control()?.engine()?;
//! let target = ProbeTarget::Kernel(ProbeAddress::from_tagged(entry));
//! engine.register_probe(target, ActionHint::Auto, axdbi::probe::handler::record_entry("vfs_read", 3))?;
//! engine.register_return_probe(target, axdbi::probe::handler::record_exit())?;
//!
//! // From the exception path
//! if let Some(kind) = axdbi::probe::handler::classify_brk(iss) {
//!     axdbi::probe::handler::dispatch_trap(&engine, TrapContext::kernel(tid), kind, regs);
//! }
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Foundations
// =============================================================================

pub mod config;
pub mod error;
pub mod ops;
pub mod platform;
pub mod regs;

// =============================================================================
// Instruction handling
// =============================================================================

pub mod decode;
pub mod emulate;
pub mod insn_slot;

// =============================================================================
// Probes and events
// =============================================================================

pub mod event;
pub mod hooks;
pub mod image;
pub mod probe;
pub mod retprobe;
pub mod transport;

pub mod engine;

pub use config::EngineConfig;
pub use engine::{Control, Engine};
pub use error::{Error, Result};
pub use hooks::{HookArgs, HookCategory, HookHandle, Owner};
pub use ops::{AuxiliaryOps, FileId, Pid, Tid};
pub use probe::{ActionHint, ProbeHandle, ProbeTarget, RetprobeHandle, TrapContext};
pub use regs::PtRegs;
pub use transport::{Delivery, RecordReader, Transport};

use alloc::sync::Arc;

// =============================================================================
// Initialization
// =============================================================================

static CONTROL: spin::Once<Control> = spin::Once::new();

/// Install the global control switch.
///
/// The engine starts disabled; write `1` to [`control()`] to enable it.
/// A second call is ignored and returns `Ok`.
pub fn init(config: EngineConfig, ops: Arc<dyn AuxiliaryOps>) -> Result<()> {
    config.validate()?;
    if CONTROL.is_completed() {
        warn!("axdbi already initialized");
        return Ok(());
    }
    let control = Control::new(config, ops)?;
    CONTROL.call_once(|| control);
    info!(
        "axdbi initialized: {} transport slots, {} xol slots per area",
        config.transport_slots, config.xol_slots
    );
    Ok(())
}

/// The global control switch.
pub fn control() -> Result<&'static Control> {
    CONTROL.get().ok_or(Error::NotInitialized)
}
