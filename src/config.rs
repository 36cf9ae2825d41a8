//! Engine configuration.

use crate::error::{Error, Result};
use crate::event::HEADER_LEN;

/// Record buffers in the transport pool.
pub const DEFAULT_TRANSPORT_SLOTS: usize = 256;
/// Largest payload of one record.
pub const DEFAULT_MAX_PAYLOAD: usize = 256;
/// Batched records delivered together.
pub const DEFAULT_BATCH_SIZE: usize = 16;
/// Pending return instances per return probe.
pub const DEFAULT_MAXACTIVE: usize = 16;
/// Slots per out-of-line area, trampoline slot included.
pub const DEFAULT_XOL_SLOTS: usize = 64;

const MIN_PAYLOAD: usize = 32;
const MAX_XOL_SLOTS: usize = 4096;

/// Tunables read when the engine is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub transport_slots: usize,
    pub max_payload: usize,
    pub batch_size: usize,
    pub default_maxactive: usize,
    pub xol_slots: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport_slots: DEFAULT_TRANSPORT_SLOTS,
            max_payload: DEFAULT_MAX_PAYLOAD,
            batch_size: DEFAULT_BATCH_SIZE,
            default_maxactive: DEFAULT_MAXACTIVE,
            xol_slots: DEFAULT_XOL_SLOTS,
        }
    }
}

impl EngineConfig {
    pub fn with_transport_slots(mut self, slots: usize) -> Self {
        self.transport_slots = slots;
        self
    }

    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    pub fn with_batch_size(mut self, records: usize) -> Self {
        self.batch_size = records;
        self
    }

    pub fn with_maxactive(mut self, maxactive: usize) -> Self {
        self.default_maxactive = maxactive;
        self
    }

    pub fn with_xol_slots(mut self, slots: usize) -> Self {
        self.xol_slots = slots;
        self
    }

    /// Check every field is in range.
    ///
    /// The transport pool must be a power of two, a payload must fit the
    /// 16-bit record length, and an out-of-line area needs at least one
    /// slot besides the trampoline slot.
    pub fn validate(&self) -> Result<()> {
        let slots = self.transport_slots;
        if slots == 0 || (slots & (slots - 1)) != 0 {
            error!("transport slots must be a power of 2, got {}", slots);
            return Err(Error::InvalidConfig("transport_slots"));
        }
        let record_len = self.max_payload.checked_add(HEADER_LEN);
        if self.max_payload < MIN_PAYLOAD || record_len.is_none_or(|len| len > u16::MAX as usize) {
            error!("max payload {} out of range", self.max_payload);
            return Err(Error::InvalidConfig("max_payload"));
        }
        if self.batch_size == 0 || self.batch_size > slots {
            error!("batch size {} must be within 1..={}", self.batch_size, slots);
            return Err(Error::InvalidConfig("batch_size"));
        }
        if self.default_maxactive == 0 {
            return Err(Error::InvalidConfig("default_maxactive"));
        }
        if !(2..=MAX_XOL_SLOTS).contains(&self.xol_slots) {
            error!("xol slots {} must be within 2..={}", self.xol_slots, MAX_XOL_SLOTS);
            return Err(Error::InvalidConfig("xol_slots"));
        }
        Ok(())
    }
}
