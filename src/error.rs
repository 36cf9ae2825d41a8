//! Error type shared by every engine component.

use axerrno::AxError;

/// Errors returned by probe, hook, image and transport operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The instruction at the probe address cannot be probed safely.
    DecodeUnsupported,
    /// A probe already occupies the address.
    AlreadyInstalled,
    /// No probe is installed at the address.
    NotInstalled,
    /// The target page is not resident or not writable.
    MemoryFault,
    /// The transport queue is saturated; the event is dropped.
    Backpressure,
    /// A subscriber counter would have gone below zero.
    CounterUnderflow,
    /// A registration asked for a different action hint at an occupied address.
    Conflict,
    /// Handle or key does not name a live object.
    NotFound,
    /// The engine is disabled.
    NotInitialized,
    /// Out-of-line instruction area has no free slot.
    NoSlot,
    /// Address is not aligned for its instruction set.
    Misaligned,
    /// Owning module is unloading and cannot be pinned.
    OwnerGone,
    /// Configuration value out of range.
    InvalidConfig(&'static str),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DecodeUnsupported => write!(f, "instruction cannot be probed"),
            Self::AlreadyInstalled => write!(f, "probe already installed at this address"),
            Self::NotInstalled => write!(f, "no probe installed at this address"),
            Self::MemoryFault => write!(f, "target memory not accessible"),
            Self::Backpressure => write!(f, "transport queue full"),
            Self::CounterUnderflow => write!(f, "subscriber counter underflow"),
            Self::Conflict => write!(f, "conflicting action hint for this address"),
            Self::NotFound => write!(f, "not found"),
            Self::NotInitialized => write!(f, "engine not initialized"),
            Self::NoSlot => write!(f, "no free out-of-line slot"),
            Self::Misaligned => write!(f, "address misaligned for instruction set"),
            Self::OwnerGone => write!(f, "owner is unloading"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl core::error::Error for Error {}

impl From<AxError> for Error {
    fn from(e: AxError) -> Self {
        log::debug!("memory access failed: {:?}", e);
        Self::MemoryFault
    }
}

/// Crate result alias.
pub type Result<T> = core::result::Result<T, Error>;
