//! Error types for VBAR operations
//!
//! "Evicted" is not an error: a fault that cannot be made resident returns
//! [`crate::FaultOutcome::Evicted`]. Everything here is either resource
//! exhaustion, a contract violation at the call site, or a device failure,
//! and [`VbarError::class`] tells the three apart.

use thiserror::Error;
use vbar_gpu::GpuError;

/// Result type for VBAR operations
pub type Result<T> = std::result::Result<T, VbarError>;

/// Broad category of a [`VbarError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Out of some resource; retrying later may succeed
    ResourceExhausted,
    /// The call itself is wrong; retrying will not help
    Contract,
    /// Device or driver failure, fatal to this operation only
    Device,
    /// The engine was never initialised
    Unavailable,
}

/// Errors that can occur during VBAR operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VbarError {
    /// Bump allocation would run past the end of the virtual range
    #[error("Virtual range exhausted: {requested} bytes requested, {available} available")]
    VirtualRangeExhausted {
        /// Bytes requested
        requested: u64,
        /// Bytes left in the range
        available: u64,
    },

    /// Device virtual address space could not be reserved
    #[error("Could not reserve {size} bytes of virtual address space: {source}")]
    AddressReservation {
        /// Bytes requested
        size: u64,
        /// Driver failure
        source: GpuError,
    },

    /// VRAM buffer could not grow to the requested size
    #[error("VRAM buffer grow to {requested} bytes failed (max {max_size})")]
    VramGrowFailed {
        /// Size requested
        requested: u64,
        /// Buffer capacity
        max_size: u64,
    },

    /// Pinned host allocation failed
    #[error("Host allocation of {0} bytes failed")]
    HostAllocation(u64),

    /// Device memory could not be obtained even after reclamation
    #[error("Device {device} out of memory after reclamation ({requested} bytes requested)")]
    DeviceOutOfMemory {
        /// Device ordinal
        device: i32,
        /// Bytes requested
        requested: u64,
    },

    /// Handle refers to a destroyed resource (includes double free)
    #[error("Stale {0} handle")]
    StaleHandle(&'static str),

    /// Raw handle value that was never issued for this resource type
    #[error("Invalid {0} handle")]
    InvalidHandle(&'static str),

    /// Unpin of a page with no outstanding fault
    #[error("Unpin without matching fault at page {page}")]
    UnpinWithoutFault {
        /// Page index within the VBAR
        page: u64,
    },

    /// Free of a VBAR that still has pinned pages
    #[error("VBAR freed with {pinned_pages} pinned pages")]
    PinnedOnFree {
        /// Pages with a non-zero pin count
        pinned_pages: usize,
    },

    /// Two signature sets of different lengths were compared
    #[error("Signature sets have different lengths: {left} vs {right}")]
    SignatureLengthMismatch {
        /// Left length
        left: usize,
        /// Right length
        right: usize,
    },

    /// Byte range does not fit inside the resource
    #[error("Range {offset}+{size} exceeds {limit} bytes")]
    RangeOutOfBounds {
        /// Start offset
        offset: u64,
        /// Length
        size: u64,
        /// Resource size
        limit: u64,
    },

    /// Invalid input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Slot destroyed or restaged while work is still in flight
    #[error("Transfer slot has work in flight")]
    SlotBusy,

    /// Allocator free of a pointer it never handed out
    #[error("Unknown device pointer {0:#x}")]
    UnknownPointer(u64),

    /// Transfer kind code outside {1, 2, 3}
    #[error("Invalid transfer kind {0}")]
    InvalidTransfer(u32),

    /// Engine not initialised
    #[error("VBAR engine not initialized")]
    NotInitialized,

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] GpuError),
}

impl VbarError {
    /// Category of this error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::VirtualRangeExhausted { .. }
            | Self::AddressReservation { .. }
            | Self::VramGrowFailed { .. }
            | Self::HostAllocation(_)
            | Self::DeviceOutOfMemory { .. } => ErrorClass::ResourceExhausted,
            Self::StaleHandle(_)
            | Self::InvalidHandle(_)
            | Self::UnpinWithoutFault { .. }
            | Self::PinnedOnFree { .. }
            | Self::SignatureLengthMismatch { .. }
            | Self::RangeOutOfBounds { .. }
            | Self::InvalidArgument(_)
            | Self::SlotBusy
            | Self::UnknownPointer(_)
            | Self::InvalidTransfer(_) => ErrorClass::Contract,
            Self::NotInitialized => ErrorClass::Unavailable,
            Self::Device(e) if e.is_out_of_memory() => ErrorClass::ResourceExhausted,
            Self::Device(GpuError::HostAllocation(_)) => ErrorClass::ResourceExhausted,
            Self::Device(_) => ErrorClass::Device,
        }
    }

    /// True when the caller should fix the call site rather than retry
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        self.class() == ErrorClass::Contract
    }
}
