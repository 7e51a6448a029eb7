//! Error types for vbar-gpu operations
//!
//! Covers CUDA driver failures, device discovery, virtual memory mapping and
//! stream work. Out-of-memory is kept apart from every other driver failure
//! because the paging engine reacts to it by evicting and retrying.

use thiserror::Error;

/// Result type alias for vbar-gpu operations
pub type Result<T> = std::result::Result<T, GpuError>;

/// Errors that can occur during GPU operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// CUDA driver error
    #[error("CUDA driver error: {0} (code: {1})")]
    CudaDriver(String, i32),

    /// CUDA driver library could not be loaded or the feature is disabled
    #[error("CUDA not available: {0}")]
    CudaNotAvailable(String),

    /// Driver initialisation or context setup failed
    #[error("Device initialization failed: {0}")]
    DeviceInit(String),

    /// Device ordinal out of range
    #[error("Device {0} not found ({1} devices available)")]
    DeviceNotFound(i32, usize),

    /// Physical device memory could not be created because the device is full
    #[error("Device {device} out of memory ({requested} bytes requested)")]
    OutOfMemory {
        /// Device ordinal
        device: i32,
        /// Bytes requested
        requested: u64,
    },

    /// Virtual address reservation or mapping failed
    #[error("GPU memory allocation failed: {0}")]
    MemoryAllocation(String),

    /// Pinned host allocation failed
    #[error("Host allocation of {0} bytes failed")]
    HostAllocation(u64),

    /// Copy rejected or failed
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Stream creation failed
    #[error("Stream creation failed: {0}")]
    StreamCreate(String),

    /// Stream or context synchronisation failed
    #[error("Stream synchronization failed: {0}")]
    StreamSync(String),

    /// Invalid argument passed to the device layer
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl GpuError {
    /// True when the device reported it is out of physical memory
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
