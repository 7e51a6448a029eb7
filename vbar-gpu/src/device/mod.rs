//! Device Backend Abstraction
//!
//! The paging engine drives a GPU exclusively through [`DeviceBackend`]:
//!
//! - [`CudaDevice`] - CUDA driver API (feature `cuda`)
//! - [`SimDevice`] - deterministic in-process device for tests and GPU-less
//!   hosts

#[cfg(feature = "cuda")]
mod cuda;
mod sim;

#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;
pub use sim::{ReadTicket, SimDevice, SimFault};

use crate::driver::{DeviceOrdinal, DevicePtr, HostPtr, PhysHandle, SignalHandle, StreamHandle};
use crate::Result;

/// Primitives the paging engine needs from a device
///
/// Virtual ranges are process-wide; physical memory, synchronisation and
/// capacity are per device.
pub trait DeviceBackend: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Number of devices visible to this backend
    fn device_count(&self) -> usize;

    /// Human-readable device name
    fn device_name(&self, device: DeviceOrdinal) -> Result<String>;

    /// Physical capacity in bytes
    fn total_memory(&self, device: DeviceOrdinal) -> Result<u64>;

    /// (free, total) bytes as reported by the device
    fn memory_info(&self, device: DeviceOrdinal) -> Result<(u64, u64)>;

    /// Reserve a virtual address range with no physical backing
    fn reserve(&self, size: u64, alignment: u64) -> Result<DevicePtr>;

    /// Release a range from [`DeviceBackend::reserve`]; it must be fully unmapped
    fn release(&self, va: DevicePtr, size: u64) -> Result<()>;

    /// Create physical memory on `device` and map it read/write at `va`
    ///
    /// A full device is reported as `GpuError::OutOfMemory`; on any error
    /// `va` is left unmapped.
    fn map(&self, va: DevicePtr, size: u64, device: DeviceOrdinal) -> Result<PhysHandle>;

    /// Unmap `va` and release its physical memory
    fn unmap(&self, va: DevicePtr, size: u64, phys: PhysHandle) -> Result<()>;

    /// Block until all work on `device` has completed
    fn synchronize(&self, device: DeviceOrdinal) -> Result<()>;

    /// Allocate page-locked host memory, zero-initialised where the backend can
    fn host_alloc(&self, size: u64) -> Result<HostPtr>;

    /// Free memory from [`DeviceBackend::host_alloc`]
    fn host_free(&self, ptr: HostPtr, size: u64) -> Result<()>;

    /// Enqueue a host-to-device copy on `stream`
    ///
    /// # Safety
    ///
    /// `src` must be readable for `size` bytes until the copy has executed.
    unsafe fn copy_htod_async(
        &self,
        dst: DevicePtr,
        src: HostPtr,
        size: u64,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Enqueue a device-to-device copy on `stream`
    fn copy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        size: u64,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Store `value` into `signal` once prior work on `stream` has completed
    fn write_value_async(&self, stream: StreamHandle, signal: SignalHandle, value: u32)
        -> Result<()>;

    /// Make `stream` wait until `signal >= value`
    fn wait_value_async(&self, stream: StreamHandle, signal: SignalHandle, value: u32)
        -> Result<()>;

    /// Block until all work on `stream` has completed
    fn stream_synchronize(&self, stream: StreamHandle) -> Result<()>;

    /// Allocate a completion signal initialised to zero
    fn signal_create(&self) -> Result<SignalHandle>;

    /// Free a completion signal
    fn signal_destroy(&self, signal: SignalHandle) -> Result<()>;

    /// Current value of a completion signal as seen by the host
    fn signal_read(&self, signal: SignalHandle) -> u32;
}
