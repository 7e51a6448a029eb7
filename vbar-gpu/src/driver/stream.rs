//! CUDA Stream Operations
//!
//! The paging engine never owns the compute stream: it is handed raw stream
//! handles by the host runtime and enqueues copies and 32-bit memory
//! operations on them. [`CudaStream`] exists for hosts (and tests) that want
//! a private non-blocking stream.
//!
//! Ordering between streams uses `cuStreamWriteValue32` on the producer and
//! `cuStreamWaitValue32` (GEQ) on the consumer, so no host thread blocks.

use std::ffi::c_void;
use std::ptr;

use super::context::get_driver;
use super::sys::{
    CUdeviceptr, CUstream, CudaDriver, CU_STREAM_NON_BLOCKING, CU_STREAM_WAIT_VALUE_GEQ,
    CU_STREAM_WRITE_VALUE_DEFAULT,
};
use crate::GpuError;

// ============================================================================
// CUDA Stream
// ============================================================================

/// Owned non-blocking CUDA stream, destroyed on drop
pub struct CudaStream {
    stream: CUstream,
}

// SAFETY: CUstream handles are thread-safe
unsafe impl Send for CudaStream {}
unsafe impl Sync for CudaStream {}

impl CudaStream {
    /// Create a new non-blocking stream on the current context
    ///
    /// # Errors
    ///
    /// Returns `Err(GpuError::StreamCreate)` if stream creation fails.
    pub fn new() -> Result<Self, GpuError> {
        let driver = get_driver()?;

        let mut stream: CUstream = ptr::null_mut();
        // SAFETY: stream pointer is valid
        let result = unsafe { (driver.cuStreamCreate)(&mut stream, CU_STREAM_NON_BLOCKING) };
        CudaDriver::check(result).map_err(|e| GpuError::StreamCreate(e.to_string()))?;

        Ok(Self { stream })
    }

    /// Raw stream handle, valid while this `CudaStream` is alive
    #[must_use]
    pub fn raw(&self) -> CUstream {
        self.stream
    }

    /// Block until all commands in this stream have completed
    ///
    /// # Errors
    ///
    /// Returns `Err(GpuError::StreamSync)` if synchronization fails.
    pub fn synchronize(&self) -> Result<(), GpuError> {
        synchronize(self.stream)
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        if let Ok(driver) = get_driver() {
            // SAFETY: stream is valid from constructor
            unsafe {
                let _ = (driver.cuStreamDestroy)(self.stream);
            }
        }
    }
}

// ============================================================================
// Borrowed-stream operations
// ============================================================================

/// Block until all commands in `stream` have completed
///
/// # Errors
///
/// Returns `Err(GpuError::StreamSync)` if synchronization fails.
pub fn synchronize(stream: CUstream) -> Result<(), GpuError> {
    let driver = get_driver()?;
    // SAFETY: caller passes a live stream (or null for the default stream)
    let result = unsafe { (driver.cuStreamSynchronize)(stream) };
    CudaDriver::check(result).map_err(|e| GpuError::StreamSync(e.to_string()))
}

/// Enqueue an async host-to-device copy
///
/// # Safety
///
/// `src` must stay valid for `size` bytes until the copy has executed.
///
/// # Errors
///
/// Returns `Err(GpuError::Transfer)` if the driver rejects the copy.
pub unsafe fn copy_htod_async(
    dst: CUdeviceptr,
    src: *const c_void,
    size: usize,
    stream: CUstream,
) -> Result<(), GpuError> {
    let driver = get_driver()?;
    // SAFETY: caller guarantees src lifetime, driver validates dst
    let result = unsafe { (driver.cuMemcpyHtoDAsync)(dst, src, size, stream) };
    CudaDriver::check(result).map_err(|e| GpuError::Transfer(e.to_string()))
}

/// Enqueue an async device-to-device copy
///
/// # Errors
///
/// Returns `Err(GpuError::Transfer)` if the driver rejects the copy.
pub fn copy_dtod_async(
    dst: CUdeviceptr,
    src: CUdeviceptr,
    size: usize,
    stream: CUstream,
) -> Result<(), GpuError> {
    let driver = get_driver()?;
    // SAFETY: device addresses are validated by the driver
    let result = unsafe { (driver.cuMemcpyDtoDAsync)(dst, src, size, stream) };
    CudaDriver::check(result).map_err(|e| GpuError::Transfer(e.to_string()))
}

/// Write `value` to `addr` once prior work on `stream` has completed
///
/// # Errors
///
/// Returns `Err(GpuError::Transfer)` if the driver rejects the operation.
pub fn write_value(stream: CUstream, addr: CUdeviceptr, value: u32) -> Result<(), GpuError> {
    let driver = get_driver()?;
    // SAFETY: addr is a device alias of host-mapped memory owned by the caller
    let result =
        unsafe { (driver.cuStreamWriteValue32)(stream, addr, value, CU_STREAM_WRITE_VALUE_DEFAULT) };
    CudaDriver::check(result).map_err(|e| GpuError::Transfer(e.to_string()))
}

/// Make `stream` wait until `*addr >= value`
///
/// # Errors
///
/// Returns `Err(GpuError::Transfer)` if the driver rejects the operation.
pub fn wait_value(stream: CUstream, addr: CUdeviceptr, value: u32) -> Result<(), GpuError> {
    let driver = get_driver()?;
    // SAFETY: addr is a device alias of host-mapped memory owned by the caller
    let result =
        unsafe { (driver.cuStreamWaitValue32)(stream, addr, value, CU_STREAM_WAIT_VALUE_GEQ) };
    CudaDriver::check(result).map_err(|e| GpuError::Transfer(e.to_string()))
}

/// Null stream handle (legacy default stream)
pub const DEFAULT_STREAM: CUstream = ptr::null_mut();
