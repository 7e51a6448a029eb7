//! Driver Initialisation and Primary Contexts
//!
//! [`get_driver`] loads the driver library and runs `cuInit` exactly once per
//! process. [`PrimaryContext`] retains one device's primary context for the
//! lifetime of a [`crate::CudaDevice`]; the engine is called from arbitrary
//! host threads, so every device query binds the context first.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use std::sync::OnceLock;

use super::sys::{CUcontext, CUdevice, CudaDriver};
use crate::GpuError;

/// Outcome of the one-time `cuInit`, as a raw driver code on failure
static INIT: OnceLock<Result<(), i32>> = OnceLock::new();

/// Loaded and initialised driver
///
/// # Errors
///
/// Returns `Err(GpuError::CudaNotAvailable)` if the library cannot be loaded
/// and `Err(GpuError::DeviceInit)` if `cuInit` failed.
pub fn get_driver() -> Result<&'static CudaDriver, GpuError> {
    let driver = CudaDriver::load()
        .ok_or_else(|| GpuError::CudaNotAvailable("CUDA driver not found".to_string()))?;
    let init = INIT.get_or_init(|| {
        // SAFETY: cuInit takes no pointers; flags must be zero
        let code = unsafe { (driver.cuInit)(0) };
        CudaDriver::check(code).map_err(|_| code)
    });
    match *init {
        Ok(()) => Ok(driver),
        Err(code) => Err(GpuError::DeviceInit(format!("cuInit failed with code {}", code))),
    }
}

/// Number of devices the driver reports
///
/// # Errors
///
/// Returns `Err(GpuError::CudaNotAvailable)` without a driver.
pub fn visible_devices() -> Result<usize, GpuError> {
    let driver = get_driver()?;
    let mut count = 0;
    // SAFETY: count is a valid out-pointer
    CudaDriver::check(unsafe { (driver.cuDeviceGetCount)(&mut count) })?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Retained primary context of one device, released on drop
pub struct PrimaryContext {
    device: CUdevice,
    context: CUcontext,
}

// SAFETY: primary contexts may be bound from any thread
unsafe impl Send for PrimaryContext {}
unsafe impl Sync for PrimaryContext {}

impl PrimaryContext {
    /// Retain the primary context of device `ordinal`
    ///
    /// # Errors
    ///
    /// Returns `Err(GpuError::CudaDriver)` if the device handle or context
    /// cannot be obtained.
    pub fn retain(ordinal: i32) -> Result<Self, GpuError> {
        let driver = get_driver()?;
        let mut device: CUdevice = 0;
        // SAFETY: device is a valid out-pointer
        CudaDriver::check(unsafe { (driver.cuDeviceGet)(&mut device, ordinal) })?;
        let mut context: CUcontext = ptr::null_mut();
        // SAFETY: device came from cuDeviceGet
        CudaDriver::check(unsafe { (driver.cuDevicePrimaryCtxRetain)(&mut context, device) })?;
        Ok(Self { device, context })
    }

    /// Bind to the calling thread
    ///
    /// # Errors
    ///
    /// Returns `Err(GpuError::CudaDriver)` if `cuCtxSetCurrent` fails.
    pub fn bind(&self) -> Result<(), GpuError> {
        let driver = get_driver()?;
        // SAFETY: context is retained for the lifetime of self
        CudaDriver::check(unsafe { (driver.cuCtxSetCurrent)(self.context) })
    }

    /// (free, total) bytes
    pub fn memory_info(&self) -> Result<(u64, u64), GpuError> {
        self.bind()?;
        let driver = get_driver()?;
        let (mut free, mut total) = (0usize, 0usize);
        // SAFETY: both out-pointers are valid; the context is current
        CudaDriver::check(unsafe { (driver.cuMemGetInfo)(&mut free, &mut total) })?;
        Ok((free as u64, total as u64))
    }

    /// Wait for all work in this context
    pub fn synchronize(&self) -> Result<(), GpuError> {
        self.bind()?;
        let driver = get_driver()?;
        // SAFETY: the context is current
        CudaDriver::check(unsafe { (driver.cuCtxSynchronize)() })
            .map_err(|e| GpuError::StreamSync(e.to_string()))
    }

    /// Marketing name of the device
    pub fn name(&self) -> Result<String, GpuError> {
        let driver = get_driver()?;
        let mut buf = [0 as c_char; 128];
        // SAFETY: buf is writable for its full length
        CudaDriver::check(unsafe {
            (driver.cuDeviceGetName)(buf.as_mut_ptr(), buf.len() as i32, self.device)
        })?;
        buf[buf.len() - 1] = 0;
        // SAFETY: buf is NUL-terminated above
        Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned())
    }

    /// Physical capacity in bytes
    pub fn total_memory(&self) -> Result<u64, GpuError> {
        let driver = get_driver()?;
        let mut bytes = 0usize;
        // SAFETY: bytes is a valid out-pointer
        CudaDriver::check(unsafe { (driver.cuDeviceTotalMem)(&mut bytes, self.device) })?;
        Ok(bytes as u64)
    }
}

impl Drop for PrimaryContext {
    fn drop(&mut self) {
        if let Ok(driver) = get_driver() {
            // SAFETY: balances the retain in PrimaryContext::retain
            let _ = unsafe { (driver.cuDevicePrimaryCtxRelease)(self.device) };
        }
    }
}
