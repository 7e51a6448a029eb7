//! CUDA Device Backend
//!
//! Retains the primary context of every visible device. Calls that name a
//! device bind that device's context; virtual reservations and stream work
//! use the home device given at construction.

use std::ffi::c_void;

use super::DeviceBackend;
use crate::driver::{
    self, PrimaryContext, DeviceOrdinal, DevicePtr, HostPtr, PhysHandle, SignalHandle, StreamHandle,
};
use crate::{GpuError, Result};

/// Size of a completion signal word
const SIGNAL_BYTES: u64 = 4;

/// CUDA driver backed device
pub struct CudaDevice {
    contexts: Vec<PrimaryContext>,
    home: usize,
}

impl CudaDevice {
    /// Retain every device's primary context, `home` becoming current
    ///
    /// # Errors
    ///
    /// Returns `Err(GpuError::CudaNotAvailable)` if the driver cannot be
    /// loaded, `Err(GpuError::DeviceNotFound)` if `home` does not exist.
    pub fn new(home: DeviceOrdinal) -> Result<Self> {
        let count = driver::visible_devices()?;
        let home_index = usize::try_from(home)
            .ok()
            .filter(|&i| i < count)
            .ok_or(GpuError::DeviceNotFound(home, count))?;
        let contexts = (0..count as i32)
            .map(PrimaryContext::retain)
            .collect::<Result<Vec<_>>>()?;
        contexts[home_index].bind()?;
        Ok(Self {
            contexts,
            home: home_index,
        })
    }

    fn context(&self, device: DeviceOrdinal) -> Result<&PrimaryContext> {
        let ctx = usize::try_from(device)
            .ok()
            .and_then(|i| self.contexts.get(i))
            .ok_or(GpuError::DeviceNotFound(device, self.contexts.len()))?;
        ctx.bind()?;
        Ok(ctx)
    }

    fn home(&self) -> Result<&PrimaryContext> {
        let ctx = &self.contexts[self.home];
        ctx.bind()?;
        Ok(ctx)
    }

    fn raw_stream(stream: StreamHandle) -> driver::sys::CUstream {
        stream.as_raw() as usize as driver::sys::CUstream
    }
}

impl DeviceBackend for CudaDevice {
    fn name(&self) -> &str {
        "CUDA"
    }

    fn device_count(&self) -> usize {
        self.contexts.len()
    }

    fn device_name(&self, device: DeviceOrdinal) -> Result<String> {
        self.context(device)?.name()
    }

    fn total_memory(&self, device: DeviceOrdinal) -> Result<u64> {
        self.context(device)?.total_memory()
    }

    fn memory_info(&self, device: DeviceOrdinal) -> Result<(u64, u64)> {
        self.context(device)?.memory_info()
    }

    fn reserve(&self, size: u64, alignment: u64) -> Result<DevicePtr> {
        self.home()?;
        driver::reserve_address(size, alignment).map(DevicePtr)
    }

    fn release(&self, va: DevicePtr, size: u64) -> Result<()> {
        self.home()?;
        driver::free_address(va.as_raw(), size)
    }

    fn map(&self, va: DevicePtr, size: u64, device: DeviceOrdinal) -> Result<PhysHandle> {
        self.context(device)?;
        driver::map_physical(va.as_raw(), size, device).map(PhysHandle)
    }

    fn unmap(&self, va: DevicePtr, size: u64, phys: PhysHandle) -> Result<()> {
        self.home()?;
        driver::unmap_physical(va.as_raw(), size, phys.0)
    }

    fn synchronize(&self, device: DeviceOrdinal) -> Result<()> {
        self.context(device)?.synchronize()
    }

    fn host_alloc(&self, size: u64) -> Result<HostPtr> {
        self.home()?;
        let p = driver::host_alloc(size)?;
        // SAFETY: fresh allocation of exactly `size` bytes
        unsafe { std::ptr::write_bytes(p.cast::<u8>(), 0, size as usize) };
        Ok(HostPtr(p as usize as u64))
    }

    fn host_free(&self, ptr: HostPtr, _size: u64) -> Result<()> {
        self.home()?;
        driver::host_free(ptr.as_mut_ptr().cast::<c_void>())
    }

    unsafe fn copy_htod_async(
        &self,
        dst: DevicePtr,
        src: HostPtr,
        size: u64,
        stream: StreamHandle,
    ) -> Result<()> {
        self.home()?;
        // SAFETY: caller keeps src readable until the copy executes
        unsafe {
            driver::copy_htod_async(
                dst.as_raw(),
                src.as_mut_ptr().cast::<c_void>().cast_const(),
                size as usize,
                Self::raw_stream(stream),
            )
        }
    }

    fn copy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        size: u64,
        stream: StreamHandle,
    ) -> Result<()> {
        self.home()?;
        driver::copy_dtod_async(dst.as_raw(), src.as_raw(), size as usize, Self::raw_stream(stream))
    }

    fn write_value_async(
        &self,
        stream: StreamHandle,
        signal: SignalHandle,
        value: u32,
    ) -> Result<()> {
        self.home()?;
        driver::write_value(Self::raw_stream(stream), signal.device.as_raw(), value)
    }

    fn wait_value_async(
        &self,
        stream: StreamHandle,
        signal: SignalHandle,
        value: u32,
    ) -> Result<()> {
        self.home()?;
        driver::wait_value(Self::raw_stream(stream), signal.device.as_raw(), value)
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<()> {
        self.home()?;
        driver::synchronize(Self::raw_stream(stream))
    }

    fn signal_create(&self) -> Result<SignalHandle> {
        let host = self.host_alloc(SIGNAL_BYTES)?;
        match driver::host_device_pointer(host.as_mut_ptr().cast::<c_void>()) {
            Ok(device) => Ok(SignalHandle {
                host: host.0,
                device: DevicePtr(device),
            }),
            Err(e) => {
                let _ = self.host_free(host, SIGNAL_BYTES);
                Err(e)
            }
        }
    }

    fn signal_destroy(&self, signal: SignalHandle) -> Result<()> {
        self.host_free(HostPtr(signal.host), SIGNAL_BYTES)
    }

    fn signal_read(&self, signal: SignalHandle) -> u32 {
        // SAFETY: the word is live host-mapped memory written by the device
        unsafe { std::ptr::read_volatile(signal.host as usize as *const u32) }
    }
}
