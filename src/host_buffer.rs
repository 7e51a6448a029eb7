//! Host Buffer Manager
//!
//! Fixed-size pinned host allocations, usable as zero-copy transfer sources
//! and as VBAR page sources.

use tracing::{debug, warn};
use vbar_gpu::{DeviceBackend, GpuError, HostPtr};

use crate::engine::Engine;
use crate::error::{Result, VbarError};
use crate::handle::Handle;

/// Handle to a pinned host buffer
pub type HostBufferHandle = Handle<HostBuffer>;

/// One pinned host allocation
#[derive(Debug)]
pub struct HostBuffer {
    pub(crate) ptr: HostPtr,
    pub(crate) size: u64,
}

impl HostBuffer {
    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VbarError::RangeOutOfBounds {
                offset,
                size: len,
                limit: self.size,
            }),
        }
    }

    pub(crate) fn release(self, backend: &dyn DeviceBackend) {
        if let Err(e) = backend.host_free(self.ptr, self.size) {
            warn!(error = %e, "host buffer free failed");
        }
    }
}

impl Engine {
    /// Allocate `size` bytes of pinned host memory
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::HostAllocation)` if the allocation fails.
    pub fn hostbuf_create(&self, size: u64) -> Result<HostBufferHandle> {
        if size == 0 {
            return Err(VbarError::InvalidArgument("zero-size host buffer".to_string()));
        }
        let ptr = self.backend.host_alloc(size).map_err(|e| match e {
            GpuError::HostAllocation(n) => VbarError::HostAllocation(n),
            other => other.into(),
        })?;
        let handle = self.lock().host_buffers.insert(HostBuffer { ptr, size });
        debug!(hostbuf = handle.to_raw(), size, "host buffer created");
        Ok(handle)
    }

    /// Host address of the buffer
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a destroyed buffer.
    pub fn hostbuf_get(&self, buf: HostBufferHandle) -> Result<HostPtr> {
        Ok(self.lock().host_buffers.get(buf)?.ptr)
    }

    /// Buffer size in bytes
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a destroyed buffer.
    pub fn hostbuf_size(&self, buf: HostBufferHandle) -> Result<u64> {
        Ok(self.lock().host_buffers.get(buf)?.size)
    }

    /// Copy `bytes` into the buffer at `offset`
    ///
    /// Bytes a queued copy has not yet read are overwritten; order writes
    /// after the slot that reads the buffer has gone idle.
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::RangeOutOfBounds)` if the bytes do not fit.
    pub fn hostbuf_write(&self, buf: HostBufferHandle, offset: u64, bytes: &[u8]) -> Result<()> {
        let state = self.lock();
        let b = state.host_buffers.get(buf)?;
        b.check_range(offset, bytes.len() as u64)?;
        // SAFETY: range checked against the live allocation above
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                b.ptr.byte_offset(offset).as_mut_ptr(),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes out of the buffer at `offset`
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::RangeOutOfBounds)` if the range does not fit.
    pub fn hostbuf_read(&self, buf: HostBufferHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        let state = self.lock();
        let b = state.host_buffers.get(buf)?;
        b.check_range(offset, len)?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: range checked against the live allocation above
        unsafe {
            std::ptr::copy_nonoverlapping(
                b.ptr.byte_offset(offset).as_mut_ptr().cast_const(),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(out)
    }

    /// Free the buffer
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::InvalidArgument)` while a VBAR uses it as page
    /// source, `Err(VbarError::StaleHandle)` on double destroy.
    pub fn hostbuf_destroy(&self, buf: HostBufferHandle) -> Result<()> {
        let mut state = self.lock();
        state.host_buffers.get(buf)?;
        if state
            .vbars
            .iter()
            .any(|(_, v)| v.source.is_some_and(|s| s.host == buf))
        {
            return Err(VbarError::InvalidArgument(
                "host buffer is attached to a VBAR as page source".to_string(),
            ));
        }
        let b = state.host_buffers.remove(buf)?;
        self.backend.host_free(b.ptr, b.size)?;
        debug!(hostbuf = buf.to_raw(), "host buffer destroyed");
        Ok(())
    }
}
