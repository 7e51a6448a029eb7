//! VRAM Buffer Manager
//!
//! One contiguous, always-resident device range per buffer. The range is
//! reserved at its maximum size up front and backed chunk by chunk as it
//! grows; it never shrinks until destroyed. Sub-allocations are a plain bump
//! allocator over the backed prefix.

use tracing::{debug, warn};
use vbar_gpu::{DeviceBackend, DeviceOrdinal, DevicePtr, PhysHandle};

use crate::config::round_up;
use crate::engine::{Engine, EngineState};
use crate::error::{Result, VbarError};
use crate::handle::Handle;
use crate::pressure::PressureEvent;
use crate::region::{Region, RegionOwner};

/// Handle to a VRAM buffer
pub type VramBufferHandle = Handle<VramBuffer>;

/// Growable, never-evicted device range
#[derive(Debug)]
pub struct VramBuffer {
    device: DeviceOrdinal,
    base: DevicePtr,
    max_size: u64,
    reserved: u64,
    chunks: Vec<PhysHandle>,
    chunk_size: u64,
    bump: u64,
}

impl VramBuffer {
    fn backed(&self) -> u64 {
        self.chunks.len() as u64 * self.chunk_size
    }

    fn chunk_va(&self, index: usize) -> DevicePtr {
        self.base.byte_offset(index as u64 * self.chunk_size)
    }

    pub(crate) fn release(self, backend: &dyn DeviceBackend) {
        for (i, &phys) in self.chunks.iter().enumerate() {
            if let Err(e) = backend.unmap(self.chunk_va(i), self.chunk_size, phys) {
                warn!(chunk = i, error = %e, "chunk unmap on teardown failed");
            }
        }
        if let Err(e) = backend.release(self.base, self.reserved) {
            warn!(error = %e, "address release on teardown failed");
        }
    }
}

impl Engine {
    /// Reserve a VRAM buffer of up to `max_size` bytes on `device`
    ///
    /// Nothing is backed until the first grow.
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::AddressReservation)` if the range cannot be
    /// reserved.
    pub fn vrambuf_create(&self, device: DeviceOrdinal, max_size: u64) -> Result<VramBufferHandle> {
        if max_size == 0 {
            return Err(VbarError::InvalidArgument("zero-size VRAM buffer".to_string()));
        }
        self.check_device(device)?;
        let chunk_size = self.config.vram_chunk_size;
        let reserved = round_up(max_size, chunk_size)?;
        let base = self
            .backend
            .reserve(reserved, chunk_size)
            .map_err(|source| VbarError::AddressReservation {
                size: reserved,
                source,
            })?;
        let handle = self.lock().vram_buffers.insert(VramBuffer {
            device,
            base,
            max_size,
            reserved,
            chunks: Vec::new(),
            chunk_size,
            bump: 0,
        });
        debug!(vrambuf = handle.to_raw(), device, max_size, "vram buffer created");
        Ok(handle)
    }

    /// Back at least the first `required` bytes
    ///
    /// Growth is in whole chunks; a grow to a size already backed is a no-op.
    /// Chunks mapped before a failure stay mapped.
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::VramGrowFailed)` if `required` exceeds the
    /// buffer or device memory cannot be found after reclamation; a pressure
    /// event is posted in the latter case.
    pub fn vrambuf_grow(&self, buf: VramBufferHandle, required: u64) -> Result<()> {
        let mut state = self.lock();
        self.grow_locked(&mut state, buf, required)
    }

    fn grow_locked(&self, state: &mut EngineState, buf: VramBufferHandle, required: u64) -> Result<()> {
        let (device, max_size, backed, chunk_size, reserved) = {
            let b = state.vram_buffers.get(buf)?;
            (b.device, b.max_size, b.backed(), b.chunk_size, b.reserved)
        };
        if required <= backed {
            return Ok(());
        }
        if required > max_size {
            warn!(vrambuf = buf.to_raw(), required, max_size, "vram grow past capacity");
            return Err(VbarError::VramGrowFailed {
                requested: required,
                max_size,
            });
        }
        let target = (required.div_ceil(chunk_size) * chunk_size).min(reserved);
        debug!(
            vrambuf = buf.to_raw(),
            from_mib = backed >> 20,
            to_mib = target >> 20,
            "vrambuf_grow"
        );

        let mut offset = backed;
        while offset < target {
            let va = state.vram_buffers.get(buf)?.base.byte_offset(offset);
            let mut reclaimed = self.reclaim_for(state, device, chunk_size)?;
            let attempt = self.map_with_reclaim(state, va, chunk_size, device, chunk_size)?;
            reclaimed += attempt.reclaimed;
            let Some(phys) = attempt.phys else {
                self.post_pressure(PressureEvent {
                    device,
                    requested: target - offset,
                    reclaimed,
                });
                return Err(VbarError::VramGrowFailed {
                    requested: required,
                    max_size,
                });
            };
            state.vram_buffers.get_mut(buf)?.chunks.push(phys);
            offset += chunk_size;
        }
        Ok(())
    }

    /// Base address
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a destroyed buffer.
    pub fn vrambuf_get(&self, buf: VramBufferHandle) -> Result<DevicePtr> {
        Ok(self.lock().vram_buffers.get(buf)?.base)
    }

    /// Bytes currently backed
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a destroyed buffer.
    pub fn vrambuf_allocated(&self, buf: VramBufferHandle) -> Result<u64> {
        Ok(self.lock().vram_buffers.get(buf)?.backed())
    }

    /// Carve `bytes` from the buffer, growing it to cover them
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::VirtualRangeExhausted)` past the buffer's
    /// maximum size, or the grow error.
    pub fn vrambuf_suballoc(&self, buf: VramBufferHandle, bytes: u64) -> Result<Region> {
        let align = self.config.alloc_alignment;
        let mut state = self.lock();
        let (start, base) = {
            let b = state.vram_buffers.get(buf)?;
            let start = b.bump.div_ceil(align) * align;
            let available = b.max_size.saturating_sub(start);
            if bytes > available {
                return Err(VbarError::VirtualRangeExhausted {
                    requested: bytes,
                    available,
                });
            }
            (start, b.base)
        };
        self.grow_locked(&mut state, buf, start + bytes)?;
        state.vram_buffers.get_mut(buf)?.bump = start + bytes;
        Ok(Region {
            owner: RegionOwner::Vram(buf),
            offset: start,
            address: base.byte_offset(start),
            size: bytes,
        })
    }

    /// Unmap every chunk and release the range
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::Device)` if the device cannot synchronise or
    /// unmap; the buffer stays alive in that case.
    pub fn vrambuf_destroy(&self, buf: VramBufferHandle) -> Result<()> {
        let mut state = self.lock();
        let (device, chunks) = {
            let b = state.vram_buffers.get(buf)?;
            (b.device, b.chunks.len())
        };
        if chunks > 0 {
            self.backend.synchronize(device)?;
        }
        loop {
            let Some(phys) = state.vram_buffers.get_mut(buf)?.chunks.pop() else {
                break;
            };
            let (va, size) = {
                let b = state.vram_buffers.get(buf)?;
                (b.chunk_va(b.chunks.len()), b.chunk_size)
            };
            if let Err(e) = self.unmap_charged(&mut state, va, size, phys, device) {
                state.vram_buffers.get_mut(buf)?.chunks.push(phys);
                return Err(e);
            }
        }
        let b = state.vram_buffers.remove(buf)?;
        self.backend.release(b.base, b.reserved)?;
        debug!(vrambuf = buf.to_raw(), "vram buffer destroyed");
        Ok(())
    }
}
