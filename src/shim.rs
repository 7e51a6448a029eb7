//! Device Allocator Shim
//!
//! Backs a host runtime's pluggable allocator with the same device memory
//! accounting the paging engine uses. Each allocation gets its own reserved
//! range, rounded up to the shim granularity, and is mapped after the same
//! up-front reclamation a page fault does. When memory still cannot be found
//! a [`PressureEvent`] is posted and the call fails with
//! [`VbarError::DeviceOutOfMemory`]; retrying is the caller's decision.

use std::collections::HashMap;

use tracing::{debug, warn};
use vbar_gpu::{DeviceBackend, DeviceOrdinal, DevicePtr, PhysHandle};

use crate::config::round_up;
use crate::engine::Engine;
use crate::error::{Result, VbarError};
use crate::pressure::PressureEvent;

#[derive(Debug, Clone, Copy)]
struct ShimBlock {
    size: u64,
    device: DeviceOrdinal,
    phys: PhysHandle,
}

/// Live shim allocations keyed by device address
#[derive(Debug, Default)]
pub(crate) struct ShimTable {
    blocks: HashMap<u64, ShimBlock>,
}

impl ShimTable {
    fn allocated_bytes(&self, device: DeviceOrdinal) -> u64 {
        self.blocks
            .values()
            .filter(|b| b.device == device)
            .map(|b| b.size)
            .sum()
    }

    pub(crate) fn release_all(&mut self, backend: &dyn DeviceBackend) {
        for (addr, block) in self.blocks.drain() {
            let va = DevicePtr(addr);
            if let Err(e) = backend.unmap(va, block.size, block.phys) {
                warn!(addr, error = %e, "shim unmap on teardown failed");
            }
            if let Err(e) = backend.release(va, block.size) {
                warn!(addr, error = %e, "shim release on teardown failed");
            }
        }
    }
}

impl Engine {
    /// Allocate `size` bytes of device memory on `device`
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::DeviceOutOfMemory)` if memory cannot be found
    /// after reclamation (a pressure event is posted first).
    pub fn shim_alloc(&self, size: u64, device: DeviceOrdinal) -> Result<DevicePtr> {
        if size == 0 {
            return Err(VbarError::InvalidArgument("zero-size device allocation".to_string()));
        }
        self.check_device(device)?;
        let granularity = self.config.shim_granularity;
        let rounded = round_up(size, granularity)?;
        let va = self
            .backend
            .reserve(rounded, granularity)
            .map_err(|source| VbarError::AddressReservation {
                size: rounded,
                source,
            })?;

        let mut state = self.lock();
        let attempt = self
            .reclaim_for(&mut state, device, rounded)
            .and_then(|reclaimed| {
                self.map_with_reclaim(&mut state, va, rounded, device, rounded)
                    .map(|a| (a, reclaimed))
            });
        let (phys, reclaimed) = match attempt {
            Ok((a, reclaimed)) => (a.phys, reclaimed + a.reclaimed),
            Err(e) => {
                drop(state);
                self.release_quietly(va, rounded);
                return Err(e);
            }
        };
        let Some(phys) = phys else {
            drop(state);
            self.release_quietly(va, rounded);
            self.post_pressure(PressureEvent {
                device,
                requested: rounded,
                reclaimed,
            });
            warn!(device, size, "device allocation failed after reclamation");
            return Err(VbarError::DeviceOutOfMemory {
                device,
                requested: size,
            });
        };
        state.shim.blocks.insert(
            va.as_raw(),
            ShimBlock {
                size: rounded,
                device,
                phys,
            },
        );
        debug!(ptr = va.as_raw(), size, rounded, device, "shim_alloc");
        Ok(va)
    }

    fn release_quietly(&self, va: DevicePtr, size: u64) {
        if let Err(e) = self.backend.release(va, size) {
            warn!(addr = va.as_raw(), error = %e, "address release failed");
        }
    }

    /// Free a pointer from [`Engine::shim_alloc`]; null is a no-op
    ///
    /// The caller guarantees no queued work still uses the memory.
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::UnknownPointer)` for a pointer the shim never
    /// handed out (including a double free).
    pub fn shim_free(&self, ptr: DevicePtr) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut state = self.lock();
        let block = state.shim.blocks.remove(&ptr.as_raw()).ok_or_else(|| {
            warn!(ptr = ptr.as_raw(), "free of unknown device pointer");
            VbarError::UnknownPointer(ptr.as_raw())
        })?;
        if let Err(e) = self.unmap_charged(&mut state, ptr, block.size, block.phys, block.device) {
            state.shim.blocks.insert(ptr.as_raw(), block);
            return Err(e);
        }
        drop(state);
        self.backend.release(ptr, block.size)?;
        debug!(ptr = ptr.as_raw(), size = block.size, "shim_free");
        Ok(())
    }

    /// Bytes the shim currently holds on `device`
    #[must_use]
    pub fn shim_allocated_bytes(&self, device: DeviceOrdinal) -> u64 {
        self.lock().shim.allocated_bytes(device)
    }
}
