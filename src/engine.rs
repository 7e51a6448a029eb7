//! Engine context
//!
//! [`Engine`] owns every resource the paging layer hands out: VBARs, VRAM
//! buffers, host buffers, transfer slots and allocator shim blocks. All
//! bookkeeping sits behind one mutex so each call's effects are complete
//! when it returns; device work it enqueues may still be in flight.
//!
//! Device memory accounting is per device. Before mapping anything the
//! engine asks for a budget deficit and evicts that much up front, then
//! falls back to evicting on an out-of-memory from the driver.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};
use vbar_gpu::{DeviceBackend, DeviceOrdinal, DevicePtr, GpuError, PhysHandle};

use crate::config::EngineConfig;
use crate::error::{Result, VbarError};
use crate::eviction::EvictScope;
use crate::handle::{Arena, HOST_BUFFER_TAG, SLOT_TAG, VBAR_TAG, VRAM_BUFFER_TAG};
use crate::host_buffer::HostBuffer;
use crate::pressure::{PressureBus, PressureEvent};
use crate::residency::{Vbar, VbarStats};
use crate::shim::ShimTable;
use crate::signature::Signature;
use crate::transfer::TransferSlot;
use crate::vram_buffer::VramBuffer;

/// Mutable engine state, guarded by [`Engine`]'s mutex
pub(crate) struct EngineState {
    pub(crate) vbars: Arena<Vbar>,
    pub(crate) slots: Arena<TransferSlot>,
    pub(crate) host_buffers: Arena<HostBuffer>,
    pub(crate) vram_buffers: Arena<VramBuffer>,
    pub(crate) shim: ShimTable,
    usage: HashMap<DeviceOrdinal, u64>,
    clock: u64,
    last_signature: u64,
    pub(crate) top_rank: i64,
    pub(crate) bottom_rank: i64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            vbars: Arena::new("vbar", VBAR_TAG),
            slots: Arena::new("transfer slot", SLOT_TAG),
            host_buffers: Arena::new("host buffer", HOST_BUFFER_TAG),
            vram_buffers: Arena::new("vram buffer", VRAM_BUFFER_TAG),
            shim: ShimTable::default(),
            usage: HashMap::new(),
            clock: 0,
            last_signature: 0,
            top_rank: 0,
            bottom_rank: 0,
        }
    }

    /// Advance the recency clock
    pub(crate) fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Draw a signature no page has ever carried
    pub(crate) fn next_signature(&mut self) -> Signature {
        self.last_signature += 1;
        Signature(self.last_signature)
    }

    pub(crate) fn usage(&self, device: DeviceOrdinal) -> u64 {
        self.usage.get(&device).copied().unwrap_or(0)
    }

    pub(crate) fn charge(&mut self, device: DeviceOrdinal, bytes: u64) {
        *self.usage.entry(device).or_insert(0) += bytes;
    }

    pub(crate) fn credit(&mut self, device: DeviceOrdinal, bytes: u64) {
        let used = self.usage.entry(device).or_insert(0);
        *used = used.saturating_sub(bytes);
    }

    fn total_usage(&self) -> u64 {
        self.usage.values().sum()
    }
}

/// Outcome of [`Engine::map_with_reclaim`]
pub(crate) struct MapAttempt {
    /// Physical allocation, `None` if eviction ran out of victims
    pub(crate) phys: Option<PhysHandle>,
    /// Bytes evicted along the way
    pub(crate) reclaimed: u64,
}

/// The paging engine
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) backend: Arc<dyn DeviceBackend>,
    state: Mutex<EngineState>,
    pressure: PressureBus,
}

impl Engine {
    /// Build an engine on top of `backend`
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::InvalidArgument)` if `config` is invalid or
    /// the backend has no devices.
    pub fn new(config: EngineConfig, backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        config.validate()?;
        let count = backend.device_count();
        if count == 0 {
            return Err(VbarError::InvalidArgument(format!(
                "{} backend has no devices",
                backend.name()
            )));
        }
        for device in 0..count as DeviceOrdinal {
            match (backend.device_name(device), backend.total_memory(device)) {
                (Ok(name), Ok(total)) => {
                    info!(device, %name, vram_mib = total >> 20, "device ready");
                }
                (Err(e), _) | (_, Err(e)) => warn!(device, error = %e, "device query failed"),
            }
        }
        info!(
            backend = backend.name(),
            page_mib = config.page_size >> 20,
            headroom_mib = config.vram_headroom >> 20,
            "vbar engine initialized"
        );
        Ok(Self {
            config,
            backend,
            state: Mutex::new(EngineState::new()),
            pressure: PressureBus::default(),
        })
    }

    /// Build an engine on the CUDA driver with `home` as the default device
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::Device)` if the driver or device is missing.
    #[cfg(feature = "cuda")]
    pub fn with_cuda(config: EngineConfig, home: DeviceOrdinal) -> Result<Self> {
        let backend = vbar_gpu::CudaDevice::new(home)?;
        Self::new(config, Arc::new(backend))
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Device backend
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock()
    }

    /// Bytes of device memory the engine has mapped, all devices
    #[must_use]
    pub fn total_vram_usage(&self) -> u64 {
        self.lock().total_usage()
    }

    /// Bytes of device memory the engine has mapped on `device`
    #[must_use]
    pub fn device_usage(&self, device: DeviceOrdinal) -> u64 {
        self.lock().usage(device)
    }

    /// Receive an event whenever a device allocation fails after reclamation
    #[must_use]
    pub fn subscribe_pressure(&self) -> Receiver<PressureEvent> {
        self.pressure.subscribe()
    }

    pub(crate) fn post_pressure(&self, event: PressureEvent) {
        debug!(
            device = event.device,
            requested = event.requested,
            reclaimed = event.reclaimed,
            "memory pressure"
        );
        self.pressure.post(event);
    }

    /// Residency report of every VBAR, also logged at debug level
    #[must_use]
    pub fn analyze(&self) -> Vec<VbarStats> {
        let state = self.lock();
        debug!(
            vbars = state.vbars.len(),
            vram_buffers = state.vram_buffers.len(),
            host_buffers = state.host_buffers.len(),
            slots = state.slots.len(),
            "engine resources"
        );
        let mut devices: Vec<DeviceOrdinal> = state.usage.keys().copied().collect();
        devices.sort_unstable();
        for device in devices {
            debug!(
                device,
                usage_mib = state.usage(device) >> 20,
                "device usage"
            );
        }
        let mut stats: Vec<VbarStats> = state
            .vbars
            .iter()
            .map(|(handle, vbar)| vbar.stats(handle, self.config.page_size))
            .collect();
        stats.sort_by_key(|s| std::cmp::Reverse(s.rank));
        for s in &stats {
            debug!(
                vbar = s.handle,
                device = s.device,
                rank = s.rank,
                resident_mib = s.resident_bytes >> 20,
                pinned_pages = s.pinned_pages,
                total_pages = s.total_pages,
                "vbar residency"
            );
        }
        stats
    }

    /// Bytes that must be evicted on `device` before mapping `bytes` more
    pub(crate) fn budget_deficit(
        &self,
        state: &EngineState,
        device: DeviceOrdinal,
        bytes: u64,
    ) -> Result<u64> {
        let (free, total) = self.backend.memory_info(device)?;
        let headroom = self.config.vram_headroom;
        let over_capacity = (state.usage(device) + bytes + headroom).saturating_sub(total);
        let over_free = (headroom + bytes).saturating_sub(free);
        let deficit = over_capacity.max(over_free);
        if deficit > 0 {
            debug!(device, deficit_mib = deficit >> 20, "imminent VRAM OOM");
        }
        Ok(deficit)
    }

    /// Evict up front so that `bytes` fit inside the device budget
    pub(crate) fn reclaim_for(
        &self,
        state: &mut EngineState,
        device: DeviceOrdinal,
        bytes: u64,
    ) -> Result<u64> {
        let deficit = self.budget_deficit(state, device, bytes)?;
        if deficit == 0 {
            return Ok(0);
        }
        self.evict(state, EvictScope::Device(device), deficit)
    }

    /// Map `size` bytes at `va`, evicting `retry_bytes` per OOM until it fits
    ///
    /// Successful maps are charged to the device.
    pub(crate) fn map_with_reclaim(
        &self,
        state: &mut EngineState,
        va: DevicePtr,
        size: u64,
        device: DeviceOrdinal,
        retry_bytes: u64,
    ) -> Result<MapAttempt> {
        let mut reclaimed = 0;
        loop {
            match self.backend.map(va, size, device) {
                Ok(phys) => {
                    state.charge(device, size);
                    trace!(va = va.as_raw(), size, device, "mapped");
                    return Ok(MapAttempt {
                        phys: Some(phys),
                        reclaimed,
                    });
                }
                Err(GpuError::OutOfMemory { .. }) => {
                    let freed = self.evict(state, EvictScope::Device(device), retry_bytes)?;
                    if freed == 0 {
                        debug!(device, size, reclaimed, "nothing left to evict");
                        return Ok(MapAttempt {
                            phys: None,
                            reclaimed,
                        });
                    }
                    reclaimed += freed;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Unmap and uncharge a mapping made by [`Engine::map_with_reclaim`]
    pub(crate) fn unmap_charged(
        &self,
        state: &mut EngineState,
        va: DevicePtr,
        size: u64,
        phys: PhysHandle,
        device: DeviceOrdinal,
    ) -> Result<()> {
        self.backend.unmap(va, size, phys)?;
        state.credit(device, size);
        trace!(va = va.as_raw(), size, device, "unmapped");
        Ok(())
    }

    /// Release every resource, ignoring pins; used on drop
    fn teardown(&self) {
        let mut state = self.lock();
        let devices: Vec<DeviceOrdinal> = (0..self.backend.device_count() as DeviceOrdinal).collect();
        for device in devices {
            if let Err(e) = self.backend.synchronize(device) {
                warn!(device, error = %e, "synchronize on shutdown failed");
            }
        }
        for vbar in state.vbars.drain() {
            vbar.release_all(self.backend.as_ref());
        }
        for slot in state.slots.drain() {
            slot.release(self.backend.as_ref());
        }
        for buf in state.host_buffers.drain() {
            buf.release(self.backend.as_ref());
        }
        for buf in state.vram_buffers.drain() {
            buf.release(self.backend.as_ref());
        }
        state.shim.release_all(self.backend.as_ref());
        state.usage.clear();
        info!("vbar engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbar_gpu::SimDevice;

    const MIB: u64 = 1 << 20;

    fn engine(capacity: u64, headroom: u64) -> (Engine, Arc<SimDevice>) {
        let dev = Arc::new(SimDevice::new(&[capacity]));
        let config = EngineConfig::new()
            .with_page_size(MIB)
            .with_vram_chunk_size(MIB)
            .with_shim_granularity(MIB)
            .with_vram_headroom(headroom);
        (Engine::new(config, dev.clone()).unwrap(), dev)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let dev = Arc::new(SimDevice::new(&[MIB]));
        let err = Engine::new(EngineConfig::new().with_page_size(3), dev).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_rejects_empty_backend() {
        let dev = Arc::new(SimDevice::new(&[]));
        assert!(Engine::new(EngineConfig::default(), dev).is_err());
    }

    #[test]
    fn test_budget_deficit_uses_headroom() {
        let (engine, dev) = engine(16 * MIB, 4 * MIB);
        let state = engine.lock();
        assert_eq!(engine.budget_deficit(&state, 0, 8 * MIB).unwrap(), 0);
        assert_eq!(engine.budget_deficit(&state, 0, 14 * MIB).unwrap(), 2 * MIB);
        drop(state);

        dev.set_external_usage(0, 10 * MIB);
        let state = engine.lock();
        assert_eq!(engine.budget_deficit(&state, 0, 4 * MIB).unwrap(), 2 * MIB);
    }

    #[test]
    fn test_signatures_strictly_increase() {
        let (engine, _dev) = engine(4 * MIB, 0);
        let mut state = engine.lock();
        let a = state.next_signature();
        let b = state.next_signature();
        assert!(b > a);
        assert_ne!(a, Signature::NONE);
    }

    #[test]
    fn test_usage_accounting() {
        let (engine, _dev) = engine(4 * MIB, 0);
        let mut state = engine.lock();
        state.charge(0, 3 * MIB);
        state.charge(1, MIB);
        state.credit(0, MIB);
        assert_eq!(state.usage(0), 2 * MIB);
        assert_eq!(state.total_usage(), 3 * MIB);
        state.credit(1, 5 * MIB);
        assert_eq!(state.usage(1), 0);
    }

    #[test]
    fn test_map_with_reclaim_gives_up_without_victims() {
        let (engine, dev) = engine(2 * MIB, 0);
        let va = dev.reserve(8 * MIB, 0).unwrap();
        let mut state = engine.lock();
        let first = engine.map_with_reclaim(&mut state, va, 2 * MIB, 0, MIB).unwrap();
        assert!(first.phys.is_some());
        let second = engine
            .map_with_reclaim(&mut state, va.byte_offset(2 * MIB), MIB, 0, MIB)
            .unwrap();
        assert!(second.phys.is_none());
        assert_eq!(second.reclaimed, 0);
        assert_eq!(state.usage(0), 2 * MIB);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (engine, dev) = engine(16 * MIB, 0);
        let vbar = engine.vbar_allocate(8 * MIB, 0).unwrap();
        assert!(engine.vbar_fault(vbar, 0, 4 * MIB).unwrap().is_resident());
        let buf = engine.vrambuf_create(0, 4 * MIB).unwrap();
        engine.vrambuf_grow(buf, MIB).unwrap();
        engine.shim_alloc(MIB, 0).unwrap();
        engine.hostbuf_create(4096).unwrap();
        assert_eq!(dev.used_bytes(0), 6 * MIB);
        drop(engine);
        assert_eq!(dev.used_bytes(0), 0);
    }
}
