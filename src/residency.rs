//! VBAR Residency Manager
//!
//! A VBAR is one reserved virtual range on one device, split into
//! fixed-size pages. Each page is independently backed by physical memory
//! (or not), carries a pin count, a last-touch stamp for LRU and a content
//! signature.
//!
//! ## Fault
//!
//! For each page covering `[offset, offset + size)`:
//!
//! 1. A resident page is pinned and touched; its signature is reported as is.
//! 2. Otherwise the device budget deficit is evicted up front, then the page
//!    is mapped, evicting one page per driver OOM until it fits.
//! 3. If nothing is left to evict, every pin taken by this call is dropped
//!    and the fault reports [`FaultOutcome::Evicted`].
//! 4. A freshly backed page is populated from the VBAR's page source, if it
//!    has one, and gets a new signature. A failed copy-in unmaps the page.
//!
//! Pages are never left half populated: they are either resident with a
//! signature that describes their bytes, or not resident.

use serde::Serialize;
use tracing::{debug, error, trace, warn};
use vbar_gpu::{DeviceBackend, DeviceOrdinal, DevicePtr, PhysHandle};

use crate::config::round_up;
use crate::engine::{Engine, EngineState};
use crate::error::{Result, VbarError};
use crate::handle::Handle;
use crate::host_buffer::HostBufferHandle;
use crate::region::{Region, RegionOwner};
use crate::signature::{Signature, SignatureSet};
use crate::transfer::SlotHandle;

/// Handle to a VBAR
pub type VbarHandle = Handle<Vbar>;

/// Result of [`Engine::vbar_fault`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Every covered page is resident and pinned
    Resident(SignatureSet),
    /// Memory pressure prevented residency; nothing is pinned
    Evicted,
}

impl FaultOutcome {
    /// True for [`FaultOutcome::Resident`]
    #[must_use]
    pub fn is_resident(&self) -> bool {
        matches!(self, Self::Resident(_))
    }

    /// Signatures of a resident fault
    #[must_use]
    pub fn signatures(&self) -> Option<&SignatureSet> {
        match self {
            Self::Resident(set) => Some(set),
            Self::Evicted => None,
        }
    }

    /// ABI result code: 0 resident, 1 evicted
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Resident(_) => 0,
            Self::Evicted => 1,
        }
    }
}

/// Host bytes copied into pages as they gain backing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSource {
    /// Host buffer whose byte `i` belongs at VBAR offset `i`
    pub host: HostBufferHandle,
    /// Slot the copies are issued through
    pub slot: SlotHandle,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Page {
    pub(crate) backing: Option<PhysHandle>,
    pub(crate) pins: u32,
    pub(crate) signature: Signature,
    pub(crate) last_touch: u64,
}

impl Page {
    pub(crate) fn is_resident(&self) -> bool {
        self.backing.is_some()
    }
}

/// One over-committed virtual range
#[derive(Debug)]
pub struct Vbar {
    pub(crate) device: DeviceOrdinal,
    pub(crate) base: DevicePtr,
    pub(crate) reserved: u64,
    pub(crate) max_size: u64,
    pub(crate) offset: u64,
    pub(crate) rank: i64,
    pub(crate) pages: Vec<Page>,
    pub(crate) source: Option<PageSource>,
}

/// Residency snapshot of one VBAR
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VbarStats {
    /// Raw handle
    pub handle: u64,
    /// Device ordinal
    pub device: DeviceOrdinal,
    /// Base virtual address
    pub base: u64,
    /// Usable size in bytes
    pub max_size: u64,
    /// Bytes handed out by the bump allocator
    pub allocated: u64,
    /// Eviction rank, higher survives longer
    pub rank: i64,
    /// Pages in the range
    pub total_pages: usize,
    /// Pages with physical backing
    pub resident_pages: usize,
    /// Pages with a non-zero pin count
    pub pinned_pages: usize,
    /// Resident bytes
    pub resident_bytes: u64,
}

impl Vbar {
    pub(crate) fn page_va(&self, page: usize, page_size: u64) -> DevicePtr {
        self.base.byte_offset(page as u64 * page_size)
    }

    fn resident_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_resident()).count()
    }

    /// Page indices covering `[offset, offset + size)`, checked against the range
    fn page_span(&self, offset: u64, size: u64, page_size: u64) -> Result<std::ops::Range<usize>> {
        let end = offset.checked_add(size);
        match end {
            Some(end) if size > 0 && end <= self.max_size => {
                Ok((offset / page_size) as usize..end.div_ceil(page_size) as usize)
            }
            _ => Err(VbarError::RangeOutOfBounds {
                offset,
                size,
                limit: self.max_size,
            }),
        }
    }

    pub(crate) fn stats(&self, handle: VbarHandle, page_size: u64) -> VbarStats {
        let resident_pages = self.resident_pages();
        VbarStats {
            handle: handle.to_raw(),
            device: self.device,
            base: self.base.as_raw(),
            max_size: self.max_size,
            allocated: self.offset,
            rank: self.rank,
            total_pages: self.pages.len(),
            resident_pages,
            pinned_pages: self.pages.iter().filter(|p| p.pins > 0).count(),
            resident_bytes: resident_pages as u64 * page_size,
        }
    }

    /// Drop all backing and the range without bookkeeping; used on teardown
    pub(crate) fn release_all(self, backend: &dyn DeviceBackend) {
        let page_size = if self.pages.is_empty() {
            0
        } else {
            self.reserved / self.pages.len() as u64
        };
        for (i, page) in self.pages.iter().enumerate() {
            if let Some(phys) = page.backing {
                if let Err(e) = backend.unmap(self.page_va(i, page_size), page_size, phys) {
                    warn!(page = i, error = %e, "unmap on teardown failed");
                }
            }
        }
        if let Err(e) = backend.release(self.base, self.reserved) {
            warn!(error = %e, "address release on teardown failed");
        }
    }
}

impl Engine {
    /// Reserve a VBAR of `size` bytes on `device`
    ///
    /// Only the page table is allocated; no device memory is mapped.
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::VirtualRangeExhausted)` if `size` rounded to
    /// pages overflows the address space, `Err(VbarError::AddressReservation)`
    /// if the virtual range cannot be reserved, `Err(VbarError::HostAllocation)`
    /// if the page table cannot be allocated.
    pub fn vbar_allocate(&self, size: u64, device: DeviceOrdinal) -> Result<VbarHandle> {
        debug!(size_mib = size >> 20, device, "vbar_allocate");
        if size == 0 {
            return Err(VbarError::InvalidArgument("zero-size VBAR".to_string()));
        }
        self.check_device(device)?;
        let page_size = self.config.page_size;
        let reserved = round_up(size, page_size)?;
        let page_count = reserved / page_size;
        let table_bytes = page_count.saturating_mul(std::mem::size_of::<Page>() as u64);

        let slots = usize::try_from(page_count).map_err(|_| VbarError::HostAllocation(table_bytes))?;
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(slots)
            .map_err(|_| VbarError::HostAllocation(table_bytes))?;
        pages.resize_with(slots, Page::default);

        let base = self
            .backend
            .reserve(reserved, page_size)
            .map_err(|source| VbarError::AddressReservation {
                size: reserved,
                source,
            })?;

        let mut state = self.lock();
        state.top_rank += 1;
        let rank = state.top_rank;
        let handle = state.vbars.insert(Vbar {
            device,
            base,
            reserved,
            max_size: size,
            offset: 0,
            rank,
            pages,
            source: None,
        });
        debug!(vbar = handle.to_raw(), base = base.as_raw(), pages = page_count, "vbar allocated");
        Ok(handle)
    }

    pub(crate) fn check_device(&self, device: DeviceOrdinal) -> Result<()> {
        let count = self.backend.device_count();
        if usize::try_from(device).map_or(true, |d| d >= count) {
            return Err(vbar_gpu::GpuError::DeviceNotFound(device, count).into());
        }
        Ok(())
    }

    /// Move this VBAR to the top of the eviction ranking
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a freed VBAR.
    pub fn vbar_prioritize(&self, vbar: VbarHandle) -> Result<()> {
        let mut state = self.lock();
        state.top_rank += 1;
        let rank = state.top_rank;
        state.vbars.get_mut(vbar)?.rank = rank;
        debug!(vbar = vbar.to_raw(), rank, "vbar_prioritize");
        Ok(())
    }

    /// Move this VBAR to the bottom of the eviction ranking
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a freed VBAR.
    pub fn vbar_deprioritize(&self, vbar: VbarHandle) -> Result<()> {
        let mut state = self.lock();
        state.bottom_rank -= 1;
        let rank = state.bottom_rank;
        state.vbars.get_mut(vbar)?.rank = rank;
        debug!(vbar = vbar.to_raw(), rank, "vbar_deprioritize");
        Ok(())
    }

    /// Base virtual address
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a freed VBAR.
    pub fn vbar_get(&self, vbar: VbarHandle) -> Result<DevicePtr> {
        Ok(self.lock().vbars.get(vbar)?.base)
    }

    /// Carve `bytes` from the VBAR, returning the aligned offset
    ///
    /// Pure bookkeeping; no page is touched.
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::VirtualRangeExhausted)` if the range is full.
    pub fn vbar_bump_alloc(&self, vbar: VbarHandle, bytes: u64) -> Result<u64> {
        let align = self.config.alloc_alignment;
        let mut state = self.lock();
        let v = state.vbars.get_mut(vbar)?;
        let start = v.offset.div_ceil(align) * align;
        let available = v.max_size.saturating_sub(start);
        if bytes > available {
            return Err(VbarError::VirtualRangeExhausted {
                requested: bytes,
                available,
            });
        }
        v.offset = start + bytes;
        trace!(vbar = vbar.to_raw(), offset = start, bytes, "vbar_bump_alloc");
        Ok(start)
    }

    /// [`Engine::vbar_bump_alloc`] returned as an addressable region
    ///
    /// # Errors
    ///
    /// Same as [`Engine::vbar_bump_alloc`].
    pub fn vbar_suballoc(&self, vbar: VbarHandle, bytes: u64) -> Result<Region> {
        let offset = self.vbar_bump_alloc(vbar, bytes)?;
        let base = self.vbar_get(vbar)?;
        Ok(Region {
            owner: RegionOwner::Vbar(vbar),
            offset,
            address: base.byte_offset(offset),
            size: bytes,
        })
    }

    /// Attach a page source so faults populate fresh pages themselves
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` if any handle is stale.
    pub fn vbar_attach_source(
        &self,
        vbar: VbarHandle,
        host: HostBufferHandle,
        slot: SlotHandle,
    ) -> Result<()> {
        let mut state = self.lock();
        state.host_buffers.get(host)?;
        state.slots.get(slot)?;
        state.vbars.get_mut(vbar)?.source = Some(PageSource { host, slot });
        Ok(())
    }

    /// Detach the page source; faults go back to caller-driven copies
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a freed VBAR.
    pub fn vbar_detach_source(&self, vbar: VbarHandle) -> Result<Option<PageSource>> {
        Ok(self.lock().vbars.get_mut(vbar)?.source.take())
    }

    /// Make `[offset, offset + size)` resident and pin it
    ///
    /// On [`FaultOutcome::Resident`] the caller owes exactly one
    /// [`Engine::vbar_unpin`] of the same range.
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::RangeOutOfBounds)` for a range outside the
    /// VBAR, `Err(VbarError::Device)` for driver failures. No pins are held
    /// after an error.
    pub fn vbar_fault(&self, vbar: VbarHandle, offset: u64, size: u64) -> Result<FaultOutcome> {
        let page_size = self.config.page_size;
        let mut state = self.lock();
        let span = state.vbars.get(vbar)?.page_span(offset, size, page_size)?;
        debug!(vbar = vbar.to_raw(), offset, size, pages = span.len(), "vbar_fault");

        // Pin what is already resident first so backing the rest cannot
        // evict pages of this same span
        let mut pinned = Vec::with_capacity(span.len());
        let mut missing = Vec::new();
        {
            let v = state.vbars.get_mut(vbar)?;
            for page in span.clone() {
                let p = &mut v.pages[page];
                if p.is_resident() {
                    p.pins += 1;
                    pinned.push(page);
                } else {
                    missing.push(page);
                }
            }
        }

        for page in missing {
            match self.back_page(&mut state, vbar, page) {
                Ok(true) => {
                    state.vbars.get_mut(vbar)?.pages[page].pins += 1;
                    pinned.push(page);
                }
                Ok(false) => {
                    Self::release_pins(&mut state, vbar, &pinned);
                    debug!(vbar = vbar.to_raw(), page, "vbar_fault: evicted");
                    return Ok(FaultOutcome::Evicted);
                }
                Err(e) => {
                    Self::release_pins(&mut state, vbar, &pinned);
                    error!(vbar = vbar.to_raw(), page, error = %e, "vbar_fault failed");
                    return Err(e);
                }
            }
        }

        let mut signatures = Vec::with_capacity(span.len());
        for page in span {
            let now = state.tick();
            let p = &mut state.vbars.get_mut(vbar)?.pages[page];
            p.last_touch = now;
            signatures.push(p.signature);
        }
        Ok(FaultOutcome::Resident(SignatureSet::new(signatures)))
    }

    fn release_pins(state: &mut EngineState, vbar: VbarHandle, pinned: &[usize]) {
        if let Ok(v) = state.vbars.get_mut(vbar) {
            for &page in pinned {
                v.pages[page].pins -= 1;
            }
        }
    }

    /// Give `page` physical backing; `Ok(false)` if memory could not be found
    fn back_page(&self, state: &mut EngineState, vbar: VbarHandle, page: usize) -> Result<bool> {
        let page_size = self.config.page_size;
        let (device, va) = {
            let v = state.vbars.get(vbar)?;
            (v.device, v.page_va(page, page_size))
        };

        self.reclaim_for(state, device, page_size)?;
        let Some(phys) = self
            .map_with_reclaim(state, va, page_size, device, page_size)?
            .phys
        else {
            return Ok(false);
        };
        state.vbars.get_mut(vbar)?.pages[page].backing = Some(phys);

        let source = state.vbars.get(vbar)?.source;
        if let Some(source) = source {
            if let Err(e) = self.populate_page(state, vbar, page, source) {
                state.vbars.get_mut(vbar)?.pages[page].backing = None;
                if let Err(unmap) = self.unmap_charged(state, va, page_size, phys, device) {
                    error!(error = %unmap, "unmap after failed copy-in failed");
                }
                return Err(e);
            }
        }

        let signature = state.next_signature();
        state.vbars.get_mut(vbar)?.pages[page].signature = signature;
        trace!(vbar = vbar.to_raw(), page, signature = signature.get(), "page backed");
        Ok(true)
    }

    /// Enqueue the copy of this page's host bytes through the source slot
    fn populate_page(
        &self,
        state: &mut EngineState,
        vbar: VbarHandle,
        page: usize,
        source: PageSource,
    ) -> Result<()> {
        let page_size = self.config.page_size;
        let page_offset = page as u64 * page_size;
        let va = state.vbars.get(vbar)?.page_va(page, page_size);
        let host = state.host_buffers.get(source.host)?;
        if page_offset >= host.size {
            return Ok(());
        }
        let len = page_size.min(host.size - page_offset);
        let src = host.ptr.byte_offset(page_offset);
        // SAFETY: src lies inside an engine-owned host buffer, which cannot be
        // destroyed while attached as a page source
        unsafe { self.slot_enqueue_htod(state, source.slot, va, src, len) }
    }

    /// Drop one pin from every page of `[offset, offset + size)`
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::UnpinWithoutFault)` if any covered page is not
    /// pinned; no pin count changes in that case.
    pub fn vbar_unpin(&self, vbar: VbarHandle, offset: u64, size: u64) -> Result<()> {
        let page_size = self.config.page_size;
        let mut state = self.lock();
        let v = state.vbars.get_mut(vbar)?;
        let span = v.page_span(offset, size, page_size)?;
        if let Some(page) = span.clone().find(|&i| v.pages[i].pins == 0) {
            warn!(vbar = vbar.to_raw(), page, "unpin without matching fault");
            return Err(VbarError::UnpinWithoutFault { page: page as u64 });
        }
        for page in span {
            v.pages[page].pins -= 1;
        }
        trace!(vbar = vbar.to_raw(), offset, size, "vbar_unpin");
        Ok(())
    }

    /// Bytes currently backed by device memory
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a freed VBAR.
    pub fn vbar_loaded_size(&self, vbar: VbarHandle) -> Result<u64> {
        let state = self.lock();
        Ok(state.vbars.get(vbar)?.resident_pages() as u64 * self.config.page_size)
    }

    /// Snapshot of one VBAR
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a freed VBAR.
    pub fn vbar_stats(&self, vbar: VbarHandle) -> Result<VbarStats> {
        let state = self.lock();
        Ok(state.vbars.get(vbar)?.stats(vbar, self.config.page_size))
    }

    /// Page signatures of `[offset, offset + size)` without faulting
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::RangeOutOfBounds)` for a range outside the VBAR.
    pub fn vbar_signatures(&self, vbar: VbarHandle, offset: u64, size: u64) -> Result<SignatureSet> {
        let state = self.lock();
        let v = state.vbars.get(vbar)?;
        let span = v.page_span(offset, size, self.config.page_size)?;
        Ok(SignatureSet::new(
            v.pages[span].iter().map(|p| p.signature).collect(),
        ))
    }

    /// Evict up to `target` bytes of this VBAR's unpinned pages
    ///
    /// Returns the bytes actually reclaimed, in whole pages.
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::Device)` if the device cannot synchronise or
    /// unmap.
    pub fn vbar_free_memory(&self, vbar: VbarHandle, target: u64) -> Result<u64> {
        let mut state = self.lock();
        state.vbars.get(vbar)?;
        let freed = self.evict(&mut state, crate::eviction::EvictScope::Vbar(vbar), target)?;
        debug!(vbar = vbar.to_raw(), target, freed, "vbar_free_memory");
        Ok(freed)
    }

    /// Release every page and the virtual range
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::PinnedOnFree)` if pages are still pinned (the
    /// VBAR stays alive), `Err(VbarError::StaleHandle)` on double free.
    pub fn vbar_free(&self, vbar: VbarHandle) -> Result<()> {
        let page_size = self.config.page_size;
        let mut state = self.lock();
        let v = state.vbars.get(vbar)?;
        let pinned_pages = v.pages.iter().filter(|p| p.pins > 0).count();
        if pinned_pages > 0 {
            error!(vbar = vbar.to_raw(), pinned_pages, "vbar_free with pinned pages");
            return Err(VbarError::PinnedOnFree { pinned_pages });
        }
        let device = v.device;
        if v.resident_pages() > 0 {
            self.backend.synchronize(device)?;
        }
        for page in 0..state.vbars.get(vbar)?.pages.len() {
            let (va, backing) = {
                let v = state.vbars.get(vbar)?;
                (v.page_va(page, page_size), v.pages[page].backing)
            };
            if let Some(phys) = backing {
                self.unmap_charged(&mut state, va, page_size, phys, device)?;
                state.vbars.get_mut(vbar)?.pages[page].backing = None;
            }
        }
        let v = state.vbars.get(vbar)?;
        self.backend.release(v.base, v.reserved)?;
        state.vbars.remove(vbar)?;
        debug!(vbar = vbar.to_raw(), "vbar freed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::Arc;
    use vbar_gpu::{SimDevice, SimFault};

    const PAGE: u64 = 1 << 20;

    fn setup(pages: u64) -> (Engine, Arc<SimDevice>) {
        let dev = Arc::new(SimDevice::new(&[pages * PAGE]));
        let config = EngineConfig::new()
            .with_page_size(PAGE)
            .with_vram_headroom(0);
        (Engine::new(config, dev.clone()).unwrap(), dev)
    }

    fn resident(outcome: FaultOutcome) -> SignatureSet {
        match outcome {
            FaultOutcome::Resident(set) => set,
            FaultOutcome::Evicted => panic!("expected resident"),
        }
    }

    #[test]
    fn test_allocate_maps_nothing() {
        let (engine, dev) = setup(4);
        let vbar = engine.vbar_allocate(64 * PAGE, 0).unwrap();
        assert_eq!(engine.vbar_loaded_size(vbar).unwrap(), 0);
        assert_eq!(dev.used_bytes(0), 0);
        assert!(!engine.vbar_get(vbar).unwrap().is_null());
    }

    #[test]
    fn test_allocate_rejects_bad_input() {
        let (engine, _dev) = setup(4);
        assert!(engine.vbar_allocate(0, 0).unwrap_err().is_contract_violation());
        assert!(matches!(
            engine.vbar_allocate(PAGE, 3),
            Err(VbarError::Device(_))
        ));
    }

    #[test]
    fn test_allocate_past_address_space() {
        let (engine, dev) = setup(4);
        let err = engine.vbar_allocate(u64::MAX, 0).unwrap_err();
        assert!(matches!(err, VbarError::VirtualRangeExhausted { .. }));
        assert!(!err.is_contract_violation());
        assert_eq!(dev.used_bytes(0), 0);
    }

    #[test]
    fn test_bump_alloc_aligns_and_bounds() {
        let (engine, _dev) = setup(4);
        let vbar = engine.vbar_allocate(4096, 0).unwrap();
        assert_eq!(engine.vbar_bump_alloc(vbar, 100).unwrap(), 0);
        assert_eq!(engine.vbar_bump_alloc(vbar, 100).unwrap(), 512);
        assert_eq!(engine.vbar_bump_alloc(vbar, 1).unwrap(), 1024);
        let err = engine.vbar_bump_alloc(vbar, 4096).unwrap_err();
        assert_eq!(
            err,
            VbarError::VirtualRangeExhausted {
                requested: 4096,
                available: 4096 - 1536
            }
        );
        assert_eq!(engine.vbar_bump_alloc(vbar, 4096 - 1536).unwrap(), 1536);
    }

    #[test]
    fn test_suballoc_region() {
        let (engine, _dev) = setup(4);
        let vbar = engine.vbar_allocate(4 * PAGE, 0).unwrap();
        engine.vbar_bump_alloc(vbar, 10).unwrap();
        let region = engine.vbar_suballoc(vbar, 1000).unwrap();
        assert_eq!(region.offset, 512);
        assert_eq!(
            region.address,
            engine.vbar_get(vbar).unwrap().byte_offset(512)
        );
        assert_eq!(region.owner, RegionOwner::Vbar(vbar));
    }

    #[test]
    fn test_fault_pins_and_signs() {
        let (engine, dev) = setup(4);
        let vbar = engine.vbar_allocate(8 * PAGE, 0).unwrap();
        let sigs = resident(engine.vbar_fault(vbar, PAGE / 2, PAGE).unwrap());
        assert_eq!(sigs.len(), 2);
        assert!(sigs.as_slice().iter().all(|s| *s != Signature::NONE));
        assert_eq!(engine.vbar_loaded_size(vbar).unwrap(), 2 * PAGE);
        assert_eq!(dev.used_bytes(0), 2 * PAGE);
        assert_eq!(engine.vbar_stats(vbar).unwrap().pinned_pages, 2);
        engine.vbar_unpin(vbar, PAGE / 2, PAGE).unwrap();
        assert_eq!(engine.vbar_stats(vbar).unwrap().pinned_pages, 0);
    }

    #[test]
    fn test_refault_keeps_signature() {
        let (engine, _dev) = setup(4);
        let vbar = engine.vbar_allocate(2 * PAGE, 0).unwrap();
        let a = resident(engine.vbar_fault(vbar, 0, 2 * PAGE).unwrap());
        engine.vbar_unpin(vbar, 0, 2 * PAGE).unwrap();
        let b = resident(engine.vbar_fault(vbar, 0, 2 * PAGE).unwrap());
        assert!(a.matches(&b).unwrap());
    }

    #[test]
    fn test_signature_changes_after_eviction() {
        let (engine, _dev) = setup(4);
        let vbar = engine.vbar_allocate(PAGE, 0).unwrap();
        let a = resident(engine.vbar_fault(vbar, 0, PAGE).unwrap());
        engine.vbar_unpin(vbar, 0, PAGE).unwrap();
        assert_eq!(engine.vbar_free_memory(vbar, 1).unwrap(), PAGE);
        assert_eq!(engine.vbar_signatures(vbar, 0, PAGE).unwrap(), a);
        let b = resident(engine.vbar_fault(vbar, 0, PAGE).unwrap());
        assert!(!a.matches(&b).unwrap());
        assert!(b.as_slice()[0] > a.as_slice()[0]);
    }

    #[test]
    fn test_fault_out_of_range() {
        let (engine, _dev) = setup(4);
        let vbar = engine.vbar_allocate(PAGE + 10, 0).unwrap();
        assert!(matches!(
            engine.vbar_fault(vbar, PAGE, 11),
            Err(VbarError::RangeOutOfBounds { .. })
        ));
        assert!(engine.vbar_fault(vbar, 0, 0).is_err());
        assert!(engine.vbar_fault(vbar, u64::MAX, 2).is_err());
        assert!(engine.vbar_fault(vbar, PAGE, 10).unwrap().is_resident());
    }

    #[test]
    fn test_fault_never_evicts_its_own_span() {
        let (engine, dev) = setup(3);
        let a = engine.vbar_allocate(3 * PAGE, 0).unwrap();
        let b = engine.vbar_allocate(PAGE, 0).unwrap();
        let tail = resident(engine.vbar_fault(a, PAGE, 2 * PAGE).unwrap());
        engine.vbar_unpin(a, PAGE, 2 * PAGE).unwrap();
        assert!(engine.vbar_fault(b, 0, PAGE).unwrap().is_resident());
        engine.vbar_unpin(b, 0, PAGE).unwrap();
        let (maps, _) = dev.map_counts();

        let all = resident(engine.vbar_fault(a, 0, 3 * PAGE).unwrap());
        assert_eq!(&all.as_slice()[1..], tail.as_slice());
        assert_eq!(dev.map_counts().0, maps + 1);
        assert_eq!(engine.vbar_loaded_size(b).unwrap(), 0);
        assert_eq!(engine.vbar_stats(a).unwrap().pinned_pages, 3);
    }

    #[test]
    fn test_fault_reports_eviction_instead_of_self_eviction() {
        let (engine, dev) = setup(2);
        let a = engine.vbar_allocate(3 * PAGE, 0).unwrap();
        let tail = resident(engine.vbar_fault(a, PAGE, 2 * PAGE).unwrap());
        engine.vbar_unpin(a, PAGE, 2 * PAGE).unwrap();
        let (maps, unmaps) = dev.map_counts();

        assert_eq!(engine.vbar_fault(a, 0, 3 * PAGE).unwrap(), FaultOutcome::Evicted);
        assert_eq!(dev.map_counts(), (maps, unmaps));
        assert_eq!(engine.vbar_stats(a).unwrap().pinned_pages, 0);
        assert_eq!(engine.vbar_signatures(a, PAGE, 2 * PAGE).unwrap(), tail);
    }

    #[test]
    fn test_evicted_when_everything_pinned() {
        let (engine, _dev) = setup(2);
        let a = engine.vbar_allocate(2 * PAGE, 0).unwrap();
        let b = engine.vbar_allocate(2 * PAGE, 0).unwrap();
        assert!(engine.vbar_fault(a, 0, 2 * PAGE).unwrap().is_resident());
        assert_eq!(engine.vbar_fault(b, 0, PAGE).unwrap(), FaultOutcome::Evicted);
        assert_eq!(engine.vbar_loaded_size(a).unwrap(), 2 * PAGE);
        assert_eq!(engine.vbar_stats(b).unwrap().pinned_pages, 0);
    }

    #[test]
    fn test_evicted_fault_releases_its_own_pins() {
        let (engine, _dev) = setup(3);
        let a = engine.vbar_allocate(2 * PAGE, 0).unwrap();
        let b = engine.vbar_allocate(2 * PAGE, 0).unwrap();
        assert!(engine.vbar_fault(a, 0, 2 * PAGE).unwrap().is_resident());
        assert_eq!(engine.vbar_fault(b, 0, 2 * PAGE).unwrap(), FaultOutcome::Evicted);
        let stats = engine.vbar_stats(b).unwrap();
        assert_eq!(stats.pinned_pages, 0);
        assert_eq!(stats.resident_pages, 1);
        assert!(engine.vbar_unpin(b, 0, PAGE).is_err());
    }

    #[test]
    fn test_pressure_evicts_unpinned_lower_priority() {
        let (engine, _dev) = setup(2);
        let a = engine.vbar_allocate(2 * PAGE, 0).unwrap();
        let b = engine.vbar_allocate(2 * PAGE, 0).unwrap();
        assert!(engine.vbar_fault(a, 0, 2 * PAGE).unwrap().is_resident());
        engine.vbar_unpin(a, 0, 2 * PAGE).unwrap();
        assert!(engine.vbar_fault(b, 0, 2 * PAGE).unwrap().is_resident());
        assert_eq!(engine.vbar_loaded_size(a).unwrap(), 0);
        assert_eq!(engine.vbar_loaded_size(b).unwrap(), 2 * PAGE);
    }

    #[test]
    fn test_driver_error_leaves_no_pins() {
        let (engine, dev) = setup(4);
        let vbar = engine.vbar_allocate(3 * PAGE, 0).unwrap();
        assert!(engine.vbar_fault(vbar, 0, PAGE).unwrap().is_resident());
        dev.fail_next_maps(1, SimFault::Driver);
        let err = engine.vbar_fault(vbar, 0, 3 * PAGE).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Device);
        assert_eq!(engine.vbar_stats(vbar).unwrap().pinned_pages, 1);
        assert!(engine.vbar_fault(vbar, 0, 3 * PAGE).unwrap().is_resident());
    }

    #[test]
    fn test_injected_oom_is_retried_after_eviction() {
        let (engine, dev) = setup(4);
        let a = engine.vbar_allocate(PAGE, 0).unwrap();
        let b = engine.vbar_allocate(PAGE, 0).unwrap();
        assert!(engine.vbar_fault(a, 0, PAGE).unwrap().is_resident());
        engine.vbar_unpin(a, 0, PAGE).unwrap();
        dev.fail_next_maps(1, SimFault::OutOfMemory);
        assert!(engine.vbar_fault(b, 0, PAGE).unwrap().is_resident());
        assert_eq!(engine.vbar_loaded_size(a).unwrap(), 0);
    }

    #[test]
    fn test_unpin_without_fault() {
        let (engine, _dev) = setup(4);
        let vbar = engine.vbar_allocate(2 * PAGE, 0).unwrap();
        assert_eq!(
            engine.vbar_unpin(vbar, 0, PAGE),
            Err(VbarError::UnpinWithoutFault { page: 0 })
        );
        engine.vbar_fault(vbar, 0, PAGE).unwrap();
        assert!(engine.vbar_unpin(vbar, 0, 2 * PAGE).is_err());
        assert_eq!(engine.vbar_stats(vbar).unwrap().pinned_pages, 1);
        engine.vbar_unpin(vbar, 0, PAGE).unwrap();
        assert!(engine.vbar_unpin(vbar, 0, PAGE).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_nested_pins() {
        let (engine, _dev) = setup(4);
        let vbar = engine.vbar_allocate(PAGE, 0).unwrap();
        engine.vbar_fault(vbar, 0, 10).unwrap();
        engine.vbar_fault(vbar, 20, 10).unwrap();
        engine.vbar_unpin(vbar, 0, 10).unwrap();
        assert_eq!(engine.vbar_free_memory(vbar, PAGE).unwrap(), 0);
        engine.vbar_unpin(vbar, 20, 10).unwrap();
        assert_eq!(engine.vbar_free_memory(vbar, PAGE).unwrap(), PAGE);
    }

    #[test]
    fn test_free_with_pins_is_reported() {
        let (engine, dev) = setup(4);
        let vbar = engine.vbar_allocate(2 * PAGE, 0).unwrap();
        engine.vbar_fault(vbar, 0, 2 * PAGE).unwrap();
        assert_eq!(
            engine.vbar_free(vbar),
            Err(VbarError::PinnedOnFree { pinned_pages: 2 })
        );
        engine.vbar_unpin(vbar, 0, 2 * PAGE).unwrap();
        engine.vbar_free(vbar).unwrap();
        assert_eq!(dev.used_bytes(0), 0);
        assert_eq!(engine.total_vram_usage(), 0);
        assert_eq!(engine.vbar_free(vbar), Err(VbarError::StaleHandle("vbar")));
        assert!(engine.vbar_fault(vbar, 0, 1).is_err());
    }

    #[test]
    fn test_prioritize_changes_victim() {
        let (engine, _dev) = setup(2);
        let a = engine.vbar_allocate(PAGE, 0).unwrap();
        let b = engine.vbar_allocate(PAGE, 0).unwrap();
        let c = engine.vbar_allocate(PAGE, 0).unwrap();
        for v in [a, b] {
            engine.vbar_fault(v, 0, PAGE).unwrap();
            engine.vbar_unpin(v, 0, PAGE).unwrap();
        }
        // a is the oldest and lowest ranked; raising it makes b the victim
        engine.vbar_prioritize(a).unwrap();
        assert!(engine.vbar_fault(c, 0, PAGE).unwrap().is_resident());
        assert_eq!(engine.vbar_loaded_size(a).unwrap(), PAGE);
        assert_eq!(engine.vbar_loaded_size(b).unwrap(), 0);

        engine.vbar_unpin(c, 0, PAGE).unwrap();
        engine.vbar_deprioritize(c).unwrap();
        assert!(engine.vbar_fault(b, 0, PAGE).unwrap().is_resident());
        assert_eq!(engine.vbar_loaded_size(c).unwrap(), 0);
        assert_eq!(engine.vbar_loaded_size(a).unwrap(), PAGE);
    }

    #[test]
    fn test_headroom_triggers_proactive_eviction() {
        let dev = Arc::new(SimDevice::new(&[4 * PAGE]));
        let config = EngineConfig::new()
            .with_page_size(PAGE)
            .with_vram_headroom(PAGE);
        let engine = Engine::new(config, dev.clone()).unwrap();
        let vbar = engine.vbar_allocate(8 * PAGE, 0).unwrap();
        for page in 0..8 {
            assert!(engine
                .vbar_fault(vbar, page * PAGE, PAGE)
                .unwrap()
                .is_resident());
            engine.vbar_unpin(vbar, page * PAGE, PAGE).unwrap();
            assert!(dev.used_bytes(0) <= 3 * PAGE);
        }
        assert_eq!(engine.vbar_loaded_size(vbar).unwrap(), 3 * PAGE);
    }

    #[test]
    fn test_stale_handles_across_types() {
        let (engine, _dev) = setup(4);
        let vbar = engine.vbar_allocate(PAGE, 0).unwrap();
        engine.vbar_free(vbar).unwrap();
        assert!(engine.vbar_prioritize(vbar).is_err());
        assert!(engine.vbar_get(vbar).is_err());
        assert!(engine.vbar_loaded_size(vbar).is_err());
        assert!(engine.vbar_bump_alloc(vbar, 1).is_err());
    }
}
