//! Simulated Device
//!
//! A capacity-limited, byte-accurate stand-in for a GPU. Physical memory is
//! materialised lazily (an untouched mapping reads as zeros), host buffers
//! are real heap allocations, and every stream is a FIFO queue.
//!
//! In eager mode (the default) queued work runs as soon as it can. In manual
//! mode work is held until [`SimDevice::run_stream`] or
//! [`SimDevice::run_all`], which lets tests interleave streams and check
//! cross-stream ordering. A `WaitValue` op at the head of a queue blocks that
//! queue until its signal catches up.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::DeviceBackend;
use crate::driver::{DeviceOrdinal, DevicePtr, HostPtr, PhysHandle, SignalHandle, StreamHandle};
use crate::{GpuError, Result};

/// Base of the simulated virtual address space
const VA_BASE: u64 = 1 << 40;

/// Reservation granularity
const VA_GRANULARITY: u64 = 2 << 20;

/// Device-side alias base for completion signals
const SIGNAL_BASE: u64 = 0xF000_0000_0000;

/// Host buffer alignment
const HOST_ALIGN: usize = 4096;

/// Injected failure for upcoming `map` calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Report the device as full
    OutOfMemory,
    /// Report a generic driver failure
    Driver,
}

/// Result slot of a [`SimDevice::launch_read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadTicket(u64);

#[derive(Debug)]
enum SimOp {
    CopyHtoD { dst: u64, src: u64, size: u64 },
    CopyDtoD { dst: u64, src: u64, size: u64 },
    WriteValue { signal: u64, value: u32 },
    WaitValue { signal: u64, value: u32 },
    Read { ticket: u64, va: u64, len: u64 },
}

#[derive(Debug)]
struct SimMemory {
    name: String,
    capacity: u64,
    used: u64,
    external: u64,
}

#[derive(Debug)]
struct Mapping {
    size: u64,
    device: DeviceOrdinal,
    phys: u64,
    data: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct SimState {
    devices: Vec<SimMemory>,
    next_va: u64,
    reservations: BTreeMap<u64, u64>,
    mappings: BTreeMap<u64, Mapping>,
    next_phys: u64,
    host: BTreeMap<u64, usize>,
    signals: HashMap<u64, u32>,
    next_signal: u64,
    streams: HashMap<u64, VecDeque<SimOp>>,
    manual: bool,
    injected: VecDeque<SimFault>,
    reject_copies: bool,
    tickets: HashMap<u64, Option<Vec<u8>>>,
    next_ticket: u64,
    async_error: Option<GpuError>,
    maps: u64,
    unmaps: u64,
}

/// Deterministic in-process device
#[derive(Debug)]
pub struct SimDevice {
    state: Mutex<SimState>,
}

impl SimDevice {
    /// One simulated device per entry of `capacities` (bytes)
    #[must_use]
    pub fn new(capacities: &[u64]) -> Self {
        let devices = capacities
            .iter()
            .enumerate()
            .map(|(i, &capacity)| SimMemory {
                name: format!("Simulated GPU {} ({} MiB)", i, capacity >> 20),
                capacity,
                used: 0,
                external: 0,
            })
            .collect();
        Self {
            state: Mutex::new(SimState {
                devices,
                next_va: VA_BASE,
                next_phys: 1,
                next_signal: 1,
                next_ticket: 1,
                ..SimState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold queued work until explicitly run
    pub fn set_manual(&self, manual: bool) {
        let mut state = self.lock();
        state.manual = manual;
        if !manual {
            state.pump();
        }
    }

    /// Fail the next `count` maps with `fault`
    pub fn fail_next_maps(&self, count: usize, fault: SimFault) {
        let mut state = self.lock();
        state.injected.extend(std::iter::repeat(fault).take(count));
    }

    /// Reject every copy at enqueue time
    pub fn set_reject_copies(&self, reject: bool) {
        self.lock().reject_copies = reject;
    }

    /// Pretend another process holds `bytes` on `device`
    pub fn set_external_usage(&self, device: DeviceOrdinal, bytes: u64) {
        let mut state = self.lock();
        if let Some(dev) = state.device_mut(device) {
            dev.external = bytes;
        }
    }

    /// Bytes mapped on `device` through this backend
    #[must_use]
    pub fn used_bytes(&self, device: DeviceOrdinal) -> u64 {
        let state = self.lock();
        state.device(device).map(|d| d.used).unwrap_or(0)
    }

    /// Number of successful maps and unmaps so far
    #[must_use]
    pub fn map_counts(&self) -> (u64, u64) {
        let state = self.lock();
        (state.maps, state.unmaps)
    }

    /// Ops queued on `stream` and not yet executed
    #[must_use]
    pub fn pending_ops(&self, stream: StreamHandle) -> usize {
        let state = self.lock();
        state.streams.get(&stream.as_raw()).map_or(0, VecDeque::len)
    }

    /// Run `stream` until it empties or blocks; returns ops executed
    pub fn run_stream(&self, stream: StreamHandle) -> usize {
        self.lock().run(stream.as_raw())
    }

    /// Run every stream until no further progress is possible
    pub fn run_all(&self) -> usize {
        self.lock().pump()
    }

    /// Enqueue a compute-like read of `[va, va + len)` on `stream`
    pub fn launch_read(&self, stream: StreamHandle, va: DevicePtr, len: u64) -> ReadTicket {
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.tickets.insert(ticket, None);
        state.enqueue(
            stream.as_raw(),
            SimOp::Read {
                ticket,
                va: va.as_raw(),
                len,
            },
        );
        ReadTicket(ticket)
    }

    /// Bytes observed by a completed read, `None` while it is still queued
    pub fn take_read(&self, ticket: ReadTicket) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let done = matches!(state.tickets.get(&ticket.0), Some(Some(_)));
        if done {
            state.tickets.remove(&ticket.0).flatten()
        } else {
            None
        }
    }

    /// Read mapped device bytes directly
    pub fn read(&self, va: DevicePtr, len: u64) -> Result<Vec<u8>> {
        self.lock().read_device(va.as_raw(), len)
    }

    /// Write mapped device bytes directly
    pub fn write(&self, va: DevicePtr, bytes: &[u8]) -> Result<()> {
        self.lock().write_device(va.as_raw(), bytes)
    }

    fn check_copy(state: &SimState, size: u64) -> Result<()> {
        if state.reject_copies {
            return Err(GpuError::Transfer("copy rejected by device".to_string()));
        }
        if size == 0 {
            return Err(GpuError::Transfer("zero-length copy".to_string()));
        }
        Ok(())
    }
}

impl SimState {
    fn device(&self, device: DeviceOrdinal) -> Option<&SimMemory> {
        usize::try_from(device).ok().and_then(|i| self.devices.get(i))
    }

    fn device_mut(&mut self, device: DeviceOrdinal) -> Option<&mut SimMemory> {
        usize::try_from(device).ok().and_then(|i| self.devices.get_mut(i))
    }

    fn checked_device(&self, device: DeviceOrdinal) -> Result<&SimMemory> {
        self.device(device)
            .ok_or(GpuError::DeviceNotFound(device, self.devices.len()))
    }

    /// Host buffer containing `[addr, addr + size)`
    fn host_contains(&self, addr: u64, size: u64) -> bool {
        self.host
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, &len)| addr + size <= base + len as u64)
    }

    /// Walk the mappings covering `[va, va + len)` in order
    fn covering(&self, va: u64, len: u64) -> Result<Vec<(u64, u64, u64)>> {
        let mut pieces = Vec::new();
        let mut cursor = va;
        let end = va + len;
        while cursor < end {
            let (&base, mapping) = self
                .mappings
                .range(..=cursor)
                .next_back()
                .filter(|(base, m)| cursor < **base + m.size)
                .ok_or_else(|| {
                    GpuError::Transfer(format!("address {:#x} is not mapped", cursor))
                })?;
            let offset = cursor - base;
            let take = (mapping.size - offset).min(end - cursor);
            pieces.push((base, offset, take));
            cursor += take;
        }
        Ok(pieces)
    }

    fn read_device(&self, va: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        for (base, offset, take) in self.covering(va, len)? {
            let mapping = &self.mappings[&base];
            match &mapping.data {
                Some(data) => {
                    out.extend_from_slice(&data[offset as usize..(offset + take) as usize]);
                }
                None => out.resize(out.len() + take as usize, 0),
            }
        }
        Ok(out)
    }

    fn write_device(&mut self, va: u64, bytes: &[u8]) -> Result<()> {
        let pieces = self.covering(va, bytes.len() as u64)?;
        let mut consumed = 0usize;
        for (base, offset, take) in pieces {
            let Some(mapping) = self.mappings.get_mut(&base) else {
                continue;
            };
            let size = mapping.size as usize;
            let data = mapping.data.get_or_insert_with(|| vec![0; size]);
            let take = take as usize;
            data[offset as usize..offset as usize + take]
                .copy_from_slice(&bytes[consumed..consumed + take]);
            consumed += take;
        }
        Ok(())
    }

    fn enqueue(&mut self, stream: u64, op: SimOp) {
        self.streams.entry(stream).or_default().push_back(op);
        if !self.manual {
            self.pump();
        }
    }

    /// Execute one op; `false` if it is a wait that cannot proceed yet
    fn execute(&mut self, op: &SimOp) -> bool {
        let result = match *op {
            SimOp::CopyHtoD { dst, src, size } => {
                if self.host_contains(src, size) {
                    // SAFETY: range lies inside a live host allocation owned by this device
                    let bytes =
                        unsafe { std::slice::from_raw_parts(src as usize as *const u8, size as usize) }
                            .to_vec();
                    self.write_device(dst, &bytes)
                } else {
                    Err(GpuError::Transfer(format!("host range {:#x} freed in flight", src)))
                }
            }
            SimOp::CopyDtoD { dst, src, size } => self
                .read_device(src, size)
                .and_then(|bytes| self.write_device(dst, &bytes)),
            SimOp::WriteValue { signal, value } => {
                self.signals.insert(signal, value);
                Ok(())
            }
            SimOp::WaitValue { signal, value } => {
                let current = self.signals.get(&signal).copied().unwrap_or(0);
                return current >= value;
            }
            SimOp::Read { ticket, va, len } => self.read_device(va, len).map(|bytes| {
                self.tickets.insert(ticket, Some(bytes));
            }),
        };
        if let Err(e) = result {
            self.async_error.get_or_insert(e);
        }
        true
    }

    fn run(&mut self, stream: u64) -> usize {
        let mut executed = 0;
        loop {
            let Some(op) = self.streams.get_mut(&stream).and_then(VecDeque::pop_front) else {
                break;
            };
            if self.execute(&op) {
                executed += 1;
            } else {
                if let Some(queue) = self.streams.get_mut(&stream) {
                    queue.push_front(op);
                }
                break;
            }
        }
        executed
    }

    fn pump(&mut self) -> usize {
        let mut total = 0;
        loop {
            let ids: Vec<u64> = self.streams.keys().copied().collect();
            let progress: usize = ids.into_iter().map(|id| self.run(id)).sum();
            if progress == 0 {
                break;
            }
            total += progress;
        }
        total
    }

    fn take_async_error(&mut self) -> Result<()> {
        self.async_error.take().map_or(Ok(()), Err)
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (&addr, &len) in &state.host {
            if let Ok(layout) = Layout::from_size_align(len, HOST_ALIGN) {
                // SAFETY: allocated in host_alloc with this layout
                unsafe { dealloc(addr as usize as *mut u8, layout) };
            }
        }
        state.host.clear();
    }
}

impl DeviceBackend for SimDevice {
    fn name(&self) -> &str {
        "Simulated"
    }

    fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    fn device_name(&self, device: DeviceOrdinal) -> Result<String> {
        Ok(self.lock().checked_device(device)?.name.clone())
    }

    fn total_memory(&self, device: DeviceOrdinal) -> Result<u64> {
        Ok(self.lock().checked_device(device)?.capacity)
    }

    fn memory_info(&self, device: DeviceOrdinal) -> Result<(u64, u64)> {
        let state = self.lock();
        let dev = state.checked_device(device)?;
        let free = dev.capacity.saturating_sub(dev.used + dev.external);
        Ok((free, dev.capacity))
    }

    fn reserve(&self, size: u64, alignment: u64) -> Result<DevicePtr> {
        if size == 0 {
            return Err(GpuError::InvalidValue("zero-size reservation".to_string()));
        }
        let mut state = self.lock();
        let align = alignment.max(VA_GRANULARITY);
        if !align.is_power_of_two() {
            return Err(GpuError::InvalidValue(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }
        let exhausted = || GpuError::MemoryAllocation("virtual address space exhausted".into());
        let base = state
            .next_va
            .div_ceil(align)
            .checked_mul(align)
            .ok_or_else(exhausted)?;
        let end = size
            .div_ceil(VA_GRANULARITY)
            .checked_mul(VA_GRANULARITY)
            .and_then(|span| base.checked_add(span))
            .ok_or_else(exhausted)?;
        state.next_va = end;
        state.reservations.insert(base, size);
        Ok(DevicePtr(base))
    }

    fn release(&self, va: DevicePtr, size: u64) -> Result<()> {
        let mut state = self.lock();
        let base = va.as_raw();
        match state.reservations.get(&base) {
            Some(&reserved) if reserved == size => {}
            _ => {
                return Err(GpuError::InvalidValue(format!(
                    "no reservation of {} bytes at {:#x}",
                    size, base
                )))
            }
        }
        if state.mappings.range(base..base + size).next().is_some() {
            return Err(GpuError::InvalidValue(format!(
                "reservation at {:#x} still has mappings",
                base
            )));
        }
        state.reservations.remove(&base);
        Ok(())
    }

    fn map(&self, va: DevicePtr, size: u64, device: DeviceOrdinal) -> Result<PhysHandle> {
        let mut state = self.lock();
        let addr = va.as_raw();
        state.checked_device(device)?;
        if size == 0 {
            return Err(GpuError::InvalidValue("zero-size mapping".to_string()));
        }
        let inside = state
            .reservations
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, &len)| addr + size <= base + len);
        if !inside {
            return Err(GpuError::InvalidValue(format!(
                "{:#x}+{} is outside every reservation",
                addr, size
            )));
        }
        let overlaps_prev = state
            .mappings
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, m)| addr < base + m.size);
        let overlaps_next = state.mappings.range(addr..addr + size).next().is_some();
        if overlaps_prev || overlaps_next {
            return Err(GpuError::InvalidValue(format!(
                "{:#x}+{} is already mapped",
                addr, size
            )));
        }
        if let Some(fault) = state.injected.pop_front() {
            return Err(match fault {
                SimFault::OutOfMemory => GpuError::OutOfMemory {
                    device,
                    requested: size,
                },
                SimFault::Driver => GpuError::CudaDriver("injected map failure".to_string(), 999),
            });
        }
        let dev = state
            .device_mut(device)
            .ok_or(GpuError::DeviceNotFound(device, 0))?;
        if dev.used + dev.external + size > dev.capacity {
            return Err(GpuError::OutOfMemory {
                device,
                requested: size,
            });
        }
        dev.used += size;
        let phys = state.next_phys;
        state.next_phys += 1;
        state.maps += 1;
        state.mappings.insert(
            addr,
            Mapping {
                size,
                device,
                phys,
                data: None,
            },
        );
        Ok(PhysHandle(phys))
    }

    fn unmap(&self, va: DevicePtr, size: u64, phys: PhysHandle) -> Result<()> {
        let mut state = self.lock();
        let addr = va.as_raw();
        match state.mappings.get(&addr) {
            Some(m) if m.size == size && m.phys == phys.0 => {}
            _ => {
                return Err(GpuError::InvalidValue(format!(
                    "no mapping of {} bytes at {:#x}",
                    size, addr
                )))
            }
        }
        if let Some(mapping) = state.mappings.remove(&addr) {
            if let Some(dev) = state.device_mut(mapping.device) {
                dev.used -= mapping.size;
            }
            state.unmaps += 1;
        }
        Ok(())
    }

    fn synchronize(&self, device: DeviceOrdinal) -> Result<()> {
        let mut state = self.lock();
        state.checked_device(device)?;
        state.pump();
        if state.streams.values().any(|q| !q.is_empty()) {
            return Err(GpuError::StreamSync(
                "streams blocked on signals that are never written".to_string(),
            ));
        }
        state.take_async_error()
    }

    fn host_alloc(&self, size: u64) -> Result<HostPtr> {
        let len = usize::try_from(size).map_err(|_| GpuError::HostAllocation(size))?;
        if len == 0 {
            return Err(GpuError::HostAllocation(size));
        }
        let layout =
            Layout::from_size_align(len, HOST_ALIGN).map_err(|_| GpuError::HostAllocation(size))?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(GpuError::HostAllocation(size));
        }
        let addr = ptr as usize as u64;
        self.lock().host.insert(addr, len);
        Ok(HostPtr(addr))
    }

    fn host_free(&self, ptr: HostPtr, size: u64) -> Result<()> {
        let mut state = self.lock();
        let len = match state.host.get(&ptr.0) {
            Some(&len) if len as u64 == size => len,
            _ => {
                return Err(GpuError::InvalidValue(format!(
                    "no host buffer of {} bytes at {:#x}",
                    size, ptr.0
                )))
            }
        };
        state.host.remove(&ptr.0);
        let layout =
            Layout::from_size_align(len, HOST_ALIGN).map_err(|_| GpuError::HostAllocation(size))?;
        // SAFETY: allocated in host_alloc with this layout, removed from the table above
        unsafe { dealloc(ptr.as_mut_ptr(), layout) };
        Ok(())
    }

    unsafe fn copy_htod_async(
        &self,
        dst: DevicePtr,
        src: HostPtr,
        size: u64,
        stream: StreamHandle,
    ) -> Result<()> {
        let mut state = self.lock();
        Self::check_copy(&state, size)?;
        if !state.host_contains(src.0, size) {
            return Err(GpuError::Transfer(format!(
                "source {:#x}+{} is not pinned host memory",
                src.0, size
            )));
        }
        state.covering(dst.as_raw(), size)?;
        state.enqueue(
            stream.as_raw(),
            SimOp::CopyHtoD {
                dst: dst.as_raw(),
                src: src.0,
                size,
            },
        );
        Ok(())
    }

    fn copy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        size: u64,
        stream: StreamHandle,
    ) -> Result<()> {
        let mut state = self.lock();
        Self::check_copy(&state, size)?;
        state.covering(src.as_raw(), size)?;
        state.covering(dst.as_raw(), size)?;
        state.enqueue(
            stream.as_raw(),
            SimOp::CopyDtoD {
                dst: dst.as_raw(),
                src: src.as_raw(),
                size,
            },
        );
        Ok(())
    }

    fn write_value_async(
        &self,
        stream: StreamHandle,
        signal: SignalHandle,
        value: u32,
    ) -> Result<()> {
        let mut state = self.lock();
        if !state.signals.contains_key(&signal.host) {
            return Err(GpuError::InvalidValue(format!("unknown signal {}", signal.host)));
        }
        state.enqueue(
            stream.as_raw(),
            SimOp::WriteValue {
                signal: signal.host,
                value,
            },
        );
        Ok(())
    }

    fn wait_value_async(
        &self,
        stream: StreamHandle,
        signal: SignalHandle,
        value: u32,
    ) -> Result<()> {
        let mut state = self.lock();
        if !state.signals.contains_key(&signal.host) {
            return Err(GpuError::InvalidValue(format!("unknown signal {}", signal.host)));
        }
        state.enqueue(
            stream.as_raw(),
            SimOp::WaitValue {
                signal: signal.host,
                value,
            },
        );
        Ok(())
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.lock();
        state.pump();
        if state
            .streams
            .get(&stream.as_raw())
            .is_some_and(|q| !q.is_empty())
        {
            return Err(GpuError::StreamSync(format!(
                "stream {:#x} is blocked on a signal that is never written",
                stream.as_raw()
            )));
        }
        state.take_async_error()
    }

    fn signal_create(&self) -> Result<SignalHandle> {
        let mut state = self.lock();
        let id = state.next_signal;
        state.next_signal += 1;
        state.signals.insert(id, 0);
        Ok(SignalHandle {
            host: id,
            device: DevicePtr(SIGNAL_BASE + id * 4),
        })
    }

    fn signal_destroy(&self, signal: SignalHandle) -> Result<()> {
        self.lock()
            .signals
            .remove(&signal.host)
            .map(|_| ())
            .ok_or_else(|| GpuError::InvalidValue(format!("unknown signal {}", signal.host)))
    }

    fn signal_read(&self, signal: SignalHandle) -> u32 {
        self.lock().signals.get(&signal.host).copied().unwrap_or(0)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Usage always equals the sum of live mappings and never exceeds capacity
        #[test]
        fn prop_usage_tracks_mappings(ops in prop::collection::vec((0u64..16, any::<bool>()), 1..64)) {
            let chunk = 1u64 << 20;
            let dev = SimDevice::new(&[6 * chunk]);
            let va = dev.reserve(16 * chunk, 0).unwrap();
            let mut live: HashMap<u64, PhysHandle> = HashMap::new();
            for (slot, map) in ops {
                let at = va.byte_offset(slot * chunk);
                if map && !live.contains_key(&slot) {
                    if let Ok(p) = dev.map(at, chunk, 0) {
                        live.insert(slot, p);
                    }
                } else if let Some(p) = live.remove(&slot) {
                    dev.unmap(at, chunk, p).unwrap();
                }
                prop_assert_eq!(dev.used_bytes(0), live.len() as u64 * chunk);
                prop_assert!(dev.used_bytes(0) <= 6 * chunk);
            }
        }
    }
}
