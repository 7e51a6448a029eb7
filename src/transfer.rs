//! Transfer Engine
//!
//! A transfer slot is bound to one stream. Every operation issued through it
//! is followed by a completion-signal write carrying the slot's issue count,
//! so:
//!
//! - [`Engine::slot_wait`] makes another stream wait for the count with a
//!   device-side wait, without blocking the host
//! - [`Engine::slot_is_idle`] compares the signal against the count
//!
//! The count is 64-bit but the signal word is 32-bit, so the word holds the
//! count relative to the slot's current epoch. Before the relative value
//! would wrap, the slot drains its stream and starts a new epoch on a fresh
//! signal.
//!
//! Destroying a slot with work in flight is refused; the caller drains first.

use tracing::{debug, trace, warn};
use vbar_gpu::{DeviceBackend, DevicePtr, HostPtr, SignalHandle, StreamHandle};

use crate::engine::{Engine, EngineState};
use crate::error::{Result, VbarError};
use crate::handle::Handle;

/// Handle to a transfer slot
pub type SlotHandle = Handle<TransferSlot>;

/// Operation kinds, with their ABI codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TransferKind {
    /// Device-to-device copy
    DeviceCopy = 1,
    /// Pinned-host-to-device copy
    HostToDevice = 2,
    /// No copy; only records a completion point
    Event = 3,
}

impl TryFrom<u32> for TransferKind {
    type Error = VbarError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Self::DeviceCopy),
            2 => Ok(Self::HostToDevice),
            3 => Ok(Self::Event),
            other => Err(VbarError::InvalidTransfer(other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Staging {
    ptr: HostPtr,
    size: u64,
}

/// Stream-bound issue queue
#[derive(Debug)]
pub struct TransferSlot {
    stream: StreamHandle,
    signal: SignalHandle,
    issued: u64,
    epoch: u64,
    staging: Option<Staging>,
}

impl TransferSlot {
    /// Operations issued since the signal was created, as written to it
    fn pending(&self) -> u32 {
        (self.issued - self.epoch) as u32
    }

    fn is_idle(&self, backend: &dyn DeviceBackend) -> bool {
        backend.signal_read(self.signal) >= self.pending()
    }

    /// Swap to a fresh signal once the current one is exhausted
    fn rotate_if_full(&mut self, backend: &dyn DeviceBackend) -> Result<()> {
        if self.issued - self.epoch < u64::from(u32::MAX) {
            return Ok(());
        }
        backend.stream_synchronize(self.stream)?;
        let fresh = backend.signal_create()?;
        let old = std::mem::replace(&mut self.signal, fresh);
        if let Err(e) = backend.signal_destroy(old) {
            warn!(error = %e, "signal destroy failed");
        }
        self.epoch = self.issued;
        debug!(stream = self.stream.as_raw(), epoch = self.epoch, "completion signal rotated");
        Ok(())
    }

    pub(crate) fn release(self, backend: &dyn DeviceBackend) {
        if let Err(e) = backend.signal_destroy(self.signal) {
            warn!(error = %e, "signal destroy failed");
        }
        if let Some(staging) = self.staging {
            if let Err(e) = backend.host_free(staging.ptr, staging.size) {
                warn!(error = %e, "staging buffer free failed");
            }
        }
    }
}

impl Engine {
    /// Create a slot issuing on `stream`
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::Device)` if no completion signal can be made.
    pub fn slot_create(&self, stream: StreamHandle) -> Result<SlotHandle> {
        let signal = self.backend.signal_create()?;
        let handle = self.lock().slots.insert(TransferSlot {
            stream,
            signal,
            issued: 0,
            epoch: 0,
            staging: None,
        });
        debug!(slot = handle.to_raw(), stream = stream.as_raw(), "slot created");
        Ok(handle)
    }

    /// Enqueue one operation on the slot's stream; returns without waiting
    ///
    /// For [`TransferKind::HostToDevice`] `src` is a host address, for
    /// [`TransferKind::DeviceCopy`] a device address, and it is ignored for
    /// [`TransferKind::Event`].
    ///
    /// # Safety
    ///
    /// For host-to-device copies `src` must stay readable for `size` bytes
    /// until the copy has executed.
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::Device)` if the stream rejects the request.
    pub unsafe fn slot_transfer(
        &self,
        slot: SlotHandle,
        src: u64,
        dst: DevicePtr,
        size: u64,
        kind: TransferKind,
    ) -> Result<()> {
        let mut state = self.lock();
        // SAFETY: forwarded from this function's contract
        unsafe { self.enqueue(&mut state, slot, kind, src, dst, size) }
    }

    /// Copy `bytes` into the slot's staging buffer and enqueue it to `dst`
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::SlotBusy)` while a previous staged copy may
    /// still be reading the staging buffer.
    pub fn slot_transfer_staged(&self, slot: SlotHandle, bytes: &[u8], dst: DevicePtr) -> Result<()> {
        if bytes.is_empty() {
            return Err(VbarError::InvalidArgument("empty staged transfer".to_string()));
        }
        let len = bytes.len() as u64;
        let mut state = self.lock();
        let (current, idle) = {
            let s = state.slots.get(slot)?;
            (s.staging, s.is_idle(self.backend.as_ref()))
        };
        let staging = match current {
            Some(staging) if !idle => {
                trace!(slot = slot.to_raw(), size = staging.size, "staging buffer in use");
                return Err(VbarError::SlotBusy);
            }
            Some(staging) if staging.size >= len => staging,
            old => {
                let ptr = self.backend.host_alloc(len).map_err(|e| match e {
                    vbar_gpu::GpuError::HostAllocation(n) => VbarError::HostAllocation(n),
                    other => other.into(),
                })?;
                let fresh = Staging { ptr, size: len };
                state.slots.get_mut(slot)?.staging = Some(fresh);
                if let Some(old) = old {
                    self.backend.host_free(old.ptr, old.size)?;
                }
                fresh
            }
        };
        // SAFETY: staging holds at least `len` bytes and no queued copy reads it
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), staging.ptr.as_mut_ptr(), bytes.len());
            self.enqueue(&mut state, slot, TransferKind::HostToDevice, staging.ptr.0, dst, len)
        }
    }

    /// Host-to-device copy on behalf of a fault
    ///
    /// # Safety
    ///
    /// Same contract as [`Engine::slot_transfer`].
    pub(crate) unsafe fn slot_enqueue_htod(
        &self,
        state: &mut EngineState,
        slot: SlotHandle,
        dst: DevicePtr,
        src: HostPtr,
        size: u64,
    ) -> Result<()> {
        // SAFETY: forwarded from this function's contract
        unsafe { self.enqueue(state, slot, TransferKind::HostToDevice, src.0, dst, size) }
    }

    unsafe fn enqueue(
        &self,
        state: &mut EngineState,
        slot: SlotHandle,
        kind: TransferKind,
        src: u64,
        dst: DevicePtr,
        size: u64,
    ) -> Result<()> {
        let s = state.slots.get_mut(slot)?;
        s.rotate_if_full(self.backend.as_ref())?;
        let stream = s.stream;
        match kind {
            TransferKind::DeviceCopy => {
                self.backend
                    .copy_dtod_async(dst, DevicePtr(src), size, stream)?;
            }
            TransferKind::HostToDevice => {
                // SAFETY: the caller keeps `src` readable until the copy runs
                unsafe { self.backend.copy_htod_async(dst, HostPtr(src), size, stream)? };
            }
            TransferKind::Event => {}
        }
        self.backend
            .write_value_async(stream, s.signal, s.pending() + 1)?;
        s.issued += 1;
        trace!(
            slot = slot.to_raw(),
            ?kind,
            dst = dst.as_raw(),
            size,
            seq = s.issued,
            "transfer enqueued"
        );
        Ok(())
    }

    /// Make `stream` wait for everything issued through `slot` so far
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::Device)` if the wait cannot be enqueued.
    pub fn slot_wait(&self, slot: SlotHandle, stream: StreamHandle) -> Result<()> {
        let state = self.lock();
        let s = state.slots.get(slot)?;
        if s.issued == s.epoch || stream == s.stream {
            return Ok(());
        }
        self.backend.wait_value_async(stream, s.signal, s.pending())?;
        trace!(slot = slot.to_raw(), stream = stream.as_raw(), seq = s.issued, "slot wait");
        Ok(())
    }

    /// True once every operation issued through `slot` has completed
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::StaleHandle)` for a destroyed slot.
    pub fn slot_is_idle(&self, slot: SlotHandle) -> Result<bool> {
        let state = self.lock();
        Ok(state.slots.get(slot)?.is_idle(self.backend.as_ref()))
    }

    /// Block until the slot's stream has finished its work
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::Device)` if the stream reports a failure.
    pub fn slot_drain(&self, slot: SlotHandle) -> Result<()> {
        let stream = self.lock().slots.get(slot)?.stream;
        self.backend.stream_synchronize(stream)?;
        Ok(())
    }

    /// Destroy an idle slot
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::SlotBusy)` if work is still in flight and
    /// `Err(VbarError::InvalidArgument)` if a VBAR uses it as page source;
    /// the slot stays alive in both cases.
    pub fn slot_destroy(&self, slot: SlotHandle) -> Result<()> {
        let mut state = self.lock();
        if !state.slots.get(slot)?.is_idle(self.backend.as_ref()) {
            warn!(slot = slot.to_raw(), "slot destroyed with work in flight");
            return Err(VbarError::SlotBusy);
        }
        if state
            .vbars
            .iter()
            .any(|(_, v)| v.source.is_some_and(|s| s.slot == slot))
        {
            return Err(VbarError::InvalidArgument(
                "slot is attached to a VBAR as page source".to_string(),
            ));
        }
        state.slots.remove(slot)?.release(self.backend.as_ref());
        debug!(slot = slot.to_raw(), "slot destroyed");
        Ok(())
    }
}
