//! C ABI
//!
//! Flat `extern "C"` exports over one process-wide engine. Handles cross the
//! boundary as non-zero `u64` values and every failure becomes a sentinel
//! (`0`, `false`, null, or fault code `2`) after being logged, so a host that
//! loaded the library on an unsupported platform degrades instead of
//! aborting.
//!
//! Rust hosts can skip [`vbar_engine_init`] and [`install`] an engine of
//! their own.

use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};
use tracing::{error, info, warn};
use vbar_gpu::{DevicePtr, StreamHandle};

use crate::engine::Engine;
use crate::error::{Result, VbarError};
use crate::handle::Handle;
use crate::logging::{set_log_level, LogLevel};
use crate::pressure::PressureEvent;
use crate::residency::FaultOutcome;
use crate::transfer::TransferKind;

/// Fault result: every page resident and pinned
pub const VBAR_FAULT_RESIDENT: c_int = 0;
/// Fault result: memory pressure, nothing pinned
pub const VBAR_FAULT_EVICTED: c_int = 1;
/// Fault result: hard error, nothing pinned
pub const VBAR_FAULT_ERROR: c_int = 2;

/// Host runtime hook that releases its cached device blocks
pub type EmptyCacheFn = extern "C" fn();

struct Installed {
    engine: Arc<Engine>,
    pressure: Mutex<Receiver<PressureEvent>>,
}

static ENGINE: RwLock<Option<Installed>> = const_rwlock(None);
static EMPTY_CACHE: Mutex<Option<EmptyCacheFn>> = const_mutex(None);

/// Set once the missing-engine warning has been logged; cleared by install
static WARNED_UNINITIALIZED: AtomicBool = AtomicBool::new(false);

/// Make `engine` the target of every export, replacing any previous one
pub fn install(engine: Arc<Engine>) {
    let pressure = Mutex::new(engine.subscribe_pressure());
    let previous = ENGINE.write().replace(Installed { engine, pressure });
    WARNED_UNINITIALIZED.store(false, Ordering::Relaxed);
    if previous.is_some() {
        info!("replaced installed vbar engine");
    }
}

/// Detach the installed engine; it is dropped once no call still uses it
pub fn uninstall() -> Option<Arc<Engine>> {
    ENGINE.write().take().map(|installed| installed.engine)
}

/// The installed engine
///
/// # Errors
///
/// Returns `Err(VbarError::NotInitialized)` if none is installed.
pub fn engine() -> Result<Arc<Engine>> {
    ENGINE
        .read()
        .as_ref()
        .map(|installed| Arc::clone(&installed.engine))
        .ok_or(VbarError::NotInitialized)
}

fn drain_pressure() -> usize {
    ENGINE
        .read()
        .as_ref()
        .map_or(0, |installed| installed.pressure.lock().try_iter().count())
}

/// Run `f` against the installed engine, mapping failure to `fallback`
fn call<T>(op: &'static str, fallback: T, f: impl FnOnce(&Engine) -> Result<T>) -> T {
    let result = engine().and_then(|engine| f(&engine));
    match result {
        Ok(value) => value,
        Err(VbarError::NotInitialized) => {
            warn_uninitialized(op);
            fallback
        }
        Err(e) => {
            error!(op, error = %e, "vbar call failed");
            fallback
        }
    }
}

/// Log the missing engine once per install cycle; true if this call logged
fn warn_uninitialized(op: &'static str) -> bool {
    if WARNED_UNINITIALIZED.swap(true, Ordering::Relaxed) {
        return false;
    }
    warn!(op, "vbar engine not initialized; further calls return sentinels silently");
    true
}

fn handle<T>(raw: u64) -> Result<Handle<T>> {
    Handle::from_raw(raw).ok_or_else(|| VbarError::InvalidArgument("null handle".to_string()))
}

/// Initialise the CUDA engine on `device`; `false` if CUDA is unusable
#[no_mangle]
pub extern "C" fn vbar_engine_init(device: c_int) -> bool {
    #[cfg(feature = "cuda")]
    {
        let built = crate::config::EngineConfig::from_env()
            .and_then(|config| Engine::with_cuda(config, device));
        match built {
            Ok(engine) => {
                install(Arc::new(engine));
                true
            }
            Err(e) => {
                error!(device, error = %e, "vbar engine init failed");
                false
            }
        }
    }
    #[cfg(not(feature = "cuda"))]
    {
        error!(device, "vbar built without CUDA support");
        false
    }
}

/// Release the installed engine
#[no_mangle]
pub extern "C" fn vbar_engine_shutdown() {
    if uninstall().is_none() {
        warn!("vbar_engine_shutdown without an engine");
    }
}

/// Reserve a VBAR; returns its handle or 0
#[no_mangle]
pub extern "C" fn vbar_allocate(size: u64, device: c_int) -> u64 {
    call("vbar_allocate", 0, |e| {
        e.vbar_allocate(size, device).map(Handle::to_raw)
    })
}

/// Raise a VBAR to the top of the eviction ranking
#[no_mangle]
pub extern "C" fn vbar_prioritize(vbar: u64) {
    call("vbar_prioritize", (), |e| e.vbar_prioritize(handle(vbar)?));
}

/// Lower a VBAR to the bottom of the eviction ranking
#[no_mangle]
pub extern "C" fn vbar_deprioritize(vbar: u64) {
    call("vbar_deprioritize", (), |e| e.vbar_deprioritize(handle(vbar)?));
}

/// Base virtual address of a VBAR, 0 on error
#[no_mangle]
pub extern "C" fn vbar_get(vbar: u64) -> u64 {
    call("vbar_get", 0, |e| Ok(e.vbar_get(handle(vbar)?)?.as_raw()))
}

/// Release a VBAR
#[no_mangle]
pub extern "C" fn vbar_free(vbar: u64) {
    call("vbar_free", (), |e| e.vbar_free(handle(vbar)?));
}

/// Fault `[offset, offset + size)` in and pin it
///
/// On [`VBAR_FAULT_RESIDENT`] one signature per covered page is written to
/// `out_signature`.
///
/// # Safety
///
/// `out_signature` must be writable for `ceil(size / page_size) + 2` values.
#[no_mangle]
pub unsafe extern "C" fn vbar_fault(
    vbar: u64,
    offset: u64,
    size: u64,
    out_signature: *mut u64,
) -> c_int {
    if out_signature.is_null() {
        error!("vbar_fault: null signature buffer");
        return VBAR_FAULT_ERROR;
    }
    call("vbar_fault", VBAR_FAULT_ERROR, |e| {
        let vbar = handle(vbar)?;
        let outcome = e.vbar_fault(vbar, offset, size)?;
        if let FaultOutcome::Resident(set) = &outcome {
            let capacity = crate::signature::signature_capacity(size, e.config().page_size);
            // SAFETY: caller sized the buffer per the function contract
            let out = unsafe { std::slice::from_raw_parts_mut(out_signature, capacity) };
            if let Err(err) = set.write_to(out) {
                e.vbar_unpin(vbar, offset, size)?;
                return Err(err);
            }
        }
        Ok(outcome.code())
    })
}

/// Drop the pins of one successful fault
#[no_mangle]
pub extern "C" fn vbar_unpin(vbar: u64, offset: u64, size: u64) {
    call("vbar_unpin", (), |e| e.vbar_unpin(handle(vbar)?, offset, size));
}

/// Resident bytes of a VBAR
#[no_mangle]
pub extern "C" fn vbar_loaded_size(vbar: u64) -> u64 {
    call("vbar_loaded_size", 0, |e| e.vbar_loaded_size(handle(vbar)?))
}

/// Evict up to `target` bytes of a VBAR's unpinned pages; returns bytes freed
#[no_mangle]
pub extern "C" fn vbar_free_memory(vbar: u64, target: u64) -> u64 {
    call("vbar_free_memory", 0, |e| {
        e.vbar_free_memory(handle(vbar)?, target)
    })
}

/// Log a residency report and return nothing
#[no_mangle]
pub extern "C" fn vbars_analyze() {
    call("vbars_analyze", (), |e| {
        let stats = e.analyze();
        info!(vbars = stats.len(), vram_mib = e.total_vram_usage() >> 20, "vbar analysis");
        Ok(())
    });
}

/// Device bytes mapped by the engine on all devices
#[no_mangle]
pub extern "C" fn get_total_vram_usage() -> u64 {
    call("get_total_vram_usage", 0, |e| Ok(e.total_vram_usage()))
}

/// Reserve a VRAM buffer; returns its handle or 0
#[no_mangle]
pub extern "C" fn vrambuf_create(device: c_int, max_size: u64) -> u64 {
    call("vrambuf_create", 0, |e| {
        e.vrambuf_create(device, max_size).map(Handle::to_raw)
    })
}

/// Back at least `size` bytes of a VRAM buffer
#[no_mangle]
pub extern "C" fn vrambuf_grow(buf: u64, size: u64) -> bool {
    call("vrambuf_grow", false, |e| {
        e.vrambuf_grow(handle(buf)?, size).map(|()| true)
    })
}

/// Base address of a VRAM buffer, 0 on error
#[no_mangle]
pub extern "C" fn vrambuf_get(buf: u64) -> u64 {
    call("vrambuf_get", 0, |e| Ok(e.vrambuf_get(handle(buf)?)?.as_raw()))
}

/// Release a VRAM buffer
#[no_mangle]
pub extern "C" fn vrambuf_destroy(buf: u64) {
    call("vrambuf_destroy", (), |e| e.vrambuf_destroy(handle(buf)?));
}

/// Allocate pinned host memory; returns its handle or 0
#[no_mangle]
pub extern "C" fn hostbuf_create(size: u64) -> u64 {
    call("hostbuf_create", 0, |e| e.hostbuf_create(size).map(Handle::to_raw))
}

/// Host address of a host buffer, null on error
#[no_mangle]
pub extern "C" fn hostbuf_get(buf: u64) -> *mut c_void {
    call("hostbuf_get", std::ptr::null_mut(), |e| {
        Ok(e.hostbuf_get(handle(buf)?)?.as_mut_ptr().cast())
    })
}

/// Free a host buffer
#[no_mangle]
pub extern "C" fn hostbuf_destroy(buf: u64) {
    call("hostbuf_destroy", (), |e| e.hostbuf_destroy(handle(buf)?));
}

/// Create a transfer slot on `stream`; returns its handle or 0
#[no_mangle]
pub extern "C" fn vbar_slot_create(stream: u64) -> u64 {
    call("vbar_slot_create", 0, |e| {
        e.slot_create(StreamHandle(stream)).map(Handle::to_raw)
    })
}

/// Enqueue a transfer of kind 1 (device copy), 2 (host to device) or 3 (event)
///
/// # Safety
///
/// For kind 2 `src` must point at `size` readable host bytes that stay valid
/// until the copy has executed.
#[no_mangle]
pub unsafe extern "C" fn vbar_slot_transfer(
    slot: u64,
    src: u64,
    dst: u64,
    size: u64,
    kind: c_int,
) -> bool {
    call("vbar_slot_transfer", false, |e| {
        let kind = u32::try_from(kind)
            .map_err(|_| VbarError::InvalidTransfer(u32::MAX))
            .and_then(TransferKind::try_from)?;
        // SAFETY: forwarded from this function's contract
        unsafe { e.slot_transfer(handle(slot)?, src, DevicePtr(dst), size, kind) }.map(|()| true)
    })
}

/// Make `stream` wait for everything issued through the slot so far
#[no_mangle]
pub extern "C" fn vbar_slot_wait(slot: u64, stream: u64) {
    call("vbar_slot_wait", (), |e| {
        e.slot_wait(handle(slot)?, StreamHandle(stream))
    });
}

/// Destroy an idle slot
#[no_mangle]
pub extern "C" fn vbar_slot_destroy(slot: u64) {
    call("vbar_slot_destroy", (), |e| e.slot_destroy(handle(slot)?));
}

/// Register the host runtime's cache release hook (null clears it)
#[no_mangle]
pub extern "C" fn set_empty_cache(callback: Option<EmptyCacheFn>) {
    *EMPTY_CACHE.lock() = callback;
}

/// Pluggable-allocator allocate; null on failure
///
/// An allocation that fails for lack of memory drains pending pressure
/// events, runs the empty-cache hook with no engine lock held and is retried
/// once.
#[no_mangle]
pub extern "C" fn alloc_fn(size: usize, device: c_int, _stream: *mut c_void) -> *mut c_void {
    let to_ptr = |ptr: DevicePtr| ptr.as_raw() as usize as *mut c_void;
    let first = engine().and_then(|e| e.shim_alloc(size as u64, device));
    match first {
        Ok(ptr) => to_ptr(ptr),
        Err(VbarError::DeviceOutOfMemory { .. }) => {
            let events = drain_pressure();
            let hook = *EMPTY_CACHE.lock();
            let Some(hook) = hook else {
                warn!(size, device, events, "device OOM and no empty-cache hook");
                return std::ptr::null_mut();
            };
            info!(size, device, events, "device OOM, emptying host cache");
            hook();
            call("alloc_fn", std::ptr::null_mut(), |e| {
                e.shim_alloc(size as u64, device).map(to_ptr)
            })
        }
        Err(e) => {
            error!(size, device, error = %e, "alloc_fn failed");
            std::ptr::null_mut()
        }
    }
}

/// Pluggable-allocator free; null is a no-op
#[no_mangle]
pub extern "C" fn free_fn(ptr: *mut c_void, _size: usize, _device: c_int, _stream: *mut c_void) {
    call("free_fn", (), |e| e.shim_free(DevicePtr(ptr as usize as u64)));
}

macro_rules! log_level_exports {
    ($($name:ident => $level:ident),* $(,)?) => {
        $(
            #[doc = concat!("Set log verbosity to `", stringify!($level), "`")]
            #[no_mangle]
            pub extern "C" fn $name() {
                set_log_level(LogLevel::$level);
            }
        )*
    };
}

log_level_exports! {
    set_log_level_none => None,
    set_log_level_critical => Critical,
    set_log_level_error => Error,
    set_log_level_warning => Warning,
    set_log_level_info => Info,
    set_log_level_debug => Debug,
    set_log_level_verbose => Verbose,
    set_log_level_vverbose => VVerbose,
}
