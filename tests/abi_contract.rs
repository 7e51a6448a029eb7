//! C ABI contract tests
//!
//! The exports act on one process-wide engine, so every test takes `GUARD`
//! and installs its own simulated engine.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vbar::abi::{self, VBAR_FAULT_ERROR, VBAR_FAULT_EVICTED, VBAR_FAULT_RESIDENT};
use vbar::{signature_capacity, Engine, EngineConfig, LogLevel, VbarError};
use vbar_gpu::SimDevice;

const MIB: u64 = 1 << 20;

static GUARD: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    GUARD.lock().unwrap_or_else(PoisonError::into_inner)
}

fn install(capacity: u64) -> (Arc<Engine>, Arc<SimDevice>) {
    let dev = Arc::new(SimDevice::new(&[capacity]));
    let config = EngineConfig::new()
        .with_page_size(MIB)
        .with_vram_chunk_size(MIB)
        .with_vram_headroom(0);
    let engine = Arc::new(Engine::new(config, dev.clone()).unwrap());
    abi::install(Arc::clone(&engine));
    (engine, dev)
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn exports_without_engine_return_sentinels() {
    let _g = serial();
    abi::uninstall();

    assert_eq!(abi::vbar_allocate(MIB, 0), 0);
    assert_eq!(abi::vbar_get(1), 0);
    assert_eq!(abi::vbar_loaded_size(1), 0);
    assert_eq!(abi::get_total_vram_usage(), 0);
    assert_eq!(abi::hostbuf_create(64), 0);
    assert!(abi::hostbuf_get(1).is_null());
    assert!(!abi::vrambuf_grow(1, MIB));
    assert!(abi::alloc_fn(4096, 0, std::ptr::null_mut()).is_null());
    let mut out = [0u64; 4];
    let code = unsafe { abi::vbar_fault(1, 0, MIB, out.as_mut_ptr()) };
    assert_eq!(code, VBAR_FAULT_ERROR);
    // void exports are harmless no-ops
    abi::vbar_free(1);
    abi::vbar_unpin(1, 0, MIB);
    abi::vbars_analyze();
    abi::vbar_engine_shutdown();
    assert!(matches!(abi::engine(), Err(VbarError::NotInitialized)));
}

#[cfg(not(feature = "cuda"))]
#[test]
fn init_without_cuda_support_fails() {
    let _g = serial();
    abi::uninstall();
    assert!(!abi::vbar_engine_init(0));
    assert!(abi::engine().is_err());
}

#[test]
fn install_replaces_previous_engine() {
    let _g = serial();
    let (first, _) = install(4 * MIB);
    let (second, _) = install(8 * MIB);
    let current = abi::engine().unwrap();
    assert!(Arc::ptr_eq(&current, &second));
    assert!(!Arc::ptr_eq(&current, &first));
    abi::vbar_engine_shutdown();
    assert!(abi::uninstall().is_none());
}

// ============================================================================
// VBARS
// ============================================================================

#[test]
fn fault_cycle_through_exports() {
    let _g = serial();
    let (engine, dev) = install(8 * MIB);

    let vbar = abi::vbar_allocate(4 * MIB, 0);
    assert_ne!(vbar, 0);
    let base = abi::vbar_get(vbar);
    assert_ne!(base, 0);

    let size = 2 * MIB + 1;
    let mut out = vec![0u64; signature_capacity(size, MIB)];
    let code = unsafe { abi::vbar_fault(vbar, MIB, size, out.as_mut_ptr()) };
    assert_eq!(code, VBAR_FAULT_RESIDENT);
    assert!(out[..3].iter().all(|&s| s != 0));
    assert_eq!(abi::vbar_loaded_size(vbar), 3 * MIB);
    assert_eq!(abi::get_total_vram_usage(), dev.used_bytes(0));

    // pinned pages survive an explicit free request
    assert_eq!(abi::vbar_free_memory(vbar, 4 * MIB), 0);
    abi::vbar_unpin(vbar, MIB, size);
    assert_eq!(abi::vbar_free_memory(vbar, MIB), MIB);

    abi::vbar_prioritize(vbar);
    abi::vbar_deprioritize(vbar);
    abi::vbars_analyze();
    abi::vbar_free(vbar);
    assert_eq!(abi::vbar_get(vbar), 0);
    assert_eq!(engine.total_vram_usage(), 0);
    abi::uninstall();
}

#[test]
fn fault_reports_eviction_and_errors() {
    let _g = serial();
    let (_engine, _dev) = install(2 * MIB);
    let vbar = abi::vbar_allocate(4 * MIB, 0);
    let mut out = vec![0u64; signature_capacity(4 * MIB, MIB)];

    let code = unsafe { abi::vbar_fault(vbar, 0, 4 * MIB, out.as_mut_ptr()) };
    assert_eq!(code, VBAR_FAULT_EVICTED);
    // pages backed before memory ran out stay resident but unpinned
    assert_eq!(abi::vbar_loaded_size(vbar), 2 * MIB);
    assert_eq!(abi::vbar_free_memory(vbar, 2 * MIB), 2 * MIB);

    let code = unsafe { abi::vbar_fault(vbar, 0, MIB, std::ptr::null_mut()) };
    assert_eq!(code, VBAR_FAULT_ERROR);
    let code = unsafe { abi::vbar_fault(vbar, 3 * MIB, 2 * MIB, out.as_mut_ptr()) };
    assert_eq!(code, VBAR_FAULT_ERROR);
    let code = unsafe { abi::vbar_fault(0, 0, MIB, out.as_mut_ptr()) };
    assert_eq!(code, VBAR_FAULT_ERROR);
    abi::uninstall();
}

// ============================================================================
// BUFFERS AND TRANSFERS
// ============================================================================

#[test]
fn buffers_and_slots_through_exports() {
    let _g = serial();
    let (_engine, dev) = install(8 * MIB);

    let vram = abi::vrambuf_create(0, 4 * MIB);
    assert_ne!(vram, 0);
    assert!(abi::vrambuf_grow(vram, 2 * MIB));
    assert!(!abi::vrambuf_grow(vram, 5 * MIB));
    let dst = abi::vrambuf_get(vram);
    assert_ne!(dst, 0);

    let host = abi::hostbuf_create(4096);
    let ptr = abi::hostbuf_get(host).cast::<u8>();
    assert!(!ptr.is_null());
    unsafe { std::ptr::write_bytes(ptr, 0x5A, 4096) };

    let slot = abi::vbar_slot_create(7);
    assert_ne!(slot, 0);
    assert!(unsafe { abi::vbar_slot_transfer(slot, ptr as u64, dst, 4096, 2) });
    assert!(unsafe { abi::vbar_slot_transfer(slot, 0, dst, 0, 3) });
    assert!(!unsafe { abi::vbar_slot_transfer(slot, 0, dst, 0, 9) });
    assert!(!unsafe { abi::vbar_slot_transfer(slot, 0, dst, 0, -1) });
    abi::vbar_slot_wait(slot, 8);
    assert_eq!(
        dev.read(vbar_gpu::DevicePtr(dst), 4).unwrap(),
        vec![0x5A; 4]
    );

    abi::vbar_slot_destroy(slot);
    abi::hostbuf_destroy(host);
    abi::vrambuf_destroy(vram);
    assert_eq!(abi::get_total_vram_usage(), 0);
    abi::uninstall();
}

#[test]
fn handles_of_one_kind_are_refused_by_another() {
    let _g = serial();
    let (engine, _dev) = install(8 * MIB);

    let vbar = abi::vbar_allocate(2 * MIB, 0);
    let vram = abi::vrambuf_create(0, 2 * MIB);
    let slot = abi::vbar_slot_create(7);
    assert_ne!(vbar, vram);
    assert_ne!(vbar, slot);

    assert_eq!(abi::vbar_get(slot), 0);
    assert_eq!(abi::vbar_get(vram), 0);
    assert_eq!(abi::vrambuf_get(vbar), 0);
    abi::vbar_free(vram);
    abi::vrambuf_destroy(vbar);
    abi::vbar_slot_destroy(vbar);

    let crossed = vbar::VbarHandle::from_raw(slot).unwrap();
    assert_eq!(
        engine.vbar_get(crossed),
        Err(VbarError::InvalidHandle("vbar"))
    );
    assert_ne!(abi::vbar_get(vbar), 0);
    assert_ne!(abi::vrambuf_get(vram), 0);

    abi::vbar_slot_destroy(slot);
    abi::vrambuf_destroy(vram);
    abi::vbar_free(vbar);
    abi::uninstall();
}

// ============================================================================
// ALLOCATOR SHIM
// ============================================================================

static HELD: AtomicU64 = AtomicU64::new(0);
static HOOK_CALLS: AtomicU64 = AtomicU64::new(0);

extern "C" fn release_held() {
    HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
    let ptr = HELD.swap(0, Ordering::SeqCst);
    abi::free_fn(ptr as usize as *mut c_void, 0, 0, std::ptr::null_mut());
}

#[test]
fn alloc_retries_after_empty_cache() {
    let _g = serial();
    let (engine, _dev) = install(4 * MIB);
    HOOK_CALLS.store(0, Ordering::SeqCst);

    let held = abi::alloc_fn(4 * MIB as usize, 0, std::ptr::null_mut());
    assert!(!held.is_null());
    HELD.store(held as usize as u64, Ordering::SeqCst);

    // no hook: the allocation fails
    abi::set_empty_cache(None);
    assert!(abi::alloc_fn(MIB as usize, 0, std::ptr::null_mut()).is_null());

    abi::set_empty_cache(Some(release_held));
    let ptr = abi::alloc_fn(MIB as usize, 0, std::ptr::null_mut());
    assert!(!ptr.is_null());
    assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(engine.shim_allocated_bytes(0), 2 * MIB);

    abi::free_fn(ptr, MIB as usize, 0, std::ptr::null_mut());
    abi::free_fn(std::ptr::null_mut(), 0, 0, std::ptr::null_mut());
    assert_eq!(engine.shim_allocated_bytes(0), 0);
    abi::set_empty_cache(None);
    abi::uninstall();
}

#[test]
fn alloc_shares_memory_with_vbars() {
    let _g = serial();
    let (engine, _dev) = install(4 * MIB);
    let vbar = abi::vbar_allocate(4 * MIB, 0);
    let mut out = vec![0u64; signature_capacity(4 * MIB, MIB)];
    let code = unsafe { abi::vbar_fault(vbar, 0, 4 * MIB, out.as_mut_ptr()) };
    assert_eq!(code, VBAR_FAULT_RESIDENT);
    abi::vbar_unpin(vbar, 0, 4 * MIB);

    // unpinned pages are reclaimed for the host runtime
    let ptr = abi::alloc_fn(MIB as usize, 0, std::ptr::null_mut());
    assert!(!ptr.is_null());
    assert!(abi::vbar_loaded_size(vbar) <= 2 * MIB);
    assert!(engine.total_vram_usage() <= 4 * MIB);
    abi::free_fn(ptr, MIB as usize, 0, std::ptr::null_mut());
    abi::uninstall();
}

// ============================================================================
// LOGGING
// ============================================================================

#[test]
fn log_level_exports_reload_the_filter() {
    let _g = serial();
    abi::set_log_level_debug();
    if let Some(filter) = vbar::logging::current_filter() {
        assert_eq!(filter, LogLevel::Debug.filter());
        abi::set_log_level_none();
        assert_eq!(vbar::logging::current_filter(), Some(LogLevel::None.filter()));
        abi::set_log_level_warning();
        assert_eq!(vbar::logging::current_filter(), Some(LogLevel::Warning.filter()));
    }
}
