//! Minimal CUDA Driver API FFI Bindings
//!
//! Hand-written FFI for the CUDA driver functions the paging engine needs:
//! device queries, primary contexts, the virtual memory management (VMM)
//! family, pinned host memory and stream memory operations.
//! Dynamic loading via libcuda.so/nvcuda.dll, nothing linked at build time.
//!
//! # Safety
//!
//! All functions in this module are unsafe. Safe wrappers are provided in
//! sibling modules (context.rs, stream.rs, memory.rs).
//!
//! # Clippy Allows
//!
//! - `borrow_as_ptr`: FFI requires `&mut T` -> `*mut T` conversion
//! - `ptr_as_ptr`: FFI pointer casts are intentional

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uint, c_ulonglong};

use crate::GpuError;

// ============================================================================
// CUDA Type Definitions (from cuda.h)
// ============================================================================

/// CUDA error code
pub type CUresult = c_int;

/// CUDA device handle
pub type CUdevice = c_int;

/// CUDA context handle (opaque pointer)
pub type CUcontext = *mut c_void;

/// CUDA stream handle (opaque pointer)
pub type CUstream = *mut c_void;

/// CUDA device pointer (GPU virtual address)
pub type CUdeviceptr = u64;

/// Physical allocation handle from cuMemCreate
pub type CUmemGenericAllocationHandle = c_ulonglong;

/// Location of a physical allocation
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CUmemLocation {
    /// CUmemLocationType
    pub type_: c_int,
    /// Device ordinal for device locations
    pub id: c_int,
}

/// Allocation flags block of CUmemAllocationProp
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CUmemAllocFlags {
    /// Compression type
    pub compression_type: u8,
    /// GPUDirect RDMA capable
    pub gpu_direct_rdma_capable: u8,
    /// Usage flags
    pub usage: u16,
    /// Reserved, must be zero
    pub reserved: [u8; 4],
}

/// Properties of a physical allocation
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CUmemAllocationProp {
    /// CUmemAllocationType
    pub type_: c_int,
    /// CUmemAllocationHandleType
    pub requested_handle_types: c_int,
    /// Where the memory lives
    pub location: CUmemLocation,
    /// Windows-only metadata, null elsewhere
    pub win32_handle_meta_data: *mut c_void,
    /// Extra flags
    pub alloc_flags: CUmemAllocFlags,
}

/// Access grant for a mapped range
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CUmemAccessDesc {
    /// Which device gets access
    pub location: CUmemLocation,
    /// CUmemAccess_flags
    pub flags: c_int,
}

// ============================================================================
// CUDA Error Codes (subset we handle)
// ============================================================================

/// CUDA success
pub const CUDA_SUCCESS: CUresult = 0;
/// Invalid value passed
pub const CUDA_ERROR_INVALID_VALUE: CUresult = 1;
/// Out of memory
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
/// CUDA not initialized
pub const CUDA_ERROR_NOT_INITIALIZED: CUresult = 3;
/// CUDA deinitialized
pub const CUDA_ERROR_DEINITIALIZED: CUresult = 4;
/// No CUDA device
pub const CUDA_ERROR_NO_DEVICE: CUresult = 100;
/// Invalid device
pub const CUDA_ERROR_INVALID_DEVICE: CUresult = 101;
/// Invalid context
pub const CUDA_ERROR_INVALID_CONTEXT: CUresult = 201;
/// Operation not supported (e.g. VMM on old drivers)
pub const CUDA_ERROR_NOT_SUPPORTED: CUresult = 801;

// ============================================================================
// CUDA Flags
// ============================================================================

/// Non-blocking stream (doesn't synchronize with stream 0)
pub const CU_STREAM_NON_BLOCKING: c_uint = 1;
/// Pinned device allocation type for cuMemCreate
pub const CU_MEM_ALLOCATION_TYPE_PINNED: c_int = 1;
/// Device location type
pub const CU_MEM_LOCATION_TYPE_DEVICE: c_int = 1;
/// Read/write access
pub const CU_MEM_ACCESS_FLAGS_PROT_READWRITE: c_int = 3;
/// Pinned host memory usable from every context
pub const CU_MEMHOSTALLOC_PORTABLE: c_uint = 1;
/// Pinned host memory mapped into the device address space
pub const CU_MEMHOSTALLOC_DEVICEMAP: c_uint = 2;
/// Wait until `*addr >= value`
pub const CU_STREAM_WAIT_VALUE_GEQ: c_uint = 0;
/// Default write semantics
pub const CU_STREAM_WRITE_VALUE_DEFAULT: c_uint = 0;

// ============================================================================
// CUDA Driver Function Pointers
// ============================================================================

/// Dynamically loaded CUDA driver functions
///
/// All function pointers are loaded at runtime from libcuda.so (Linux)
/// or nvcuda.dll (Windows). This avoids link-time dependency on CUDA.
#[allow(non_snake_case)]
pub struct CudaDriver {
    /// cuInit - Initialize the CUDA driver
    pub cuInit: unsafe extern "C" fn(flags: c_uint) -> CUresult,

    // Device Management
    /// cuDeviceGetCount - Get number of CUDA devices
    pub cuDeviceGetCount: unsafe extern "C" fn(count: *mut c_int) -> CUresult,
    /// cuDeviceGet - Get device handle by ordinal
    pub cuDeviceGet: unsafe extern "C" fn(device: *mut CUdevice, ordinal: c_int) -> CUresult,
    /// cuDeviceGetName - Get device name
    pub cuDeviceGetName:
        unsafe extern "C" fn(name: *mut c_char, len: c_int, device: CUdevice) -> CUresult,
    /// cuDeviceTotalMem - Get total device memory
    pub cuDeviceTotalMem: unsafe extern "C" fn(bytes: *mut usize, device: CUdevice) -> CUresult,

    // Context Management (Primary Context API)
    /// cuDevicePrimaryCtxRetain - Retain primary context
    pub cuDevicePrimaryCtxRetain:
        unsafe extern "C" fn(ctx: *mut CUcontext, device: CUdevice) -> CUresult,
    /// cuDevicePrimaryCtxRelease - Release primary context
    pub cuDevicePrimaryCtxRelease: unsafe extern "C" fn(device: CUdevice) -> CUresult,
    /// cuCtxSetCurrent - Set current context
    pub cuCtxSetCurrent: unsafe extern "C" fn(ctx: CUcontext) -> CUresult,
    /// cuCtxSynchronize - Synchronize current context
    pub cuCtxSynchronize: unsafe extern "C" fn() -> CUresult,

    // Virtual Memory Management
    /// cuMemAddressReserve - Reserve a virtual address range
    pub cuMemAddressReserve: unsafe extern "C" fn(
        ptr: *mut CUdeviceptr,
        size: usize,
        alignment: usize,
        addr: CUdeviceptr,
        flags: c_ulonglong,
    ) -> CUresult,
    /// cuMemAddressFree - Release a virtual address range
    pub cuMemAddressFree: unsafe extern "C" fn(ptr: CUdeviceptr, size: usize) -> CUresult,
    /// cuMemCreate - Create physical memory
    pub cuMemCreate: unsafe extern "C" fn(
        handle: *mut CUmemGenericAllocationHandle,
        size: usize,
        prop: *const CUmemAllocationProp,
        flags: c_ulonglong,
    ) -> CUresult,
    /// cuMemRelease - Release physical memory
    pub cuMemRelease: unsafe extern "C" fn(handle: CUmemGenericAllocationHandle) -> CUresult,
    /// cuMemMap - Map physical memory into a reserved range
    pub cuMemMap: unsafe extern "C" fn(
        ptr: CUdeviceptr,
        size: usize,
        offset: usize,
        handle: CUmemGenericAllocationHandle,
        flags: c_ulonglong,
    ) -> CUresult,
    /// cuMemUnmap - Unmap a range
    pub cuMemUnmap: unsafe extern "C" fn(ptr: CUdeviceptr, size: usize) -> CUresult,
    /// cuMemSetAccess - Grant access to a mapped range
    pub cuMemSetAccess: unsafe extern "C" fn(
        ptr: CUdeviceptr,
        size: usize,
        desc: *const CUmemAccessDesc,
        count: usize,
    ) -> CUresult,
    /// cuMemGetInfo - Get free and total memory
    pub cuMemGetInfo: unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> CUresult,

    // Host Memory
    /// cuMemHostAlloc - Allocate page-locked host memory
    pub cuMemHostAlloc:
        unsafe extern "C" fn(pp: *mut *mut c_void, size: usize, flags: c_uint) -> CUresult,
    /// cuMemFreeHost - Free page-locked host memory
    pub cuMemFreeHost: unsafe extern "C" fn(p: *mut c_void) -> CUresult,
    /// cuMemHostGetDevicePointer - Device alias of mapped host memory
    pub cuMemHostGetDevicePointer:
        unsafe extern "C" fn(dptr: *mut CUdeviceptr, p: *mut c_void, flags: c_uint) -> CUresult,

    // Copies
    /// cuMemcpyHtoDAsync - Async copy from host to device
    pub cuMemcpyHtoDAsync: unsafe extern "C" fn(
        dst: CUdeviceptr,
        src: *const c_void,
        size: usize,
        stream: CUstream,
    ) -> CUresult,
    /// cuMemcpyDtoDAsync - Async copy from device to device
    pub cuMemcpyDtoDAsync: unsafe extern "C" fn(
        dst: CUdeviceptr,
        src: CUdeviceptr,
        size: usize,
        stream: CUstream,
    ) -> CUresult,

    // Streams
    /// cuStreamCreate - Create a stream
    pub cuStreamCreate: unsafe extern "C" fn(stream: *mut CUstream, flags: c_uint) -> CUresult,
    /// cuStreamDestroy - Destroy a stream
    pub cuStreamDestroy: unsafe extern "C" fn(stream: CUstream) -> CUresult,
    /// cuStreamSynchronize - Synchronize a stream
    pub cuStreamSynchronize: unsafe extern "C" fn(stream: CUstream) -> CUresult,
    /// cuStreamWriteValue32 - Write a value once prior stream work completes
    pub cuStreamWriteValue32: unsafe extern "C" fn(
        stream: CUstream,
        addr: CUdeviceptr,
        value: u32,
        flags: c_uint,
    ) -> CUresult,
    /// cuStreamWaitValue32 - Block a stream until a memory condition holds
    pub cuStreamWaitValue32: unsafe extern "C" fn(
        stream: CUstream,
        addr: CUdeviceptr,
        value: u32,
        flags: c_uint,
    ) -> CUresult,
}

// ============================================================================
// Dynamic Loading
// ============================================================================

#[cfg(feature = "cuda")]
mod loading {
    use super::*;
    use libloading::{Library, Symbol};
    use std::sync::OnceLock;

    /// Global driver instance (loaded once)
    static DRIVER: OnceLock<Option<CudaDriver>> = OnceLock::new();

    /// Library handle (must outlive function pointers)
    static LIBRARY: OnceLock<Option<Library>> = OnceLock::new();

    impl CudaDriver {
        /// Load CUDA driver dynamically
        ///
        /// Returns `None` if CUDA is not available (no driver installed).
        /// This is NOT an error - it's expected on systems without NVIDIA GPUs.
        #[must_use]
        pub fn load() -> Option<&'static Self> {
            let _ = LIBRARY.get_or_init(|| {
                #[cfg(target_os = "linux")]
                let lib_names = ["libcuda.so.1", "libcuda.so"];
                #[cfg(target_os = "windows")]
                let lib_names = ["nvcuda.dll"];
                #[cfg(not(any(target_os = "linux", target_os = "windows")))]
                let lib_names: [&str; 0] = [];

                for name in lib_names {
                    // SAFETY: We're loading a well-known system library
                    if let Ok(lib) = unsafe { Library::new(name) } {
                        return Some(lib);
                    }
                }
                None
            });

            DRIVER
                .get_or_init(|| {
                    let lib = LIBRARY.get()?.as_ref()?;
                    Self::load_from_library(lib)
                })
                .as_ref()
        }

        /// Load function pointers from library
        fn load_from_library(lib: &Library) -> Option<Self> {
            // SAFETY: All symbols are standard CUDA driver API functions and the
            // declared signatures match cuda.h for the versioned names used.
            unsafe {
                macro_rules! load_sym {
                    ($name:literal, $ty:ty) => {{
                        let sym: Symbol<'_, $ty> = lib.get($name.as_bytes()).ok()?;
                        *sym
                    }};
                }

                type FnInit = unsafe extern "C" fn(c_uint) -> CUresult;
                type FnDeviceGetCount = unsafe extern "C" fn(*mut c_int) -> CUresult;
                type FnDeviceGet = unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult;
                type FnDeviceGetName =
                    unsafe extern "C" fn(*mut c_char, c_int, CUdevice) -> CUresult;
                type FnDeviceTotalMem = unsafe extern "C" fn(*mut usize, CUdevice) -> CUresult;
                type FnPrimaryCtxRetain =
                    unsafe extern "C" fn(*mut CUcontext, CUdevice) -> CUresult;
                type FnPrimaryCtxRelease = unsafe extern "C" fn(CUdevice) -> CUresult;
                type FnCtxSetCurrent = unsafe extern "C" fn(CUcontext) -> CUresult;
                type FnCtxSync = unsafe extern "C" fn() -> CUresult;
                type FnAddressReserve = unsafe extern "C" fn(
                    *mut CUdeviceptr,
                    usize,
                    usize,
                    CUdeviceptr,
                    c_ulonglong,
                ) -> CUresult;
                type FnAddressFree = unsafe extern "C" fn(CUdeviceptr, usize) -> CUresult;
                type FnMemCreate = unsafe extern "C" fn(
                    *mut CUmemGenericAllocationHandle,
                    usize,
                    *const CUmemAllocationProp,
                    c_ulonglong,
                ) -> CUresult;
                type FnMemRelease = unsafe extern "C" fn(CUmemGenericAllocationHandle) -> CUresult;
                type FnMemMap = unsafe extern "C" fn(
                    CUdeviceptr,
                    usize,
                    usize,
                    CUmemGenericAllocationHandle,
                    c_ulonglong,
                ) -> CUresult;
                type FnMemUnmap = unsafe extern "C" fn(CUdeviceptr, usize) -> CUresult;
                type FnMemSetAccess =
                    unsafe extern "C" fn(CUdeviceptr, usize, *const CUmemAccessDesc, usize) -> CUresult;
                type FnMemGetInfo = unsafe extern "C" fn(*mut usize, *mut usize) -> CUresult;
                type FnHostAlloc = unsafe extern "C" fn(*mut *mut c_void, usize, c_uint) -> CUresult;
                type FnFreeHost = unsafe extern "C" fn(*mut c_void) -> CUresult;
                type FnHostGetDevicePointer =
                    unsafe extern "C" fn(*mut CUdeviceptr, *mut c_void, c_uint) -> CUresult;
                type FnMemcpyHtoDAsync =
                    unsafe extern "C" fn(CUdeviceptr, *const c_void, usize, CUstream) -> CUresult;
                type FnMemcpyDtoDAsync =
                    unsafe extern "C" fn(CUdeviceptr, CUdeviceptr, usize, CUstream) -> CUresult;
                type FnStreamCreate = unsafe extern "C" fn(*mut CUstream, c_uint) -> CUresult;
                type FnStreamDestroy = unsafe extern "C" fn(CUstream) -> CUresult;
                type FnStreamSync = unsafe extern "C" fn(CUstream) -> CUresult;
                type FnStreamValue32 =
                    unsafe extern "C" fn(CUstream, CUdeviceptr, u32, c_uint) -> CUresult;

                Some(CudaDriver {
                    cuInit: load_sym!("cuInit", FnInit),
                    cuDeviceGetCount: load_sym!("cuDeviceGetCount", FnDeviceGetCount),
                    cuDeviceGet: load_sym!("cuDeviceGet", FnDeviceGet),
                    cuDeviceGetName: load_sym!("cuDeviceGetName", FnDeviceGetName),
                    cuDeviceTotalMem: load_sym!("cuDeviceTotalMem_v2", FnDeviceTotalMem),
                    cuDevicePrimaryCtxRetain: load_sym!(
                        "cuDevicePrimaryCtxRetain",
                        FnPrimaryCtxRetain
                    ),
                    cuDevicePrimaryCtxRelease: load_sym!(
                        "cuDevicePrimaryCtxRelease_v2",
                        FnPrimaryCtxRelease
                    ),
                    cuCtxSetCurrent: load_sym!("cuCtxSetCurrent", FnCtxSetCurrent),
                    cuCtxSynchronize: load_sym!("cuCtxSynchronize", FnCtxSync),
                    cuMemAddressReserve: load_sym!("cuMemAddressReserve", FnAddressReserve),
                    cuMemAddressFree: load_sym!("cuMemAddressFree", FnAddressFree),
                    cuMemCreate: load_sym!("cuMemCreate", FnMemCreate),
                    cuMemRelease: load_sym!("cuMemRelease", FnMemRelease),
                    cuMemMap: load_sym!("cuMemMap", FnMemMap),
                    cuMemUnmap: load_sym!("cuMemUnmap", FnMemUnmap),
                    cuMemSetAccess: load_sym!("cuMemSetAccess", FnMemSetAccess),
                    cuMemGetInfo: load_sym!("cuMemGetInfo_v2", FnMemGetInfo),
                    cuMemHostAlloc: load_sym!("cuMemHostAlloc", FnHostAlloc),
                    cuMemFreeHost: load_sym!("cuMemFreeHost", FnFreeHost),
                    cuMemHostGetDevicePointer: load_sym!(
                        "cuMemHostGetDevicePointer_v2",
                        FnHostGetDevicePointer
                    ),
                    cuMemcpyHtoDAsync: load_sym!("cuMemcpyHtoDAsync_v2", FnMemcpyHtoDAsync),
                    cuMemcpyDtoDAsync: load_sym!("cuMemcpyDtoDAsync_v2", FnMemcpyDtoDAsync),
                    cuStreamCreate: load_sym!("cuStreamCreate", FnStreamCreate),
                    cuStreamDestroy: load_sym!("cuStreamDestroy_v2", FnStreamDestroy),
                    cuStreamSynchronize: load_sym!("cuStreamSynchronize", FnStreamSync),
                    cuStreamWriteValue32: load_sym!("cuStreamWriteValue32_v2", FnStreamValue32),
                    cuStreamWaitValue32: load_sym!("cuStreamWaitValue32_v2", FnStreamValue32),
                })
            }
        }
    }
}

#[cfg(not(feature = "cuda"))]
mod loading {
    use super::*;

    impl CudaDriver {
        /// CUDA not available without feature
        #[must_use]
        pub fn load() -> Option<&'static Self> {
            None
        }
    }
}

impl CudaDriver {
    /// Check CUDA result and convert to GpuError
    ///
    /// # Errors
    ///
    /// Returns `Err(GpuError::CudaDriver)` if result is not CUDA_SUCCESS.
    pub fn check(result: CUresult) -> Result<(), GpuError> {
        if result == CUDA_SUCCESS {
            Ok(())
        } else {
            Err(GpuError::CudaDriver(
                cuda_error_string(result).to_string(),
                result,
            ))
        }
    }

    /// Like [`CudaDriver::check`] but reports OOM as `GpuError::OutOfMemory`
    ///
    /// # Errors
    ///
    /// Returns `Err(GpuError::OutOfMemory)` for CUDA_ERROR_OUT_OF_MEMORY,
    /// `Err(GpuError::CudaDriver)` for every other failure.
    pub fn check_alloc(result: CUresult, device: i32, requested: u64) -> Result<(), GpuError> {
        if result == CUDA_ERROR_OUT_OF_MEMORY {
            return Err(GpuError::OutOfMemory { device, requested });
        }
        Self::check(result)
    }
}

// ============================================================================
// Error String Conversion
// ============================================================================

/// Convert CUDA error code to human-readable string
#[must_use]
pub fn cuda_error_string(code: CUresult) -> &'static str {
    match code {
        CUDA_SUCCESS => "CUDA_SUCCESS",
        CUDA_ERROR_INVALID_VALUE => "CUDA_ERROR_INVALID_VALUE",
        CUDA_ERROR_OUT_OF_MEMORY => "CUDA_ERROR_OUT_OF_MEMORY",
        CUDA_ERROR_NOT_INITIALIZED => "CUDA_ERROR_NOT_INITIALIZED",
        CUDA_ERROR_DEINITIALIZED => "CUDA_ERROR_DEINITIALIZED",
        CUDA_ERROR_NO_DEVICE => "CUDA_ERROR_NO_DEVICE",
        CUDA_ERROR_INVALID_DEVICE => "CUDA_ERROR_INVALID_DEVICE",
        CUDA_ERROR_INVALID_CONTEXT => "CUDA_ERROR_INVALID_CONTEXT",
        CUDA_ERROR_NOT_SUPPORTED => "CUDA_ERROR_NOT_SUPPORTED",
        _ => "CUDA_ERROR_UNKNOWN",
    }
}

// ============================================================================
// Tests
// ============================================================================


// ============================================================================
// Property-Based Tests
// ============================================================================
