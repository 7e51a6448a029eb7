//! Virtual Memory Management and Pinned Host Memory
//!
//! Thin safe wrappers over the CUDA VMM family. A virtual range is reserved
//! once and physical memory is created, mapped and made accessible in one
//! step per chunk, so ranges can be far larger than the device and backed
//! piecemeal.
//!
//! The caller must have bound the right context (see
//! `PrimaryContext::bind`).

use std::ffi::c_void;
use std::ptr;

use super::context::get_driver;
use super::sys::{
    CUdeviceptr, CUmemAccessDesc, CUmemAllocFlags, CUmemAllocationProp,
    CUmemGenericAllocationHandle, CUmemLocation, CudaDriver, CUDA_SUCCESS,
    CU_MEMHOSTALLOC_DEVICEMAP, CU_MEMHOSTALLOC_PORTABLE, CU_MEM_ACCESS_FLAGS_PROT_READWRITE,
    CU_MEM_ALLOCATION_TYPE_PINNED, CU_MEM_LOCATION_TYPE_DEVICE,
};
use crate::GpuError;

// ============================================================================
// Virtual address ranges
// ============================================================================

/// Reserve `size` bytes of device virtual address space
///
/// # Errors
///
/// Returns `Err(GpuError::MemoryAllocation)` if the reservation fails.
pub fn reserve_address(size: u64, alignment: u64) -> Result<CUdeviceptr, GpuError> {
    let driver = get_driver()?;
    let mut ptr: CUdeviceptr = 0;
    // SAFETY: ptr is a valid out pointer, no fixed address requested
    let result =
        unsafe { (driver.cuMemAddressReserve)(&mut ptr, size as usize, alignment as usize, 0, 0) };
    CudaDriver::check(result).map_err(|e| GpuError::MemoryAllocation(e.to_string()))?;
    Ok(ptr)
}

/// Release a range from [`reserve_address`]
///
/// # Errors
///
/// Returns `Err(GpuError::CudaDriver)` if the driver rejects the release.
pub fn free_address(ptr: CUdeviceptr, size: u64) -> Result<(), GpuError> {
    let driver = get_driver()?;
    // SAFETY: range came from cuMemAddressReserve and is fully unmapped
    let result = unsafe { (driver.cuMemAddressFree)(ptr, size as usize) };
    CudaDriver::check(result)
}

/// Create `size` bytes of physical memory on `device` and map it at `vaddr`
///
/// Partial progress is unwound on failure, so an error leaves `vaddr`
/// unmapped.
///
/// # Errors
///
/// Returns `Err(GpuError::OutOfMemory)` if the device is full,
/// `Err(GpuError::CudaDriver)` for any other failure.
pub fn map_physical(
    vaddr: CUdeviceptr,
    size: u64,
    device: i32,
) -> Result<CUmemGenericAllocationHandle, GpuError> {
    let driver = get_driver()?;
    let location = CUmemLocation {
        type_: CU_MEM_LOCATION_TYPE_DEVICE,
        id: device,
    };
    let prop = CUmemAllocationProp {
        type_: CU_MEM_ALLOCATION_TYPE_PINNED,
        requested_handle_types: 0,
        location,
        win32_handle_meta_data: ptr::null_mut(),
        alloc_flags: CUmemAllocFlags::default(),
    };
    let access = CUmemAccessDesc {
        location,
        flags: CU_MEM_ACCESS_FLAGS_PROT_READWRITE,
    };

    let mut handle: CUmemGenericAllocationHandle = 0;
    // SAFETY: prop is fully initialised, handle is a valid out pointer
    let result = unsafe { (driver.cuMemCreate)(&mut handle, size as usize, &prop, 0) };
    CudaDriver::check_alloc(result, device, size)?;

    // SAFETY: vaddr lies in a reserved range, handle is live
    let result = unsafe { (driver.cuMemMap)(vaddr, size as usize, 0, handle, 0) };
    if result != CUDA_SUCCESS {
        // SAFETY: handle is live and unmapped
        unsafe {
            let _ = (driver.cuMemRelease)(handle);
        }
        return CudaDriver::check_alloc(result, device, size).map(|()| handle);
    }

    // SAFETY: range was just mapped
    let result = unsafe { (driver.cuMemSetAccess)(vaddr, size as usize, &access, 1) };
    if result != CUDA_SUCCESS {
        // SAFETY: unwinding the two steps above
        unsafe {
            let _ = (driver.cuMemUnmap)(vaddr, size as usize);
            let _ = (driver.cuMemRelease)(handle);
        }
        return CudaDriver::check_alloc(result, device, size).map(|()| handle);
    }

    Ok(handle)
}

/// Unmap `vaddr` and release its physical memory
///
/// # Errors
///
/// Returns `Err(GpuError::CudaDriver)` if either step fails; the release is
/// still attempted when the unmap fails.
pub fn unmap_physical(
    vaddr: CUdeviceptr,
    size: u64,
    handle: CUmemGenericAllocationHandle,
) -> Result<(), GpuError> {
    let driver = get_driver()?;
    // SAFETY: range was mapped by map_physical with this handle
    let unmap = unsafe { (driver.cuMemUnmap)(vaddr, size as usize) };
    // SAFETY: handle is live
    let release = unsafe { (driver.cuMemRelease)(handle) };
    CudaDriver::check(unmap)?;
    CudaDriver::check(release)
}

// ============================================================================
// Pinned host memory
// ============================================================================

/// Allocate `size` bytes of page-locked, device-mapped host memory
///
/// # Errors
///
/// Returns `Err(GpuError::HostAllocation)` on failure.
pub fn host_alloc(size: u64) -> Result<*mut c_void, GpuError> {
    let driver = get_driver()?;
    let mut p: *mut c_void = ptr::null_mut();
    // SAFETY: p is a valid out pointer
    let result = unsafe {
        (driver.cuMemHostAlloc)(
            &mut p,
            size as usize,
            CU_MEMHOSTALLOC_PORTABLE | CU_MEMHOSTALLOC_DEVICEMAP,
        )
    };
    if result != CUDA_SUCCESS || p.is_null() {
        return Err(GpuError::HostAllocation(size));
    }
    Ok(p)
}

/// Free memory from [`host_alloc`]
///
/// # Errors
///
/// Returns `Err(GpuError::CudaDriver)` if the driver rejects the pointer.
pub fn host_free(p: *mut c_void) -> Result<(), GpuError> {
    let driver = get_driver()?;
    // SAFETY: p came from cuMemHostAlloc
    let result = unsafe { (driver.cuMemFreeHost)(p) };
    CudaDriver::check(result)
}

/// Device alias of device-mapped host memory
///
/// # Errors
///
/// Returns `Err(GpuError::CudaDriver)` if `p` is not device-mapped.
pub fn host_device_pointer(p: *mut c_void) -> Result<CUdeviceptr, GpuError> {
    let driver = get_driver()?;
    let mut dptr: CUdeviceptr = 0;
    // SAFETY: p came from cuMemHostAlloc with DEVICEMAP
    let result = unsafe { (driver.cuMemHostGetDevicePointer)(&mut dptr, p, 0) };
    CudaDriver::check(result)?;
    Ok(dptr)
}
