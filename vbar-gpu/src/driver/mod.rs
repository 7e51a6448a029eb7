//! CUDA Driver API (Minimal FFI)
//!
//! Binds only the driver entry points the paging engine needs: primary
//! contexts, the VMM reserve/create/map family, pinned host memory, async
//! copies and 32-bit stream memory operations.
//!
//! Everything compiles without the `cuda` feature; the driver simply fails to
//! load and every call returns `GpuError::CudaNotAvailable`.

mod context;
mod memory;
mod stream;
pub mod sys;
mod types;

pub use context::{get_driver, visible_devices, PrimaryContext};
pub use memory::{
    free_address, host_alloc, host_device_pointer, host_free, map_physical, reserve_address,
    unmap_physical,
};
pub use stream::{
    copy_dtod_async, copy_htod_async, synchronize, wait_value, write_value, CudaStream,
    DEFAULT_STREAM,
};
pub use types::*;
