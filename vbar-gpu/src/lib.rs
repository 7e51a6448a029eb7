//! # vbar-gpu: Device Layer for the VBAR Paging Engine
//!
//! Everything below the paging engine that talks to a GPU lives here:
//!
//! - [`driver`] - CUDA driver API (minimal FFI, loaded at runtime)
//! - [`device`] - the [`DeviceBackend`] trait plus its CUDA and simulated
//!   implementations
//!
//! The paging engine only ever sees [`DeviceBackend`], so it can be driven by
//! [`SimDevice`] in tests and on machines without a GPU.
//!
//! ## Quick Start
//!
//! ```rust
//! use vbar_gpu::{DeviceBackend, SimDevice};
//!
//! let dev = SimDevice::new(&[64 << 20]);
//! let va = dev.reserve(128 << 20, 0).unwrap();
//! let phys = dev.map(va, 2 << 20, 0).unwrap();
//! assert_eq!(dev.used_bytes(0), 2 << 20);
//! dev.unmap(va, 2 << 20, phys).unwrap();
//! dev.release(va, 128 << 20).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
// Allow possible truncation - device sizes fit in usize on supported targets
#![allow(clippy::cast_possible_truncation)]
// Allow doc markdown for CUDA symbol names
#![allow(clippy::doc_markdown)]
// Allow missing errors doc on thin driver wrappers
#![allow(clippy::missing_errors_doc)]
// Allow uninlined format args - stylistic preference
#![allow(clippy::uninlined_format_args)]
// Allow cast_sign_loss - device ordinals are validated non-negative
#![allow(clippy::cast_sign_loss)]
// Allow module_name_repetitions - CudaDevice in device module
#![allow(clippy::module_name_repetitions)]

pub mod device;
pub mod driver;
pub mod error;

pub use device::{DeviceBackend, ReadTicket, SimDevice, SimFault};
#[cfg(feature = "cuda")]
pub use device::CudaDevice;
pub use driver::{DeviceOrdinal, DevicePtr, HostPtr, PhysHandle, SignalHandle, StreamHandle};
pub use error::{GpuError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
