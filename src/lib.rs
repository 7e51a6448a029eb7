//! VBAR: Virtual Memory Paging for GPU-Resident Tensors
//!
//! **VBAR** (virtual bar) lets a process address far more device memory than
//! the GPU physically has. A VBAR is a reserved virtual range that is backed
//! by physical pages on demand:
//!
//! 1. **Fault** a byte range before use; covering pages are mapped (evicting
//!    cold, unpinned pages if needed) and pinned
//! 2. **Compare signatures** to decide whether the bytes must be uploaded
//!    again
//! 3. **Unpin** once the range is no longer in use
//!
//! Alongside the paged ranges the engine manages always-resident VRAM
//! buffers, pinned host buffers, stream-ordered transfer slots and an
//! allocator shim that lets a host runtime share the same device memory
//! accounting.
//!
//! # Design Principles
//!
//! - **Explicit context**: every operation is a method on an [`Engine`]
//! - **Checked handles**: resources are generation-checked arena handles
//! - **Pressure is not an error**: a fault that cannot be satisfied returns
//!   [`FaultOutcome::Evicted`]
//! - **One device seam**: everything GPU-specific sits behind
//!   [`vbar_gpu::DeviceBackend`]
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use vbar::{Engine, EngineConfig, FaultOutcome};
//! use vbar_gpu::SimDevice;
//!
//! let device = Arc::new(SimDevice::new(&[64 << 20]));
//! let config = EngineConfig::new().with_page_size(2 << 20).with_vram_headroom(0);
//! let engine = Engine::new(config, device).unwrap();
//!
//! let vbar = engine.vbar_allocate(256 << 20, 0).unwrap();
//! let offset = engine.vbar_bump_alloc(vbar, 4 << 20).unwrap();
//! match engine.vbar_fault(vbar, offset, 4 << 20).unwrap() {
//!     FaultOutcome::Resident(signatures) => {
//!         assert_eq!(signatures.len(), 2);
//!         engine.vbar_unpin(vbar, offset, 4 << 20).unwrap();
//!     }
//!     FaultOutcome::Evicted => unreachable!("device has room"),
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
// Allow possible truncation - page indices and host sizes fit in usize on supported targets
#![allow(clippy::cast_possible_truncation)]
// Allow doc markdown for ABI symbol names
#![allow(clippy::doc_markdown)]
// Allow uninlined format args - stylistic preference
#![allow(clippy::uninlined_format_args)]
// Allow module_name_repetitions - VbarError in error module
#![allow(clippy::module_name_repetitions)]
// Allow missing safety doc on ABI exports documented at module level
#![allow(clippy::missing_safety_doc)]

pub mod abi;
pub mod config;
mod engine;
pub mod error;
mod eviction;
pub mod handle;
pub mod host_buffer;
pub mod logging;
pub mod pressure;
pub mod region;
pub mod residency;
pub mod shim;
pub mod signature;
pub mod transfer;
pub mod vram_buffer;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ErrorClass, Result, VbarError};
pub use handle::Handle;
pub use host_buffer::HostBufferHandle;
pub use logging::{init_logging, log_level, set_log_level, LogLevel};
pub use pressure::PressureEvent;
pub use region::{Region, RegionOwner, RegionRecord};
pub use residency::{FaultOutcome, PageSource, VbarHandle, VbarStats};
pub use signature::{signature_capacity, signatures_match, Signature, SignatureSet};
pub use transfer::{SlotHandle, TransferKind};
pub use vram_buffer::VramBufferHandle;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }
}
