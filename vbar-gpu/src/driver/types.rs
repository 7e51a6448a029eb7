//! Device Layer Types
//!
//! Plain-data identifiers shared by every `DeviceBackend` implementation.
//! None of these own anything; lifetimes are managed by whoever created them.

/// CUDA device ordinal
pub type DeviceOrdinal = i32;

/// Device virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// Null device pointer
    pub const NULL: Self = Self(0);

    /// Get raw address
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[must_use]
    pub const fn byte_offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Host address (pinned or pageable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostPtr(pub u64);

impl HostPtr {
    /// Null host pointer
    pub const NULL: Self = Self(0);

    /// Check if null
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[must_use]
    pub const fn byte_offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// As a raw mutable pointer
    #[must_use]
    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as usize as *mut u8
    }
}

/// Stream handle owned by the host runtime (`CUstream` value, 0 = default stream)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub u64);

impl StreamHandle {
    /// The legacy default stream
    pub const DEFAULT: Self = Self(0);

    /// Get raw value
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Physical allocation backing a mapped range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysHandle(pub u64);

/// Completion signal: a 32-bit word the device writes and streams wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandle {
    /// Host-side address of the word (or backend-private id)
    pub host: u64,
    /// Device-visible alias of the word
    pub device: DevicePtr,
}
