//! Sub-allocation handles
//!
//! VBAR and VRAM buffer sub-allocations share one shape so callers can hand
//! either to the transfer engine.

use serde::Serialize;
use vbar_gpu::DevicePtr;

use crate::residency::VbarHandle;
use crate::vram_buffer::VramBufferHandle;

/// Resource a [`Region`] was carved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionOwner {
    /// Paged; must be faulted before use
    Vbar(VbarHandle),
    /// Always resident
    Vram(VramBufferHandle),
}

impl RegionOwner {
    /// Raw handle of the owner
    #[must_use]
    pub fn raw(&self) -> u64 {
        match self {
            Self::Vbar(h) => h.to_raw(),
            Self::Vram(h) => h.to_raw(),
        }
    }
}

/// Addressing handle for a sub-allocation; owns no memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    /// Owning resource
    pub owner: RegionOwner,
    /// Offset within the owner
    pub offset: u64,
    /// Device virtual address
    pub address: DevicePtr,
    /// Length in bytes
    pub size: u64,
}

impl Region {
    /// One past the last byte
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// True if the two regions share an owner and at least one byte
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.owner == other.owner && self.offset < other.end() && other.offset < self.end()
    }

    /// Device address `offset` bytes into the region
    #[must_use]
    pub fn at(&self, offset: u64) -> Option<DevicePtr> {
        (offset < self.size).then(|| self.address.byte_offset(offset))
    }
}

/// Serialized form, for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionRecord {
    /// `"vbar"` or `"vram"`
    pub owner_kind: &'static str,
    /// Raw owner handle
    pub owner: u64,
    /// Offset within the owner
    pub offset: u64,
    /// Device address
    pub address: u64,
    /// Length in bytes
    pub size: u64,
}

impl From<Region> for RegionRecord {
    fn from(region: Region) -> Self {
        Self {
            owner_kind: match region.owner {
                RegionOwner::Vbar(_) => "vbar",
                RegionOwner::Vram(_) => "vram",
            },
            owner: region.owner.raw(),
            offset: region.offset,
            address: region.address.as_raw(),
            size: region.size,
        }
    }
}
