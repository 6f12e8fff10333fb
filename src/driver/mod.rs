// src/driver/mod.rs - device driver seam for virtual-memory operations

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use host::HostDriver;

#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;

use std::fmt;
use thiserror::Error;

/// Identifies one accelerator device by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Parse a device string such as `"cuda:0"`, `"dev0"` or `"1"` down to
    /// its ordinal. Returns `None` when no trailing ordinal is present.
    pub fn parse(s: &str) -> Option<DeviceId> {
        let digits = s.trim().trim_start_matches(|c: char| !c.is_ascii_digit());
        if digits.is_empty() {
            return None;
        }
        digits.parse().ok().map(DeviceId)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Opaque handle to one granularity-sized unit of physical device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle(pub u64);

/// A reserved virtual address range with no physical backing of its own.
#[derive(Debug, Clone, Copy)]
pub struct VirtualRange {
    pub base: u64,
    pub len: usize,
    pub device: DeviceId,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device ordinal {0} is out of range")]
    InvalidDevice(u32),

    #[error("device out of memory")]
    OutOfMemory,

    #[error("address range reservation failed: {0}")]
    ReservationFailed(String),

    #[error("page mapping operation failed: {0}")]
    MapFailed(String),

    #[error("driver call failed: {0}")]
    Internal(String),
}

/// Low-level virtual-memory operations of one device driver.
///
/// The allocator core is written entirely against this trait; the CUDA VMM
/// backend and the host simulation both implement it, and a cross-process
/// page pool would plug in here by exporting/importing page handles. All
/// calls are made under the allocator's process-wide lock, so
/// implementations need no cross-call ordering guarantees of their own.
pub trait DeviceDriver: Send + Sync {
    /// Number of visible devices.
    fn device_count(&self) -> u32;

    /// Minimum unit at which the device can commit or release physical
    /// memory. Reservation sizes and map offsets are multiples of this.
    fn allocation_granularity(&self, device: DeviceId) -> Result<usize, DriverError>;

    /// Reserve a contiguous virtual address range without committing any
    /// physical memory.
    fn reserve_address_range(&self, device: DeviceId, len: usize)
        -> Result<VirtualRange, DriverError>;

    /// Release a reservation. Every offset must already be unmapped.
    fn release_address_range(&self, range: &VirtualRange) -> Result<(), DriverError>;

    /// Commit one physical page of `len` bytes on `device`.
    fn create_physical_page(&self, device: DeviceId, len: usize)
        -> Result<PageHandle, DriverError>;

    /// Return a physical page to the device.
    fn release_physical_page(&self, page: PageHandle) -> Result<(), DriverError>;

    /// Install `page` at `byte_offset` within `range`.
    fn map_page(&self, range: &VirtualRange, byte_offset: usize, page: PageHandle)
        -> Result<(), DriverError>;

    /// Detach the mapping of `len` bytes at `byte_offset` within `range`.
    fn unmap_page(&self, range: &VirtualRange, byte_offset: usize, len: usize)
        -> Result<(), DriverError>;
}
