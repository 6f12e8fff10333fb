// src/error.rs - unified allocator error type
use crate::driver::DriverError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmmError>;

/// Errors surfaced by the elastic KV-cache allocator.
///
/// Precondition violations (`InvalidArgument`, `AlreadyMapped`, `NotMapped`)
/// and capacity failures (`ResourceExhausted`) are recoverable; the serving
/// engine is expected to retry with a different plan, typically after
/// evicting blocks elsewhere. `DeviceReservationFailed` and `Driver` are
/// fatal to the allocator instance and are never retried internally.
#[derive(Debug, Error)]
pub enum EmmError {
    /// Operation invoked outside an active init/shutdown window.
    #[error("allocator is not initialized")]
    NotInitialized,

    /// Malformed size, dtype width, device string, or offset.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The block offset already has a physical page installed.
    #[error("block offset {0} is already mapped")]
    AlreadyMapped(u64),

    /// The block offset has no physical page installed.
    #[error("block offset {0} is not mapped")]
    NotMapped(u64),

    /// Neither the page pool nor the driver can satisfy the request.
    #[error("physical page pool exhausted: need {needed} pages, {available} available")]
    ResourceExhausted { needed: usize, available: usize },

    /// The driver could not reserve virtual address space.
    #[error("virtual address reservation failed: {0}")]
    DeviceReservationFailed(String),

    /// An underlying device-API call failed unexpectedly.
    #[error(transparent)]
    Driver(#[from] DriverError),
}
