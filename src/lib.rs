//! Elastic GPU memory management for co-located LLM serving engines.
//!
//! Serving engines that share a GPU each reserve a large virtual address
//! range for their paged KV cache up front, then commit and release physical
//! memory block by block as load shifts. The virtual reservation costs
//! nothing until a block offset is mapped; the physical pages backing the
//! mappings come from one per-device pool with a fixed budget, so the
//! engines' footprints can grow and shrink against each other without
//! either one re-reserving address space.
//!
//! A KV tensor set is `2 * num_layers` equal sub-tensors in one contiguous
//! reservation, and a single block offset addresses the same slice of every
//! sub-tensor at once. Batched map and unmap calls are transactional: on any
//! failure the completed prefix is rolled back and the caller observes no
//! state change.
//!
//! The device is reached through the [`driver::DeviceDriver`] trait. The
//! default build runs against a host-heap simulation; the `cuda` feature
//! switches in the CUDA virtual memory management API.

pub mod allocator;
pub mod driver;
pub mod error;
pub mod ffi;
pub mod pool;
pub mod reserve;
pub mod tensor;

pub use allocator::{
    create_kv_tensors, free_kv_tensors, init_emm, is_initialized, map_to_kv_tensors,
    pool_free_pages, shutdown_emm, unmap_from_kv_tensors, EmmConfig, TensorAllocator,
    DEFAULT_POOL_PAGES,
};
pub use error::{EmmError, Result};
pub use pool::{PhysicalPagePool, PoolStats};
pub use reserve::KvReservation;
pub use tensor::{DType, KvKind, KvTensorView};

/// Round `size` up to the next multiple of `granularity`.
pub(crate) fn round_up(size: usize, granularity: usize) -> usize {
    debug_assert!(granularity > 0);
    size.div_ceil(granularity) * granularity
}
