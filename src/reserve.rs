// src/reserve.rs - virtual reservations and their block mapping tables
use crate::driver::{DeviceDriver, DeviceId, PageHandle, VirtualRange};
use crate::error::{EmmError, Result};
use crate::pool::PhysicalPagePool;
use crate::round_up;
use crate::tensor::{DType, KvKind, KvTensorView};
use std::collections::{HashMap, HashSet};

/// Tracks which block offsets of a reservation are physically backed, and by
/// which pages. One entry per mapped offset; each entry holds one page per
/// (layer, K/V) sub-tensor, in sub-tensor order.
#[derive(Debug, Default)]
pub struct MappingTable {
    entries: HashMap<usize, Vec<PageHandle>>,
}

impl MappingTable {
    fn insert(&mut self, block: usize, pages: Vec<PageHandle>) {
        debug_assert!(!self.entries.contains_key(&block));
        self.entries.insert(block, pages);
    }

    fn remove(&mut self, block: usize) -> Option<Vec<PageHandle>> {
        self.entries.remove(&block)
    }

    fn get(&self, block: usize) -> Option<&[PageHandle]> {
        self.entries.get(&block).map(Vec::as_slice)
    }

    pub fn contains(&self, block: usize) -> bool {
        self.entries.contains_key(&block)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn blocks_sorted(&self) -> Vec<usize> {
        let mut blocks: Vec<usize> = self.entries.keys().copied().collect();
        blocks.sort_unstable();
        blocks
    }
}

/// A contiguous virtual address range holding one KV tensor set, plus its
/// mapping table.
///
/// The range is laid out as `2 * num_layers` equal sub-tensors in a fixed
/// layer-major order: layer 0 K, layer 0 V, layer 1 K, layer 1 V, ... A
/// block offset addresses the same granularity-sized slice of every
/// sub-tensor at once (paged-KV convention: one block spans the full model
/// depth), so mapping one offset commits `2 * num_layers` physical pages.
pub struct KvReservation {
    range: VirtualRange,
    device: DeviceId,
    granularity: usize,
    num_layers: usize,
    tensor_size: usize,
    blocks_per_tensor: usize,
    dtype: DType,
    table: MappingTable,
}

impl KvReservation {
    /// Reserve virtual address space sized for `num_layers` K/V tensor
    /// pairs of `size` bytes each, rounded up to the granularity. No
    /// physical memory is committed here.
    pub fn new(
        driver: &dyn DeviceDriver,
        device: DeviceId,
        size: usize,
        dtype: DType,
        num_layers: usize,
        granularity: usize,
    ) -> Result<Self> {
        debug_assert!(size > 0 && num_layers > 0 && granularity > 0);
        let tensor_size = round_up(size, granularity);
        let total = tensor_size
            .checked_mul(num_layers)
            .and_then(|t| t.checked_mul(2))
            .ok_or_else(|| {
                EmmError::InvalidArgument(format!(
                    "reservation size overflows: {size} bytes x {num_layers} layers x 2"
                ))
            })?;
        let range = driver
            .reserve_address_range(device, total)
            .map_err(|e| EmmError::DeviceReservationFailed(e.to_string()))?;
        log::info!(
            "{device}: reserved {}KiB virtual range at {:#x} ({num_layers} layers, {} blocks per tensor)",
            total / 1024,
            range.base,
            tensor_size / granularity
        );
        Ok(Self {
            range,
            device,
            granularity,
            num_layers,
            tensor_size,
            blocks_per_tensor: tensor_size / granularity,
            dtype,
            table: MappingTable::default(),
        })
    }

    /// Views over the sub-tensors, in creation order: layer 0 K, layer 0 V,
    /// layer 1 K, ...
    pub fn tensor_views(&self) -> Vec<KvTensorView> {
        let mut views = Vec::with_capacity(self.num_tensors());
        for layer in 0..self.num_layers {
            for kind in [KvKind::Key, KvKind::Value] {
                let idx = views.len();
                views.push(KvTensorView {
                    addr: self.range.base + (idx * self.tensor_size) as u64,
                    len: self.tensor_size,
                    dtype: self.dtype,
                    device: self.device,
                    layer,
                    kind,
                });
            }
        }
        views
    }

    pub fn num_tensors(&self) -> usize {
        self.num_layers * 2
    }

    pub fn blocks_per_tensor(&self) -> usize {
        self.blocks_per_tensor
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn virtual_size(&self) -> usize {
        self.range.len
    }

    pub fn mapped_blocks(&self) -> usize {
        self.table.len()
    }

    pub fn is_mapped(&self, offset: u64) -> bool {
        usize::try_from(offset)
            .map(|block| self.table.contains(block))
            .unwrap_or(false)
    }

    fn sub_tensor_offset(&self, tensor_idx: usize, block: usize) -> usize {
        tensor_idx * self.tensor_size + block * self.granularity
    }

    /// Validate a batch up front: in-bounds, no duplicates, and every offset
    /// in the expected mapped/unmapped state. Nothing is mutated here, so a
    /// precondition failure has no side effects.
    fn check_offsets(&self, offsets: &[u64], want_mapped: bool) -> Result<Vec<usize>> {
        let mut blocks = Vec::with_capacity(offsets.len());
        let mut seen = HashSet::with_capacity(offsets.len());
        for &offset in offsets {
            let block = usize::try_from(offset)
                .ok()
                .filter(|&b| b < self.blocks_per_tensor)
                .ok_or_else(|| {
                    EmmError::InvalidArgument(format!(
                        "block offset {offset} out of range ({} blocks per tensor)",
                        self.blocks_per_tensor
                    ))
                })?;
            if !seen.insert(block) {
                return Err(EmmError::InvalidArgument(format!(
                    "duplicate block offset {offset} in batch"
                )));
            }
            match (want_mapped, self.table.contains(block)) {
                (true, false) => return Err(EmmError::NotMapped(offset)),
                (false, true) => return Err(EmmError::AlreadyMapped(offset)),
                _ => {}
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Map every offset in order, all-or-nothing. Each offset acquires one
    /// page per sub-tensor from the pool and installs it; if any acquisition
    /// or driver call fails, the installed prefix is undone in reverse order
    /// and the reservation is left exactly as before the call.
    pub fn map_blocks(
        &mut self,
        offsets: &[u64],
        pool: &PhysicalPagePool,
        driver: &dyn DeviceDriver,
    ) -> Result<()> {
        let blocks = self.check_offsets(offsets, false)?;
        let pages_needed = blocks.len() * self.num_tensors();
        let available = pool.free_count();
        if pages_needed > available {
            return Err(EmmError::ResourceExhausted {
                needed: pages_needed,
                available,
            });
        }

        // Phase one: stage acquisitions and driver installs in order.
        let mut installed: Vec<(usize, PageHandle)> = Vec::with_capacity(pages_needed);
        let mut staged: Vec<(usize, Vec<PageHandle>)> = Vec::with_capacity(blocks.len());
        let mut failure: Option<EmmError> = None;

        'batch: for &block in &blocks {
            let mut pages = Vec::with_capacity(self.num_tensors());
            for tensor_idx in 0..self.num_tensors() {
                let page = match pool.acquire() {
                    Ok(page) => page,
                    Err(e) => {
                        failure = Some(e);
                        break 'batch;
                    }
                };
                let byte_offset = self.sub_tensor_offset(tensor_idx, block);
                if let Err(e) = driver.map_page(&self.range, byte_offset, page) {
                    pool.release(page);
                    failure = Some(e.into());
                    break 'batch;
                }
                installed.push((byte_offset, page));
                pages.push(page);
            }
            staged.push((block, pages));
        }

        if let Some(err) = failure {
            // Undo the successful prefix in reverse order.
            for (byte_offset, page) in installed.into_iter().rev() {
                if let Err(e) = driver.unmap_page(&self.range, byte_offset, self.granularity) {
                    log::error!("rollback unmap at byte offset {byte_offset} failed: {e}");
                }
                pool.release(page);
            }
            log::debug!(
                "{}: map batch of {} offsets rolled back: {err}",
                self.device,
                offsets.len()
            );
            return Err(err);
        }

        // Phase two: commit into the live table.
        for (block, pages) in staged {
            self.table.insert(block, pages);
        }
        log::debug!(
            "{}: mapped {} offsets ({pages_needed} pages), {} blocks resident",
            self.device,
            offsets.len(),
            self.table.len()
        );
        Ok(())
    }

    /// Unmap every offset in order, all-or-nothing. Pages return to the pool
    /// only once the whole batch has detached; a driver failure partway
    /// remaps the detached prefix in reverse order.
    pub fn unmap_blocks(
        &mut self,
        offsets: &[u64],
        pool: &PhysicalPagePool,
        driver: &dyn DeviceDriver,
    ) -> Result<()> {
        let blocks = self.check_offsets(offsets, true)?;

        let mut detached: Vec<(usize, PageHandle)> = Vec::new();
        let mut failure: Option<EmmError> = None;

        'batch: for &block in &blocks {
            let pages = match self.table.get(block) {
                Some(pages) => pages,
                // check_offsets guarantees presence
                None => continue,
            };
            for (tensor_idx, &page) in pages.iter().enumerate() {
                let byte_offset = self.sub_tensor_offset(tensor_idx, block);
                if let Err(e) = driver.unmap_page(&self.range, byte_offset, self.granularity) {
                    failure = Some(e.into());
                    break 'batch;
                }
                detached.push((byte_offset, page));
            }
        }

        if let Some(err) = failure {
            for (byte_offset, page) in detached.into_iter().rev() {
                if let Err(e) = driver.map_page(&self.range, byte_offset, page) {
                    log::error!("rollback remap at byte offset {byte_offset} failed: {e}");
                }
            }
            log::debug!(
                "{}: unmap batch of {} offsets rolled back: {err}",
                self.device,
                offsets.len()
            );
            return Err(err);
        }

        let released = detached.len();
        for &block in &blocks {
            if let Some(pages) = self.table.remove(block) {
                for page in pages {
                    pool.release(page);
                }
            }
        }
        log::debug!(
            "{}: unmapped {} offsets ({released} pages), {} blocks resident",
            self.device,
            offsets.len(),
            self.table.len()
        );
        Ok(())
    }

    /// Unmap every resident block and release the virtual range. Terminal:
    /// the reservation is consumed.
    pub fn release(mut self, pool: &PhysicalPagePool, driver: &dyn DeviceDriver) -> Result<()> {
        for block in self.table.blocks_sorted() {
            if let Some(pages) = self.table.remove(block) {
                for (tensor_idx, page) in pages.into_iter().enumerate() {
                    let byte_offset = self.sub_tensor_offset(tensor_idx, block);
                    if let Err(e) = driver.unmap_page(&self.range, byte_offset, self.granularity) {
                        log::error!("teardown unmap at byte offset {byte_offset} failed: {e}");
                    }
                    pool.release(page);
                }
            }
        }
        driver.release_address_range(&self.range)?;
        log::info!(
            "{}: released reservation at {:#x} ({}KiB)",
            self.device,
            self.range.base,
            self.range.len / 1024
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HostDriver;
    use std::sync::Arc;

    const GRAN: usize = 4096;

    fn setup(capacity: usize) -> (Arc<HostDriver>, PhysicalPagePool) {
        let driver = Arc::new(HostDriver::with_granularity(1, GRAN));
        let pool = PhysicalPagePool::new(
            Arc::clone(&driver) as Arc<dyn DeviceDriver>,
            DeviceId(0),
            GRAN,
            capacity,
        );
        (driver, pool)
    }

    fn reservation(driver: &HostDriver, size: usize, num_layers: usize) -> KvReservation {
        KvReservation::new(driver, DeviceId(0), size, DType::Float16, num_layers, GRAN).unwrap()
    }

    #[test]
    fn test_sizing_rounds_up_to_granularity() {
        let (driver, _pool) = setup(8);
        let r = reservation(&driver, GRAN + 1, 3);
        assert_eq!(r.blocks_per_tensor(), 2);
        assert_eq!(r.num_tensors(), 6);
        assert_eq!(r.virtual_size(), 2 * GRAN * 6);
    }

    #[test]
    fn test_view_order_is_layer_major_k_then_v() {
        let (driver, _pool) = setup(8);
        let r = reservation(&driver, GRAN, 2);
        let views = r.tensor_views();
        assert_eq!(views.len(), 4);
        assert_eq!((views[0].layer, views[0].kind), (0, KvKind::Key));
        assert_eq!((views[1].layer, views[1].kind), (0, KvKind::Value));
        assert_eq!((views[2].layer, views[2].kind), (1, KvKind::Key));
        assert_eq!((views[3].layer, views[3].kind), (1, KvKind::Value));
        // disjoint, contiguous sub-ranges
        for pair in views.windows(2) {
            assert_eq!(pair[1].addr, pair[0].addr + pair[0].len as u64);
        }
    }

    #[test]
    fn test_map_unmap_round_trip() {
        let (driver, pool) = setup(16);
        let mut r = reservation(&driver, 2 * GRAN, 2);

        r.map_blocks(&[0, 1], &pool, driver.as_ref()).unwrap();
        assert_eq!(r.mapped_blocks(), 2);
        assert_eq!(pool.in_use(), 8); // 2 offsets x 4 sub-tensors

        r.unmap_blocks(&[0, 1], &pool, driver.as_ref()).unwrap();
        assert_eq!(r.mapped_blocks(), 0);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.free_count(), 16);
        r.release(&pool, driver.as_ref()).unwrap();
    }

    #[test]
    fn test_double_map_fails_without_side_effects() {
        let (driver, pool) = setup(8);
        let mut r = reservation(&driver, 2 * GRAN, 1);

        r.map_blocks(&[0], &pool, driver.as_ref()).unwrap();
        let before = pool.in_use();
        assert!(matches!(
            r.map_blocks(&[1, 0], &pool, driver.as_ref()),
            Err(EmmError::AlreadyMapped(0))
        ));
        assert_eq!(pool.in_use(), before);
        assert!(!r.is_mapped(1));
    }

    #[test]
    fn test_unmap_unmapped_fails_without_side_effects() {
        let (driver, pool) = setup(8);
        let mut r = reservation(&driver, 2 * GRAN, 1);
        r.map_blocks(&[0], &pool, driver.as_ref()).unwrap();

        assert!(matches!(
            r.unmap_blocks(&[0, 1], &pool, driver.as_ref()),
            Err(EmmError::NotMapped(1))
        ));
        assert!(r.is_mapped(0));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_batch_rejects_duplicates_and_out_of_range() {
        let (driver, pool) = setup(8);
        let mut r = reservation(&driver, 2 * GRAN, 1);
        assert!(matches!(
            r.map_blocks(&[0, 0], &pool, driver.as_ref()),
            Err(EmmError::InvalidArgument(_))
        ));
        assert!(matches!(
            r.map_blocks(&[2], &pool, driver.as_ref()),
            Err(EmmError::InvalidArgument(_))
        ));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_exhaustion_mid_batch_rolls_back() {
        // budget covers one offset of two pages, not two
        let (driver, pool) = setup(3);
        let mut r = reservation(&driver, 2 * GRAN, 1);

        let err = r.map_blocks(&[0, 1], &pool, driver.as_ref()).unwrap_err();
        assert!(matches!(
            err,
            EmmError::ResourceExhausted {
                needed: 4,
                available: 3
            }
        ));
        assert_eq!(r.mapped_blocks(), 0);
        assert_eq!(pool.free_count(), 3);

        r.map_blocks(&[1], &pool, driver.as_ref()).unwrap();
        assert!(r.is_mapped(1));
    }

    #[test]
    fn test_driver_failure_mid_batch_rolls_back_in_reverse() {
        let (driver, pool) = setup(8);
        let mut r = reservation(&driver, 2 * GRAN, 1);

        // third driver map call fails: offset 0 fully installed, offset 1 half done
        driver.fail_map_after(2);
        let err = r.map_blocks(&[0, 1], &pool, driver.as_ref()).unwrap_err();
        assert!(matches!(err, EmmError::Driver(_)));
        assert_eq!(r.mapped_blocks(), 0);
        assert_eq!(pool.free_count(), 8);
        assert!(!r.is_mapped(0) && !r.is_mapped(1));

        // the same batch succeeds once the fault clears
        r.map_blocks(&[0, 1], &pool, driver.as_ref()).unwrap();
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn test_release_returns_all_pages() {
        let (driver, pool) = setup(8);
        let mut r = reservation(&driver, 2 * GRAN, 2);
        r.map_blocks(&[0, 1], &pool, driver.as_ref()).unwrap();
        assert_eq!(pool.in_use(), 8);

        r.release(&pool, driver.as_ref()).unwrap();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.free_count(), 8);
    }
}
