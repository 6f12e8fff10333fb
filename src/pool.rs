// src/pool.rs - shared physical page pool, one per device
use crate::driver::{DeviceDriver, DeviceId, PageHandle};
use crate::error::{EmmError, Result};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared pool of granularity-sized physical pages for one device.
///
/// Pages are committed from the driver lazily, up to the configured budget,
/// and recycled through a free queue once a mapping releases them. Budget
/// that has not been committed yet still counts as free capacity, so
/// `free_count + in_use == capacity` holds at all times. Every reservation
/// on the device draws from the same pool; this is the cross-engine sharing
/// mechanism.
pub struct PhysicalPagePool {
    device: DeviceId,
    page_size: usize,
    capacity: usize,
    free_pages: SegQueue<PageHandle>,
    committed: AtomicUsize,
    in_use: AtomicUsize,
    recycled: AtomicUsize,
    driver: Arc<dyn DeviceDriver>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Configured physical budget in pages.
    pub capacity: usize,
    /// Pages actually committed from the driver so far.
    pub committed: usize,
    /// Pages currently backing a mapped offset.
    pub in_use: usize,
    /// Pages available to new mappings (committed or not).
    pub free: usize,
    /// Times a free page was handed out instead of committing a new one.
    pub recycled: usize,
}

impl PhysicalPagePool {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        device: DeviceId,
        page_size: usize,
        capacity: usize,
    ) -> Self {
        log::info!(
            "physical page pool: {device}, budget {capacity} pages x {}KiB",
            page_size / 1024
        );
        Self {
            device,
            page_size,
            capacity,
            free_pages: SegQueue::new(),
            committed: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
            driver,
        }
    }

    /// Hand out one page, recycling a free one before asking the driver.
    pub fn acquire(&self) -> Result<PageHandle> {
        if let Some(page) = self.free_pages.pop() {
            self.recycled.fetch_add(1, Ordering::Relaxed);
            self.in_use.fetch_add(1, Ordering::Relaxed);
            return Ok(page);
        }
        if self.committed.load(Ordering::Relaxed) >= self.capacity {
            return Err(EmmError::ResourceExhausted {
                needed: 1,
                available: 0,
            });
        }
        let page = self.driver.create_physical_page(self.device, self.page_size)?;
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "{}: committed page {}/{} from driver",
            self.device,
            self.committed.load(Ordering::Relaxed),
            self.capacity
        );
        Ok(page)
    }

    /// Return a page for reuse by any reservation on this device.
    pub fn release(&self, page: PageHandle) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.free_pages.push(page);
    }

    /// Pages available to new mappings; uncommitted budget counts as free.
    pub fn free_count(&self) -> usize {
        self.capacity - self.in_use.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn stats(&self) -> PoolStats {
        let in_use = self.in_use.load(Ordering::Relaxed);
        PoolStats {
            capacity: self.capacity,
            committed: self.committed.load(Ordering::Relaxed),
            in_use,
            free: self.capacity - in_use,
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }

    /// Release every committed free page back to the driver. In-use pages
    /// must have been released first; reservation teardown does that.
    pub fn drain(&self) -> Result<()> {
        let mut released = 0;
        while let Some(page) = self.free_pages.pop() {
            self.driver.release_physical_page(page)?;
            self.committed.fetch_sub(1, Ordering::Relaxed);
            released += 1;
        }
        if released > 0 {
            log::debug!("{}: drained {released} pages back to the driver", self.device);
        }
        Ok(())
    }
}
