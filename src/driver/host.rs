// src/driver/host.rs - host-heap simulation of the device VMM API
use super::{DeviceDriver, DeviceId, DriverError, PageHandle, VirtualRange};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Matches the pointer alignment device runtimes hand out.
const HOST_ALIGNMENT: usize = 64;

/// Default commit granularity, same as the CUDA VMM minimum on most parts.
pub const DEFAULT_HOST_GRANULARITY: usize = 2 * 1024 * 1024;

struct HostRange {
    layout: Layout,
    // byte offset -> page id currently installed there
    mapped: HashMap<usize, u64>,
}

struct HostPage {
    len: usize,
    mapped_at: Option<(u64, usize)>,
}

/// Simulates the device virtual-memory API on the host heap.
///
/// Address ranges are real heap allocations, so the view addresses handed to
/// callers are dereferenceable in tests; physical pages are bookkeeping
/// entries. The driver rejects the same preconditions a VMM driver would:
/// misaligned offsets, double maps, unmapping an unbacked offset, releasing
/// a range that still has mappings.
pub struct HostDriver {
    device_count: u32,
    granularity: usize,
    ranges: Mutex<HashMap<u64, HostRange>>,
    pages: Mutex<HashMap<u64, HostPage>>,
    next_page: AtomicU64,
    // countdowns until one injected map/unmap failure; negative disables them
    map_failures_after: AtomicI64,
    unmap_failures_after: AtomicI64,
}

impl HostDriver {
    pub fn new(device_count: u32) -> Self {
        Self::with_granularity(device_count, DEFAULT_HOST_GRANULARITY)
    }

    pub fn with_granularity(device_count: u32, granularity: usize) -> Self {
        assert!(granularity > 0, "granularity must be positive");
        Self {
            device_count,
            granularity,
            ranges: Mutex::new(HashMap::new()),
            pages: Mutex::new(HashMap::new()),
            next_page: AtomicU64::new(1),
            map_failures_after: AtomicI64::new(-1),
            unmap_failures_after: AtomicI64::new(-1),
        }
    }

    /// Test hook: let the next `n` map calls succeed, then fail exactly one.
    pub fn fail_map_after(&self, n: usize) {
        self.map_failures_after.store(n as i64, Ordering::SeqCst);
    }

    /// Test hook: let the next `n` unmap calls succeed, then fail exactly one.
    pub fn fail_unmap_after(&self, n: usize) {
        self.unmap_failures_after.store(n as i64, Ordering::SeqCst);
    }

    fn check_device(&self, device: DeviceId) -> Result<(), DriverError> {
        if device.0 >= self.device_count {
            return Err(DriverError::InvalidDevice(device.0));
        }
        Ok(())
    }

    fn lock_ranges(&self) -> std::sync::MutexGuard<'_, HashMap<u64, HostRange>> {
        match self.ranges.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_pages(&self) -> std::sync::MutexGuard<'_, HashMap<u64, HostPage>> {
        match self.pages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DeviceDriver for HostDriver {
    fn device_count(&self) -> u32 {
        self.device_count
    }

    fn allocation_granularity(&self, device: DeviceId) -> Result<usize, DriverError> {
        self.check_device(device)?;
        Ok(self.granularity)
    }

    fn reserve_address_range(
        &self,
        device: DeviceId,
        len: usize,
    ) -> Result<VirtualRange, DriverError> {
        self.check_device(device)?;
        if len == 0 || len % self.granularity != 0 {
            return Err(DriverError::ReservationFailed(format!(
                "length {len} is not a positive multiple of granularity {}",
                self.granularity
            )));
        }
        let layout = Layout::from_size_align(len, HOST_ALIGNMENT)
            .map_err(|e| DriverError::ReservationFailed(e.to_string()))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DriverError::OutOfMemory);
        }
        let base = ptr as u64;
        self.lock_ranges().insert(
            base,
            HostRange {
                layout,
                mapped: HashMap::new(),
            },
        );
        log::trace!("host driver: reserved {len}B at {base:#x} on {device}");
        Ok(VirtualRange { base, len, device })
    }

    fn release_address_range(&self, range: &VirtualRange) -> Result<(), DriverError> {
        let mut ranges = self.lock_ranges();
        let entry = ranges
            .get(&range.base)
            .ok_or_else(|| DriverError::Internal(format!("unknown range {:#x}", range.base)))?;
        if !entry.mapped.is_empty() {
            return Err(DriverError::Internal(format!(
                "range {:#x} still has {} mapped offsets",
                range.base,
                entry.mapped.len()
            )));
        }
        let entry = ranges.remove(&range.base).ok_or_else(|| {
            DriverError::Internal(format!("unknown range {:#x}", range.base))
        })?;
        unsafe { dealloc(range.base as *mut u8, entry.layout) };
        log::trace!("host driver: released range {:#x}", range.base);
        Ok(())
    }

    fn create_physical_page(
        &self,
        device: DeviceId,
        len: usize,
    ) -> Result<PageHandle, DriverError> {
        self.check_device(device)?;
        if len == 0 {
            return Err(DriverError::Internal("zero-sized page".into()));
        }
        let id = self.next_page.fetch_add(1, Ordering::Relaxed);
        self.lock_pages().insert(
            id,
            HostPage {
                len,
                mapped_at: None,
            },
        );
        Ok(PageHandle(id))
    }

    fn release_physical_page(&self, page: PageHandle) -> Result<(), DriverError> {
        let mut pages = self.lock_pages();
        match pages.get(&page.0) {
            None => Err(DriverError::Internal(format!("unknown page {}", page.0))),
            Some(entry) if entry.mapped_at.is_some() => Err(DriverError::Internal(format!(
                "page {} is still mapped",
                page.0
            ))),
            Some(_) => {
                pages.remove(&page.0);
                Ok(())
            }
        }
    }

    fn map_page(
        &self,
        range: &VirtualRange,
        byte_offset: usize,
        page: PageHandle,
    ) -> Result<(), DriverError> {
        let mut ranges = self.lock_ranges();
        let mut pages = self.lock_pages();
        let range_entry = ranges
            .get_mut(&range.base)
            .ok_or_else(|| DriverError::Internal(format!("unknown range {:#x}", range.base)))?;
        let page_entry = pages
            .get_mut(&page.0)
            .ok_or_else(|| DriverError::Internal(format!("unknown page {}", page.0)))?;
        if byte_offset % self.granularity != 0 {
            return Err(DriverError::MapFailed(format!(
                "offset {byte_offset} is not aligned to granularity {}",
                self.granularity
            )));
        }
        if byte_offset + page_entry.len > range.len {
            return Err(DriverError::MapFailed(format!(
                "offset {byte_offset} + page length {} exceeds range length {}",
                page_entry.len, range.len
            )));
        }
        if range_entry.mapped.contains_key(&byte_offset) {
            return Err(DriverError::MapFailed(format!(
                "offset {byte_offset} is already backed"
            )));
        }
        if page_entry.mapped_at.is_some() {
            return Err(DriverError::MapFailed(format!(
                "page {} is already mapped elsewhere",
                page.0
            )));
        }

        let remaining = self.map_failures_after.load(Ordering::SeqCst);
        if remaining >= 0 {
            if remaining == 0 {
                self.map_failures_after.store(-1, Ordering::SeqCst);
                return Err(DriverError::MapFailed("injected map failure".into()));
            }
            self.map_failures_after.store(remaining - 1, Ordering::SeqCst);
        }

        range_entry.mapped.insert(byte_offset, page.0);
        page_entry.mapped_at = Some((range.base, byte_offset));
        Ok(())
    }

    fn unmap_page(
        &self,
        range: &VirtualRange,
        byte_offset: usize,
        len: usize,
    ) -> Result<(), DriverError> {
        let mut ranges = self.lock_ranges();
        let mut pages = self.lock_pages();
        let range_entry = ranges
            .get_mut(&range.base)
            .ok_or_else(|| DriverError::Internal(format!("unknown range {:#x}", range.base)))?;
        let page_id = range_entry.mapped.get(&byte_offset).copied().ok_or_else(|| {
            DriverError::MapFailed(format!("offset {byte_offset} is not mapped"))
        })?;
        let page_entry = pages
            .get_mut(&page_id)
            .ok_or_else(|| DriverError::Internal(format!("unknown page {page_id}")))?;
        if page_entry.len != len {
            return Err(DriverError::MapFailed(format!(
                "unmap length {len} does not match page length {}",
                page_entry.len
            )));
        }

        let remaining = self.unmap_failures_after.load(Ordering::SeqCst);
        if remaining >= 0 {
            if remaining == 0 {
                self.unmap_failures_after.store(-1, Ordering::SeqCst);
                return Err(DriverError::MapFailed("injected unmap failure".into()));
            }
            self.unmap_failures_after.store(remaining - 1, Ordering::SeqCst);
        }

        range_entry.mapped.remove(&byte_offset);
        page_entry.mapped_at = None;
        Ok(())
    }
}

impl Drop for HostDriver {
    fn drop(&mut self) {
        // reclaim any range the allocator did not release
        let mut ranges = self.lock_ranges();
        for (base, entry) in ranges.drain() {
            unsafe { dealloc(base as *mut u8, entry.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAN: usize = 4096;

    fn driver() -> HostDriver {
        HostDriver::with_granularity(1, GRAN)
    }

    #[test]
    fn test_reserve_and_release() {
        let d = driver();
        let range = d.reserve_address_range(DeviceId(0), 4 * GRAN).unwrap();
        assert_eq!(range.len, 4 * GRAN);
        assert!(range.base != 0);
        d.release_address_range(&range).unwrap();
    }

    #[test]
    fn test_reserve_rejects_unaligned_length() {
        let d = driver();
        assert!(d.reserve_address_range(DeviceId(0), GRAN + 1).is_err());
        assert!(d.reserve_address_range(DeviceId(0), 0).is_err());
    }

    #[test]
    fn test_map_rejects_double_map_and_misalignment() {
        let d = driver();
        let range = d.reserve_address_range(DeviceId(0), 2 * GRAN).unwrap();
        let page = d.create_physical_page(DeviceId(0), GRAN).unwrap();
        let other = d.create_physical_page(DeviceId(0), GRAN).unwrap();

        assert!(d.map_page(&range, 1, page).is_err()); // misaligned
        d.map_page(&range, 0, page).unwrap();
        assert!(d.map_page(&range, 0, other).is_err()); // offset taken
        assert!(d.map_page(&range, GRAN, page).is_err()); // page already mapped

        // a mapped range cannot be released
        assert!(d.release_address_range(&range).is_err());

        d.unmap_page(&range, 0, GRAN).unwrap();
        assert!(d.unmap_page(&range, 0, GRAN).is_err()); // not mapped anymore
        d.release_address_range(&range).unwrap();
    }

    #[test]
    fn test_release_mapped_page_fails() {
        let d = driver();
        let range = d.reserve_address_range(DeviceId(0), GRAN).unwrap();
        let page = d.create_physical_page(DeviceId(0), GRAN).unwrap();
        d.map_page(&range, 0, page).unwrap();
        assert!(d.release_physical_page(page).is_err());
        d.unmap_page(&range, 0, GRAN).unwrap();
        d.release_physical_page(page).unwrap();
        d.release_address_range(&range).unwrap();
    }

    #[test]
    fn test_injected_map_failure_is_one_shot() {
        let d = driver();
        let range = d.reserve_address_range(DeviceId(0), 4 * GRAN).unwrap();
        let a = d.create_physical_page(DeviceId(0), GRAN).unwrap();
        let b = d.create_physical_page(DeviceId(0), GRAN).unwrap();

        d.fail_map_after(1);
        d.map_page(&range, 0, a).unwrap();
        assert!(d.map_page(&range, GRAN, b).is_err());
        // hook disarms after firing once
        d.map_page(&range, GRAN, b).unwrap();
    }

    #[test]
    fn test_injected_unmap_failure_is_one_shot() {
        let d = driver();
        let range = d.reserve_address_range(DeviceId(0), 4 * GRAN).unwrap();
        let a = d.create_physical_page(DeviceId(0), GRAN).unwrap();
        let b = d.create_physical_page(DeviceId(0), GRAN).unwrap();
        d.map_page(&range, 0, a).unwrap();
        d.map_page(&range, GRAN, b).unwrap();

        d.fail_unmap_after(1);
        d.unmap_page(&range, 0, GRAN).unwrap();
        assert!(d.unmap_page(&range, GRAN, GRAN).is_err());
        // the failed offset stays mapped and the hook disarms
        d.unmap_page(&range, GRAN, GRAN).unwrap();
    }

    #[test]
    fn test_invalid_device() {
        let d = driver();
        assert!(matches!(
            d.reserve_address_range(DeviceId(7), GRAN),
            Err(DriverError::InvalidDevice(7))
        ));
    }
}
