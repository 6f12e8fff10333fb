// src/allocator.rs - tensor-backing allocator facade and process lifecycle
use crate::driver::{DeviceDriver, DeviceId, HostDriver};
use crate::error::{EmmError, Result};
use crate::pool::{PhysicalPagePool, PoolStats};
use crate::reserve::KvReservation;
use crate::tensor::{DType, KvTensorView};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default physical page budget per device.
pub const DEFAULT_POOL_PAGES: usize = 1024;

/// Allocator configuration, validated at `init_emm`.
#[derive(Debug, Clone)]
pub struct EmmConfig {
    /// Device strings the allocator manages, e.g. `"cuda:0"`.
    pub devices: Vec<String>,
    /// Physical page budget per device; the pool never commits more.
    pub pool_pages: usize,
    /// Optional block granularity override; must be a positive multiple of
    /// the driver's allocation granularity.
    pub granularity: Option<usize>,
}

impl Default for EmmConfig {
    fn default() -> Self {
        Self {
            devices: vec!["cuda:0".to_string()],
            pool_pages: DEFAULT_POOL_PAGES,
            granularity: None,
        }
    }
}

impl EmmConfig {
    fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(EmmError::InvalidArgument("no devices configured".into()));
        }
        if self.pool_pages == 0 {
            return Err(EmmError::InvalidArgument(
                "pool_pages must be positive".into(),
            ));
        }
        if self.granularity == Some(0) {
            return Err(EmmError::InvalidArgument(
                "granularity must be positive".into(),
            ));
        }
        Ok(())
    }
}

struct DeviceState {
    id: DeviceId,
    granularity: usize,
    pool: Arc<PhysicalPagePool>,
}

/// Process-wide tensor-backing allocator.
///
/// Holds one virtual reservation per created KV tensor set and one physical
/// page pool per device, shared by every reservation on that device. All
/// four core operations mutate shared accounting and run under one lock at
/// the global surface; the struct itself is plain `&mut self` so tests can
/// construct isolated instances with an injected driver.
pub struct TensorAllocator {
    driver: Arc<dyn DeviceDriver>,
    devices: HashMap<String, DeviceState>,
    reservations: Vec<KvReservation>,
}

impl TensorAllocator {
    pub fn new(config: EmmConfig, driver: Arc<dyn DeviceDriver>) -> Result<Self> {
        config.validate()?;
        let mut devices = HashMap::new();
        for name in &config.devices {
            let id = DeviceId::parse(name).ok_or_else(|| {
                EmmError::InvalidArgument(format!("malformed device string {name:?}"))
            })?;
            if id.0 >= driver.device_count() {
                return Err(EmmError::InvalidArgument(format!(
                    "device {name:?} is not visible (driver reports {} devices)",
                    driver.device_count()
                )));
            }
            // two spellings of one ordinal would split the device budget
            // across two pools
            if devices.values().any(|s: &DeviceState| s.id == id) {
                return Err(EmmError::InvalidArgument(format!(
                    "device {name:?} duplicates an already configured ordinal ({id})"
                )));
            }
            let driver_granularity = driver.allocation_granularity(id)?;
            let granularity = match config.granularity {
                None => driver_granularity,
                Some(g) if g % driver_granularity == 0 => g,
                Some(g) => {
                    return Err(EmmError::InvalidArgument(format!(
                        "granularity {g} is not a multiple of the device allocation granularity {driver_granularity}"
                    )))
                }
            };
            let pool = Arc::new(PhysicalPagePool::new(
                Arc::clone(&driver),
                id,
                granularity,
                config.pool_pages,
            ));
            devices.insert(
                name.clone(),
                DeviceState {
                    id,
                    granularity,
                    pool,
                },
            );
        }
        log::info!(
            "allocator initialized: {} device(s), {} pages per pool",
            devices.len(),
            config.pool_pages
        );
        Ok(Self {
            driver,
            devices,
            reservations: Vec::new(),
        })
    }

    /// Convenience constructor over the host driver, for tests and CPU-only
    /// environments.
    pub fn with_host_driver(config: EmmConfig) -> Result<Self> {
        let driver = Arc::new(host_driver_for(&config));
        Self::new(config, driver)
    }

    /// Reserve virtual space for one KV tensor set on `device` and return
    /// its `2 * num_layers` views. No physical memory is committed.
    pub fn create_kv_tensors(
        &mut self,
        size: usize,
        dtype_size: usize,
        device: &str,
        num_layers: usize,
    ) -> Result<Vec<KvTensorView>> {
        if size == 0 {
            return Err(EmmError::InvalidArgument("size must be positive".into()));
        }
        if num_layers == 0 {
            return Err(EmmError::InvalidArgument(
                "num_layers must be positive".into(),
            ));
        }
        let dtype = DType::from_byte_width(dtype_size)?;
        let state = self.devices.get(device).ok_or_else(|| {
            EmmError::InvalidArgument(format!("unknown device {device:?}"))
        })?;
        let reservation = KvReservation::new(
            self.driver.as_ref(),
            state.id,
            size,
            dtype,
            num_layers,
            state.granularity,
        )?;
        let views = reservation.tensor_views();
        self.reservations.push(reservation);
        Ok(views)
    }

    fn active_parts(&mut self) -> Result<(&mut KvReservation, Arc<PhysicalPagePool>)> {
        let idx = match self.reservations.len() {
            0 => {
                return Err(EmmError::InvalidArgument(
                    "no active KV tensor set; call create_kv_tensors first".into(),
                ))
            }
            n => n - 1,
        };
        let device = self.reservations[idx].device();
        let pool = self
            .devices
            .values()
            .find(|s| s.id == device)
            .map(|s| Arc::clone(&s.pool))
            .ok_or_else(|| {
                EmmError::InvalidArgument(format!("device {device} is no longer configured"))
            })?;
        Ok((&mut self.reservations[idx], pool))
    }

    /// Map block offsets of the most-recently-created tensor set,
    /// all-or-nothing.
    pub fn map_to_kv_tensors(&mut self, offsets: &[u64]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let driver = Arc::clone(&self.driver);
        let (reservation, pool) = self.active_parts()?;
        reservation.map_blocks(offsets, pool.as_ref(), driver.as_ref())
    }

    /// Unmap block offsets of the most-recently-created tensor set,
    /// all-or-nothing. Released pages are available to any reservation on
    /// the same device.
    pub fn unmap_from_kv_tensors(&mut self, offsets: &[u64]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let driver = Arc::clone(&self.driver);
        let (reservation, pool) = self.active_parts()?;
        reservation.unmap_blocks(offsets, pool.as_ref(), driver.as_ref())
    }

    /// Tear down every tracked tensor set: unmap all resident blocks and
    /// release the virtual ranges. Calling with nothing tracked is a no-op.
    pub fn free_kv_tensors(&mut self) -> Result<()> {
        if self.reservations.is_empty() {
            log::debug!("free_kv_tensors: nothing to free");
            return Ok(());
        }
        let mut first_err = None;
        for reservation in self.reservations.drain(..) {
            let device = reservation.device();
            let pool = self
                .devices
                .values()
                .find(|s| s.id == device)
                .map(|s| Arc::clone(&s.pool));
            let result = match pool {
                Some(pool) => reservation.release(pool.as_ref(), self.driver.as_ref()),
                None => Err(EmmError::InvalidArgument(format!(
                    "device {device} is no longer configured"
                ))),
            };
            if let Err(e) = result {
                log::error!("reservation teardown failed: {e}");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn pool_stats(&self, device: &str) -> Result<PoolStats> {
        self.devices
            .get(device)
            .map(|s| s.pool.stats())
            .ok_or_else(|| EmmError::InvalidArgument(format!("unknown device {device:?}")))
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Free all reservations and drain the pools back to the driver.
    pub fn shutdown(&mut self) -> Result<()> {
        self.free_kv_tensors()?;
        for state in self.devices.values() {
            state.pool.drain()?;
        }
        log::info!("allocator shut down");
        Ok(())
    }
}

fn host_driver_for(config: &EmmConfig) -> HostDriver {
    let device_count = config
        .devices
        .iter()
        .filter_map(|name| DeviceId::parse(name))
        .map(|d| d.0 + 1)
        .max()
        .unwrap_or(1);
    match config.granularity {
        Some(g) if g > 0 => HostDriver::with_granularity(device_count, g),
        _ => HostDriver::new(device_count),
    }
}

#[cfg(feature = "cuda")]
fn default_driver(_config: &EmmConfig) -> Result<Arc<dyn DeviceDriver>> {
    Ok(Arc::new(crate::driver::CudaDriver::new()?))
}

#[cfg(not(feature = "cuda"))]
fn default_driver(config: &EmmConfig) -> Result<Arc<dyn DeviceDriver>> {
    Ok(Arc::new(host_driver_for(config)))
}

lazy_static! {
    static ref GLOBAL_ALLOCATOR: Mutex<Option<TensorAllocator>> = Mutex::new(None);
}

fn global_lock() -> MutexGuard<'static, Option<TensorAllocator>> {
    match GLOBAL_ALLOCATOR.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn with_allocator<T>(f: impl FnOnce(&mut TensorAllocator) -> Result<T>) -> Result<T> {
    let mut guard = global_lock();
    match guard.as_mut() {
        Some(allocator) => f(allocator),
        None => Err(EmmError::NotInitialized),
    }
}

/// Initialize the process-wide allocator. A second call while already
/// initialized is a no-op, so engine integration code can call this
/// unconditionally.
pub fn init_emm(config: EmmConfig) -> Result<()> {
    let mut guard = global_lock();
    if guard.is_some() {
        log::debug!("init_emm: already initialized, ignoring");
        return Ok(());
    }
    let driver = default_driver(&config)?;
    *guard = Some(TensorAllocator::new(config, driver)?);
    Ok(())
}

/// Tear down the process-wide allocator: frees all reservations and returns
/// every physical page to the driver. Safe to call repeatedly; also serves
/// as the reset between tests.
pub fn shutdown_emm() {
    let mut guard = global_lock();
    if let Some(mut allocator) = guard.take() {
        if let Err(e) = allocator.shutdown() {
            log::error!("shutdown_emm: {e}");
        }
    }
}

/// Whether the process-wide allocator is currently initialized.
pub fn is_initialized() -> bool {
    global_lock().is_some()
}

/// Reserve virtual space for one KV tensor set; see
/// [`TensorAllocator::create_kv_tensors`].
pub fn create_kv_tensors(
    size: usize,
    dtype_size: usize,
    device: &str,
    num_layers: usize,
) -> Result<Vec<KvTensorView>> {
    with_allocator(|a| a.create_kv_tensors(size, dtype_size, device, num_layers))
}

/// Map block offsets into the active tensor set, all-or-nothing.
pub fn map_to_kv_tensors(offsets: &[u64]) -> Result<()> {
    with_allocator(|a| a.map_to_kv_tensors(offsets))
}

/// Unmap block offsets from the active tensor set, all-or-nothing.
pub fn unmap_from_kv_tensors(offsets: &[u64]) -> Result<()> {
    with_allocator(|a| a.unmap_from_kv_tensors(offsets))
}

/// Free every tracked tensor set.
pub fn free_kv_tensors() -> Result<()> {
    with_allocator(|a| a.free_kv_tensors())
}

/// Free page count of one device's pool.
pub fn pool_free_pages(device: &str) -> Result<usize> {
    with_allocator(|a| Ok(a.pool_stats(device)?.free))
}
