// src/ffi.rs - C ABI and optional Python bindings over the global allocator
use crate::allocator::{self, EmmConfig, DEFAULT_POOL_PAGES};
use crate::error::EmmError;
use std::ffi::CStr;
use std::os::raw::c_char;

pub const EMM_SUCCESS: i32 = 0;
pub const EMM_ERROR_NOT_INITIALIZED: i32 = -1;
pub const EMM_ERROR_INVALID_PARAM: i32 = -2;
pub const EMM_ERROR_EXHAUSTED: i32 = -3;
pub const EMM_ERROR_DRIVER: i32 = -4;
pub const EMM_ERROR_ALREADY_MAPPED: i32 = -5;
pub const EMM_ERROR_NOT_MAPPED: i32 = -6;
pub const EMM_ERROR_RESERVATION: i32 = -7;

fn error_code(err: &EmmError) -> i32 {
    match err {
        EmmError::NotInitialized => EMM_ERROR_NOT_INITIALIZED,
        EmmError::InvalidArgument(_) => EMM_ERROR_INVALID_PARAM,
        EmmError::AlreadyMapped(_) => EMM_ERROR_ALREADY_MAPPED,
        EmmError::NotMapped(_) => EMM_ERROR_NOT_MAPPED,
        EmmError::ResourceExhausted { .. } => EMM_ERROR_EXHAUSTED,
        EmmError::DeviceReservationFailed(_) => EMM_ERROR_RESERVATION,
        EmmError::Driver(_) => EMM_ERROR_DRIVER,
    }
}

/// C-compatible tensor view descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CKvTensorView {
    pub addr: u64,
    pub len: usize,
    pub dtype_size: u32,
    pub layer: u32,
    pub is_value: u32,
}

unsafe fn cstr_arg(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(str::to_owned)
}

/// Initialize the process-wide allocator for one device.
///
/// `pool_pages == 0` and `granularity == 0` select the defaults. A null
/// `device` selects `"cuda:0"`. Calling again while initialized succeeds
/// without changing the configuration.
#[no_mangle]
pub unsafe extern "C" fn emm_init(
    device: *const c_char,
    pool_pages: usize,
    granularity: usize,
) -> i32 {
    let mut config = EmmConfig::default();
    if let Some(device) = cstr_arg(device) {
        config.devices = vec![device];
    }
    if pool_pages > 0 {
        config.pool_pages = pool_pages;
    } else {
        config.pool_pages = DEFAULT_POOL_PAGES;
    }
    config.granularity = (granularity > 0).then_some(granularity);
    match allocator::init_emm(config) {
        Ok(()) => EMM_SUCCESS,
        Err(e) => {
            log::error!("emm_init failed: {e}");
            error_code(&e)
        }
    }
}

/// Tear down the allocator. Safe to call repeatedly.
#[no_mangle]
pub extern "C" fn emm_shutdown() {
    allocator::shutdown_emm();
}

#[no_mangle]
pub extern "C" fn emm_is_initialized() -> bool {
    allocator::is_initialized()
}

/// Reserve a KV tensor set and write up to `views_cap` view descriptors to
/// `views_out`. The full count (`2 * num_layers`) is stored in `count_out`
/// even when it exceeds the capacity, so callers can size a second call.
#[no_mangle]
pub unsafe extern "C" fn emm_create_kv_tensors(
    size: usize,
    dtype_size: usize,
    device: *const c_char,
    num_layers: usize,
    views_out: *mut CKvTensorView,
    views_cap: usize,
    count_out: *mut usize,
) -> i32 {
    let device = match cstr_arg(device) {
        Some(device) => device,
        None => return EMM_ERROR_INVALID_PARAM,
    };
    if count_out.is_null() {
        return EMM_ERROR_INVALID_PARAM;
    }
    match allocator::create_kv_tensors(size, dtype_size, &device, num_layers) {
        Ok(views) => {
            *count_out = views.len();
            if !views_out.is_null() {
                for (i, view) in views.iter().take(views_cap).enumerate() {
                    *views_out.add(i) = CKvTensorView {
                        addr: view.addr,
                        len: view.len,
                        dtype_size: view.dtype.byte_width() as u32,
                        layer: view.layer as u32,
                        is_value: matches!(view.kind, crate::tensor::KvKind::Value) as u32,
                    };
                }
            }
            EMM_SUCCESS
        }
        Err(e) => {
            log::error!("emm_create_kv_tensors failed: {e}");
            error_code(&e)
        }
    }
}

/// Map `count` block offsets into the active tensor set. Returns true on
/// success; on failure nothing was mapped.
#[no_mangle]
pub unsafe extern "C" fn emm_map_to_kv_tensors(offsets: *const u64, count: usize) -> bool {
    if count == 0 {
        return true;
    }
    if offsets.is_null() {
        return false;
    }
    let offsets = std::slice::from_raw_parts(offsets, count);
    match allocator::map_to_kv_tensors(offsets) {
        Ok(()) => true,
        Err(e) => {
            log::error!("emm_map_to_kv_tensors failed: {e}");
            false
        }
    }
}

/// Unmap `count` block offsets from the active tensor set. Returns true on
/// success; on failure every offset stays mapped.
#[no_mangle]
pub unsafe extern "C" fn emm_unmap_from_kv_tensors(offsets: *const u64, count: usize) -> bool {
    if count == 0 {
        return true;
    }
    if offsets.is_null() {
        return false;
    }
    let offsets = std::slice::from_raw_parts(offsets, count);
    match allocator::unmap_from_kv_tensors(offsets) {
        Ok(()) => true,
        Err(e) => {
            log::error!("emm_unmap_from_kv_tensors failed: {e}");
            false
        }
    }
}

/// Free every tracked tensor set.
#[no_mangle]
pub extern "C" fn emm_free_kv_tensors() -> i32 {
    match allocator::free_kv_tensors() {
        Ok(()) => EMM_SUCCESS,
        Err(e) => {
            log::error!("emm_free_kv_tensors failed: {e}");
            error_code(&e)
        }
    }
}

/// Store the device pool's free page count in `free_out`.
#[no_mangle]
pub unsafe extern "C" fn emm_pool_free_pages(device: *const c_char, free_out: *mut usize) -> i32 {
    let device = match cstr_arg(device) {
        Some(device) => device,
        None => return EMM_ERROR_INVALID_PARAM,
    };
    if free_out.is_null() {
        return EMM_ERROR_INVALID_PARAM;
    }
    match allocator::pool_free_pages(&device) {
        Ok(free) => {
            *free_out = free;
            EMM_SUCCESS
        }
        Err(e) => error_code(&e),
    }
}

#[cfg(feature = "python")]
mod python {
    use super::*;
    use crate::tensor::KvKind;
    use pyo3::exceptions::{PyMemoryError, PyRuntimeError, PyValueError};
    use pyo3::prelude::*;

    fn to_py_err(err: EmmError) -> PyErr {
        match &err {
            EmmError::InvalidArgument(_) => PyValueError::new_err(err.to_string()),
            EmmError::ResourceExhausted { .. } => PyMemoryError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }

    #[pyfunction]
    #[pyo3(signature = (device = "cuda:0", pool_pages = DEFAULT_POOL_PAGES, granularity = None))]
    fn init_emm(device: &str, pool_pages: usize, granularity: Option<usize>) -> PyResult<()> {
        let config = EmmConfig {
            devices: vec![device.to_string()],
            pool_pages,
            granularity,
        };
        allocator::init_emm(config).map_err(to_py_err)
    }

    #[pyfunction]
    fn shutdown_emm() {
        allocator::shutdown_emm();
    }

    /// Returns one `(addr, len, dtype_size, layer, is_value)` tuple per
    /// sub-tensor, in layer-major K-then-V order.
    #[pyfunction]
    fn create_kv_tensors(
        size: usize,
        dtype_size: usize,
        device: &str,
        num_layers: usize,
    ) -> PyResult<Vec<(u64, usize, usize, usize, bool)>> {
        let views = allocator::create_kv_tensors(size, dtype_size, device, num_layers)
            .map_err(to_py_err)?;
        Ok(views
            .into_iter()
            .map(|v| {
                (
                    v.addr,
                    v.len,
                    v.dtype.byte_width(),
                    v.layer,
                    matches!(v.kind, KvKind::Value),
                )
            })
            .collect())
    }

    #[pyfunction]
    fn map_to_kv_tensors(offsets: Vec<u64>) -> bool {
        allocator::map_to_kv_tensors(&offsets).is_ok()
    }

    #[pyfunction]
    fn unmap_from_kv_tensors(offsets: Vec<u64>) -> bool {
        allocator::unmap_from_kv_tensors(&offsets).is_ok()
    }

    #[pyfunction]
    fn free_kv_tensors() -> PyResult<()> {
        allocator::free_kv_tensors().map_err(to_py_err)
    }

    #[pyfunction]
    fn pool_free_pages(device: &str) -> PyResult<usize> {
        allocator::pool_free_pages(device).map_err(to_py_err)
    }

    #[pymodule]
    fn vmm_kv_cache(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(init_emm, m)?)?;
        m.add_function(wrap_pyfunction!(shutdown_emm, m)?)?;
        m.add_function(wrap_pyfunction!(create_kv_tensors, m)?)?;
        m.add_function(wrap_pyfunction!(map_to_kv_tensors, m)?)?;
        m.add_function(wrap_pyfunction!(unmap_from_kv_tensors, m)?)?;
        m.add_function(wrap_pyfunction!(free_kv_tensors, m)?)?;
        m.add_function(wrap_pyfunction!(pool_free_pages, m)?)?;
        Ok(())
    }
}
