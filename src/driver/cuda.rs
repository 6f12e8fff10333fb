// src/driver/cuda.rs - CUDA virtual memory management backend
//
// Binds the driver API directly (cuMemAddressReserve / cuMemCreate /
// cuMemMap family); the runtime API has no equivalent of these calls.
use super::{DeviceDriver, DeviceId, DriverError, PageHandle, VirtualRange};
use std::collections::HashMap;
use std::os::raw::{c_char, c_int, c_uint, c_ulonglong, c_void};
use std::sync::Mutex;

type CUresult = c_int;
type CUdeviceptr = c_ulonglong;
type CUmemGenericAllocationHandle = c_ulonglong;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

const CU_MEM_ALLOCATION_TYPE_PINNED: c_int = 1;
const CU_MEM_LOCATION_TYPE_DEVICE: c_int = 1;
const CU_MEM_ALLOC_GRANULARITY_MINIMUM: c_uint = 0;
const CU_MEM_ACCESS_FLAGS_PROT_READWRITE: c_int = 3;

#[repr(C)]
#[derive(Clone, Copy)]
struct CUmemLocation {
    type_: c_int,
    id: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CUmemAllocationPropAllocFlags {
    compression_type: u8,
    gpu_direct_rdma_capable: u8,
    usage: u16,
    reserved: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CUmemAllocationProp {
    type_: c_int,
    requested_handle_types: c_int,
    location: CUmemLocation,
    win32_handle_meta_data: *mut c_void,
    alloc_flags: CUmemAllocationPropAllocFlags,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CUmemAccessDesc {
    location: CUmemLocation,
    flags: c_int,
}

#[link(name = "cuda")]
extern "C" {
    fn cuInit(flags: c_uint) -> CUresult;
    fn cuDeviceGetCount(count: *mut c_int) -> CUresult;
    fn cuGetErrorString(error: CUresult, str_out: *mut *const c_char) -> CUresult;
    fn cuMemGetAllocationGranularity(
        granularity: *mut usize,
        prop: *const CUmemAllocationProp,
        option: c_uint,
    ) -> CUresult;
    fn cuMemAddressReserve(
        ptr: *mut CUdeviceptr,
        size: usize,
        alignment: usize,
        addr: CUdeviceptr,
        flags: c_ulonglong,
    ) -> CUresult;
    fn cuMemAddressFree(ptr: CUdeviceptr, size: usize) -> CUresult;
    fn cuMemCreate(
        handle: *mut CUmemGenericAllocationHandle,
        size: usize,
        prop: *const CUmemAllocationProp,
        flags: c_ulonglong,
    ) -> CUresult;
    fn cuMemRelease(handle: CUmemGenericAllocationHandle) -> CUresult;
    fn cuMemMap(
        ptr: CUdeviceptr,
        size: usize,
        offset: usize,
        handle: CUmemGenericAllocationHandle,
        flags: c_ulonglong,
    ) -> CUresult;
    fn cuMemUnmap(ptr: CUdeviceptr, size: usize) -> CUresult;
    fn cuMemSetAccess(
        ptr: CUdeviceptr,
        size: usize,
        desc: *const CUmemAccessDesc,
        count: usize,
    ) -> CUresult;
}

fn cu_error_string(code: CUresult) -> String {
    let mut ptr: *const c_char = std::ptr::null();
    unsafe {
        if cuGetErrorString(code, &mut ptr) == CUDA_SUCCESS && !ptr.is_null() {
            return std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned();
        }
    }
    format!("CUresult {code}")
}

fn cu_check(code: CUresult, what: &str) -> Result<(), DriverError> {
    match code {
        CUDA_SUCCESS => Ok(()),
        CUDA_ERROR_OUT_OF_MEMORY => Err(DriverError::OutOfMemory),
        _ => Err(DriverError::Internal(format!(
            "{what}: {}",
            cu_error_string(code)
        ))),
    }
}

fn alloc_prop(device: DeviceId) -> CUmemAllocationProp {
    CUmemAllocationProp {
        type_: CU_MEM_ALLOCATION_TYPE_PINNED,
        requested_handle_types: 0,
        location: CUmemLocation {
            type_: CU_MEM_LOCATION_TYPE_DEVICE,
            id: device.0 as c_int,
        },
        win32_handle_meta_data: std::ptr::null_mut(),
        alloc_flags: CUmemAllocationPropAllocFlags {
            compression_type: 0,
            gpu_direct_rdma_capable: 0,
            usage: 0,
            reserved: [0; 4],
        },
    }
}

struct CudaPage {
    len: usize,
    device: DeviceId,
}

/// [`DeviceDriver`] backed by the CUDA VMM API.
pub struct CudaDriver {
    device_count: u32,
    pages: Mutex<HashMap<u64, CudaPage>>,
}

impl CudaDriver {
    pub fn new() -> Result<Self, DriverError> {
        unsafe {
            cu_check(cuInit(0), "cuInit")?;
            let mut count: c_int = 0;
            cu_check(cuDeviceGetCount(&mut count), "cuDeviceGetCount")?;
            log::info!("cuda driver: {count} device(s) visible");
            Ok(Self {
                device_count: count.max(0) as u32,
                pages: Mutex::new(HashMap::new()),
            })
        }
    }

    fn check_device(&self, device: DeviceId) -> Result<(), DriverError> {
        if device.0 >= self.device_count {
            return Err(DriverError::InvalidDevice(device.0));
        }
        Ok(())
    }

    fn lock_pages(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CudaPage>> {
        match self.pages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DeviceDriver for CudaDriver {
    fn device_count(&self) -> u32 {
        self.device_count
    }

    fn allocation_granularity(&self, device: DeviceId) -> Result<usize, DriverError> {
        self.check_device(device)?;
        let prop = alloc_prop(device);
        let mut granularity = 0usize;
        unsafe {
            cu_check(
                cuMemGetAllocationGranularity(
                    &mut granularity,
                    &prop,
                    CU_MEM_ALLOC_GRANULARITY_MINIMUM,
                ),
                "cuMemGetAllocationGranularity",
            )?;
        }
        Ok(granularity)
    }

    fn reserve_address_range(
        &self,
        device: DeviceId,
        len: usize,
    ) -> Result<VirtualRange, DriverError> {
        self.check_device(device)?;
        let mut ptr: CUdeviceptr = 0;
        unsafe {
            cu_check(
                cuMemAddressReserve(&mut ptr, len, 0, 0, 0),
                "cuMemAddressReserve",
            )
            .map_err(|e| DriverError::ReservationFailed(e.to_string()))?;
        }
        log::trace!("cuda driver: reserved {len}B at {ptr:#x} on {device}");
        Ok(VirtualRange {
            base: ptr,
            len,
            device,
        })
    }

    fn release_address_range(&self, range: &VirtualRange) -> Result<(), DriverError> {
        unsafe { cu_check(cuMemAddressFree(range.base, range.len), "cuMemAddressFree") }
    }

    fn create_physical_page(
        &self,
        device: DeviceId,
        len: usize,
    ) -> Result<PageHandle, DriverError> {
        self.check_device(device)?;
        let prop = alloc_prop(device);
        let mut handle: CUmemGenericAllocationHandle = 0;
        unsafe {
            cu_check(cuMemCreate(&mut handle, len, &prop, 0), "cuMemCreate")?;
        }
        self.lock_pages().insert(handle, CudaPage { len, device });
        Ok(PageHandle(handle))
    }

    fn release_physical_page(&self, page: PageHandle) -> Result<(), DriverError> {
        self.lock_pages().remove(&page.0);
        unsafe { cu_check(cuMemRelease(page.0), "cuMemRelease") }
    }

    fn map_page(
        &self,
        range: &VirtualRange,
        byte_offset: usize,
        page: PageHandle,
    ) -> Result<(), DriverError> {
        let (len, device) = {
            let pages = self.lock_pages();
            let entry = pages
                .get(&page.0)
                .ok_or_else(|| DriverError::Internal(format!("unknown page {}", page.0)))?;
            (entry.len, entry.device)
        };
        let ptr = range.base + byte_offset as CUdeviceptr;
        unsafe {
            cu_check(cuMemMap(ptr, len, 0, page.0, 0), "cuMemMap")
                .map_err(|e| DriverError::MapFailed(e.to_string()))?;
            let desc = CUmemAccessDesc {
                location: CUmemLocation {
                    type_: CU_MEM_LOCATION_TYPE_DEVICE,
                    id: device.0 as c_int,
                },
                flags: CU_MEM_ACCESS_FLAGS_PROT_READWRITE,
            };
            if let Err(e) = cu_check(cuMemSetAccess(ptr, len, &desc, 1), "cuMemSetAccess") {
                // leave no half-installed mapping behind
                let _ = cuMemUnmap(ptr, len);
                return Err(DriverError::MapFailed(e.to_string()));
            }
        }
        Ok(())
    }

    fn unmap_page(
        &self,
        range: &VirtualRange,
        byte_offset: usize,
        len: usize,
    ) -> Result<(), DriverError> {
        let ptr = range.base + byte_offset as CUdeviceptr;
        unsafe {
            cu_check(cuMemUnmap(ptr, len), "cuMemUnmap")
                .map_err(|e| DriverError::MapFailed(e.to_string()))
        }
    }
}
