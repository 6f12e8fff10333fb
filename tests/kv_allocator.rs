// Integration tests over the allocator facade and the process-wide surface.
use std::sync::Arc;
use vmm_kv_cache::driver::{DeviceDriver, HostDriver};
use vmm_kv_cache::{
    allocator, EmmConfig, EmmError, KvKind, TensorAllocator,
};

const MIB: usize = 1024 * 1024;
const GRAN: usize = 2 * MIB;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The process-wide allocator is one shared instance, so its whole lifecycle
/// runs as a single sequential test.
#[test]
fn test_global_lifecycle() {
    init_logging();

    // every call demands initialization first
    assert!(matches!(
        allocator::create_kv_tensors(4 * MIB, 2, "cuda:0", 2),
        Err(EmmError::NotInitialized)
    ));
    assert!(matches!(
        allocator::map_to_kv_tensors(&[0]),
        Err(EmmError::NotInitialized)
    ));
    assert!(!allocator::is_initialized());

    let config = EmmConfig {
        devices: vec!["cuda:0".to_string()],
        pool_pages: 1024,
        granularity: Some(GRAN),
    };
    allocator::init_emm(config.clone()).unwrap();
    assert!(allocator::is_initialized());

    // a second init while running is accepted and changes nothing
    allocator::init_emm(EmmConfig {
        pool_pages: 1,
        ..config.clone()
    })
    .unwrap();
    assert_eq!(allocator::pool_free_pages("cuda:0").unwrap(), 1024);

    // 2 layers -> 4 sub-tensors, 4MiB each -> 2 blocks per tensor
    let views = allocator::create_kv_tensors(4 * MIB, 2, "cuda:0", 2).unwrap();
    assert_eq!(views.len(), 4);
    assert_eq!((views[0].layer, views[0].kind), (0, KvKind::Key));
    assert_eq!((views[3].layer, views[3].kind), (1, KvKind::Value));
    for pair in views.windows(2) {
        assert_eq!(pair[1].addr, pair[0].addr + pair[0].len as u64);
    }
    // reservation alone commits nothing
    assert_eq!(allocator::pool_free_pages("cuda:0").unwrap(), 1024);

    // each offset backs all 4 sub-tensors
    allocator::map_to_kv_tensors(&[0, 1]).unwrap();
    assert_eq!(allocator::pool_free_pages("cuda:0").unwrap(), 1016);

    allocator::unmap_from_kv_tensors(&[0]).unwrap();
    assert_eq!(allocator::pool_free_pages("cuda:0").unwrap(), 1020);

    // already-released offsets are rejected without touching the rest
    assert!(matches!(
        allocator::unmap_from_kv_tensors(&[0]),
        Err(EmmError::NotMapped(0))
    ));
    assert!(matches!(
        allocator::map_to_kv_tensors(&[1]),
        Err(EmmError::AlreadyMapped(1))
    ));
    assert_eq!(allocator::pool_free_pages("cuda:0").unwrap(), 1020);

    allocator::free_kv_tensors().unwrap();
    assert_eq!(allocator::pool_free_pages("cuda:0").unwrap(), 1024);
    // freeing with nothing tracked stays a no-op
    allocator::free_kv_tensors().unwrap();

    allocator::shutdown_emm();
    allocator::shutdown_emm(); // idempotent
    assert!(!allocator::is_initialized());
    assert!(matches!(
        allocator::map_to_kv_tensors(&[0]),
        Err(EmmError::NotInitialized)
    ));

    // the process can initialize again after a shutdown
    allocator::init_emm(config).unwrap();
    allocator::create_kv_tensors(4 * MIB, 2, "cuda:0", 1).unwrap();
    allocator::map_to_kv_tensors(&[0]).unwrap();
    allocator::shutdown_emm();
}

fn host_allocator(pool_pages: usize) -> TensorAllocator {
    TensorAllocator::with_host_driver(EmmConfig {
        devices: vec!["cuda:0".to_string()],
        pool_pages,
        granularity: Some(GRAN),
    })
    .unwrap()
}

#[test]
fn test_map_batch_is_all_or_nothing_on_exhaustion() {
    init_logging();
    // budget covers one offset (2 pages), the batch needs two
    let mut a = host_allocator(3);
    a.create_kv_tensors(2 * GRAN, 2, "cuda:0", 1).unwrap();

    let err = a.map_to_kv_tensors(&[0, 1]).unwrap_err();
    assert!(matches!(
        err,
        EmmError::ResourceExhausted {
            needed: 4,
            available: 3
        }
    ));
    let stats = a.pool_stats("cuda:0").unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.free, 3);

    // a batch that fits still goes through afterwards
    a.map_to_kv_tensors(&[1]).unwrap();
    assert_eq!(a.pool_stats("cuda:0").unwrap().in_use, 2);
}

#[test]
fn test_map_batch_rolls_back_on_driver_failure() {
    init_logging();
    let driver = Arc::new(HostDriver::with_granularity(1, GRAN));
    let mut a = TensorAllocator::new(
        EmmConfig {
            devices: vec!["cuda:0".to_string()],
            pool_pages: 8,
            granularity: Some(GRAN),
        },
        Arc::clone(&driver) as Arc<dyn DeviceDriver>,
    )
    .unwrap();
    a.create_kv_tensors(2 * GRAN, 2, "cuda:0", 1).unwrap();

    // offset 0 installs fully, offset 1 fails on its first page
    driver.fail_map_after(2);
    assert!(matches!(
        a.map_to_kv_tensors(&[0, 1]),
        Err(EmmError::Driver(_))
    ));
    let stats = a.pool_stats("cuda:0").unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.free, 8);

    // the fault was one-shot, the same batch succeeds now
    a.map_to_kv_tensors(&[0, 1]).unwrap();
    assert_eq!(a.pool_stats("cuda:0").unwrap().in_use, 4);
}

#[test]
fn test_unmap_batch_rolls_back_on_driver_failure() {
    init_logging();
    let driver = Arc::new(HostDriver::with_granularity(1, GRAN));
    let mut a = TensorAllocator::new(
        EmmConfig {
            devices: vec!["cuda:0".to_string()],
            pool_pages: 8,
            granularity: Some(GRAN),
        },
        Arc::clone(&driver) as Arc<dyn DeviceDriver>,
    )
    .unwrap();
    a.create_kv_tensors(2 * GRAN, 2, "cuda:0", 1).unwrap();
    a.map_to_kv_tensors(&[0, 1]).unwrap();
    assert_eq!(a.pool_stats("cuda:0").unwrap().in_use, 4);

    // offset 0 detaches fully, offset 1 fails on its first page; the
    // detached prefix must be remapped before the error surfaces
    driver.fail_unmap_after(2);
    assert!(matches!(
        a.unmap_from_kv_tensors(&[0, 1]),
        Err(EmmError::Driver(_))
    ));
    let stats = a.pool_stats("cuda:0").unwrap();
    assert_eq!(stats.in_use, 4);
    assert_eq!(stats.free, 4);

    // the fault was one-shot, the same batch succeeds now
    a.unmap_from_kv_tensors(&[0, 1]).unwrap();
    let stats = a.pool_stats("cuda:0").unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.free, 8);
}

#[test]
fn test_engines_share_and_recycle_one_pool() {
    init_logging();
    let mut a = host_allocator(4);

    // engine A grows to the whole physical budget
    a.create_kv_tensors(2 * GRAN, 2, "cuda:0", 1).unwrap();
    a.map_to_kv_tensors(&[0, 1]).unwrap();
    assert_eq!(a.pool_stats("cuda:0").unwrap().free, 0);

    // engine B can reserve but not commit while A holds everything
    a.create_kv_tensors(2 * GRAN, 2, "cuda:0", 1).unwrap();
    assert!(matches!(
        a.map_to_kv_tensors(&[0]),
        Err(EmmError::ResourceExhausted { .. })
    ));

    // once A and B release, a new tensor set reuses the committed pages
    a.free_kv_tensors().unwrap();
    a.create_kv_tensors(2 * GRAN, 2, "cuda:0", 1).unwrap();
    a.map_to_kv_tensors(&[0, 1]).unwrap();
    let stats = a.pool_stats("cuda:0").unwrap();
    assert_eq!(stats.in_use, 4);
    assert!(stats.recycled >= 4);

    a.shutdown().unwrap();
    let stats = a.pool_stats("cuda:0").unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.committed, 0);
}

#[test]
fn test_argument_validation_surfaces_invalid_argument() {
    init_logging();
    let mut a = host_allocator(8);

    assert!(matches!(
        a.create_kv_tensors(0, 2, "cuda:0", 1),
        Err(EmmError::InvalidArgument(_))
    ));
    assert!(matches!(
        a.create_kv_tensors(GRAN, 2, "cuda:0", 0),
        Err(EmmError::InvalidArgument(_))
    ));
    assert!(matches!(
        a.create_kv_tensors(GRAN, 5, "cuda:0", 1),
        Err(EmmError::InvalidArgument(_))
    ));
    assert!(matches!(
        a.create_kv_tensors(GRAN, 2, "cuda:9", 1),
        Err(EmmError::InvalidArgument(_))
    ));
    assert!(matches!(
        a.map_to_kv_tensors(&[0]),
        Err(EmmError::InvalidArgument(_))
    ));

    a.create_kv_tensors(2 * GRAN, 2, "cuda:0", 1).unwrap();
    assert!(matches!(
        a.map_to_kv_tensors(&[0, 0]),
        Err(EmmError::InvalidArgument(_))
    ));
    assert!(matches!(
        a.map_to_kv_tensors(&[7]),
        Err(EmmError::InvalidArgument(_))
    ));
    assert_eq!(a.pool_stats("cuda:0").unwrap().in_use, 0);
}
