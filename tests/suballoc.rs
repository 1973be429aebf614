use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    ptr::NonNull,
    sync::Arc,
};

use parking_lot::Mutex;
use stratum::{
    AllocateInfo, AllocationCreateFlags, AllocationCreateInfo, AllocationError, Allocator,
    AllocatorCreateInfo, BufferInfo, BufferUsage, Device, DeviceError, FenceStatus, ImageInfo,
    MappingError, MemoryHeapProperties, MemoryRequirements, MemoryTypeProperties, MemoryUsage,
    OutOfMemoryError, PhysicalProperties, PoolCreateFlags, PoolCreateInfo, Properties, Tiling,
};

const MIB: u64 = 1024 * 1024;

#[derive(Default)]
struct Inner {
    next_memory: u64,
    live: HashMap<u64, u64>,
    freed: HashSet<u64>,
    mapped: HashMap<u64, Box<[u8]>>,
    next_resource: u64,
    buffers: HashMap<u64, BufferInfo>,
    images: HashMap<u64, ImageInfo>,
    bound: Vec<(u64, u64, u64)>,
}

#[derive(Default)]
struct MockDevice(Mutex<Inner>);

impl MockDevice {
    fn live_memory_count(&self) -> usize {
        self.0.lock().live.len()
    }

    fn bound_count(&self) -> usize {
        self.0.lock().bound.len()
    }
}

impl Device for MockDevice {
    type Memory = u64;
    type Buffer = u64;
    type Image = u64;
    type Fence = u64;

    unsafe fn allocate(&self, info: AllocateInfo<'_, Self>) -> Result<u64, AllocationError> {
        let mut inner = self.0.lock();
        let id = inner.next_memory;
        inner.next_memory = id + 1;
        inner.live.insert(id, info.size);
        Ok(id)
    }

    unsafe fn free(&self, memory: u64) {
        let mut inner = self.0.lock();
        assert!(inner.live.remove(&memory).is_some(), "freeing unknown memory");
        assert!(inner.freed.insert(memory), "double-free");
        assert!(
            !inner.mapped.contains_key(&memory),
            "freeing mapped memory"
        );
    }

    unsafe fn map(&self, memory: &u64) -> Result<NonNull<u8>, MappingError> {
        let mut inner = self.0.lock();
        let size = inner.live[memory] as usize;
        let backing = inner
            .mapped
            .entry(*memory)
            .or_insert_with(|| vec![0u8; size].into_boxed_slice());
        Ok(NonNull::new(backing.as_mut_ptr()).unwrap())
    }

    unsafe fn unmap(&self, memory: &u64) {
        assert!(
            self.0.lock().mapped.remove(memory).is_some(),
            "unmapping unmapped memory"
        );
    }

    unsafe fn flush<'a>(
        &self,
        regions: impl IntoIterator<Item = (&'a u64, Range<u64>)>,
    ) -> Result<(), OutOfMemoryError> {
        let inner = self.0.lock();
        for (memory, range) in regions {
            assert!(range.end <= inner.live[memory]);
        }
        Ok(())
    }

    unsafe fn invalidate<'a>(
        &self,
        regions: impl IntoIterator<Item = (&'a u64, Range<u64>)>,
    ) -> Result<(), OutOfMemoryError> {
        let inner = self.0.lock();
        for (memory, range) in regions {
            assert!(range.end <= inner.live[memory]);
        }
        Ok(())
    }

    unsafe fn create_buffer(&self, info: &BufferInfo) -> Result<u64, AllocationError> {
        let mut inner = self.0.lock();
        let id = inner.next_resource;
        inner.next_resource = id + 1;
        inner.buffers.insert(id, *info);
        Ok(id)
    }

    unsafe fn destroy_buffer(&self, buffer: u64) {
        assert!(self.0.lock().buffers.remove(&buffer).is_some());
    }

    fn buffer_requirements(&self, buffer: &u64) -> MemoryRequirements {
        let info = self.0.lock().buffers[buffer];
        MemoryRequirements {
            size: info.size.next_multiple_of(16),
            alignment: 64,
            memory_type_bits: 0b1111,
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }

    unsafe fn bind_buffer(
        &self,
        buffer: &u64,
        memory: &u64,
        offset: u64,
    ) -> Result<(), DeviceError> {
        self.0.lock().bound.push((*buffer, *memory, offset));
        Ok(())
    }

    unsafe fn create_image(&self, info: &ImageInfo) -> Result<u64, AllocationError> {
        let mut inner = self.0.lock();
        let id = inner.next_resource;
        inner.next_resource = id + 1;
        inner.images.insert(id, *info);
        Ok(id)
    }

    unsafe fn destroy_image(&self, image: u64) {
        assert!(self.0.lock().images.remove(&image).is_some());
    }

    fn image_requirements(&self, image: &u64) -> MemoryRequirements {
        let info = self.0.lock().images[image];
        let texels = info.extent.iter().map(|&dim| dim as u64).product::<u64>();
        MemoryRequirements {
            size: (texels * 4).next_multiple_of(256),
            alignment: 256,
            memory_type_bits: 0b0011,
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }

    unsafe fn bind_image(
        &self,
        image: &u64,
        memory: &u64,
        offset: u64,
    ) -> Result<(), DeviceError> {
        self.0.lock().bound.push((*image, *memory, offset));
        Ok(())
    }

    fn fence_status(&self, _fence: &u64) -> Result<FenceStatus, DeviceError> {
        Ok(FenceStatus::Unsignaled)
    }

    fn wait_for_fences(
        &self,
        _fences: &[u64],
        _wait_all: bool,
        _timeout_ns: u64,
    ) -> Result<bool, DeviceError> {
        Ok(false)
    }
}

fn physical() -> PhysicalProperties {
    PhysicalProperties {
        memory_types: vec![
            MemoryTypeProperties {
                properties: Properties::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryTypeProperties {
                properties: Properties::DEVICE_LOCAL
                    | Properties::HOST_VISIBLE
                    | Properties::HOST_COHERENT,
                heap_index: 0,
            },
            MemoryTypeProperties {
                properties: Properties::HOST_VISIBLE | Properties::HOST_COHERENT,
                heap_index: 1,
            },
            MemoryTypeProperties {
                properties: Properties::HOST_VISIBLE
                    | Properties::HOST_COHERENT
                    | Properties::HOST_CACHED,
                heap_index: 1,
            },
        ],
        memory_heaps: vec![
            MemoryHeapProperties { size: 32 * MIB },
            MemoryHeapProperties { size: 32 * MIB },
        ],
        buffer_image_granularity: 1024,
        non_coherent_atom_size: 64,
        integrated_gpu: false,
    }
}

fn init(device: &Arc<MockDevice>) -> Allocator<MockDevice> {
    Allocator::new(
        Arc::clone(device),
        physical(),
        AllocatorCreateInfo {
            frame_in_use_count: 2,
            ..Default::default()
        },
    )
    .unwrap()
}

fn requirements(size: u64, alignment: u64) -> MemoryRequirements {
    MemoryRequirements {
        size,
        alignment,
        memory_type_bits: !0,
        prefers_dedicated: false,
        requires_dedicated: false,
    }
}

#[test]
fn init_and_dispose() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);
    allocator.dispose().unwrap();
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn usage_selects_memory_type() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    let index = |usage| {
        allocator
            .find_memory_type_index(
                !0,
                &AllocationCreateInfo {
                    usage,
                    ..Default::default()
                },
            )
            .unwrap()
    };
    assert_eq!(index(MemoryUsage::GpuOnly), 0);
    assert_eq!(index(MemoryUsage::CpuOnly), 1);
    assert_eq!(index(MemoryUsage::GpuToCpu), 3);
    assert_eq!(index(MemoryUsage::CpuCopy), 2);

    assert!(matches!(
        allocator.find_memory_type_index(
            !0,
            &AllocationCreateInfo {
                usage: MemoryUsage::GpuLazilyAllocated,
                ..Default::default()
            },
        ),
        Err(AllocationError::NoSuitableMemory(..))
    ));
    allocator.dispose().unwrap();
}

#[test]
fn create_buffer_binds_and_rolls_back() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    let (buffer, allocation) = allocator
        .create_buffer(
            &BufferInfo {
                size: 1000,
                usage: BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
            },
            &AllocationCreateInfo {
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(allocation.memory_type(), 0);
    assert!(!allocation.is_dedicated());
    assert_eq!(allocation.offset() % 64, 0);
    assert!(allocation.size() >= 1000);
    assert_eq!(device.bound_count(), 1);

    allocator.free_memory(allocation);
    unsafe { device.destroy_buffer(buffer) };

    // Zero-sized buffers are rejected before anything is created.
    assert!(matches!(
        allocator.create_buffer(
            &BufferInfo {
                size: 0,
                usage: BufferUsage::VERTEX,
            },
            &AllocationCreateInfo::default(),
        ),
        Err(AllocationError::InvalidArgument(_))
    ));

    allocator.dispose().unwrap();
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn create_image_validates_extent() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    assert!(matches!(
        allocator.create_image(
            &ImageInfo {
                extent: [16, 0, 1],
                mip_levels: 1,
                array_layers: 1,
                tiling: Tiling::Optimal,
                usage: stratum::ImageUsage::SAMPLED,
            },
            &AllocationCreateInfo::default(),
        ),
        Err(AllocationError::InvalidArgument(_))
    ));

    let (image, allocation) = allocator
        .create_image(
            &ImageInfo {
                extent: [64, 64, 1],
                mip_levels: 1,
                array_layers: 1,
                tiling: Tiling::Optimal,
                usage: stratum::ImageUsage::SAMPLED | stratum::ImageUsage::TRANSFER_DST,
            },
            &AllocationCreateInfo {
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(allocation.offset() % 256, 0);

    allocator.free_memory(allocation);
    unsafe { device.destroy_image(image) };
    allocator.dispose().unwrap();
}

#[test]
fn oversized_requests_go_dedicated() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    // Heaps are 32 MiB, so blocks are 4 MiB; 3 MiB is over half a block.
    let allocation = allocator
        .allocate_memory(
            &requirements(3 * MIB, 256),
            &AllocationCreateInfo {
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(allocation.is_dedicated());
    assert_eq!(allocation.offset(), 0);

    allocator.free_memory(allocation);
    allocator.dispose().unwrap();
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn explicit_dedicated_flag() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    let allocation = allocator
        .allocate_memory(
            &requirements(4096, 64),
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::DEDICATED_MEMORY,
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(allocation.is_dedicated());
    allocator.free_memory(allocation);
    allocator.dispose().unwrap();
}

#[test]
fn invalid_flag_combinations_are_rejected() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    for flags in [
        AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE,
        AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST,
    ] {
        assert!(matches!(
            allocator.allocate_memory(
                &requirements(4096, 64),
                &AllocationCreateInfo {
                    flags,
                    ..Default::default()
                },
            ),
            Err(AllocationError::InvalidArgument(_))
        ));
    }

    assert!(matches!(
        allocator.allocate_memory(&requirements(0, 64), &AllocationCreateInfo::default()),
        Err(AllocationError::InvalidArgument(_))
    ));

    allocator.dispose().unwrap();
}

#[test]
fn never_allocate_fails_without_blocks() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    assert!(matches!(
        allocator.allocate_memory(
            &requirements(4096, 64),
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::NEVER_ALLOCATE,
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        ),
        Err(AllocationError::OutOfMemory(
            OutOfMemoryError::OutOfDeviceMemory
        ))
    ));
    allocator.dispose().unwrap();
}

#[test]
fn blocks_are_reused_across_allocations() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    let mut allocations = Vec::new();
    for _ in 0..64 {
        allocations.push(
            allocator
                .allocate_memory(
                    &requirements(16 * 1024, 256),
                    &AllocationCreateInfo {
                        usage: MemoryUsage::GpuOnly,
                        ..Default::default()
                    },
                )
                .unwrap(),
        );
    }
    // 64 * 16 KiB = 1 MiB fits one 4 MiB block.
    assert_eq!(device.live_memory_count(), 1);

    let budget = allocator.get_budget();
    assert_eq!(budget[0].block_bytes, 4 * MIB);
    assert_eq!(budget[0].allocation_bytes, MIB);

    for allocation in allocations {
        allocator.free_memory(allocation);
    }
    let budget = allocator.get_budget();
    assert_eq!(budget[0].allocation_bytes, 0);

    allocator.dispose().unwrap();
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn within_budget_is_enforced() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    // The fallback budget is 80% of the 32 MiB heap.
    assert!(matches!(
        allocator.allocate_memory(
            &MemoryRequirements {
                size: 30 * MIB,
                alignment: 256,
                memory_type_bits: 0b0001,
                prefers_dedicated: false,
                requires_dedicated: false,
            },
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::WITHIN_BUDGET,
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        ),
        Err(AllocationError::OutOfMemory(_))
    ));
    allocator.dispose().unwrap();
}

#[test]
fn mapping_lifecycle() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    let (buffer, mut allocation) = allocator
        .create_buffer(
            &BufferInfo {
                size: 4096,
                usage: BufferUsage::TRANSFER_SRC,
            },
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::MAPPED,
                usage: MemoryUsage::CpuOnly,
                ..Default::default()
            },
        )
        .unwrap();

    let base = allocation.mapped_ptr().expect("persistently mapped");
    let ptr = allocator.map_memory(&mut allocation).unwrap();
    assert_eq!(base, ptr);
    unsafe {
        std::ptr::write_bytes(ptr.as_ptr(), 0xAB, allocation.size() as usize);
    }
    allocator
        .flush_allocation(&allocation, 0, u64::MAX)
        .unwrap();
    allocator
        .invalidate_allocation(&allocation, 128, 64)
        .unwrap();
    allocator.unmap_memory(&mut allocation);
    assert!(allocation.mapped_ptr().is_some());

    allocator.free_memory(allocation);
    unsafe { device.destroy_buffer(buffer) };
    allocator.dispose().unwrap();
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn pool_with_eviction_recovers_space() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    let pool = allocator
        .create_pool(&PoolCreateInfo {
            memory_type: 0,
            block_size: MIB,
            max_block_count: 1,
            frame_in_use_count: 2,
            ..Default::default()
        })
        .unwrap();

    let info = AllocationCreateInfo {
        flags: AllocationCreateFlags::CAN_BECOME_LOST,
        pool: Some(pool.id()),
        ..Default::default()
    };
    let mut old = Vec::new();
    for _ in 0..4 {
        old.push(
            allocator
                .allocate_memory(&requirements(256 * 1024, 64), &info)
                .unwrap(),
        );
    }
    // The single block is full now.
    assert!(allocator
        .allocate_memory(&requirements(256 * 1024, 64), &info)
        .is_err());

    // Three frames later the untouched allocations are fair game.
    allocator.set_current_frame_index(3);
    let new = allocator
        .allocate_memory(
            &requirements(256 * 1024, 64),
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::CAN_MAKE_OTHER_LOST,
                pool: Some(pool.id()),
                ..Default::default()
            },
        )
        .unwrap();

    let lost = old.iter().filter(|allocation| allocation.is_lost()).count();
    assert_eq!(lost, 1);
    let lost_handle = old.iter().find(|allocation| allocation.is_lost()).unwrap();
    assert!(!allocator.touch_allocation(lost_handle));

    allocator.free_memory(new);
    for allocation in old {
        // Freeing a lost allocation is a silent no-op.
        allocator.free_memory(allocation);
    }
    allocator.destroy_pool(pool);
    allocator.dispose().unwrap();
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn unwired_pool_algorithms_are_rejected() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    for flags in [
        PoolCreateFlags::LINEAR_ALGORITHM,
        PoolCreateFlags::BUDDY_ALGORITHM,
    ] {
        assert!(matches!(
            allocator.create_pool(&PoolCreateInfo {
                memory_type: 0,
                flags,
                ..Default::default()
            }),
            Err(AllocationError::InvalidArgument(_))
        ));
    }

    let pool = allocator
        .create_pool(&PoolCreateInfo {
            memory_type: 0,
            flags: PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY,
            ..Default::default()
        })
        .unwrap();
    allocator.destroy_pool(pool);
    allocator.dispose().unwrap();
}

#[test]
fn make_allocations_lost_sweeps_stale_entries() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    let info = AllocationCreateInfo {
        flags: AllocationCreateFlags::CAN_BECOME_LOST,
        usage: MemoryUsage::GpuOnly,
        ..Default::default()
    };
    let a = allocator
        .allocate_memory(&requirements(4096, 64), &info)
        .unwrap();
    let b = allocator
        .allocate_memory(&requirements(4096, 64), &info)
        .unwrap();

    assert_eq!(allocator.make_allocations_lost(), 0);

    allocator.set_current_frame_index(5);
    allocator.touch_allocation(&a);
    assert_eq!(allocator.make_allocations_lost(), 1);
    assert!(!a.is_lost());
    assert!(b.is_lost());

    allocator.free_memory(a);
    allocator.free_memory(b);
    allocator.dispose().unwrap();
}

#[test]
fn utilization_reports_usage() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);

    let allocation = allocator
        .allocate_memory(
            &requirements(64 * 1024, 256),
            &AllocationCreateInfo {
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        )
        .unwrap();

    let utilization = allocator.utilization();
    assert_eq!(utilization.heaps.len(), 2);
    assert_eq!(utilization.heaps[0].utilization.used, 4 * MIB);
    assert_eq!(utilization.heaps[0].utilization.effective, 64 * 1024);
    // The Display impl is exercised for coverage of the report path.
    assert!(!format!("{utilization}").is_empty());

    allocator.free_memory(allocation);
    allocator.dispose().unwrap();
}

#[test]
fn random_alloc_free_soak() {
    let device = Arc::new(MockDevice::default());
    let allocator = init(&device);
    let mut held: Vec<stratum::Allocation<MockDevice>> = Vec::new();

    for _ in 0..512 {
        match rand::random::<u8>() % 3 {
            0 | 1 => {
                let size = 1u64 << (7 + rand::random::<u32>() % 8);
                let alignment = 1u64 << (rand::random::<u32>() % 10);
                let usage = match rand::random::<u8>() % 4 {
                    0 => MemoryUsage::GpuOnly,
                    1 => MemoryUsage::CpuOnly,
                    2 => MemoryUsage::CpuToGpu,
                    _ => MemoryUsage::GpuToCpu,
                };
                let allocation = allocator
                    .allocate_memory(
                        &requirements(size, alignment),
                        &AllocationCreateInfo {
                            usage,
                            ..Default::default()
                        },
                    )
                    .unwrap_or_else(|err| panic!("allocation of {size} failed: {err}"));
                assert_eq!(allocation.offset() % alignment, 0);
                assert!(allocation.size() >= size);
                held.push(allocation);
            }
            _ if !held.is_empty() => {
                let index = rand::random::<usize>() % held.len();
                allocator.free_memory(held.swap_remove(index));
            }
            _ => {}
        }
    }

    for allocation in held.drain(..) {
        allocator.free_memory(allocation);
    }
    allocator.dispose().unwrap();
    assert_eq!(device.live_memory_count(), 0);
}
