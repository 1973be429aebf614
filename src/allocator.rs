use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use crate::{
    allocation::{
        Allocation, AllocationCreateFlags, AllocationCreateInfo, AllocationPayload,
        AllocationShared, PERSISTENT_MAP,
    },
    block_list::BlockList,
    budget::{Budget, BudgetTracker},
    device::{
        AllocateInfo, BufferInfo, BufferUsage, DedicatedFor, Device, ImageInfo, MemoryRequirements,
        PhysicalProperties, Tiling,
    },
    error::{AllocationError, DisposeError, MappingError, OutOfMemoryError},
    mapping::flush_range,
    memory::{Memory, Properties},
    metadata::SuballocationType,
    pool::{Pool, PoolCreateFlags, PoolCreateInfo, PoolId},
    usage::{memory_type_cost, MemoryUsage},
    utilization::{
        MemoryHeapUtilization, MemoryTypeUtilization, MemoryUtilization, TotalMemoryUtilization,
    },
};

/// Default target size of one block on large heaps.
const DEFAULT_LARGE_HEAP_BLOCK_SIZE: u64 = 256 * 1024 * 1024;

/// Heaps at most this large get blocks of an eighth of the heap instead.
const SMALL_HEAP_MAX_SIZE: u64 = 1024 * 1024 * 1024;

bitflags::bitflags! {
    /// Allocator-wide feature flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AllocatorCreateFlags: u32 {
        /// The caller guarantees external synchronization of all calls.
        /// Advisory; the allocator keeps its internal locks either way.
        const EXTERNALLY_SYNCHRONIZED = 0x1;
        /// The device supports the memory-budget query.
        const EXT_MEMORY_BUDGET = 0x2;
        /// Expose AMD device-coherent memory types.
        const AMD_DEVICE_COHERENT_MEMORY = 0x4;
        /// Allocate device-address-capable memory for buffers that request it.
        const BUFFER_DEVICE_ADDRESS = 0x8;
    }
}

/// Allocator construction parameters.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllocatorCreateInfo {
    /// Feature flags.
    pub flags: AllocatorCreateFlags,

    /// Target size of one block on large heaps. Zero picks 256 MiB.
    pub preferred_large_heap_block_size: u64,

    /// Per-heap byte caps. Missing entries or `None` mean uncapped.
    pub heap_size_limits: Vec<Option<u64>>,

    /// How many frames an untouched lost-eligible allocation stays
    /// protected.
    pub frame_in_use_count: u32,

    /// Free bytes kept before and after every suballocation.
    pub debug_margin: u64,
}

#[derive(Debug)]
struct DedicatedRecord {
    id: u64,
    size: u64,
}

/// The top-level allocator.
///
/// Owns one default block list per memory type, the user pools, the
/// dedicated-allocation registries and the heap budget accounting.
pub struct Allocator<D: Device> {
    device: Arc<D>,
    physical: PhysicalProperties,
    flags: AllocatorCreateFlags,
    global_memory_type_bits: u32,
    frame_in_use_count: u32,
    current_frame: AtomicU64,
    default_lists: Vec<Arc<BlockList<D>>>,
    pools: RwLock<HashMap<PoolId, Arc<BlockList<D>>>>,
    next_pool_id: AtomicU64,
    dedicated: Vec<RwLock<Vec<DedicatedRecord>>>,
    next_dedicated_id: AtomicU64,
    budget: BudgetTracker,
}

impl<D: Device> std::fmt::Debug for Allocator<D> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Allocator")
            .field("memory_types", &self.physical.memory_types.len())
            .field("memory_heaps", &self.physical.memory_heaps.len())
            .field("flags", &self.flags)
            .field("current_frame", &self.current_frame.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<D: Device> Allocator<D> {
    /// Create an allocator over `device` with the given memory properties
    /// snapshot.
    pub fn new(
        device: Arc<D>,
        physical: PhysicalProperties,
        info: AllocatorCreateInfo,
    ) -> Result<Self, AllocationError> {
        if physical.memory_types.is_empty() || physical.memory_heaps.is_empty() {
            return Err(AllocationError::InvalidArgument(
                "physical properties report no memory types or heaps",
            ));
        }
        if !physical.buffer_image_granularity.is_power_of_two()
            || !physical.non_coherent_atom_size.is_power_of_two()
        {
            return Err(AllocationError::InvalidArgument(
                "granularity and atom size must be powers of two",
            ));
        }
        if physical.memory_types.len() > 32 {
            return Err(AllocationError::InvalidArgument(
                "more than 32 memory types",
            ));
        }
        if physical
            .memory_types
            .iter()
            .any(|ty| ty.heap_index as usize >= physical.memory_heaps.len())
        {
            return Err(AllocationError::InvalidArgument(
                "memory type references a heap that does not exist",
            ));
        }

        let preferred_large = if info.preferred_large_heap_block_size == 0 {
            DEFAULT_LARGE_HEAP_BLOCK_SIZE
        } else {
            info.preferred_large_heap_block_size
        };

        let mut global_memory_type_bits = 0u32;
        for (index, ty) in physical.memory_types.iter().enumerate() {
            let amd_coherent = ty
                .properties
                .intersects(Properties::DEVICE_COHERENT_AMD | Properties::DEVICE_UNCACHED_AMD);
            if !amd_coherent || info.flags.contains(AllocatorCreateFlags::AMD_DEVICE_COHERENT_MEMORY)
            {
                global_memory_type_bits |= 1 << index;
            }
        }

        let mut heap_size_limits = info.heap_size_limits.clone();
        heap_size_limits.resize(physical.memory_heaps.len(), None);
        let budget = BudgetTracker::new(
            physical.memory_heaps.clone(),
            heap_size_limits,
            info.flags.contains(AllocatorCreateFlags::EXT_MEMORY_BUDGET),
        );

        let default_lists = physical
            .memory_types
            .iter()
            .enumerate()
            .map(|(index, ty)| {
                let heap_index = ty.heap_index as usize;
                let heap_size = physical.memory_heaps[heap_index].size;
                let block_size = if heap_size <= SMALL_HEAP_MAX_SIZE {
                    heap_size / 8
                } else {
                    preferred_large
                };
                Arc::new(BlockList::new(
                    index as u32,
                    heap_index,
                    heap_size,
                    ty.properties,
                    block_size.max(1),
                    0,
                    usize::MAX,
                    physical.buffer_image_granularity,
                    info.frame_in_use_count,
                    info.debug_margin,
                    false,
                    None,
                ))
            })
            .collect();

        log::info!(
            "creating allocator: {} memory type(s), {} heap(s), flags {:?}",
            physical.memory_types.len(),
            physical.memory_heaps.len(),
            info.flags
        );

        let dedicated = physical
            .memory_types
            .iter()
            .map(|_| RwLock::new(Vec::new()))
            .collect();

        Ok(Allocator {
            device,
            physical,
            flags: info.flags,
            global_memory_type_bits,
            frame_in_use_count: info.frame_in_use_count,
            current_frame: AtomicU64::new(0),
            default_lists,
            pools: RwLock::new(HashMap::new()),
            next_pool_id: AtomicU64::new(0),
            dedicated,
            next_dedicated_id: AtomicU64::new(0),
            budget,
        })
    }

    /// The device this allocator serves.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// How many frames an untouched lost-eligible allocation stays
    /// protected from eviction.
    pub fn frame_in_use_count(&self) -> u32 {
        self.frame_in_use_count
    }

    /// Frame counter used by the lost-allocation machinery. The host
    /// advances it once per frame.
    pub fn current_frame_index(&self) -> u64 {
        self.current_frame.load(Ordering::Acquire)
    }

    /// Set the current frame index. Must not race with allocations that use
    /// lost semantics.
    pub fn set_current_frame_index(&self, frame: u64) {
        debug_assert_ne!(frame, crate::allocation::FRAME_INDEX_LOST);
        self.current_frame.store(frame, Ordering::Release);
    }

    /// Pick the cheapest admissible memory type out of `memory_type_bits`.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        info: &AllocationCreateInfo,
    ) -> Result<u32, AllocationError> {
        let mut bits = memory_type_bits & self.global_memory_type_bits;
        if info.memory_type_bits != 0 {
            bits &= info.memory_type_bits;
        }

        let required = info.required_flags | info.usage.required();
        let preferred = info.preferred_flags
            | info
                .usage
                .preferred(self.physical.integrated_gpu, info.preferred_flags);
        let not_preferred = info.usage.not_preferred();

        let mut best: Option<(u32, u32)> = None;
        for (index, ty) in self.physical.memory_types.iter().enumerate() {
            if bits & (1 << index) == 0 || !ty.properties.contains(required) {
                continue;
            }
            let cost = memory_type_cost(ty.properties, preferred, not_preferred);
            if cost == 0 {
                return Ok(index as u32);
            }
            match best {
                Some((_, best_cost)) if best_cost <= cost => {}
                _ => best = Some((index as u32, cost)),
            }
        }
        best.map(|(index, _)| index)
            .ok_or(AllocationError::NoSuitableMemory(memory_type_bits, required))
    }

    /// Memory type a buffer with `buffer_info` would be placed in.
    /// Creates and destroys a throwaway buffer to query requirements.
    pub fn find_memory_type_index_for_buffer(
        &self,
        buffer_info: &BufferInfo,
        info: &AllocationCreateInfo,
    ) -> Result<u32, AllocationError> {
        let buffer = unsafe { self.device.create_buffer(buffer_info) }?;
        let requirements = self.device.buffer_requirements(&buffer);
        unsafe { self.device.destroy_buffer(buffer) };
        self.find_memory_type_index(requirements.memory_type_bits, info)
    }

    /// Memory type an image with `image_info` would be placed in.
    pub fn find_memory_type_index_for_image(
        &self,
        image_info: &ImageInfo,
        info: &AllocationCreateInfo,
    ) -> Result<u32, AllocationError> {
        let image = unsafe { self.device.create_image(image_info) }?;
        let requirements = self.device.image_requirements(&image);
        unsafe { self.device.destroy_image(image) };
        self.find_memory_type_index(requirements.memory_type_bits, info)
    }

    /// Allocate memory for externally queried requirements.
    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        info: &AllocationCreateInfo,
    ) -> Result<Allocation<D>, AllocationError> {
        self.allocate(
            requirements,
            false,
            false,
            None,
            false,
            info,
            SuballocationType::Unknown,
        )
    }

    /// Allocate memory suitable for `buffer`, honouring its dedicated
    /// allocation hints. Binds it when `bind` is set.
    pub fn allocate_memory_for_buffer(
        &self,
        buffer: &D::Buffer,
        info: &AllocationCreateInfo,
        bind: bool,
    ) -> Result<Allocation<D>, AllocationError> {
        let requirements = self.device.buffer_requirements(buffer);
        let allocation = self.allocate(
            &requirements,
            requirements.prefers_dedicated,
            requirements.requires_dedicated,
            Some(DedicatedFor::Buffer(buffer)),
            false,
            info,
            SuballocationType::Buffer,
        )?;
        if bind {
            if let Err(err) = self.bind_buffer_memory(&allocation, 0, buffer) {
                self.free_memory(allocation);
                return Err(err.into());
            }
        }
        Ok(allocation)
    }

    /// Allocate memory suitable for `image`, honouring its dedicated
    /// allocation hints. Binds it when `bind` is set.
    pub fn allocate_memory_for_image(
        &self,
        image: &D::Image,
        info: &AllocationCreateInfo,
        bind: bool,
    ) -> Result<Allocation<D>, AllocationError> {
        let requirements = self.device.image_requirements(image);
        let allocation = self.allocate(
            &requirements,
            requirements.prefers_dedicated,
            requirements.requires_dedicated,
            Some(DedicatedFor::Image(image)),
            false,
            info,
            SuballocationType::ImageUnknown,
        )?;
        if bind {
            if let Err(err) = self.bind_image_memory(&allocation, 0, image) {
                self.free_memory(allocation);
                return Err(err.into());
            }
        }
        Ok(allocation)
    }

    /// Create a buffer, allocate memory for it and bind the two together
    /// (unless `DONT_BIND` is set). Either both objects are returned or
    /// neither.
    pub fn create_buffer(
        &self,
        buffer_info: &BufferInfo,
        info: &AllocationCreateInfo,
    ) -> Result<(D::Buffer, Allocation<D>), AllocationError> {
        if buffer_info.size == 0 {
            return Err(AllocationError::InvalidArgument("buffer size is zero"));
        }
        let buffer = unsafe { self.device.create_buffer(buffer_info) }?;
        let requirements = self.device.buffer_requirements(&buffer);
        let device_address = self.flags.contains(AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS)
            && buffer_info.usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS);

        let allocation = match self.allocate(
            &requirements,
            requirements.prefers_dedicated,
            requirements.requires_dedicated,
            Some(DedicatedFor::Buffer(&buffer)),
            device_address,
            info,
            SuballocationType::Buffer,
        ) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer) };
                return Err(err);
            }
        };

        if !info.flags.contains(AllocationCreateFlags::DONT_BIND) {
            if let Err(err) = self.bind_buffer_memory(&allocation, 0, &buffer) {
                self.free_memory(allocation);
                unsafe { self.device.destroy_buffer(buffer) };
                return Err(err.into());
            }
        }
        Ok((buffer, allocation))
    }

    /// Create an image, allocate memory for it and bind the two together
    /// (unless `DONT_BIND` is set). Either both objects are returned or
    /// neither.
    pub fn create_image(
        &self,
        image_info: &ImageInfo,
        info: &AllocationCreateInfo,
    ) -> Result<(D::Image, Allocation<D>), AllocationError> {
        if image_info.extent.iter().any(|&dim| dim == 0) {
            return Err(AllocationError::InvalidArgument("image extent is zero"));
        }
        if image_info.mip_levels == 0 || image_info.array_layers == 0 {
            return Err(AllocationError::InvalidArgument(
                "image mip level or array layer count is zero",
            ));
        }
        let ty = match image_info.tiling {
            Tiling::Optimal => SuballocationType::ImageOptimal,
            Tiling::Linear => SuballocationType::ImageLinear,
        };
        let image = unsafe { self.device.create_image(image_info) }?;
        let requirements = self.device.image_requirements(&image);

        let allocation = match self.allocate(
            &requirements,
            requirements.prefers_dedicated,
            requirements.requires_dedicated,
            Some(DedicatedFor::Image(&image)),
            false,
            info,
            ty,
        ) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image) };
                return Err(err);
            }
        };

        if !info.flags.contains(AllocationCreateFlags::DONT_BIND) {
            if let Err(err) = self.bind_image_memory(&allocation, 0, &image) {
                self.free_memory(allocation);
                unsafe { self.device.destroy_image(image) };
                return Err(err.into());
            }
        }
        Ok((image, allocation))
    }

    /// Bind `buffer` at `local_offset` into the allocation.
    pub fn bind_buffer_memory(
        &self,
        allocation: &Allocation<D>,
        local_offset: u64,
        buffer: &D::Buffer,
    ) -> Result<(), crate::error::DeviceError> {
        match &allocation.payload {
            AllocationPayload::Block { block, offset, .. } => {
                block.bind_buffer(&self.device, buffer, offset + local_offset)
            }
            AllocationPayload::Dedicated { memory, .. } => unsafe {
                self.device.bind_buffer(buffer, memory.raw(), local_offset)
            },
        }
    }

    /// Bind `image` at `local_offset` into the allocation.
    pub fn bind_image_memory(
        &self,
        allocation: &Allocation<D>,
        local_offset: u64,
        image: &D::Image,
    ) -> Result<(), crate::error::DeviceError> {
        match &allocation.payload {
            AllocationPayload::Block { block, offset, .. } => {
                block.bind_image(&self.device, image, offset + local_offset)
            }
            AllocationPayload::Dedicated { memory, .. } => unsafe {
                self.device.bind_image(image, memory.raw(), local_offset)
            },
        }
    }

    /// Free an allocation. Freeing an allocation that has become lost is a
    /// silent no-op apart from budget accounting.
    pub fn free_memory(&self, mut allocation: Allocation<D>) {
        let current_frame = self.current_frame_index();
        let live = allocation.shared.touch(current_frame);

        match allocation.payload {
            AllocationPayload::Block {
                ref block,
                offset,
                pool,
                ..
            } => {
                // Release any mapping references this allocation still holds
                // on its block.
                let mut refs = allocation.map_count & !PERSISTENT_MAP;
                if allocation.map_count & PERSISTENT_MAP != 0 {
                    refs += 1;
                }
                if refs > 0 {
                    if allocation.map_count & !PERSISTENT_MAP != 0 {
                        log::warn!("freeing an allocation that is still mapped");
                    }
                    block.unmap(&self.device, refs);
                }
                allocation.map_count = 0;

                let list = match pool {
                    Some(id) => self.pools.read().get(&id).cloned(),
                    None => Some(Arc::clone(
                        &self.default_lists[allocation.memory_type as usize],
                    )),
                };
                match list {
                    Some(list) if live => {
                        list.free(&self.device, &self.budget, block, offset, allocation.size);
                    }
                    // Lost, or the owning pool is already gone; only the
                    // budget still counts the allocation.
                    _ => {
                        self.budget.record_free(allocation.heap_index, allocation.size);
                    }
                }
            }
            AllocationPayload::Dedicated { memory, ptr, id } => {
                if ptr.is_some() {
                    unsafe { self.device.unmap(memory.raw()) };
                }
                let mut registry = self.dedicated[allocation.memory_type as usize].write();
                if let Some(position) = registry.iter().position(|record| record.id == id) {
                    registry.remove(position);
                }
                drop(registry);
                let size = memory.size();
                unsafe { self.device.free(memory.into_raw()) };
                self.budget.record_block_free(allocation.heap_index, size);
                self.budget.record_free(allocation.heap_index, size);
                log::trace!("freed dedicated allocation of {} bytes", size);
            }
        }
    }

    /// Record that `allocation` is used in the current frame. Returns
    /// `false` when it has become lost.
    pub fn touch_allocation(&self, allocation: &Allocation<D>) -> bool {
        allocation.shared.touch(self.current_frame_index())
    }

    /// Evict every stale lost-eligible allocation. Returns how many were
    /// made lost.
    pub fn make_allocations_lost(&self) -> usize {
        let current_frame = self.current_frame_index();
        let mut lost = 0;
        for list in &self.default_lists {
            lost += list.make_allocations_lost(current_frame);
        }
        for list in self.pools.read().values() {
            lost += list.make_allocations_lost(current_frame);
        }
        lost
    }

    /// Map the allocation, incrementing its mapping reference count.
    pub fn map_memory(
        &self,
        allocation: &mut Allocation<D>,
    ) -> Result<NonNull<u8>, MappingError> {
        if allocation.is_lost() {
            return Err(MappingError::MappingFailed);
        }
        match &mut allocation.payload {
            AllocationPayload::Block { block, offset, .. } => {
                let ptr = block.map(&self.device, 1)?;
                allocation.map_count += 1;
                Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(*offset as usize)) })
            }
            AllocationPayload::Dedicated { memory, ptr, .. } => match ptr {
                Some(existing) => {
                    allocation.map_count += 1;
                    Ok(*existing)
                }
                None => {
                    if !memory.host_visible() {
                        return Err(MappingError::HostInvisible);
                    }
                    let mapped = unsafe { self.device.map(memory.raw()) }?;
                    *ptr = Some(mapped);
                    allocation.map_count += 1;
                    Ok(mapped)
                }
            },
        }
    }

    /// Release one mapping reference. Unmapping more times than mapped is a
    /// misuse.
    pub fn unmap_memory(&self, allocation: &mut Allocation<D>) {
        assert!(
            allocation.map_count & !PERSISTENT_MAP > 0,
            "unmapping an allocation that is not mapped"
        );
        allocation.map_count -= 1;
        match &mut allocation.payload {
            AllocationPayload::Block { block, .. } => {
                block.unmap(&self.device, 1);
            }
            AllocationPayload::Dedicated { memory, ptr, .. } => {
                if allocation.map_count == 0 {
                    unsafe { self.device.unmap(memory.raw()) };
                    *ptr = None;
                }
            }
        }
    }

    /// Flush host writes in `offset..offset + size` of the allocation.
    /// No-op on host-coherent memory. `u64::MAX` means "to the end".
    pub fn flush_allocation(
        &self,
        allocation: &Allocation<D>,
        offset: u64,
        size: u64,
    ) -> Result<(), OutOfMemoryError> {
        match self.host_access_range(allocation, offset, size) {
            Some((memory, range)) => unsafe { self.device.flush([(memory, range)]) },
            None => Ok(()),
        }
    }

    /// Make device writes in `offset..offset + size` visible to the host.
    /// No-op on host-coherent memory. `u64::MAX` means "to the end".
    pub fn invalidate_allocation(
        &self,
        allocation: &Allocation<D>,
        offset: u64,
        size: u64,
    ) -> Result<(), OutOfMemoryError> {
        match self.host_access_range(allocation, offset, size) {
            Some((memory, range)) => unsafe { self.device.invalidate([(memory, range)]) },
            None => Ok(()),
        }
    }

    /// Create a user pool.
    pub fn create_pool(&self, info: &PoolCreateInfo) -> Result<Pool, AllocationError> {
        if info.memory_type as usize >= self.physical.memory_types.len() {
            return Err(AllocationError::InvalidArgument(
                "pool memory type index out of range",
            ));
        }
        if self.global_memory_type_bits & (1 << info.memory_type) == 0 {
            return Err(AllocationError::InvalidArgument(
                "pool memory type is not usable with this allocator",
            ));
        }
        if info
            .flags
            .intersects(PoolCreateFlags::LINEAR_ALGORITHM | PoolCreateFlags::BUDDY_ALGORITHM)
        {
            return Err(AllocationError::InvalidArgument(
                "linear and buddy pool algorithms are not available",
            ));
        }
        if info.max_block_count != 0 && info.min_block_count > info.max_block_count {
            return Err(AllocationError::InvalidArgument(
                "pool min block count exceeds max block count",
            ));
        }

        let ty = &self.physical.memory_types[info.memory_type as usize];
        let heap_index = ty.heap_index as usize;
        let heap_size = self.physical.memory_heaps[heap_index].size;
        let block_size = if info.block_size != 0 {
            info.block_size
        } else {
            self.default_lists[info.memory_type as usize].preferred_block_size()
        };
        let granularity = if info
            .flags
            .contains(PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY)
        {
            1
        } else {
            self.physical.buffer_image_granularity
        };
        let max_block_count = if info.max_block_count == 0 {
            usize::MAX
        } else {
            info.max_block_count
        };

        let id = PoolId(self.next_pool_id.fetch_add(1, Ordering::Relaxed));
        let list: Arc<BlockList<D>> = Arc::new(BlockList::new(
            info.memory_type,
            heap_index,
            heap_size,
            ty.properties,
            block_size,
            info.min_block_count,
            max_block_count,
            granularity,
            info.frame_in_use_count,
            0,
            info.block_size != 0,
            Some(id),
        ));
        list.create_min_blocks(&self.device, &self.budget)?;

        self.pools.write().insert(id, list);
        log::info!(
            "created pool {:?}: memory type {}, block size {}",
            id,
            info.memory_type,
            block_size
        );
        Ok(Pool { id })
    }

    /// Destroy a user pool. Outstanding allocations from the pool are
    /// leaked and reported.
    pub fn destroy_pool(&self, pool: Pool) {
        let list = self.pools.write().remove(&pool.id);
        if let Some(list) = list {
            let leaked = list.dispose(&self.device, &self.budget);
            if leaked > 0 {
                log::error!("pool {:?} destroyed with {} live allocation(s)", pool.id, leaked);
            }
        }
    }

    /// Per-heap budget snapshot, refreshed from the device when stale.
    pub fn get_budget(&self) -> Vec<Budget> {
        self.budget.budgets(&*self.device)
    }

    /// Heap and type utilization snapshot.
    pub fn utilization(&self) -> TotalMemoryUtilization {
        let mut heap_used = vec![0u64; self.physical.memory_heaps.len()];
        let mut heap_effective = vec![0u64; self.physical.memory_heaps.len()];

        let types = self
            .physical
            .memory_types
            .iter()
            .enumerate()
            .map(|(index, ty)| {
                let heap_index = ty.heap_index as usize;
                let (mut block_bytes, mut used, _) = self.default_lists[index].statistics();
                for list in self.pools.read().values() {
                    if list.memory_type() == index as u32 {
                        let (pool_blocks, pool_used, _) = list.statistics();
                        block_bytes += pool_blocks;
                        used += pool_used;
                    }
                }
                for record in self.dedicated[index].read().iter() {
                    block_bytes += record.size;
                    used += record.size;
                }
                heap_used[heap_index] += block_bytes;
                heap_effective[heap_index] += used;
                MemoryTypeUtilization {
                    utilization: MemoryUtilization {
                        used: block_bytes,
                        effective: used,
                    },
                    properties: ty.properties,
                    heap_index,
                }
            })
            .collect();

        let heaps = self
            .physical
            .memory_heaps
            .iter()
            .enumerate()
            .map(|(index, heap)| MemoryHeapUtilization {
                utilization: MemoryUtilization {
                    used: heap_used[index],
                    effective: heap_effective[index],
                },
                size: heap.size,
            })
            .collect();

        TotalMemoryUtilization { types, heaps }
    }

    /// Tear the allocator down. Fails when user pools or allocations are
    /// still alive; the caller keeps responsibility for those.
    pub fn dispose(self) -> Result<(), DisposeError> {
        let pools = self.pools.read().len();
        let dedicated = self
            .dedicated
            .iter()
            .map(|registry| registry.read().len())
            .sum();
        let allocations = self
            .default_lists
            .iter()
            .map(|list| list.allocation_count())
            .sum();

        if pools != 0 || dedicated != 0 || allocations != 0 {
            let error = DisposeError {
                pools,
                dedicated,
                allocations,
            };
            log::error!("{}", error);
            return Err(error);
        }

        // Drop glue releases the remaining (empty) blocks.
        Ok(())
    }

    fn host_access_range<'a>(
        &self,
        allocation: &'a Allocation<D>,
        offset: u64,
        size: u64,
    ) -> Option<(&'a D::Memory, std::ops::Range<u64>)> {
        if allocation.properties().contains(Properties::HOST_COHERENT) {
            return None;
        }
        let atom = self.physical.non_coherent_atom_size;
        match &allocation.payload {
            AllocationPayload::Block {
                block,
                offset: alloc_offset,
                ..
            } => flush_range(
                *alloc_offset,
                allocation.size,
                block.memory().size(),
                atom,
                offset,
                size,
            )
            .map(|range| (block.memory().raw(), range)),
            AllocationPayload::Dedicated { memory, .. } => {
                flush_range(0, allocation.size, memory.size(), atom, offset, size)
                    .map(|range| (memory.raw(), range))
            }
        }
    }

    /// The common allocation path: validate, pick memory types, try each
    /// until one succeeds.
    #[allow(clippy::too_many_arguments)]
    fn allocate(
        &self,
        requirements: &MemoryRequirements,
        prefers_dedicated: bool,
        requires_dedicated: bool,
        dedicated_for: Option<DedicatedFor<'_, D>>,
        device_address: bool,
        info: &AllocationCreateInfo,
        ty: SuballocationType,
    ) -> Result<Allocation<D>, AllocationError> {
        if requirements.size == 0 {
            return Err(AllocationError::InvalidArgument("allocation size is zero"));
        }
        if !requirements.alignment.is_power_of_two() {
            return Err(AllocationError::InvalidArgument(
                "alignment is not a power of two",
            ));
        }
        let flags = info.flags;
        if flags.contains(AllocationCreateFlags::DEDICATED_MEMORY)
            && flags.contains(AllocationCreateFlags::NEVER_ALLOCATE)
        {
            return Err(AllocationError::InvalidArgument(
                "DEDICATED_MEMORY and NEVER_ALLOCATE are mutually exclusive",
            ));
        }
        if flags.contains(AllocationCreateFlags::MAPPED)
            && flags.contains(AllocationCreateFlags::CAN_BECOME_LOST)
        {
            return Err(AllocationError::InvalidArgument(
                "MAPPED and CAN_BECOME_LOST are mutually exclusive",
            ));
        }
        if requires_dedicated && flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
            return Err(AllocationError::InvalidArgument(
                "resource requires a dedicated allocation but NEVER_ALLOCATE is set",
            ));
        }

        // Explicit pool: the pool already pins the memory type.
        if let Some(pool_id) = info.pool {
            if flags.contains(AllocationCreateFlags::DEDICATED_MEMORY) {
                return Err(AllocationError::InvalidArgument(
                    "DEDICATED_MEMORY cannot be combined with a pool",
                ));
            }
            let list = self
                .pools
                .read()
                .get(&pool_id)
                .cloned()
                .ok_or(AllocationError::InvalidArgument("pool does not exist"))?;
            if requirements.memory_type_bits & (1 << list.memory_type()) == 0 {
                return Err(AllocationError::InvalidArgument(
                    "resource cannot live in the pool's memory type",
                ));
            }
            return list.allocate(
                &self.device,
                &self.budget,
                self.current_frame_index(),
                requirements.size,
                requirements.alignment,
                info,
                ty,
            );
        }

        let mut bits = requirements.memory_type_bits;
        loop {
            let type_index = self.find_memory_type_index(bits, info)?;
            match self.allocate_of_type(
                type_index,
                requirements,
                prefers_dedicated,
                requires_dedicated,
                dedicated_for.as_ref(),
                device_address,
                info,
                ty,
            ) {
                Ok(allocation) => return Ok(allocation),
                Err(AllocationError::OutOfMemory(_)) => {
                    // This type is exhausted; retry with the next best one.
                    bits &= !(1 << type_index);
                    if bits == 0 {
                        return Err(OutOfMemoryError::OutOfDeviceMemory.into());
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_of_type(
        &self,
        type_index: u32,
        requirements: &MemoryRequirements,
        prefers_dedicated: bool,
        requires_dedicated: bool,
        dedicated_for: Option<&DedicatedFor<'_, D>>,
        device_address: bool,
        info: &AllocationCreateInfo,
        ty: SuballocationType,
    ) -> Result<Allocation<D>, AllocationError> {
        let list = &self.default_lists[type_index as usize];
        let flags = info.flags;
        let size = requirements.size;

        // Transient attachments never share blocks.
        let force_dedicated =
            requires_dedicated || info.usage == MemoryUsage::GpuLazilyAllocated;
        let prefer_dedicated = force_dedicated
            || flags.contains(AllocationCreateFlags::DEDICATED_MEMORY)
            || prefers_dedicated
            || size > list.preferred_block_size() / 2;
        let never_allocate = flags.contains(AllocationCreateFlags::NEVER_ALLOCATE);

        if prefer_dedicated && !never_allocate {
            match self.allocate_dedicated(type_index, size, dedicated_for, device_address, info) {
                Ok(allocation) => return Ok(allocation),
                Err(err) if force_dedicated => return Err(err),
                Err(_) => {}
            }
        } else if force_dedicated && never_allocate {
            return Err(OutOfMemoryError::OutOfDeviceMemory.into());
        }

        let block_result = list.allocate(
            &self.device,
            &self.budget,
            self.current_frame_index(),
            size,
            requirements.alignment,
            info,
            ty,
        );
        match block_result {
            Ok(allocation) => Ok(allocation),
            Err(AllocationError::OutOfMemory(err)) if !prefer_dedicated && !never_allocate => {
                // Block placement failed; a dedicated allocation is the
                // fallback.
                self.allocate_dedicated(type_index, size, dedicated_for, device_address, info)
                    .map_err(|_| AllocationError::OutOfMemory(err))
            }
            Err(err) => Err(err),
        }
    }

    fn allocate_dedicated(
        &self,
        type_index: u32,
        size: u64,
        dedicated_for: Option<&DedicatedFor<'_, D>>,
        device_address: bool,
        info: &AllocationCreateInfo,
    ) -> Result<Allocation<D>, AllocationError> {
        // Lost semantics only exist inside blocks.
        if info.flags.contains(AllocationCreateFlags::CAN_BECOME_LOST) {
            return Err(OutOfMemoryError::OutOfDeviceMemory.into());
        }
        let heap_index = self.physical.memory_types[type_index as usize].heap_index as usize;
        if info.flags.contains(AllocationCreateFlags::WITHIN_BUDGET)
            && self.budget.would_exceed(&*self.device, heap_index, size)
        {
            return Err(OutOfMemoryError::OutOfDeviceMemory.into());
        }
        if self.budget.block_bytes(heap_index).saturating_add(size)
            > self.budget.heap_capacity(heap_index)
        {
            return Err(OutOfMemoryError::OutOfDeviceMemory.into());
        }

        let properties = self.physical.memory_types[type_index as usize].properties;
        let dedicated = match dedicated_for {
            Some(DedicatedFor::Buffer(buffer)) => Some(DedicatedFor::Buffer(*buffer)),
            Some(DedicatedFor::Image(image)) => Some(DedicatedFor::Image(*image)),
            None => None,
        };
        let raw = unsafe {
            self.device.allocate(AllocateInfo {
                memory_type: type_index,
                size,
                dedicated,
                device_address,
            })
        }?;
        let memory = unsafe { Memory::from_raw(raw, size, properties) };

        let mut ptr = None;
        let mut map_count = 0;
        if info.flags.contains(AllocationCreateFlags::MAPPED) && memory.host_visible() {
            match unsafe { self.device.map(memory.raw()) } {
                Ok(mapped) => {
                    ptr = Some(mapped);
                    map_count = PERSISTENT_MAP;
                }
                Err(err) => {
                    unsafe { self.device.free(memory.into_raw()) };
                    return Err(err.into());
                }
            }
        }

        let id = self.next_dedicated_id.fetch_add(1, Ordering::Relaxed);
        self.dedicated[type_index as usize]
            .write()
            .push(DedicatedRecord { id, size });
        self.budget.record_block_alloc(heap_index, size);
        self.budget.record_alloc(heap_index, size);
        log::trace!(
            "dedicated allocation of {} bytes from memory type {}",
            size,
            type_index
        );

        Ok(Allocation {
            shared: Arc::new(AllocationShared::new(self.current_frame_index(), false)),
            payload: AllocationPayload::Dedicated { memory, ptr, id },
            size,
            memory_type: type_index,
            heap_index,
            map_count,
        })
    }
}

impl<D: Device> Drop for Allocator<D> {
    fn drop(&mut self) {
        for list in &self.default_lists {
            let leaked = list.dispose(&self.device, &self.budget);
            if leaked > 0 {
                log::error!(
                    "allocator dropped with {} live allocation(s) in memory type {}",
                    leaked,
                    list.memory_type()
                );
            }
        }
        let pools = std::mem::take(&mut *self.pools.write());
        for (id, list) in pools {
            let leaked = list.dispose(&self.device, &self.budget);
            if leaked > 0 {
                log::error!("allocator dropped with live pool {:?} ({} allocation(s))", id, leaked);
            }
        }
    }
}
