use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;

use crate::{
    allocation::{
        Allocation, AllocationCreateFlags, AllocationCreateInfo, AllocationPayload,
        AllocationShared, PERSISTENT_MAP,
    },
    block::MemoryBlock,
    budget::BudgetTracker,
    device::{AllocateInfo, Device},
    error::{AllocationError, OutOfMemoryError},
    memory::{Memory, Properties},
    metadata::{BlockMetadata, Request, RequestContext, Strategy, SuballocationType},
    pool::PoolId,
};

/// How many times an eviction-based allocation is retried when racing
/// touches invalidate the chosen victims.
const LOST_TRY_COUNT: usize = 32;

/// Derive the in-block placement strategy from request flags.
/// At most one strategy flag may be set; the default is first-fit.
pub(crate) fn strategy_from_flags(
    flags: AllocationCreateFlags,
) -> Result<Strategy, AllocationError> {
    let strategy = flags & AllocationCreateFlags::STRATEGY_MASK;
    if strategy.bits().count_ones() > 1 {
        return Err(AllocationError::InvalidArgument(
            "more than one strategy flag set",
        ));
    }
    Ok(if strategy == AllocationCreateFlags::STRATEGY_BEST_FIT {
        Strategy::BestFit
    } else if strategy == AllocationCreateFlags::STRATEGY_WORST_FIT {
        Strategy::WorstFit
    } else {
        Strategy::FirstFit
    })
}

/// The set of blocks of one memory type sharing a configuration.
#[derive(Debug)]
pub(crate) struct BlockList<D: Device> {
    memory_type: u32,
    heap_index: usize,
    heap_size: u64,
    properties: Properties,
    preferred_block_size: u64,
    min_block_count: usize,
    max_block_count: usize,
    granularity: u64,
    frame_in_use_count: u32,
    debug_margin: u64,
    explicit_block_size: bool,
    pool: Option<PoolId>,
    blocks: RwLock<Vec<Arc<MemoryBlock<D>>>>,
    next_block_id: AtomicU64,
}

impl<D: Device> BlockList<D> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        memory_type: u32,
        heap_index: usize,
        heap_size: u64,
        properties: Properties,
        preferred_block_size: u64,
        min_block_count: usize,
        max_block_count: usize,
        granularity: u64,
        frame_in_use_count: u32,
        debug_margin: u64,
        explicit_block_size: bool,
        pool: Option<PoolId>,
    ) -> Self {
        BlockList {
            memory_type,
            heap_index,
            heap_size,
            properties,
            preferred_block_size,
            min_block_count,
            max_block_count,
            granularity,
            frame_in_use_count,
            debug_margin,
            explicit_block_size,
            pool,
            blocks: RwLock::new(Vec::new()),
            next_block_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn memory_type(&self) -> u32 {
        self.memory_type
    }

    pub(crate) fn preferred_block_size(&self) -> u64 {
        self.preferred_block_size
    }

    /// Pre-create `min_block_count` blocks.
    pub(crate) fn create_min_blocks(
        &self,
        device: &D,
        budget: &BudgetTracker,
    ) -> Result<(), AllocationError> {
        for _ in 0..self.min_block_count {
            let block = self.create_block(device, budget, self.preferred_block_size)?;
            self.blocks.write().push(block);
        }
        Ok(())
    }

    pub(crate) fn allocate(
        &self,
        device: &D,
        budget: &BudgetTracker,
        current_frame: u64,
        size: u64,
        alignment: u64,
        info: &AllocationCreateInfo,
        ty: SuballocationType,
    ) -> Result<Allocation<D>, AllocationError> {
        let mut flags = info.flags;
        // Mapping is meaningless on host-invisible memory.
        if !self.properties.contains(Properties::HOST_VISIBLE) {
            flags.remove(AllocationCreateFlags::MAPPED);
        }
        if flags.contains(AllocationCreateFlags::UPPER_ADDRESS) {
            return Err(AllocationError::InvalidArgument(
                "upper-address placement requires the linear algorithm",
            ));
        }
        let strategy = strategy_from_flags(flags)?;

        let ctx = RequestContext {
            size,
            alignment,
            ty,
            strategy,
            can_make_other_lost: false,
            current_frame,
            frame_in_use_count: self.frame_in_use_count,
        };
        let may_evict = flags.contains(AllocationCreateFlags::CAN_MAKE_OTHER_LOST);

        // Walk existing blocks.
        if let Some(allocation) = self.try_existing_blocks(device, budget, &ctx, flags)? {
            return Ok(allocation);
        }

        // Grow.
        let never_allocate = flags.contains(AllocationCreateFlags::NEVER_ALLOCATE);
        if !never_allocate && self.blocks.read().len() < self.max_block_count {
            match self.grow_and_allocate(device, budget, &ctx, flags, size) {
                Ok(allocation) => return Ok(allocation),
                Err(AllocationError::OutOfMemory(_)) if may_evict => {}
                Err(err) => return Err(err),
            }
        }

        // Evict stale lost-eligible allocations and retry.
        if may_evict {
            let lost_ctx = RequestContext {
                can_make_other_lost: true,
                ..ctx
            };
            for _ in 0..LOST_TRY_COUNT {
                let Some(block) = self.best_lost_candidate(&lost_ctx) else {
                    break;
                };
                let mut metadata = block.metadata().lock();
                // The candidate was judged without the lock held; re-verify.
                let Some(mut request) = metadata.try_create_request(&lost_ctx) else {
                    continue;
                };
                if request.items_to_make_lost > 0
                    && !metadata.make_requested_lost(
                        &mut request,
                        current_frame,
                        self.frame_in_use_count,
                    )
                {
                    continue;
                }
                // Victims are gone; the refreshed request addresses the
                // merged free range.
                let Some(request) = metadata.try_create_request(&ctx) else {
                    continue;
                };
                debug_assert_eq!(request.items_to_make_lost, 0);
                return self.commit(device, budget, &block, &mut metadata, request, &ctx, flags);
            }
        }

        Err(OutOfMemoryError::OutOfDeviceMemory.into())
    }

    /// Free the suballocation at `offset` inside `block`, then lazily
    /// destroy surplus empty blocks.
    pub(crate) fn free(
        &self,
        device: &D,
        budget: &BudgetTracker,
        block: &Arc<MemoryBlock<D>>,
        offset: u64,
        size: u64,
    ) {
        let now_empty = {
            let mut metadata = block.metadata().lock();
            metadata.free_at_offset(offset);
            metadata.is_empty()
        };
        budget.record_free(self.heap_index, size);
        log::trace!(
            "freed {} bytes at {} from block {} of memory type {}",
            size,
            offset,
            block.id(),
            self.memory_type
        );

        if now_empty {
            self.shrink(device, budget);
        }
    }

    /// Destroy the newest surplus empty block, keeping one empty block
    /// around as a reuse buffer while the list stays above its minimum.
    fn shrink(&self, device: &D, budget: &BudgetTracker) {
        let removed = {
            let mut blocks = self.blocks.write();
            if blocks.len() <= self.min_block_count {
                return;
            }
            let empties: Vec<usize> = blocks
                .iter()
                .enumerate()
                .filter(|(_, block)| block.metadata().lock().is_empty())
                .map(|(index, _)| index)
                .collect();
            if empties.len() < 2 {
                return;
            }
            // Newest empty goes first.
            let index = *empties.last().expect("just checked");
            blocks.remove(index)
        };
        self.destroy_block(device, budget, removed);
    }

    pub(crate) fn make_allocations_lost(&self, current_frame: u64) -> usize {
        let blocks = self.blocks.read();
        let mut lost = 0;
        for block in blocks.iter() {
            lost += block
                .metadata()
                .lock()
                .make_allocations_lost(current_frame, self.frame_in_use_count);
        }
        lost
    }

    /// Number of live suballocations across all blocks.
    pub(crate) fn allocation_count(&self) -> usize {
        self.blocks
            .read()
            .iter()
            .map(|block| block.metadata().lock().allocation_count())
            .sum()
    }

    /// (block bytes, bytes in use, block count).
    pub(crate) fn statistics(&self) -> (u64, u64, usize) {
        let blocks = self.blocks.read();
        let mut block_bytes = 0;
        let mut used = 0;
        for block in blocks.iter() {
            let metadata = block.metadata().lock();
            block_bytes += metadata.block_size();
            used += metadata.block_size() - metadata.sum_free_size();
        }
        (block_bytes, used, blocks.len())
    }

    /// Destroy all blocks. Returns the number of leaked suballocations.
    pub(crate) fn dispose(&self, device: &D, budget: &BudgetTracker) -> usize {
        let blocks = std::mem::take(&mut *self.blocks.write());
        let mut leaked = 0;
        for block in blocks {
            leaked += block.metadata().lock().allocation_count();
            self.destroy_block(device, budget, block);
        }
        leaked
    }

    fn try_existing_blocks(
        &self,
        device: &D,
        budget: &BudgetTracker,
        ctx: &RequestContext,
        flags: AllocationCreateFlags,
    ) -> Result<Option<Allocation<D>>, AllocationError> {
        let candidates: Vec<Arc<MemoryBlock<D>>> = {
            let blocks = self.blocks.read();
            let mut candidates: Vec<_> = blocks.iter().cloned().collect();
            match ctx.strategy {
                // Tightest block first keeps fragmentation in the busiest
                // blocks instead of spreading it.
                Strategy::BestFit => {
                    candidates.sort_by_key(|block| block.metadata().lock().sum_free_size());
                }
                Strategy::WorstFit => {
                    candidates.sort_by_key(|block| {
                        std::cmp::Reverse(block.metadata().lock().sum_free_size())
                    });
                }
                Strategy::FirstFit | Strategy::MinOffset => {}
            }
            candidates
        };

        for block in candidates {
            let mut metadata = block.metadata().lock();
            if let Some(request) = metadata.try_create_request(ctx) {
                let allocation =
                    self.commit(device, budget, &block, &mut metadata, request, ctx, flags)?;
                return Ok(Some(allocation));
            }
        }
        Ok(None)
    }

    /// Commit a request against the metadata it was created from, under the
    /// same lock guard.
    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        device: &D,
        budget: &BudgetTracker,
        block: &Arc<MemoryBlock<D>>,
        metadata: &mut BlockMetadata,
        request: Request,
        ctx: &RequestContext,
        flags: AllocationCreateFlags,
    ) -> Result<Allocation<D>, AllocationError> {
        debug_assert_eq!(request.items_to_make_lost, 0);
        let can_become_lost = flags.contains(AllocationCreateFlags::CAN_BECOME_LOST);
        let shared = Arc::new(AllocationShared::new(ctx.current_frame, can_become_lost));
        metadata.alloc(&request, ctx.ty, ctx.size, Arc::clone(&shared));
        #[cfg(debug_assertions)]
        metadata.validate();

        let mut map_count = 0;
        if flags.contains(AllocationCreateFlags::MAPPED) {
            match block.map(device, 1) {
                Ok(_) => map_count = PERSISTENT_MAP,
                Err(err) => {
                    metadata.free_at_offset(request.offset);
                    return Err(err.into());
                }
            }
        }

        budget.record_alloc(self.heap_index, ctx.size);
        log::trace!(
            "placed {} bytes at {} in block {} of memory type {}",
            ctx.size,
            request.offset,
            block.id(),
            self.memory_type
        );

        Ok(Allocation {
            shared,
            payload: AllocationPayload::Block {
                block: Arc::clone(block),
                offset: request.offset,
                ty: ctx.ty,
                pool: self.pool,
            },
            size: ctx.size,
            memory_type: self.memory_type,
            heap_index: self.heap_index,
            map_count,
        })
    }

    fn grow_and_allocate(
        &self,
        device: &D,
        budget: &BudgetTracker,
        ctx: &RequestContext,
        flags: AllocationCreateFlags,
        size: u64,
    ) -> Result<Allocation<D>, AllocationError> {
        let block_size = self.new_block_size(size)?;

        if flags.contains(AllocationCreateFlags::WITHIN_BUDGET)
            && budget.would_exceed(device, self.heap_index, block_size)
        {
            return Err(OutOfMemoryError::OutOfDeviceMemory.into());
        }

        let mut blocks = self.blocks.write();
        if blocks.len() >= self.max_block_count {
            return Err(OutOfMemoryError::OutOfDeviceMemory.into());
        }
        let block = self.create_block(device, budget, block_size)?;

        // Commit before publishing the block so the request can't be raced.
        let result = {
            let mut metadata = block.metadata().lock();
            metadata
                .try_create_request(ctx)
                .ok_or(AllocationError::OutOfMemory(
                    OutOfMemoryError::OutOfDeviceMemory,
                ))
                .and_then(|request| {
                    self.commit(device, budget, &block, &mut metadata, request, ctx, flags)
                })
        };
        match result {
            Ok(allocation) => {
                blocks.push(block);
                Ok(allocation)
            }
            Err(err) => {
                drop(blocks);
                self.destroy_block(device, budget, block);
                Err(err)
            }
        }
    }

    fn new_block_size(&self, size: u64) -> Result<u64, AllocationError> {
        if self.explicit_block_size {
            if size > self.preferred_block_size {
                return Err(OutOfMemoryError::OutOfDeviceMemory.into());
            }
            return Ok(self.preferred_block_size);
        }
        // Oversized requests get a block of their own size, bounded by the
        // huge-allocation limit of an eighth of the heap.
        let huge_bound = (self.heap_size / 8).max(self.preferred_block_size);
        if size > huge_bound {
            return Err(OutOfMemoryError::OutOfDeviceMemory.into());
        }
        Ok(size.max(self.preferred_block_size))
    }

    fn create_block(
        &self,
        device: &D,
        budget: &BudgetTracker,
        block_size: u64,
    ) -> Result<Arc<MemoryBlock<D>>, AllocationError> {
        if budget
            .block_bytes(self.heap_index)
            .saturating_add(block_size)
            > budget.heap_capacity(self.heap_index)
        {
            return Err(OutOfMemoryError::OutOfDeviceMemory.into());
        }
        let raw = unsafe {
            device.allocate(AllocateInfo {
                memory_type: self.memory_type,
                size: block_size,
                dedicated: None,
                device_address: false,
            })
        }?;
        let memory = unsafe { Memory::from_raw(raw, block_size, self.properties) };
        let id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
        budget.record_block_alloc(self.heap_index, block_size);
        log::trace!(
            "new block {} of {} bytes for memory type {}",
            id,
            block_size,
            self.memory_type
        );
        Ok(Arc::new(MemoryBlock::new(
            id,
            self.memory_type,
            memory,
            self.granularity,
            self.debug_margin,
        )))
    }

    fn destroy_block(&self, device: &D, budget: &BudgetTracker, block: Arc<MemoryBlock<D>>) {
        let size = block.memory().size();
        match Arc::try_unwrap(block) {
            Ok(block) => {
                budget.record_block_free(self.heap_index, size);
                log::trace!(
                    "destroyed block of {} bytes of memory type {}",
                    size,
                    self.memory_type
                );
                block.dispose(device);
            }
            Err(block) => {
                // Still referenced by a racing caller; put it back.
                self.blocks.write().push(block);
            }
        }
    }

    /// Cheapest eviction-based candidate across all blocks, judged with
    /// only brief lock holds.
    fn best_lost_candidate(&self, ctx: &RequestContext) -> Option<Arc<MemoryBlock<D>>> {
        let blocks = self.blocks.read();
        let mut best: Option<(u64, Arc<MemoryBlock<D>>)> = None;
        for block in blocks.iter() {
            let request = block.metadata().lock().try_create_request(ctx);
            if let Some(request) = request {
                let cost = request.cost();
                match &best {
                    Some((best_cost, _)) if *best_cost <= cost => {}
                    _ => best = Some((cost, Arc::clone(block))),
                }
                if ctx.strategy == Strategy::FirstFit {
                    break;
                }
            }
        }
        best.map(|(_, block)| block)
    }
}
