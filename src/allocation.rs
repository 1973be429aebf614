use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    block::MemoryBlock,
    device::Device,
    memory::{Memory, Properties},
    metadata::SuballocationType,
    pool::PoolId,
    usage::MemoryUsage,
};

/// Frame index of an allocation that has been reclaimed.
/// Once stored, an allocation never leaves this state.
pub(crate) const FRAME_INDEX_LOST: u64 = u64::MAX;

/// Bit of `map_count` marking a persistently mapped allocation.
/// Acts as one extra mapping reference.
pub(crate) const PERSISTENT_MAP: u32 = 0x8000_0000;

bitflags::bitflags! {
    /// Flags controlling one allocation request.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AllocationCreateFlags: u32 {
        /// Allocate a whole memory object for this allocation alone.
        const DEDICATED_MEMORY = 0x1;
        /// Never create a new memory object; only place within existing blocks.
        const NEVER_ALLOCATE = 0x2;
        /// Map the allocation persistently for its whole lifetime.
        const MAPPED = 0x4;
        /// The allocator may reclaim this allocation when it goes untouched
        /// for more than `frame_in_use_count` frames.
        const CAN_BECOME_LOST = 0x8;
        /// This request may evict stale lost-eligible allocations to make room.
        const CAN_MAKE_OTHER_LOST = 0x10;
        /// Place the allocation at the upper end of its block.
        /// Only meaningful with the linear algorithm.
        const UPPER_ADDRESS = 0x20;
        /// Create the resource but do not bind the allocation to it.
        const DONT_BIND = 0x40;
        /// Fail instead of exceeding the heap budget.
        const WITHIN_BUDGET = 0x80;

        /// Prefer the smallest free range that fits.
        const STRATEGY_BEST_FIT = 0x1_0000;
        /// Prefer the largest free range.
        const STRATEGY_WORST_FIT = 0x2_0000;
        /// Take the first free range that fits.
        const STRATEGY_FIRST_FIT = 0x4_0000;

        /// Alias: minimize memory usage.
        const STRATEGY_MIN_MEMORY = Self::STRATEGY_BEST_FIT.bits();
        /// Alias: minimize allocation time.
        const STRATEGY_MIN_TIME = Self::STRATEGY_FIRST_FIT.bits();
        /// Alias: minimize fragmentation.
        const STRATEGY_MIN_FRAGMENTATION = Self::STRATEGY_WORST_FIT.bits();
    }
}

impl AllocationCreateFlags {
    pub(crate) const STRATEGY_MASK: AllocationCreateFlags = AllocationCreateFlags::STRATEGY_BEST_FIT
        .union(AllocationCreateFlags::STRATEGY_WORST_FIT)
        .union(AllocationCreateFlags::STRATEGY_FIRST_FIT);
}

/// Parameters of an allocation request.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocationCreateInfo {
    /// Request flags.
    pub flags: AllocationCreateFlags,

    /// Intended memory usage.
    pub usage: MemoryUsage,

    /// Property flags the chosen memory type must have.
    pub required_flags: Properties,

    /// Property flags the chosen memory type should have.
    pub preferred_flags: Properties,

    /// Restrict candidate memory types to this mask. Zero means no
    /// restriction.
    pub memory_type_bits: u32,

    /// Allocate from this pool instead of the default block lists.
    pub pool: Option<PoolId>,
}

/// State shared between a client-held [`Allocation`] and the suballocation
/// record inside its block, so that a racing touch and a racing make-lost
/// cannot both succeed.
#[derive(Debug)]
pub(crate) struct AllocationShared {
    last_use_frame: AtomicU64,
    can_become_lost: bool,
}

impl AllocationShared {
    pub(crate) fn new(current_frame: u64, can_become_lost: bool) -> Self {
        AllocationShared {
            last_use_frame: AtomicU64::new(current_frame),
            can_become_lost,
        }
    }

    pub(crate) fn can_become_lost(&self) -> bool {
        self.can_become_lost
    }

    pub(crate) fn last_use_frame(&self) -> u64 {
        self.last_use_frame.load(Ordering::Acquire)
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.last_use_frame() == FRAME_INDEX_LOST
    }

    /// Record use in `current_frame`. Returns `false` if the allocation is
    /// already lost.
    pub(crate) fn touch(&self, current_frame: u64) -> bool {
        let mut last = self.last_use_frame.load(Ordering::Acquire);
        loop {
            if last == FRAME_INDEX_LOST {
                return false;
            }
            match self.last_use_frame.compare_exchange_weak(
                last,
                current_frame,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }

    /// Whether the allocation has gone untouched long enough to be evicted.
    pub(crate) fn is_stale(&self, current_frame: u64, frame_in_use_count: u32) -> bool {
        let last = self.last_use_frame();
        last != FRAME_INDEX_LOST && last.saturating_add(frame_in_use_count as u64) < current_frame
    }

    /// Transition to lost. Fails if the allocation was touched within the
    /// last `frame_in_use_count` frames or is already lost.
    pub(crate) fn make_lost(&self, current_frame: u64, frame_in_use_count: u32) -> bool {
        debug_assert!(self.can_become_lost);
        let mut last = self.last_use_frame.load(Ordering::Acquire);
        loop {
            if last == FRAME_INDEX_LOST {
                return false;
            }
            if last.saturating_add(frame_in_use_count as u64) >= current_frame {
                return false;
            }
            match self.last_use_frame.compare_exchange_weak(
                last,
                FRAME_INDEX_LOST,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum AllocationPayload<D: Device> {
    /// Suballocated region of a shared block.
    Block {
        block: Arc<MemoryBlock<D>>,
        offset: u64,
        ty: SuballocationType,
        pool: Option<PoolId>,
    },
    /// Whole memory object owned by this allocation.
    Dedicated {
        memory: Memory<D::Memory>,
        ptr: Option<NonNull<u8>>,
        id: u64,
    },
}

/// A committed memory region handed to the caller.
///
/// Free it with [`Allocator::free_memory`](crate::Allocator::free_memory);
/// dropping an unfreed allocation leaks its region and is reported when the
/// allocator is disposed.
#[derive(Debug)]
pub struct Allocation<D: Device> {
    pub(crate) shared: Arc<AllocationShared>,
    pub(crate) payload: AllocationPayload<D>,
    pub(crate) size: u64,
    pub(crate) memory_type: u32,
    pub(crate) heap_index: usize,
    pub(crate) map_count: u32,
}

unsafe impl<D: Device> Send for Allocation<D> where D::Memory: Send {}
unsafe impl<D: Device> Sync for Allocation<D> where D::Memory: Sync {}

impl<D: Device> Allocation<D> {
    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Memory type index the region was placed in.
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// Offset within the underlying memory object. Always zero for
    /// dedicated allocations.
    pub fn offset(&self) -> u64 {
        match self.payload {
            AllocationPayload::Block { offset, .. } => offset,
            AllocationPayload::Dedicated { .. } => 0,
        }
    }

    /// Whether this allocation owns its whole memory object.
    pub fn is_dedicated(&self) -> bool {
        matches!(self.payload, AllocationPayload::Dedicated { .. })
    }

    /// Whether the allocation has been reclaimed.
    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    /// Host pointer to the start of the region, if currently mapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        match &self.payload {
            AllocationPayload::Dedicated { ptr, .. } => *ptr,
            AllocationPayload::Block { block, offset, .. } => block.mapped_ptr(*offset),
        }
    }

    pub(crate) fn properties(&self) -> Properties {
        match &self.payload {
            AllocationPayload::Dedicated { memory, .. } => memory.properties(),
            AllocationPayload::Block { block, .. } => block.memory().properties(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_updates_frame() {
        let shared = AllocationShared::new(5, true);
        assert!(shared.touch(7));
        assert_eq!(shared.last_use_frame(), 7);
    }

    #[test]
    fn make_lost_requires_staleness() {
        let shared = AllocationShared::new(5, true);
        // Frame 6 with two frames of protection: still in use.
        assert!(!shared.make_lost(6, 2));
        assert!(!shared.is_lost());
        // Frame 8: 5 + 2 < 8, eviction allowed.
        assert!(shared.make_lost(8, 2));
        assert!(shared.is_lost());
    }

    #[test]
    fn lost_is_terminal() {
        let shared = AllocationShared::new(0, true);
        assert!(shared.make_lost(10, 2));
        assert!(!shared.touch(11));
        assert!(!shared.make_lost(20, 2));
        assert_eq!(shared.last_use_frame(), FRAME_INDEX_LOST);
    }
}
