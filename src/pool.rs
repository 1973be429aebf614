bitflags::bitflags! {
    /// Flags of a user pool.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct PoolCreateFlags: u32 {
        /// Treat the buffer-image granularity as 1 inside this pool.
        /// Valid when the pool only ever hosts one side of the conflict
        /// table.
        const IGNORE_BUFFER_IMAGE_GRANULARITY = 0x1;
        /// Use the linear (ring-buffer) placement algorithm.
        /// Not wired to an alternative metadata engine.
        const LINEAR_ALGORITHM = 0x2;
        /// Use the buddy placement algorithm.
        /// Not wired to an alternative metadata engine.
        const BUDDY_ALGORITHM = 0x4;
    }
}

/// Parameters of a user pool.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolCreateInfo {
    /// Memory type index all blocks of the pool are allocated from.
    pub memory_type: u32,

    /// Pool flags.
    pub flags: PoolCreateFlags,

    /// Size of each block. Zero picks the default block size of the memory
    /// type.
    pub block_size: u64,

    /// Blocks created eagerly and never destroyed.
    pub min_block_count: usize,

    /// Hard cap on the number of blocks. Zero means unbounded.
    pub max_block_count: usize,

    /// Overrides the allocator-wide frame-in-use count for lost-eligible
    /// allocations placed in this pool.
    pub frame_in_use_count: u32,
}

impl Default for PoolCreateInfo {
    fn default() -> Self {
        PoolCreateInfo {
            memory_type: 0,
            flags: PoolCreateFlags::empty(),
            block_size: 0,
            min_block_count: 0,
            max_block_count: 0,
            frame_in_use_count: 0,
        }
    }
}

/// Identifier of a user pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolId(pub(crate) u64);

/// Handle to a user pool. Destroy it with
/// [`Allocator::destroy_pool`](crate::Allocator::destroy_pool).
#[derive(Debug)]
pub struct Pool {
    pub(crate) id: PoolId,
}

impl Pool {
    /// Identifier to reference this pool from an
    /// [`AllocationCreateInfo`](crate::AllocationCreateInfo).
    pub fn id(&self) -> PoolId {
        self.id
    }
}
