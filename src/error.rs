use crate::memory::Properties;

/// Typical memory error - out of available memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OutOfMemoryError {
    /// Host memory exhausted.
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// Device memory exhausted.
    #[error("Out of device memory")]
    OutOfDeviceMemory,
}

/// Unexpected status returned by the graphics API.
/// The raw status code is carried through unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Device error ({0})")]
pub struct DeviceError(pub i32);

/// Possible cause of mapping failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    /// Attempt to map memory without host-visible property.
    #[error("Memory is not HOST_VISIBLE and can't be mapped")]
    HostInvisible,

    /// Attempt to map memory out of bounds.
    #[error("Mapping range is out of bounds")]
    OutOfBounds,

    /// Unable to allocate an appropriately sized contiguous virtual address range.
    #[error("Virtual memory allocation failed")]
    MappingFailed,

    /// Out of either host or device memory.
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemoryError),
}

/// Possible cause of allocation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Malformed caller input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Out of either host or device memory.
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemoryError),

    /// Implementation doesn't allow to create more memory objects.
    #[error("Can't allocate more memory objects")]
    TooManyObjects,

    /// No memory type among the required mask supports the requested properties.
    #[error("Memory type among ({0:#b}) with properties ({1:?}) not found")]
    NoSuitableMemory(u32, Properties),

    /// Error occurred during mapping operation.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Unexpected status from the graphics API.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Failure of a fence wait submitted to the [`WaitScheduler`](crate::WaitScheduler).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The driver reported an error for this fence.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A previous batched wait failed and the scheduler is defunct.
    /// Carries the status that killed it.
    #[error("Wait scheduler is defunct: {0}")]
    Defunct(DeviceError),

    /// The scheduler was disposed while the wait was pending.
    #[error("Wait scheduler was disposed")]
    Disposed,
}

/// Live objects found while disposing of the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Allocator disposed with live objects: {pools} pool(s), {dedicated} dedicated allocation(s), {allocations} block allocation(s)")]
pub struct DisposeError {
    /// User pools not yet destroyed.
    pub pools: usize,

    /// Dedicated allocations not yet freed.
    pub dedicated: usize,

    /// Suballocations not yet freed.
    pub allocations: usize,
}
