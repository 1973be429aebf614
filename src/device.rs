use std::ptr::NonNull;

use crate::{
    error::{AllocationError, DeviceError, MappingError, OutOfMemoryError},
    memory::Properties,
};

bitflags::bitflags! {
    /// Intended usage of a buffer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BufferUsage: u32 {
        /// Source of transfer commands.
        const TRANSFER_SRC = 0x1;
        /// Destination of transfer commands.
        const TRANSFER_DST = 0x2;
        /// Uniform buffer access.
        const UNIFORM = 0x10;
        /// Storage buffer access.
        const STORAGE = 0x20;
        /// Index buffer binding.
        const INDEX = 0x40;
        /// Vertex buffer binding.
        const VERTEX = 0x80;
        /// Indirect command source.
        const INDIRECT = 0x100;
        /// The buffer address may be queried and used in shaders.
        const SHADER_DEVICE_ADDRESS = 0x20000;
    }
}

bitflags::bitflags! {
    /// Intended usage of an image.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ImageUsage: u32 {
        /// Source of transfer commands.
        const TRANSFER_SRC = 0x1;
        /// Destination of transfer commands.
        const TRANSFER_DST = 0x2;
        /// Sampled in shaders.
        const SAMPLED = 0x4;
        /// Storage image access.
        const STORAGE = 0x8;
        /// Color attachment.
        const COLOR_ATTACHMENT = 0x10;
        /// Depth-stencil attachment.
        const DEPTH_STENCIL_ATTACHMENT = 0x20;
        /// Transient attachment, may live in lazily allocated memory.
        const TRANSIENT_ATTACHMENT = 0x40;
    }
}

/// Row layout of image texels in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Tiling {
    /// Implementation-defined layout, fastest for device access.
    Optimal,
    /// Row-major layout, host-accessible.
    Linear,
}

/// Buffer creation info.
#[derive(Clone, Copy, Debug)]
pub struct BufferInfo {
    /// Buffer size.
    pub size: u64,

    /// Buffer usage flags.
    pub usage: BufferUsage,
}

/// Image creation info.
#[derive(Clone, Copy, Debug)]
pub struct ImageInfo {
    /// Extent in texels: width, height, depth.
    pub extent: [u32; 3],

    /// Number of mip levels.
    pub mip_levels: u32,

    /// Number of array layers.
    pub array_layers: u32,

    /// Texel layout.
    pub tiling: Tiling,

    /// Image usage flags.
    pub usage: ImageUsage,
}

/// Memory requirements of a resource, as reported by the extended
/// requirements query.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRequirements {
    /// Required allocation size in bytes.
    pub size: u64,

    /// Required offset alignment. Power of two.
    pub alignment: u64,

    /// Bitmask of memory types the resource may be bound to.
    pub memory_type_bits: u32,

    /// The implementation prefers a dedicated allocation for this resource.
    pub prefers_dedicated: bool,

    /// The implementation requires a dedicated allocation for this resource.
    pub requires_dedicated: bool,
}

/// Resource a dedicated allocation is made for, chained into the
/// device-memory allocation the way the dedicated-allocation extension
/// expects.
#[derive(Debug)]
pub enum DedicatedFor<'a, D: Device + ?Sized> {
    /// The allocation will back this buffer exclusively.
    Buffer(&'a D::Buffer),
    /// The allocation will back this image exclusively.
    Image(&'a D::Image),
}

/// Parameters of one device-memory allocation.
#[derive(Debug)]
pub struct AllocateInfo<'a, D: Device + ?Sized> {
    /// Memory type index to allocate from.
    pub memory_type: u32,

    /// Allocation size in bytes.
    pub size: u64,

    /// Resource this allocation is dedicated to, if any.
    pub dedicated: Option<DedicatedFor<'a, D>>,

    /// Request a device-address-capable allocation.
    pub device_address: bool,
}

/// Status of a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    /// The fence is signaled.
    Signaled,
    /// The fence is not signaled yet.
    Unsignaled,
}

/// Current usage and budget of one memory heap, as reported by the
/// memory-budget extension.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapBudget {
    /// Estimated bytes of the heap currently in use by this process.
    pub usage: u64,

    /// Estimated bytes this process may allocate from the heap before
    /// allocations start to fail or degrade.
    pub budget: u64,
}

/// Properties of one memory type.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryTypeProperties {
    /// Property flags of the type.
    pub properties: Properties,

    /// Index of the heap this type allocates from.
    pub heap_index: u32,
}

/// Properties of one memory heap.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryHeapProperties {
    /// Heap size in bytes.
    pub size: u64,
}

/// Memory properties snapshot of the physical device.
/// This must be fetched from the physical device before creating the allocator.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhysicalProperties {
    /// All memory types, in type-index order.
    pub memory_types: Vec<MemoryTypeProperties>,

    /// All memory heaps, in heap-index order.
    pub memory_heaps: Vec<MemoryHeapProperties>,

    /// Page size at which buffer and image resources must not share a page.
    /// Power of two.
    pub buffer_image_granularity: u64,

    /// Alignment for flush/invalidate ranges on non-coherent memory.
    /// Power of two.
    pub non_coherent_atom_size: u64,

    /// The device is an integrated GPU sharing memory with the host.
    pub integrated_gpu: bool,
}

/// Trait for the low-level graphics API the allocator sits on.
///
/// Implementors wrap the real device and its function table. All handles are
/// opaque to the allocator; `Fence` is a non-owning handle and must be cheap
/// to clone.
pub trait Device: Send + Sync {
    /// Raw device memory object.
    type Memory: std::fmt::Debug + Send + Sync;

    /// Raw buffer object.
    type Buffer: std::fmt::Debug;

    /// Raw image object.
    type Image: std::fmt::Debug;

    /// Raw fence handle.
    type Fence: std::fmt::Debug + Clone + Send + Sync;

    /// Allocate a memory object. Charges the heap of `info.memory_type`.
    ///
    /// # Safety
    ///
    /// `info.memory_type` must be a valid memory type index and resources
    /// referenced by `info.dedicated` must be live.
    unsafe fn allocate(&self, info: AllocateInfo<'_, Self>) -> Result<Self::Memory, AllocationError>;

    /// Free a memory object, returning it to its heap.
    ///
    /// # Safety
    ///
    /// `memory` must not be mapped and no resource may still be bound to it.
    unsafe fn free(&self, memory: Self::Memory);

    /// Map the whole memory object.
    ///
    /// # Safety
    ///
    /// `memory` must be host-visible and not currently mapped.
    unsafe fn map(&self, memory: &Self::Memory) -> Result<NonNull<u8>, MappingError>;

    /// Unmap the memory object.
    ///
    /// # Safety
    ///
    /// `memory` must be mapped, and no pointer into the mapping may be used
    /// after this call.
    unsafe fn unmap(&self, memory: &Self::Memory);

    /// Flush mapped ranges, making host writes available to the device.
    ///
    /// # Safety
    ///
    /// Every range must lie within a currently mapped region of its memory.
    unsafe fn flush<'a>(
        &self,
        regions: impl IntoIterator<Item = (&'a Self::Memory, std::ops::Range<u64>)>,
    ) -> Result<(), OutOfMemoryError>
    where
        Self::Memory: 'a;

    /// Invalidate mapped ranges, making device writes visible to the host.
    ///
    /// # Safety
    ///
    /// Every range must lie within a currently mapped region of its memory.
    unsafe fn invalidate<'a>(
        &self,
        regions: impl IntoIterator<Item = (&'a Self::Memory, std::ops::Range<u64>)>,
    ) -> Result<(), OutOfMemoryError>
    where
        Self::Memory: 'a;

    /// Create a buffer object. No memory is bound to it yet.
    ///
    /// # Safety
    ///
    /// `info.size` must be non-zero.
    unsafe fn create_buffer(&self, info: &BufferInfo) -> Result<Self::Buffer, AllocationError>;

    /// Destroy a buffer object.
    ///
    /// # Safety
    ///
    /// The device must not be using the buffer.
    unsafe fn destroy_buffer(&self, buffer: Self::Buffer);

    /// Query memory requirements of a buffer, including dedicated-allocation
    /// hints.
    fn buffer_requirements(&self, buffer: &Self::Buffer) -> MemoryRequirements;

    /// Bind memory to a buffer at `offset`.
    ///
    /// # Safety
    ///
    /// The range `offset .. offset + requirements.size` must lie within
    /// `memory` and must not be bound to any other live resource.
    unsafe fn bind_buffer(
        &self,
        buffer: &Self::Buffer,
        memory: &Self::Memory,
        offset: u64,
    ) -> Result<(), DeviceError>;

    /// Create an image object. No memory is bound to it yet.
    ///
    /// # Safety
    ///
    /// Extent, mip and layer counts of `info` must be non-zero.
    unsafe fn create_image(&self, info: &ImageInfo) -> Result<Self::Image, AllocationError>;

    /// Destroy an image object.
    ///
    /// # Safety
    ///
    /// The device must not be using the image.
    unsafe fn destroy_image(&self, image: Self::Image);

    /// Query memory requirements of an image, including dedicated-allocation
    /// hints.
    fn image_requirements(&self, image: &Self::Image) -> MemoryRequirements;

    /// Bind memory to an image at `offset`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Device::bind_buffer`].
    unsafe fn bind_image(
        &self,
        image: &Self::Image,
        memory: &Self::Memory,
        offset: u64,
    ) -> Result<(), DeviceError>;

    /// Query the status of a fence without waiting.
    fn fence_status(&self, fence: &Self::Fence) -> Result<FenceStatus, DeviceError>;

    /// Wait for fences. With `wait_all == false` returns as soon as any
    /// fence is signaled. Returns `Ok(false)` on timeout.
    fn wait_for_fences(
        &self,
        fences: &[Self::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<bool, DeviceError>;

    /// Fetch the current per-heap budget, or `None` when the memory-budget
    /// extension is not available.
    fn memory_budget(&self) -> Option<Vec<HeapBudget>> {
        None
    }
}
