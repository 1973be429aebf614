bitflags::bitflags! {
    /// Memory property flags of one memory type, mirroring the flags the
    /// graphics API reports for it.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Properties: u32 {
        /// Fastest memory for device access.
        const DEVICE_LOCAL = 0x1;
        /// Memory that can be mapped for host access.
        const HOST_VISIBLE = 0x2;
        /// Host writes don't need explicit flushes, device writes don't need invalidation.
        const HOST_COHERENT = 0x4;
        /// Memory cached on the host side.
        const HOST_CACHED = 0x8;
        /// Memory backed lazily, usable for transient attachments only.
        const LAZILY_ALLOCATED = 0x10;
        /// Memory only accessible by protected operations.
        const PROTECTED = 0x20;
        /// Device-coherent memory (AMD extension).
        const DEVICE_COHERENT_AMD = 0x40;
        /// Device-uncached memory (AMD extension).
        const DEVICE_UNCACHED_AMD = 0x80;
    }
}

/// Memory object wrapper.
/// Contains size and properties of the memory.
#[derive(Debug)]
pub struct Memory<M> {
    raw: M,
    size: u64,
    properties: Properties,
}

impl<M> Memory<M> {
    /// Create memory from a raw object.
    ///
    /// # Safety
    ///
    /// `raw` must be a live device memory object of exactly `size` bytes,
    /// allocated from a memory type with `properties`.
    pub unsafe fn from_raw(raw: M, size: u64, properties: Properties) -> Self {
        Memory {
            raw,
            size,
            properties,
        }
    }

    /// Get memory properties.
    pub fn properties(&self) -> Properties {
        self.properties
    }

    /// Get memory size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get raw memory.
    pub fn raw(&self) -> &M {
        &self.raw
    }

    /// Unwrap raw memory.
    pub fn into_raw(self) -> M {
        self.raw
    }

    /// Check if this memory is host-visible and can be mapped.
    pub fn host_visible(&self) -> bool {
        self.properties.contains(Properties::HOST_VISIBLE)
    }

    /// Check if this memory is host-coherent and doesn't require
    /// invalidating or flushing.
    pub fn host_coherent(&self) -> bool {
        self.properties.contains(Properties::HOST_COHERENT)
    }
}
