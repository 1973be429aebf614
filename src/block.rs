use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::{
    device::Device,
    error::{DeviceError, MappingError},
    memory::Memory,
    metadata::BlockMetadata,
};

#[derive(Debug)]
struct MapState {
    refs: u32,
    ptr: Option<NonNull<u8>>,
}

/// One device memory object subdivided into suballocations.
///
/// The map state lock also serialises resource binds with remaps.
#[derive(Debug)]
pub(crate) struct MemoryBlock<D: Device> {
    id: u64,
    memory_type: u32,
    memory: Memory<D::Memory>,
    metadata: Mutex<BlockMetadata>,
    map_state: Mutex<MapState>,
}

unsafe impl<D: Device> Send for MemoryBlock<D> {}
unsafe impl<D: Device> Sync for MemoryBlock<D> {}

impl<D: Device> MemoryBlock<D> {
    pub(crate) fn new(
        id: u64,
        memory_type: u32,
        memory: Memory<D::Memory>,
        granularity: u64,
        debug_margin: u64,
    ) -> Self {
        let metadata = BlockMetadata::new(memory.size(), granularity, debug_margin);
        MemoryBlock {
            id,
            memory_type,
            memory,
            metadata: Mutex::new(metadata),
            map_state: Mutex::new(MapState { refs: 0, ptr: None }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn memory(&self) -> &Memory<D::Memory> {
        &self.memory
    }

    pub(crate) fn metadata(&self) -> &Mutex<BlockMetadata> {
        &self.metadata
    }

    /// Take `count` mapping references, mapping the underlying memory on the
    /// first one.
    pub(crate) fn map(&self, device: &D, count: u32) -> Result<NonNull<u8>, MappingError> {
        if !self.memory.host_visible() {
            return Err(MappingError::HostInvisible);
        }
        let mut state = self.map_state.lock();
        if count == 0 {
            return state.ptr.ok_or(MappingError::MappingFailed);
        }
        match state.ptr {
            Some(ptr) => {
                state.refs += count;
                Ok(ptr)
            }
            None => {
                let ptr = unsafe { device.map(self.memory.raw()) }?;
                state.refs = count;
                state.ptr = Some(ptr);
                Ok(ptr)
            }
        }
    }

    /// Release `count` mapping references, unmapping on the last one.
    /// Releasing more references than were taken is a misuse.
    pub(crate) fn unmap(&self, device: &D, count: u32) {
        if count == 0 {
            return;
        }
        let mut state = self.map_state.lock();
        assert!(
            state.refs >= count,
            "unmapping a block more times than it was mapped"
        );
        state.refs -= count;
        if state.refs == 0 {
            state.ptr = None;
            unsafe { device.unmap(self.memory.raw()) };
        }
    }

    /// Host pointer at `offset` into the block, if currently mapped.
    pub(crate) fn mapped_ptr(&self, offset: u64) -> Option<NonNull<u8>> {
        debug_assert!(crate::util::fits_usize(offset));
        let state = self.map_state.lock();
        state
            .ptr
            .map(|ptr| unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset as usize)) })
    }

    pub(crate) fn bind_buffer(
        &self,
        device: &D,
        buffer: &D::Buffer,
        offset: u64,
    ) -> Result<(), DeviceError> {
        let _guard = self.map_state.lock();
        unsafe { device.bind_buffer(buffer, self.memory.raw(), offset) }
    }

    pub(crate) fn bind_image(
        &self,
        device: &D,
        image: &D::Image,
        offset: u64,
    ) -> Result<(), DeviceError> {
        let _guard = self.map_state.lock();
        unsafe { device.bind_image(image, self.memory.raw(), offset) }
    }

    /// Release the device memory. The block must no longer host any
    /// suballocation.
    pub(crate) fn dispose(self, device: &D) {
        log::trace!(
            "disposing block {} of memory type {}",
            self.id,
            self.memory_type
        );
        debug_assert!(self.metadata.lock().is_empty());
        let mut state = self.map_state.lock();
        if state.ptr.take().is_some() {
            state.refs = 0;
            unsafe { device.unmap(self.memory.raw()) };
        }
        drop(state);
        unsafe { device.free(self.memory.into_raw()) };
    }
}
