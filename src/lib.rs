//! GPU memory suballocation.
//!
//! Low-level graphics APIs hand out device memory in a bounded number of
//! coarse heap allocations; real workloads need thousands of fine-grained
//! regions for their buffers and images. This crate amortizes a small number
//! of large device allocations ("blocks") into many client allocations with
//! predictable fragmentation behaviour, honouring alignment, buffer/image
//! page granularity and dedicated-allocation requirements along the way.
//!
//! The graphics API itself is abstracted behind the [`Device`] trait; the
//! [`Allocator`] sits on top of it. A [`WaitScheduler`] batches fence waits
//! onto a single background thread so completion of GPU work can be awaited
//! without one blocked OS thread per waiter.

#![deny(unused_must_use)]
#![warn(missing_docs)]

mod allocation;
mod allocator;
mod block;
mod block_list;
mod budget;
mod device;
mod error;
mod mapping;
mod memory;
mod metadata;
mod pool;
mod usage;
mod util;
mod utilization;
mod wait;

pub use crate::{
    allocation::{Allocation, AllocationCreateFlags, AllocationCreateInfo},
    allocator::{Allocator, AllocatorCreateFlags, AllocatorCreateInfo},
    budget::Budget,
    device::{
        AllocateInfo, BufferInfo, BufferUsage, DedicatedFor, Device, FenceStatus, HeapBudget,
        ImageInfo, ImageUsage, MemoryHeapProperties, MemoryRequirements, MemoryTypeProperties,
        PhysicalProperties, Tiling,
    },
    error::{
        AllocationError, DeviceError, DisposeError, MappingError, OutOfMemoryError, WaitError,
    },
    memory::{Memory, Properties},
    pool::{Pool, PoolCreateFlags, PoolCreateInfo, PoolId},
    usage::MemoryUsage,
    utilization::{
        MemoryHeapUtilization, MemoryTypeUtilization, MemoryUtilization, TotalMemoryUtilization,
    },
    wait::{WaitHandle, WaitScheduler},
};
