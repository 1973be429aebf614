//! Host-access plumbing: range arithmetic for flushing and invalidating
//! mapped memory.

use std::ops::Range;

use crate::util::{align_down, align_up};

/// Absolute device-memory range to pass to a flush or invalidate for the
/// sub-range `offset..offset + size` of an allocation, aligned out to the
/// non-coherent atom size and clamped to the underlying memory object.
///
/// Returns `None` when the sub-range is empty. `u64::MAX` as `size` means
/// "to the end of the allocation".
pub(crate) fn flush_range(
    alloc_offset: u64,
    alloc_size: u64,
    memory_size: u64,
    atom: u64,
    offset: u64,
    size: u64,
) -> Option<Range<u64>> {
    debug_assert!(atom.is_power_of_two());
    if offset >= alloc_size || size == 0 {
        return None;
    }
    let size = size.min(alloc_size - offset);

    let start = align_down(alloc_offset + offset, atom);
    let end = align_up(alloc_offset + offset + size, atom).min(memory_size);
    debug_assert!(start < end);
    Some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_allocation() {
        // Allocation [256..768) in a 1024-byte block, atom 64.
        let range = flush_range(256, 512, 1024, 64, 0, u64::MAX).unwrap();
        assert_eq!(range, 256..768);
    }

    #[test]
    fn subrange_is_aligned_out() {
        let range = flush_range(256, 512, 1024, 64, 10, 20).unwrap();
        assert_eq!(range, 256..320);
    }

    #[test]
    fn end_clamps_to_memory_size() {
        let range = flush_range(960, 64, 1000, 64, 0, u64::MAX).unwrap();
        assert_eq!(range, 960..1000);
    }

    #[test]
    fn empty_subrange_is_none() {
        assert!(flush_range(0, 512, 1024, 64, 512, u64::MAX).is_none());
        assert!(flush_range(0, 512, 1024, 64, 0, 0).is_none());
    }
}
