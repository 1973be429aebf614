use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::device::{Device, HeapBudget, MemoryHeapProperties};

/// A fetched budget snapshot goes stale after this many allocation
/// operations.
const OPERATIONS_PER_BUDGET_FETCH: u32 = 30;

/// When the budget extension is absent, assume this much of a heap is
/// usable.
const FALLBACK_BUDGET_NUMERATOR: u64 = 8;
const FALLBACK_BUDGET_DENOMINATOR: u64 = 10;

/// Current usage and budget of one heap as seen by the allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Budget {
    /// Bytes of device memory committed in blocks and dedicated allocations.
    pub block_bytes: u64,

    /// Bytes handed out to live allocations.
    pub allocation_bytes: u64,

    /// Estimated total heap usage of this process, including memory
    /// allocated outside of this allocator when the budget extension
    /// reports it.
    pub usage: u64,

    /// Estimated bytes available before allocations start failing.
    pub budget: u64,
}

#[derive(Debug, Default)]
struct HeapCounters {
    block_bytes: AtomicU64,
    allocation_bytes: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
struct FetchedBudget {
    usage: u64,
    budget: u64,
    block_bytes_at_fetch: u64,
}

/// Per-heap budget accounting. Counters are plain atomics; only the
/// extension snapshot sits behind a lock.
#[derive(Debug)]
pub(crate) struct BudgetTracker {
    counters: Vec<HeapCounters>,
    heaps: Vec<MemoryHeapProperties>,
    heap_size_limits: Vec<Option<u64>>,
    fetched: RwLock<Option<Vec<FetchedBudget>>>,
    operations_since_fetch: AtomicU32,
    use_extension: bool,
}

impl BudgetTracker {
    pub(crate) fn new(
        heaps: Vec<MemoryHeapProperties>,
        heap_size_limits: Vec<Option<u64>>,
        use_extension: bool,
    ) -> Self {
        debug_assert_eq!(heaps.len(), heap_size_limits.len());
        BudgetTracker {
            counters: heaps.iter().map(|_| HeapCounters::default()).collect(),
            heaps,
            heap_size_limits,
            fetched: RwLock::new(None),
            operations_since_fetch: AtomicU32::new(0),
            use_extension,
        }
    }

    pub(crate) fn record_block_alloc(&self, heap: usize, size: u64) {
        self.counters[heap]
            .block_bytes
            .fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn record_block_free(&self, heap: usize, size: u64) {
        self.counters[heap]
            .block_bytes
            .fetch_sub(size, Ordering::Relaxed);
    }

    pub(crate) fn record_alloc(&self, heap: usize, size: u64) {
        self.counters[heap]
            .allocation_bytes
            .fetch_add(size, Ordering::Relaxed);
        self.operations_since_fetch.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self, heap: usize, size: u64) {
        self.counters[heap]
            .allocation_bytes
            .fetch_sub(size, Ordering::Relaxed);
        self.operations_since_fetch.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn block_bytes(&self, heap: usize) -> u64 {
        self.counters[heap].block_bytes.load(Ordering::Relaxed)
    }

    /// Effective heap capacity: the configured limit when one is set,
    /// otherwise the full heap size.
    pub(crate) fn heap_capacity(&self, heap: usize) -> u64 {
        self.heap_size_limits[heap].unwrap_or(self.heaps[heap].size)
    }

    /// Whether committing `size` more bytes on `heap` would exceed its
    /// budget.
    pub(crate) fn would_exceed<D: Device>(&self, device: &D, heap: usize, size: u64) -> bool {
        let budget = self.heap_budget(device, heap);
        budget.usage.saturating_add(size) > budget.budget
    }

    /// Budget of a single heap, refreshing the extension snapshot when it
    /// has gone stale.
    pub(crate) fn heap_budget<D: Device>(&self, device: &D, heap: usize) -> Budget {
        self.refresh_if_stale(device);
        self.heap_budget_no_refresh(heap)
    }

    /// Budgets of all heaps.
    pub(crate) fn budgets<D: Device>(&self, device: &D) -> Vec<Budget> {
        self.refresh_if_stale(device);
        (0..self.heaps.len())
            .map(|heap| self.heap_budget_no_refresh(heap))
            .collect()
    }

    fn heap_budget_no_refresh(&self, heap: usize) -> Budget {
        let block_bytes = self.counters[heap].block_bytes.load(Ordering::Relaxed);
        let allocation_bytes = self.counters[heap]
            .allocation_bytes
            .load(Ordering::Relaxed);

        let fetched = self.fetched.read();
        match fetched.as_ref().and_then(|snapshot| snapshot.get(heap)) {
            Some(snapshot) => Budget {
                block_bytes,
                allocation_bytes,
                // Blocks committed since the fetch shift the reported usage.
                usage: snapshot
                    .usage
                    .saturating_add(block_bytes.saturating_sub(snapshot.block_bytes_at_fetch)),
                budget: snapshot.budget.min(self.heap_capacity(heap)),
            },
            None => Budget {
                block_bytes,
                allocation_bytes,
                usage: block_bytes,
                budget: self.heap_capacity(heap) * FALLBACK_BUDGET_NUMERATOR
                    / FALLBACK_BUDGET_DENOMINATOR,
            },
        }
    }

    fn refresh_if_stale<D: Device>(&self, device: &D) {
        if !self.use_extension {
            return;
        }
        let stale = self.fetched.read().is_none()
            || self.operations_since_fetch.load(Ordering::Relaxed) >= OPERATIONS_PER_BUDGET_FETCH;
        if !stale {
            return;
        }
        if let Some(raw) = device.memory_budget() {
            let snapshot: Vec<FetchedBudget> = raw
                .iter()
                .enumerate()
                .take(self.heaps.len())
                .map(|(heap, HeapBudget { usage, budget })| FetchedBudget {
                    usage: *usage,
                    budget: *budget,
                    block_bytes_at_fetch: self.counters[heap].block_bytes.load(Ordering::Relaxed),
                })
                .collect();
            *self.fetched.write() = Some(snapshot);
            self.operations_since_fetch.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heaps(sizes: &[u64]) -> Vec<MemoryHeapProperties> {
        sizes
            .iter()
            .map(|&size| MemoryHeapProperties { size })
            .collect()
    }

    #[test]
    fn fallback_budget_is_four_fifths_of_heap() {
        let tracker = BudgetTracker::new(heaps(&[1000]), vec![None], false);
        tracker.record_block_alloc(0, 100);
        let budget = tracker.heap_budget_no_refresh(0);
        assert_eq!(budget.usage, 100);
        assert_eq!(budget.budget, 800);
    }

    #[test]
    fn heap_limit_caps_budget() {
        let tracker = BudgetTracker::new(heaps(&[1000]), vec![Some(500)], false);
        let budget = tracker.heap_budget_no_refresh(0);
        assert_eq!(budget.budget, 400);
    }

    #[test]
    fn counters_track_both_directions() {
        let tracker = BudgetTracker::new(heaps(&[1 << 20]), vec![None], false);
        tracker.record_block_alloc(0, 4096);
        tracker.record_alloc(0, 128);
        tracker.record_alloc(0, 256);
        tracker.record_free(0, 128);
        let budget = tracker.heap_budget_no_refresh(0);
        assert_eq!(budget.block_bytes, 4096);
        assert_eq!(budget.allocation_bytes, 256);
    }
}
