//! Free/used bookkeeping of a single memory block.

use std::sync::Arc;

use slab::Slab;

use crate::{
    allocation::AllocationShared,
    util::{align_up, blocks_on_same_page},
};

/// Free ranges smaller than this are kept in the suballocation sequence but
/// not in the by-size index.
pub(crate) const MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER: u64 = 16;

/// Cost of evicting one lost-eligible allocation, used to compare candidate
/// placements that differ in how many victims they require.
pub(crate) const LOST_ALLOCATION_COST: u64 = 1_048_576;

/// Kind of resource occupying a suballocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SuballocationType {
    Free,
    Unknown,
    Buffer,
    ImageUnknown,
    ImageLinear,
    ImageOptimal,
}

/// Whether two resources of these kinds may not share a granularity page.
pub(crate) fn granularity_conflict(a: SuballocationType, b: SuballocationType) -> bool {
    use SuballocationType::*;
    let (a, b) = if a > b { (b, a) } else { (a, b) };
    match (a, b) {
        (Free, _) => false,
        (Unknown, _) => true,
        (Buffer, ImageUnknown) | (Buffer, ImageOptimal) => true,
        (ImageUnknown, ImageUnknown) | (ImageUnknown, ImageLinear) | (ImageUnknown, ImageOptimal) => {
            true
        }
        (ImageLinear, ImageOptimal) => true,
        _ => false,
    }
}

/// Placement strategy inside a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Smallest free range that fits.
    BestFit,
    /// Largest free range first.
    WorstFit,
    /// First range found, cheapest to compute.
    FirstFit,
    /// Lowest offset first. Internal.
    #[allow(dead_code)]
    MinOffset,
}

/// Parameters of one placement query.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RequestContext {
    pub size: u64,
    pub alignment: u64,
    pub ty: SuballocationType,
    pub strategy: Strategy,
    pub can_make_other_lost: bool,
    pub current_frame: u64,
    pub frame_in_use_count: u32,
}

/// A placement candidate produced by [`BlockMetadata::try_create_request`].
/// Valid until the metadata is mutated, except through
/// [`BlockMetadata::make_requested_lost`] which updates it in place.
#[derive(Clone, Debug)]
pub(crate) struct Request {
    pub(crate) node: usize,
    pub(crate) offset: u64,
    pub(crate) sum_free_size: u64,
    pub(crate) sum_item_size: u64,
    pub(crate) items_to_make_lost: usize,
}

impl Request {
    pub(crate) fn cost(&self) -> u64 {
        self.sum_item_size + self.items_to_make_lost as u64 * LOST_ALLOCATION_COST
    }
}

#[derive(Debug)]
struct Suballocation {
    offset: u64,
    size: u64,
    prev: Option<usize>,
    next: Option<usize>,
    ty: SuballocationType,
    alloc: Option<Arc<AllocationShared>>,
}

/// The free/used map of one block: a doubly-linked sequence of
/// suballocations in offset order over slot-allocated nodes, plus an
/// ascending-by-size index of the registered free ranges.
#[derive(Debug)]
pub(crate) struct BlockMetadata {
    block_size: u64,
    granularity: u64,
    debug_margin: u64,
    nodes: Slab<Suballocation>,
    head: usize,
    tail: usize,
    // Keys of registered free nodes, ascending by (size, offset).
    free_index: Vec<usize>,
    sum_free_size: u64,
    alloc_count: usize,
    free_count: usize,
}

impl BlockMetadata {
    pub(crate) fn new(block_size: u64, granularity: u64, debug_margin: u64) -> Self {
        assert!(block_size > 0);
        assert!(granularity.is_power_of_two());

        let mut nodes = Slab::with_capacity(32);
        let root = nodes.insert(Suballocation {
            offset: 0,
            size: block_size,
            prev: None,
            next: None,
            ty: SuballocationType::Free,
            alloc: None,
        });

        let mut metadata = BlockMetadata {
            block_size,
            granularity,
            debug_margin,
            nodes,
            head: root,
            tail: root,
            free_index: Vec::with_capacity(32),
            sum_free_size: block_size,
            alloc_count: 0,
            free_count: 1,
        };
        metadata.register_free(root);
        metadata
    }

    pub(crate) fn block_size(&self) -> u64 {
        self.block_size
    }

    pub(crate) fn sum_free_size(&self) -> u64 {
        self.sum_free_size
    }

    pub(crate) fn allocation_count(&self) -> usize {
        self.alloc_count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.alloc_count == 0
    }

    /// Size of the largest free range.
    pub(crate) fn unused_range_size_max(&self) -> u64 {
        let mut max = 0;
        let mut cur = Some(self.head);
        while let Some(key) = cur {
            let node = &self.nodes[key];
            if node.ty == SuballocationType::Free && node.size > max {
                max = node.size;
            }
            cur = node.next;
        }
        max
    }

    /// Find a placement for the request without mutating anything.
    pub(crate) fn try_create_request(&self, ctx: &RequestContext) -> Option<Request> {
        debug_assert!(ctx.size > 0);
        debug_assert!(ctx.alignment.is_power_of_two());
        debug_assert_ne!(ctx.ty, SuballocationType::Free);

        let min_size = ctx.size + 2 * self.debug_margin;

        if !ctx.can_make_other_lost && self.sum_free_size < min_size {
            return None;
        }

        if !self.free_index.is_empty() {
            match ctx.strategy {
                Strategy::BestFit => {
                    let start = self.leftmost_by_size(min_size);
                    for &key in &self.free_index[start..] {
                        if let Some(request) = self.check_free_placement(key, ctx) {
                            return Some(request);
                        }
                    }
                }
                Strategy::WorstFit | Strategy::FirstFit => {
                    for &key in self.free_index.iter().rev() {
                        if self.nodes[key].size < min_size {
                            break;
                        }
                        if let Some(request) = self.check_free_placement(key, ctx) {
                            return Some(request);
                        }
                    }
                }
                Strategy::MinOffset => {
                    let mut cur = Some(self.head);
                    while let Some(key) = cur {
                        let node = &self.nodes[key];
                        cur = node.next;
                        if node.ty == SuballocationType::Free && node.size >= min_size {
                            if let Some(request) = self.check_free_placement(key, ctx) {
                                return Some(request);
                            }
                        }
                    }
                }
            }
        }

        if ctx.can_make_other_lost {
            // Brute-force scan with eviction: every suballocation is a
            // candidate start, the cheapest (or first) win.
            let mut best: Option<Request> = None;
            let mut cur = Some(self.head);
            while let Some(key) = cur {
                cur = self.nodes[key].next;
                if let Some(request) = self.check_lost_placement(key, ctx) {
                    if ctx.strategy == Strategy::FirstFit {
                        return Some(request);
                    }
                    match &best {
                        Some(current) if current.cost() <= request.cost() => {}
                        _ => best = Some(request),
                    }
                }
            }
            return best;
        }

        None
    }

    /// Commit a request produced by a preceding successful
    /// `try_create_request` with no intervening mutation (other than
    /// `make_requested_lost` on the same request).
    pub(crate) fn alloc(
        &mut self,
        request: &Request,
        ty: SuballocationType,
        size: u64,
        alloc: Arc<AllocationShared>,
    ) {
        debug_assert_ne!(ty, SuballocationType::Free);
        debug_assert!(request.sum_free_size >= size);
        let key = request.node;
        let (node_offset, node_size) = {
            let node = &self.nodes[key];
            debug_assert_eq!(node.ty, SuballocationType::Free);
            debug_assert!(request.offset >= node.offset);
            (node.offset, node.size)
        };
        let padding_begin = request.offset - node_offset;
        debug_assert!(node_size >= padding_begin + size);
        let padding_end = node_size - padding_begin - size;

        self.unregister_free(key);

        {
            let node = &mut self.nodes[key];
            node.offset = request.offset;
            node.size = size;
            node.ty = ty;
            node.alloc = Some(alloc);
        }

        if padding_end > 0 {
            let next = self.nodes[key].next;
            let padding = self.nodes.insert(Suballocation {
                offset: request.offset + size,
                size: padding_end,
                prev: Some(key),
                next,
                ty: SuballocationType::Free,
                alloc: None,
            });
            match next {
                Some(next) => self.nodes[next].prev = Some(padding),
                None => self.tail = padding,
            }
            self.nodes[key].next = Some(padding);
            self.free_count += 1;
            self.register_free(padding);
        }

        if padding_begin > 0 {
            let prev = self.nodes[key].prev;
            let padding = self.nodes.insert(Suballocation {
                offset: node_offset,
                size: padding_begin,
                prev,
                next: Some(key),
                ty: SuballocationType::Free,
                alloc: None,
            });
            match prev {
                Some(prev) => self.nodes[prev].next = Some(padding),
                None => self.head = padding,
            }
            self.nodes[key].prev = Some(padding);
            self.free_count += 1;
            self.register_free(padding);
        }

        self.free_count -= 1;
        self.alloc_count += 1;
        self.sum_free_size -= size;
    }

    /// Flip the suballocation at `offset` back to free and merge with free
    /// neighbours. Panics when no live suballocation starts there.
    pub(crate) fn free_at_offset(&mut self, offset: u64) {
        let mut cur = Some(self.head);
        while let Some(key) = cur {
            let node = &self.nodes[key];
            if node.offset == offset && node.ty != SuballocationType::Free {
                self.free_suballocation(key);
                return;
            }
            cur = node.next;
        }
        panic!("no allocation at offset {offset}");
    }

    /// Evict every stale lost-eligible allocation in the block. Returns the
    /// number of allocations made lost.
    pub(crate) fn make_allocations_lost(
        &mut self,
        current_frame: u64,
        frame_in_use_count: u32,
    ) -> usize {
        let mut victims = Vec::new();
        let mut cur = Some(self.head);
        while let Some(key) = cur {
            let node = &self.nodes[key];
            cur = node.next;
            if node.ty != SuballocationType::Free {
                if let Some(alloc) = &node.alloc {
                    if alloc.can_become_lost() && alloc.make_lost(current_frame, frame_in_use_count)
                    {
                        victims.push(key);
                    }
                }
            }
        }
        let count = victims.len();
        for key in victims {
            self.free_suballocation(key);
        }
        count
    }

    /// Evict the victims of a request whose `items_to_make_lost` is
    /// non-zero, walking forward from the request's node. Fails when any
    /// chosen victim has been touched since the request was created; the
    /// request's node is kept pointing at the merged free range.
    pub(crate) fn make_requested_lost(
        &mut self,
        request: &mut Request,
        current_frame: u64,
        frame_in_use_count: u32,
    ) -> bool {
        let mut remaining = request.items_to_make_lost;
        let mut key = request.node;
        while remaining > 0 {
            if self.nodes[key].ty == SuballocationType::Free {
                key = self.nodes[key]
                    .next
                    .expect("lost request extends past the end of the block");
                continue;
            }
            let eligible = {
                let alloc = self.nodes[key]
                    .alloc
                    .as_ref()
                    .expect("used suballocation without allocation");
                alloc.make_lost(current_frame, frame_in_use_count)
            };
            if !eligible {
                return false;
            }
            key = self.free_suballocation(key);
            request.node = key;
            remaining -= 1;
        }
        debug_assert_eq!(self.nodes[request.node].ty, SuballocationType::Free);
        true
    }

    fn check_free_placement(&self, key: usize, ctx: &RequestContext) -> Option<Request> {
        let node = &self.nodes[key];
        debug_assert_eq!(node.ty, SuballocationType::Free);

        let mut offset = align_up(node.offset + self.debug_margin, ctx.alignment);
        offset = self.bump_past_prev_conflicts(key, offset, ctx.ty);

        let padding_begin = offset - node.offset;
        if padding_begin + ctx.size + self.debug_margin > node.size {
            return None;
        }

        if self.forward_conflict(self.nodes[key].next, offset, ctx.size, ctx.ty) {
            return None;
        }

        Some(Request {
            node: key,
            offset,
            sum_free_size: node.size,
            sum_item_size: 0,
            items_to_make_lost: 0,
        })
    }

    fn check_lost_placement(&self, key: usize, ctx: &RequestContext) -> Option<Request> {
        let node = &self.nodes[key];
        let mut sum_free_size = 0;
        let mut sum_item_size = 0;
        let mut items_to_make_lost = 0;

        if node.ty == SuballocationType::Free {
            sum_free_size = node.size;
        } else {
            let alloc = node.alloc.as_ref()?;
            if alloc.can_become_lost() && alloc.is_stale(ctx.current_frame, ctx.frame_in_use_count) {
                items_to_make_lost += 1;
                sum_item_size += node.size;
            } else {
                return None;
            }
        }

        let mut offset = align_up(node.offset + self.debug_margin, ctx.alignment);
        offset = self.bump_past_prev_conflicts(key, offset, ctx.ty);

        // Past this suballocation entirely; a later one is the right start.
        if offset >= node.offset + node.size {
            return None;
        }

        let padding_begin = offset - node.offset;
        let total_size = padding_begin + ctx.size + self.debug_margin;
        if node.offset + total_size > self.block_size {
            return None;
        }

        // Consume successors until the whole range is covered.
        let mut last = key;
        if total_size > node.size {
            let mut remaining = total_size - node.size;
            while remaining > 0 {
                last = self.nodes[last].next?;
                let spanned = &self.nodes[last];
                if spanned.ty == SuballocationType::Free {
                    sum_free_size += spanned.size;
                } else {
                    let alloc = spanned.alloc.as_ref()?;
                    if alloc.can_become_lost()
                        && alloc.is_stale(ctx.current_frame, ctx.frame_in_use_count)
                    {
                        items_to_make_lost += 1;
                        sum_item_size += spanned.size;
                    } else {
                        return None;
                    }
                }
                remaining = remaining.saturating_sub(spanned.size);
            }
        }

        // A surviving forward granularity conflict is fatal unless the
        // occupant itself can be made lost.
        if self.granularity > 1 {
            let mut cur = self.nodes[last].next;
            while let Some(next_key) = cur {
                let next = &self.nodes[next_key];
                if !blocks_on_same_page(offset, ctx.size, next.offset, self.granularity) {
                    break;
                }
                if granularity_conflict(ctx.ty, next.ty) {
                    let alloc = next.alloc.as_ref()?;
                    if alloc.can_become_lost()
                        && alloc.is_stale(ctx.current_frame, ctx.frame_in_use_count)
                    {
                        items_to_make_lost += 1;
                    } else {
                        return None;
                    }
                }
                cur = next.next;
            }
        }

        Some(Request {
            node: key,
            offset,
            sum_free_size,
            sum_item_size,
            items_to_make_lost,
        })
    }

    /// Walk backward over suballocations sharing a granularity page with
    /// `offset`; a type conflict pushes the offset to the next page.
    fn bump_past_prev_conflicts(&self, key: usize, offset: u64, ty: SuballocationType) -> u64 {
        if self.granularity <= 1 {
            return offset;
        }
        let mut cur = self.nodes[key].prev;
        while let Some(prev_key) = cur {
            let prev = &self.nodes[prev_key];
            if !blocks_on_same_page(prev.offset, prev.size, offset, self.granularity) {
                break;
            }
            if granularity_conflict(prev.ty, ty) {
                return align_up(offset, self.granularity);
            }
            cur = prev.prev;
        }
        offset
    }

    /// Whether any suballocation after the candidate shares its last page
    /// and conflicts in type.
    fn forward_conflict(
        &self,
        mut cur: Option<usize>,
        offset: u64,
        size: u64,
        ty: SuballocationType,
    ) -> bool {
        if self.granularity <= 1 {
            return false;
        }
        while let Some(next_key) = cur {
            let next = &self.nodes[next_key];
            if !blocks_on_same_page(offset, size, next.offset, self.granularity) {
                break;
            }
            if granularity_conflict(ty, next.ty) {
                return true;
            }
            cur = next.next;
        }
        false
    }

    /// Free `key`, merging with free neighbours. Returns the key of the
    /// surviving merged free range.
    fn free_suballocation(&mut self, key: usize) -> usize {
        {
            let node = &mut self.nodes[key];
            debug_assert_ne!(node.ty, SuballocationType::Free);
            self.sum_free_size += node.size;
            node.ty = SuballocationType::Free;
            node.alloc = None;
        }
        self.alloc_count -= 1;
        self.free_count += 1;

        let mut key = key;
        if let Some(next) = self.nodes[key].next {
            if self.nodes[next].ty == SuballocationType::Free {
                self.unregister_free(next);
                self.merge_with_next(key, next);
            }
        }
        if let Some(prev) = self.nodes[key].prev {
            if self.nodes[prev].ty == SuballocationType::Free {
                self.unregister_free(prev);
                self.merge_with_next(prev, key);
                key = prev;
            }
        }
        self.register_free(key);
        key
    }

    /// `a` absorbs its next node `b`.
    fn merge_with_next(&mut self, a: usize, b: usize) {
        debug_assert_eq!(self.nodes[a].next, Some(b));
        let absorbed = self.nodes.remove(b);
        self.free_count -= 1;
        let node = &mut self.nodes[a];
        node.size += absorbed.size;
        node.next = absorbed.next;
        match absorbed.next {
            Some(next) => self.nodes[next].prev = Some(a),
            None => self.tail = a,
        }
    }

    /// Leftmost position in the free index with size at least `size`.
    fn leftmost_by_size(&self, size: u64) -> usize {
        let (Ok(index) | Err(index)) = self.free_index.binary_search_by(|&key| {
            let node = &self.nodes[key];
            (node.size, node.offset).cmp(&(size, 0))
        });
        index
    }

    fn register_free(&mut self, key: usize) {
        let node = &self.nodes[key];
        if node.size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            return;
        }
        let entry = (node.size, node.offset);
        let position = self
            .free_index
            .binary_search_by(|&k| {
                let n = &self.nodes[k];
                (n.size, n.offset).cmp(&entry)
            })
            .unwrap_or_else(|insert_at| insert_at);
        self.free_index.insert(position, key);
    }

    fn unregister_free(&mut self, key: usize) {
        let node = &self.nodes[key];
        if node.size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            return;
        }
        let entry = (node.size, node.offset);
        match self.free_index.binary_search_by(|&k| {
            let n = &self.nodes[k];
            (n.size, n.offset).cmp(&entry)
        }) {
            Ok(position) => {
                debug_assert_eq!(self.free_index[position], key);
                self.free_index.remove(position);
            }
            Err(_) => debug_assert!(false, "registered free range missing from index"),
        }
    }

    /// Confirm every structural invariant. Test and debug builds only.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn validate(&self) {
        let mut offset = 0;
        let mut free_sum = 0;
        let mut free_count = 0;
        let mut alloc_count = 0;
        let mut max_free = 0;
        let mut prev: Option<usize> = None;
        let mut prev_free = false;
        let mut registered = 0;

        let mut cur = Some(self.head);
        while let Some(key) = cur {
            let node = &self.nodes[key];
            assert_eq!(node.offset, offset, "gap or overlap in suballocations");
            assert!(node.size > 0);
            assert_eq!(node.prev, prev);
            if node.ty == SuballocationType::Free {
                assert!(!prev_free, "two adjacent free suballocations");
                assert!(node.alloc.is_none());
                free_sum += node.size;
                free_count += 1;
                max_free = max_free.max(node.size);
                if node.size >= MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
                    registered += 1;
                    assert!(
                        self.free_index.contains(&key),
                        "large free range not registered"
                    );
                }
                prev_free = true;
            } else {
                assert!(node.alloc.is_some());
                alloc_count += 1;
                prev_free = false;
            }
            offset += node.size;
            prev = Some(key);
            cur = node.next;
        }

        assert_eq!(offset, self.block_size);
        assert_eq!(prev, Some(self.tail));
        assert_eq!(free_sum, self.sum_free_size);
        assert_eq!(free_count, self.free_count);
        assert_eq!(alloc_count, self.alloc_count);
        assert_eq!(max_free, self.unused_range_size_max());
        assert_eq!(registered, self.free_index.len());
        for window in self.free_index.windows(2) {
            let a = &self.nodes[window[0]];
            let b = &self.nodes[window[1]];
            assert!((a.size, a.offset) < (b.size, b.offset), "free index unsorted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(size: u64, alignment: u64, ty: SuballocationType) -> RequestContext {
        RequestContext {
            size,
            alignment,
            ty,
            strategy: Strategy::BestFit,
            can_make_other_lost: false,
            current_frame: 0,
            frame_in_use_count: 0,
        }
    }

    fn shared() -> Arc<AllocationShared> {
        Arc::new(AllocationShared::new(0, false))
    }

    fn lost_eligible(frame: u64) -> Arc<AllocationShared> {
        Arc::new(AllocationShared::new(frame, true))
    }

    #[test]
    fn exact_fit_empty_block() {
        let mut metadata = BlockMetadata::new(1024, 1, 0);
        let request = metadata
            .try_create_request(&ctx(1024, 1, SuballocationType::Buffer))
            .unwrap();
        assert_eq!(request.offset, 0);
        metadata.alloc(&request, SuballocationType::Buffer, 1024, shared());
        metadata.validate();
        assert_eq!(metadata.sum_free_size(), 0);
        assert_eq!(metadata.allocation_count(), 1);
    }

    #[test]
    fn best_fit_vs_worst_fit() {
        // Carve out free ranges [0..256), [384..768), [896..1024) with used
        // gaps between them.
        let mut metadata = BlockMetadata::new(1024, 1, 0);
        let mut transient = Vec::new();
        for (size, keep) in [(256u64, false), (128, true), (384, false), (128, true), (128, false)]
        {
            let mut c = ctx(size, 1, SuballocationType::Buffer);
            c.strategy = Strategy::MinOffset;
            let request = metadata.try_create_request(&c).unwrap();
            metadata.alloc(&request, SuballocationType::Buffer, size, shared());
            if !keep {
                transient.push(request.offset);
            }
        }
        for offset in transient {
            metadata.free_at_offset(offset);
        }
        metadata.validate();
        assert_eq!(metadata.sum_free_size(), 256 + 384 + 128);

        // Best fit takes the smallest range that still fits, worst fit the
        // largest one.
        let mut best = ctx(200, 1, SuballocationType::Buffer);
        best.strategy = Strategy::BestFit;
        assert_eq!(metadata.try_create_request(&best).unwrap().offset, 0);

        let mut worst = best;
        worst.strategy = Strategy::WorstFit;
        assert_eq!(metadata.try_create_request(&worst).unwrap().offset, 384);
    }

    #[test]
    fn alignment_padding() {
        let mut metadata = BlockMetadata::new(4096, 1, 0);
        let request = metadata
            .try_create_request(&ctx(100, 256, SuballocationType::Buffer))
            .unwrap();
        assert_eq!(request.offset, 0);
        metadata.alloc(&request, SuballocationType::Buffer, 100, shared());
        metadata.validate();

        let request = metadata
            .try_create_request(&ctx(100, 256, SuballocationType::Buffer))
            .unwrap();
        assert_eq!(request.offset, 256);
        metadata.alloc(&request, SuballocationType::Buffer, 100, shared());
        metadata.validate();
        // Leading free range [100..256) remains.
        assert_eq!(metadata.sum_free_size(), 4096 - 200);
    }

    #[test]
    fn granularity_conflict_bumps_offset() {
        let mut metadata = BlockMetadata::new(4096, 256, 0);
        let request = metadata
            .try_create_request(&ctx(200, 1, SuballocationType::Buffer))
            .unwrap();
        metadata.alloc(&request, SuballocationType::Buffer, 200, shared());

        let request = metadata
            .try_create_request(&ctx(100, 1, SuballocationType::ImageOptimal))
            .unwrap();
        assert_eq!(request.offset, 256);
        metadata.alloc(&request, SuballocationType::ImageOptimal, 100, shared());
        metadata.validate();
    }

    #[test]
    fn compatible_types_share_page() {
        let mut metadata = BlockMetadata::new(4096, 256, 0);
        let request = metadata
            .try_create_request(&ctx(200, 1, SuballocationType::Buffer))
            .unwrap();
        metadata.alloc(&request, SuballocationType::Buffer, 200, shared());

        let request = metadata
            .try_create_request(&ctx(100, 1, SuballocationType::Buffer))
            .unwrap();
        assert_eq!(request.offset, 200);
    }

    #[test]
    fn lost_reclamation() {
        let mut metadata = BlockMetadata::new(3 * 1024, 1, 0);
        for _ in 0..3 {
            let request = metadata
                .try_create_request(&ctx(1024, 1, SuballocationType::Buffer))
                .unwrap();
            metadata.alloc(&request, SuballocationType::Buffer, 1024, lost_eligible(0));
        }
        assert_eq!(metadata.sum_free_size(), 0);

        // Three frames later without touches, eviction becomes possible.
        let mut c = ctx(1024, 1, SuballocationType::Buffer);
        c.can_make_other_lost = true;
        c.current_frame = 3;
        c.frame_in_use_count = 2;
        let mut request = metadata.try_create_request(&c).unwrap();
        assert_eq!(request.items_to_make_lost, 1);
        assert_eq!(request.sum_item_size, 1024);

        assert!(metadata.make_requested_lost(&mut request, 3, 2));
        metadata.alloc(&request, SuballocationType::Buffer, 1024, shared());
        metadata.validate();
        assert_eq!(metadata.allocation_count(), 3);
    }

    #[test]
    fn lost_scan_rejects_recently_used() {
        let mut metadata = BlockMetadata::new(1024, 1, 0);
        let request = metadata
            .try_create_request(&ctx(1024, 1, SuballocationType::Buffer))
            .unwrap();
        metadata.alloc(&request, SuballocationType::Buffer, 1024, lost_eligible(2));

        let mut c = ctx(1024, 1, SuballocationType::Buffer);
        c.can_make_other_lost = true;
        c.current_frame = 3;
        c.frame_in_use_count = 2;
        assert!(metadata.try_create_request(&c).is_none());
    }

    #[test]
    fn make_allocations_lost_is_monotonic() {
        let mut metadata = BlockMetadata::new(2048, 1, 0);
        for _ in 0..2 {
            let request = metadata
                .try_create_request(&ctx(1024, 1, SuballocationType::Buffer))
                .unwrap();
            metadata.alloc(&request, SuballocationType::Buffer, 1024, lost_eligible(0));
        }
        assert_eq!(metadata.make_allocations_lost(1, 2), 0);
        assert_eq!(metadata.make_allocations_lost(5, 2), 2);
        // Idempotent within the frame, monotonic across frames.
        assert_eq!(metadata.make_allocations_lost(5, 2), 0);
        assert_eq!(metadata.make_allocations_lost(9, 2), 0);
        metadata.validate();
        assert!(metadata.is_empty());
        assert_eq!(metadata.sum_free_size(), 2048);
    }

    #[test]
    fn free_merges_neighbours() {
        let mut metadata = BlockMetadata::new(1024, 1, 0);
        let mut offsets = Vec::new();
        for _ in 0..4 {
            let request = metadata
                .try_create_request(&ctx(256, 1, SuballocationType::Buffer))
                .unwrap();
            offsets.push(request.offset);
            metadata.alloc(&request, SuballocationType::Buffer, 256, shared());
        }
        metadata.validate();
        for offset in offsets {
            metadata.free_at_offset(offset);
            metadata.validate();
        }
        assert!(metadata.is_empty());
        assert_eq!(metadata.sum_free_size(), 1024);
        assert_eq!(metadata.unused_range_size_max(), 1024);
    }

    #[test]
    fn alternating_alloc_free_returns_to_canonical_state() {
        let mut metadata = BlockMetadata::new(4096, 1, 0);
        for _ in 0..16 {
            let request = metadata
                .try_create_request(&ctx(768, 64, SuballocationType::Buffer))
                .unwrap();
            let offset = request.offset;
            metadata.alloc(&request, SuballocationType::Buffer, 768, shared());
            metadata.validate();
            metadata.free_at_offset(offset);
            metadata.validate();
        }
        assert!(metadata.is_empty());
        assert_eq!(metadata.sum_free_size(), 4096);
        assert_eq!(metadata.unused_range_size_max(), 4096);
    }

    #[test]
    fn committing_never_increases_free_size() {
        let mut metadata = BlockMetadata::new(4096, 256, 0);
        let before = metadata.sum_free_size();
        let request = metadata
            .try_create_request(&ctx(100, 256, SuballocationType::ImageOptimal))
            .unwrap();
        assert_eq!(request.offset % 256, 0);
        metadata.alloc(&request, SuballocationType::ImageOptimal, 100, shared());
        assert!(metadata.sum_free_size() < before);
        metadata.free_at_offset(request.offset);
        assert_eq!(metadata.sum_free_size(), before);
    }
}
