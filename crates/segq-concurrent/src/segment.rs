use crate::chain::Chain;
use crate::promise::Promise;
use crate::slot::{AwaiterPlacement, ItemPlacement, Slot};
use crate::sync::{AtomicUsize, Ordering};
use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;
use std::sync::Arc;

pub(crate) enum AddOutcome<T> {
    Added,
    /// The claimed index was past the end; retry against the current tail.
    Overflow(T),
    /// The matched awaiter was canceled; retry with a fresh claim.
    Refused(T),
}

pub(crate) enum TakeOutcome<T> {
    Parked(Arc<Promise<T>>),
    Matched(T),
    Overflow(Arc<Promise<T>>),
}

#[derive(Clone, Copy)]
enum Side {
    Item,
    Awaiter,
}

/// Fixed-capacity block of slots, one link of the chain.
pub(crate) struct Segment<T> {
    sequence: u64,
    item_cursor: CachePadded<AtomicUsize>,
    awaiter_cursor: CachePadded<AtomicUsize>,
    next: ArcSwapOption<Segment<T>>,
    slots: Box<[Slot<T>]>,
}

impl<T> Segment<T> {
    pub(crate) fn new(sequence: u64, capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>();
        Self {
            sequence,
            item_cursor: CachePadded::new(AtomicUsize::new(0)),
            awaiter_cursor: CachePadded::new(AtomicUsize::new(0)),
            next: ArcSwapOption::empty(),
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn is_last(&self, index: usize) -> bool {
        index + 1 == self.capacity()
    }

    pub(crate) fn next(&self) -> Option<Arc<Segment<T>>> {
        self.next.load_full()
    }

    /// Detach the successor, used when tearing the chain down.
    pub(crate) fn unlink(&self) -> Option<Arc<Segment<T>>> {
        self.next.swap(None)
    }

    /// Claimed item indices, clamped to capacity.
    pub(crate) fn item_cursor(&self) -> usize {
        self.item_cursor.load(Ordering::Acquire).min(self.capacity())
    }

    /// Claimed awaiter indices, clamped to capacity.
    pub(crate) fn awaiter_cursor(&self) -> usize {
        self.awaiter_cursor.load(Ordering::Acquire).min(self.capacity())
    }

    pub(crate) fn resident_items(&self) -> usize {
        self.item_cursor().saturating_sub(self.awaiter_cursor())
    }

    /// Parked awaiters in `[item_cursor, awaiter_cursor)` still waiting for an item.
    pub(crate) fn live_awaiters(&self) -> usize {
        (self.item_cursor()..self.awaiter_cursor())
            .filter(|&index| self.slots[index].holds_live_awaiter())
            .count()
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot<T> {
        &self.slots[index]
    }

    pub(crate) fn try_add(&self, item: T, chain: &Chain<T>) -> AddOutcome<T> {
        let index = self.item_cursor.fetch_add(1, Ordering::AcqRel);
        if index >= self.capacity() {
            return AddOutcome::Overflow(item);
        }
        // SAFETY: fetch_add handed out `index` to this claim only.
        let placement = unsafe { self.slots[index].put_item(item) };
        if self.is_last(index) {
            self.grow(Side::Item, placement.arrived_second(), chain);
        }
        match placement {
            ItemPlacement::Parked | ItemPlacement::Delivered => AddOutcome::Added,
            ItemPlacement::Refused(item) => AddOutcome::Refused(item),
        }
    }

    pub(crate) fn try_take(&self, promise: Arc<Promise<T>>, chain: &Chain<T>) -> TakeOutcome<T> {
        let index = self.awaiter_cursor.fetch_add(1, Ordering::AcqRel);
        if index >= self.capacity() {
            return TakeOutcome::Overflow(promise);
        }
        // SAFETY: fetch_add handed out `index` to this claim only.
        let placement = unsafe { self.slots[index].put_awaiter(promise.clone()) };
        if self.is_last(index) {
            self.grow(Side::Awaiter, placement.arrived_second(), chain);
        }
        match placement {
            AwaiterPlacement::Parked => TakeOutcome::Parked(promise),
            AwaiterPlacement::Matched(item) => TakeOutcome::Matched(item),
        }
    }

    /// Runs once per side when that side claims the last index.
    fn grow(&self, side: Side, arrived_second: bool, chain: &Chain<T>) {
        let next = self.ensure_next(chain);
        match side {
            Side::Item => chain.advance_item_tail(&next),
            Side::Awaiter => chain.advance_awaiter_tail(&next),
        }
        if arrived_second {
            chain.advance_head(&next);
        }
    }

    fn ensure_next(&self, chain: &Chain<T>) -> Arc<Segment<T>> {
        if let Some(next) = self.next.load_full() {
            return next;
        }
        let fresh = Arc::new(Segment::new(self.sequence + 1, self.capacity()));
        let previous = self
            .next
            .compare_and_swap(&None::<Arc<Segment<T>>>, Some(fresh.clone()));
        match &*previous {
            Some(existing) => existing.clone(),
            None => {
                chain.record_allocation(&fresh);
                fresh
            }
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn overflowing_claims_are_reported() {
        let chain = Chain::new(2);
        let segment = chain.item_tail();
        assert!(matches!(segment.try_add(1, &chain), AddOutcome::Added));
        assert!(matches!(segment.try_add(2, &chain), AddOutcome::Added));
        match segment.try_add(3, &chain) {
            AddOutcome::Overflow(item) => assert_eq!(item, 3),
            _ => panic!("expected overflow"),
        }
        assert_eq!(segment.item_cursor(), 2);
        assert_eq!(segment.resident_items(), 2);
    }

    #[test]
    fn last_index_links_successor_once() {
        let chain = Chain::new(1);
        let first = chain.item_tail();
        assert!(matches!(first.try_add('x', &chain), AddOutcome::Added));
        let linked = first.next().expect("successor linked");
        assert_eq!(linked.sequence(), first.sequence() + 1);
        assert!(Arc::ptr_eq(&chain.item_tail(), &linked));
        assert!(Arc::ptr_eq(&chain.awaiter_tail(), &first));

        let promise = Promise::with_token(None);
        match first.try_take(promise, &chain) {
            TakeOutcome::Matched(item) => assert_eq!(item, 'x'),
            _ => panic!("expected a match"),
        }
        let again = first.next().expect("successor linked");
        assert!(Arc::ptr_eq(&again, &linked));
        assert!(Arc::ptr_eq(&chain.head(), &linked));
        assert_eq!(chain.segments_allocated(), 2);
    }
}
