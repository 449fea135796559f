use crate::segment::Segment;
use crate::sync::{AtomicUsize, Ordering};
use arc_swap::ArcSwap;
use crossbeam_utils::CachePadded;
use metrics::counter;
use std::sync::Arc;
use tracing::debug;

/// The three chain pointers plus bookkeeping shared by every segment.
///
/// `head <= awaiter_tail, item_tail` in sequence order at quiescence; all three
/// only ever move to a segment with a higher sequence number.
pub(crate) struct Chain<T> {
    head: CachePadded<ArcSwap<Segment<T>>>,
    item_tail: CachePadded<ArcSwap<Segment<T>>>,
    awaiter_tail: CachePadded<ArcSwap<Segment<T>>>,
    capacity: usize,
    allocated: AtomicUsize,
}

impl<T> Chain<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let first = Arc::new(Segment::new(0, capacity));
        Self {
            head: CachePadded::new(ArcSwap::new(first.clone())),
            item_tail: CachePadded::new(ArcSwap::new(first.clone())),
            awaiter_tail: CachePadded::new(ArcSwap::new(first)),
            capacity,
            allocated: AtomicUsize::new(1),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn head(&self) -> Arc<Segment<T>> {
        self.head.load_full()
    }

    pub(crate) fn item_tail(&self) -> Arc<Segment<T>> {
        self.item_tail.load_full()
    }

    pub(crate) fn awaiter_tail(&self) -> Arc<Segment<T>> {
        self.awaiter_tail.load_full()
    }

    pub(crate) fn segments_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn record_allocation(&self, segment: &Segment<T>) {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        counter!("segq_segments_allocated").increment(1);
        debug!(
            sequence = segment.sequence(),
            capacity = self.capacity,
            "linked new segment"
        );
    }

    pub(crate) fn advance_item_tail(&self, to: &Arc<Segment<T>>) {
        advance(&self.item_tail, to);
    }

    pub(crate) fn advance_awaiter_tail(&self, to: &Arc<Segment<T>>) {
        advance(&self.awaiter_tail, to);
    }

    pub(crate) fn advance_head(&self, to: &Arc<Segment<T>>) {
        if advance(&self.head, to) {
            debug!(sequence = to.sequence(), "head advanced past drained segment");
        }
    }

    /// Segments reachable from `head`, stopping where `next` is unset.
    pub(crate) fn segments(&self) -> Segments<T> {
        Segments {
            next: Some(self.head()),
        }
    }

    /// Items added but not yet handed to a consumer. Weakly consistent.
    pub(crate) fn count(&self) -> usize {
        self.segments().map(|segment| segment.resident_items()).sum()
    }

    /// Suspended consumers that are neither matched nor canceled. Weakly consistent.
    ///
    /// Parked promises whose token has fired are canceled by the scan and left out.
    pub(crate) fn awaiter_count(&self) -> usize {
        self.segments()
            .map(|segment| segment.live_awaiters())
            .sum()
    }

    /// Break every `next` link so dropping a long chain does not recurse.
    pub(crate) fn unlink_all(&self) {
        let mut cursor = Some(self.head());
        while let Some(segment) = cursor {
            cursor = segment.unlink();
        }
    }
}

/// Move `pointer` forward to `to`, unless it already sits at or past it.
fn advance<T>(pointer: &ArcSwap<Segment<T>>, to: &Arc<Segment<T>>) -> bool {
    loop {
        let current = pointer.load();
        if current.sequence() >= to.sequence() {
            return false;
        }
        let previous = pointer.compare_and_swap(&current, to.clone());
        if Arc::ptr_eq(&previous, &current) {
            return true;
        }
    }
}

pub(crate) struct Segments<T> {
    next: Option<Arc<Segment<T>>>,
}

impl<T> Iterator for Segments<T> {
    type Item = Arc<Segment<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.next();
        Some(current)
    }
}
