use crate::promise::Promise;
use crate::sync::{AtomicU8, Ordering};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use crossbeam_utils::Backoff;
use std::sync::Arc;

const EMPTY: u8 = 0;
const HAS_ITEM: u8 = 1;
const HAS_AWAITER: u8 = 2;
const INSPECTING: u8 = 3;
const RETIRED: u8 = 4;
const COUNTING: u8 = 5;

/// Result of placing an item into its claimed slot.
#[derive(Debug)]
pub(crate) enum ItemPlacement<T> {
    /// Arrived first; the item waits for the matching awaiter-claim.
    Parked,
    /// Arrived second; the waiting awaiter received the item.
    Delivered,
    /// Arrived second, but the waiting awaiter had been canceled.
    Refused(T),
}

impl<T> ItemPlacement<T> {
    pub(crate) fn arrived_second(&self) -> bool {
        !matches!(self, ItemPlacement::Parked)
    }
}

/// Result of placing an awaiter into its claimed slot.
#[derive(Debug)]
pub(crate) enum AwaiterPlacement<T> {
    /// Arrived first; the promise waits for the matching item-claim.
    Parked,
    /// Arrived second; the waiting item is handed over.
    Matched(T),
}

impl<T> AwaiterPlacement<T> {
    pub(crate) fn arrived_second(&self) -> bool {
        matches!(self, AwaiterPlacement::Matched(_))
    }
}

/// Rendezvous cell for exactly one item-claim and one awaiter-claim.
///
/// Whichever claimant arrives first publishes its payload with a CAS out of
/// `EMPTY`; the second one finds the CAS failing, consumes the other payload
/// and retires the slot. Readers briefly hold a parked item in `INSPECTING`
/// and a parked awaiter in `COUNTING`; the second claimant waits them out.
pub(crate) struct Slot<T> {
    state: AtomicU8,
    item: UnsafeCell<MaybeUninit<T>>,
    awaiter: UnsafeCell<MaybeUninit<Arc<Promise<T>>>>,
}

// Safety: each cell is written by its single claimant before the publishing
// CAS and read by the other claimant only after observing that state.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            item: UnsafeCell::new(MaybeUninit::uninit()),
            awaiter: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// # Safety
    ///
    /// The caller must hold the unique item-claim for this slot.
    pub(crate) unsafe fn put_item(&self, item: T) -> ItemPlacement<T> {
        unsafe { (*self.item.get()).write(item) };
        match self
            .state
            .compare_exchange(EMPTY, HAS_ITEM, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => ItemPlacement::Parked,
            Err(state) => {
                self.retire_awaiter(state);
                // SAFETY: the CAS failed, so the item was never published and is still ours.
                let item = unsafe { (*self.item.get()).assume_init_read() };
                // SAFETY: HAS_AWAITER -> RETIRED was won with Acquire; the awaiter-claim
                // and counters never touch the cell again.
                let awaiter = unsafe { (*self.awaiter.get()).assume_init_read() };
                match awaiter.try_set_result(item) {
                    Ok(()) => ItemPlacement::Delivered,
                    Err(item) => ItemPlacement::Refused(item),
                }
            }
        }
    }

    /// Move a parked awaiter to `RETIRED`, waiting out a concurrent count.
    fn retire_awaiter(&self, mut state: u8) {
        let backoff = Backoff::new();
        loop {
            match state {
                HAS_AWAITER => match self.state.compare_exchange_weak(
                    HAS_AWAITER,
                    RETIRED,
                    Ordering::Acquire,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => state = actual,
                },
                COUNTING => {
                    backoff.snooze();
                    state = self.state.load(Ordering::Acquire);
                }
                other => panic!("item-claim found slot in state {other}"),
            }
        }
    }

    /// # Safety
    ///
    /// The caller must hold the unique awaiter-claim for this slot.
    pub(crate) unsafe fn put_awaiter(&self, awaiter: Arc<Promise<T>>) -> AwaiterPlacement<T> {
        unsafe { (*self.awaiter.get()).write(awaiter) };
        let mut state = match self
            .state
            .compare_exchange(EMPTY, HAS_AWAITER, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return AwaiterPlacement::Parked,
            Err(state) => state,
        };

        // SAFETY: the CAS failed, so our promise handle was never published.
        drop(unsafe { (*self.awaiter.get()).assume_init_read() });

        let backoff = Backoff::new();
        loop {
            match state {
                HAS_ITEM => match self.state.compare_exchange_weak(
                    HAS_ITEM,
                    RETIRED,
                    Ordering::Acquire,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: HAS_ITEM -> RETIRED won with Acquire; the item is ours.
                        let item = unsafe { (*self.item.get()).assume_init_read() };
                        return AwaiterPlacement::Matched(item);
                    }
                    Err(actual) => state = actual,
                },
                INSPECTING => {
                    backoff.snooze();
                    state = self.state.load(Ordering::Acquire);
                }
                other => panic!("awaiter-claim found slot in state {other}"),
            }
        }
    }

    /// Clone the parked item, if the slot still holds one.
    ///
    /// Spins while the slot is claimed but not yet published, or while another
    /// reader is inspecting it.
    pub(crate) fn clone_item(&self) -> Option<T>
    where
        T: Clone,
    {
        let backoff = Backoff::new();
        loop {
            match self.state.load(Ordering::Acquire) {
                EMPTY | INSPECTING => backoff.snooze(),
                HAS_ITEM => {
                    if self
                        .state
                        .compare_exchange_weak(HAS_ITEM, INSPECTING, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        let _guard = RestoreGuard::new(&self.state, HAS_ITEM);
                        // SAFETY: INSPECTING blocks the awaiter-claim from moving the item out.
                        let item = unsafe { (*self.item.get()).assume_init_ref() };
                        return Some(item.clone());
                    }
                }
                _ => return None,
            }
        }
    }

    /// Whether the slot holds a parked awaiter that is neither matched nor
    /// canceled. A promise whose token has fired is canceled on the way.
    pub(crate) fn holds_live_awaiter(&self) -> bool {
        let backoff = Backoff::new();
        loop {
            match self.state.load(Ordering::Acquire) {
                EMPTY | COUNTING => backoff.snooze(),
                HAS_AWAITER => {
                    if self
                        .state
                        .compare_exchange_weak(HAS_AWAITER, COUNTING, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        let _guard = RestoreGuard::new(&self.state, HAS_AWAITER);
                        // SAFETY: COUNTING keeps the item-claim from moving the handle out.
                        let awaiter = unsafe { (*self.awaiter.get()).assume_init_ref() };
                        return !awaiter.is_canceled();
                    }
                }
                _ => return false,
            }
        }
    }
}

/// Puts a slot back into its parked state after a read, including on unwind.
struct RestoreGuard<'a> {
    state: &'a AtomicU8,
    parked: u8,
}

impl<'a> RestoreGuard<'a> {
    fn new(state: &'a AtomicU8, parked: u8) -> Self {
        Self { state, parked }
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.state.store(self.parked, Ordering::Release);
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        match self.state.load(Ordering::Acquire) {
            // SAFETY: exclusive access; the parked payload was never consumed.
            HAS_ITEM | INSPECTING => unsafe { self.item.get_mut().assume_init_drop() },
            HAS_AWAITER | COUNTING => unsafe { self.awaiter.get_mut().assume_init_drop() },
            _ => {}
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn promise() -> Arc<Promise<String>> {
        Promise::new(CancellationToken::new())
    }

    #[test]
    fn item_first_is_taken_by_awaiter() {
        let slot = Slot::new();
        let placed = unsafe { slot.put_item("a".to_string()) };
        assert!(matches!(placed, ItemPlacement::Parked));
        assert!(!placed.arrived_second());
        match unsafe { slot.put_awaiter(promise()) } {
            AwaiterPlacement::Matched(item) => assert_eq!(item, "a"),
            AwaiterPlacement::Parked => panic!("expected a match"),
        }
    }

    #[test]
    fn awaiter_first_is_resolved_by_item() {
        let slot = Slot::new();
        let waiting = promise();
        let placed = unsafe { slot.put_awaiter(waiting.clone()) };
        assert!(matches!(placed, AwaiterPlacement::Parked));
        let delivered = unsafe { slot.put_item("b".to_string()) };
        assert!(matches!(delivered, ItemPlacement::Delivered));
        assert!(waiting.is_resolved());
        assert_eq!(Arc::strong_count(&waiting), 1);
    }

    #[test]
    fn canceled_awaiter_refuses_item() {
        let slot = Slot::new();
        let waiting = promise();
        unsafe { slot.put_awaiter(waiting.clone()) };
        waiting.cancel();
        match unsafe { slot.put_item("c".to_string()) } {
            ItemPlacement::Refused(item) => assert_eq!(item, "c"),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn clone_item_leaves_item_in_place() {
        let slot = Slot::new();
        unsafe { slot.put_item(vec![1, 2, 3]) };
        assert_eq!(slot.clone_item(), Some(vec![1, 2, 3]));
        match unsafe { slot.put_awaiter(Promise::new(CancellationToken::new())) } {
            AwaiterPlacement::Matched(item) => assert_eq!(item, vec![1, 2, 3]),
            AwaiterPlacement::Parked => panic!("expected a match"),
        }
        assert_eq!(slot.clone_item(), None);
    }

    #[test]
    fn fired_token_makes_parked_awaiter_dead() {
        let token = CancellationToken::new();
        let slot = Slot::new();
        let waiting = Promise::<String>::new(token.clone());
        unsafe { slot.put_awaiter(waiting.clone()) };
        assert!(slot.holds_live_awaiter());
        token.cancel();
        assert!(!slot.holds_live_awaiter());
        assert!(waiting.is_canceled());
        match unsafe { slot.put_item("d".to_string()) } {
            ItemPlacement::Refused(item) => assert_eq!(item, "d"),
            other => panic!("expected refusal, got {other:?}"),
        }
        assert!(!slot.holds_live_awaiter());
    }

    #[test]
    fn parked_item_is_not_an_awaiter() {
        let slot = Slot::new();
        unsafe { slot.put_item(1u8) };
        assert!(!slot.holds_live_awaiter());
    }

    #[test]
    fn dropping_slot_releases_parked_payloads() {
        let marker = Arc::new(());
        let slot = Slot::new();
        unsafe { slot.put_item(marker.clone()) };
        drop(slot);
        assert_eq!(Arc::strong_count(&marker), 1);

        let waiting = Promise::<u8>::new(CancellationToken::new());
        let slot = Slot::new();
        unsafe { slot.put_awaiter(waiting.clone()) };
        drop(slot);
        assert_eq!(Arc::strong_count(&waiting), 1);
    }
}
