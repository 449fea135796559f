use crate::sync::{AtomicU8, Ordering};
use core::cell::UnsafeCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::task::AtomicWaker;
use segq_core::TakeError;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::trace;

const PENDING: u8 = 0;
const SETTING: u8 = 1;
const RESOLVED: u8 = 2;
const CANCELED: u8 = 3;
const CONSUMED: u8 = 4;

/// Single-assignment, cancellable hand-off cell for one suspended consumer.
///
/// Exactly one of [`Promise::try_set_result`] and [`Promise::cancel`] wins.
/// A value set before cancellation is kept; a cancellation observed before
/// the value is set makes the setter get its value back.
pub struct Promise<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
    waker: AtomicWaker,
    token: Option<CancellationToken>,
}

// Safety: `value` is written only by the thread that wins PENDING -> SETTING and
// read only by the thread that wins RESOLVED -> CONSUMED.
unsafe impl<T: Send> Send for Promise<T> {}
unsafe impl<T: Send> Sync for Promise<T> {}

impl<T> Promise<T> {
    /// Create a promise that cancels itself once `token` fires.
    pub fn new(token: CancellationToken) -> Arc<Self> {
        Self::with_token(Some(token))
    }

    pub(crate) fn with_token(token: Option<CancellationToken>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            value: UnsafeCell::new(None),
            waker: AtomicWaker::new(),
            token,
        })
    }

    /// Deliver `value`. Hands the value back if the promise was already
    /// canceled (or its token has fired) or resolved.
    pub fn try_set_result(&self, value: T) -> Result<(), T> {
        if self.token_fired() {
            self.cancel();
            return Err(value);
        }
        if self
            .state
            .compare_exchange(PENDING, SETTING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        // SAFETY: winning PENDING -> SETTING grants exclusive write access.
        unsafe { *self.value.get() = Some(value) };
        self.state.store(RESOLVED, Ordering::Release);
        self.waker.wake();
        Ok(())
    }

    /// Cancel the promise. Returns `false` if it was already resolved or canceled.
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            trace!("promise canceled before delivery");
            self.waker.wake();
        }
        won
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), RESOLVED | CONSUMED)
    }

    /// Whether the promise ended canceled. A pending promise whose token has
    /// fired is canceled here, without waiting for a poll.
    pub fn is_canceled(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CANCELED => true,
            PENDING if self.token_fired() => {
                self.cancel();
                self.state.load(Ordering::Acquire) == CANCELED
            }
            _ => false,
        }
    }

    pub(crate) fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }

    fn token_fired(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn consume(&self) -> Option<T> {
        self.state
            .compare_exchange(RESOLVED, CONSUMED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            // SAFETY: winning RESOLVED -> CONSUMED grants exclusive read access,
            // and the Acquire pairs with the setter's Release store.
            .and_then(|_| unsafe { (*self.value.get()).take() })
    }

    /// Poll for the outcome, registering `cx`'s waker while still pending.
    pub fn poll_result(&self, cx: &mut Context<'_>) -> Poll<Result<T, TakeError>> {
        let mut registered = false;
        loop {
            match self.state.load(Ordering::Acquire) {
                RESOLVED => {
                    if let Some(value) = self.consume() {
                        return Poll::Ready(Ok(value));
                    }
                }
                CANCELED => return Poll::Ready(Err(TakeError::Canceled)),
                CONSUMED => panic!("promise result polled after it was consumed"),
                PENDING if self.token_fired() => {
                    self.cancel();
                }
                // SETTING: the setter wakes us after its RESOLVED store.
                _ if registered => return Poll::Pending,
                _ => {
                    self.waker.register(cx.waker());
                    registered = true;
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.is_resolved())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

enum TakeState<T> {
    Ready(Option<T>),
    Canceled,
    Waiting {
        promise: Arc<Promise<T>>,
        cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    },
    Done,
}

/// Future returned by [`AsyncQueue::take`](crate::AsyncQueue::take).
///
/// Resolves to the next item in FIFO order, or to [`TakeError::Canceled`] if
/// its cancellation token fired before an item was delivered. Dropping a
/// pending future cancels it, so the item that would have been delivered
/// goes to the next consumer instead.
#[must_use = "futures do nothing unless polled"]
pub struct TakeFuture<T> {
    state: TakeState<T>,
}

// The item is only ever moved out by value, never pinned.
impl<T> Unpin for TakeFuture<T> {}

impl<T> TakeFuture<T> {
    pub(crate) fn ready(item: T) -> Self {
        Self {
            state: TakeState::Ready(Some(item)),
        }
    }

    pub(crate) fn canceled() -> Self {
        Self {
            state: TakeState::Canceled,
        }
    }

    pub(crate) fn waiting(promise: Arc<Promise<T>>) -> Self {
        let cancelled = promise
            .token()
            .map(|token| Box::pin(token.clone().cancelled_owned()));
        Self {
            state: TakeState::Waiting { promise, cancelled },
        }
    }

    pub fn is_resolved(&self) -> bool {
        match &self.state {
            TakeState::Ready(item) => item.is_some(),
            TakeState::Waiting { promise, .. } => promise.is_resolved(),
            TakeState::Canceled | TakeState::Done => false,
        }
    }

    pub fn is_canceled(&self) -> bool {
        match &self.state {
            TakeState::Canceled => true,
            TakeState::Waiting { promise, .. } => promise.is_canceled(),
            TakeState::Ready(_) | TakeState::Done => false,
        }
    }

    /// Take the outcome without waiting, if there is one.
    pub fn try_result(&mut self) -> Option<Result<T, TakeError>> {
        let outcome = match &mut self.state {
            TakeState::Ready(item) => item.take().map(Ok),
            TakeState::Canceled => Some(Err(TakeError::Canceled)),
            TakeState::Waiting { promise, .. } => {
                if let Some(value) = promise.consume() {
                    Some(Ok(value))
                } else if promise.is_canceled() {
                    Some(Err(TakeError::Canceled))
                } else {
                    None
                }
            }
            TakeState::Done => None,
        };
        if outcome.is_some() {
            self.state = TakeState::Done;
        }
        outcome
    }
}

impl<T> Future for TakeFuture<T> {
    type Output = Result<T, TakeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let poll = match &mut this.state {
            TakeState::Ready(item) => match item.take() {
                Some(item) => Poll::Ready(Ok(item)),
                None => panic!("TakeFuture polled after completion"),
            },
            TakeState::Canceled => Poll::Ready(Err(TakeError::Canceled)),
            TakeState::Waiting { promise, cancelled } => {
                if let Some(cancelled) = cancelled {
                    if cancelled.as_mut().poll(cx).is_ready() {
                        promise.cancel();
                    }
                }
                promise.poll_result(cx)
            }
            TakeState::Done => panic!("TakeFuture polled after completion"),
        };
        if poll.is_ready() {
            this.state = TakeState::Done;
        }
        poll
    }
}

impl<T> Drop for TakeFuture<T> {
    fn drop(&mut self) {
        if let TakeState::Waiting { promise, .. } = &self.state {
            if promise.cancel() {
                trace!("pending take dropped, treating as canceled");
            }
        }
    }
}

impl<T> std::fmt::Debug for TakeFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TakeFuture")
            .field("resolved", &self.is_resolved())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
