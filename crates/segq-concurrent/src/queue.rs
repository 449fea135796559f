use crate::chain::Chain;
use crate::promise::{Promise, TakeFuture};
use crate::segment::{AddOutcome, Segment, TakeOutcome};
use core::future::Future;
use core::marker::PhantomData;
use core::pin::Pin;
use core::task::{Context, Poll};
use crossbeam_utils::Backoff;
use futures::Stream;
use metrics::counter;
use segq_core::{ConfigError, QueueConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Unbounded multi-producer, multi-consumer FIFO queue.
///
/// [`add`](Self::add) never blocks. [`take`](Self::take) returns a future
/// that resolves immediately when an item is waiting, or suspends until some
/// later `add` hands one over. The k-th claim to add pairs with the k-th
/// claim to take across the whole queue.
///
/// Storage is a chain of fixed-capacity segments. Producers and consumers
/// claim slot indices with a fetch-and-add and meet in the slot through a
/// single compare-and-swap; no locks are taken on either path.
pub struct AsyncQueue<T> {
    chain: Chain<T>,
}

/// Point-in-time diagnostics. Every field is weakly consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub count: usize,
    pub awaiter_count: usize,
    pub live_segments: usize,
    pub segment_capacity: usize,
    pub segments_allocated: usize,
}

impl<T> AsyncQueue<T> {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Panics if `config` does not validate; see [`try_with_config`](Self::try_with_config).
    pub fn with_config(config: QueueConfig) -> Self {
        match Self::try_with_config(config) {
            Ok(queue) => queue,
            Err(err) => panic!("invalid queue configuration: {err}"),
        }
    }

    pub fn try_with_config(config: QueueConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            chain: Chain::new(config.segment_capacity),
        })
    }

    pub fn with_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let queue = Self::new();
        items.into_iter().for_each(|item| queue.add(item));
        queue
    }

    pub fn segment_capacity(&self) -> usize {
        self.chain.capacity()
    }

    /// Append `item`, or hand it straight to the oldest waiting consumer.
    pub fn add(&self, item: T) {
        let mut item = item;
        let backoff = Backoff::new();
        loop {
            let tail = self.chain.item_tail();
            match tail.try_add(item, &self.chain) {
                AddOutcome::Added => return,
                AddOutcome::Overflow(returned) => {
                    item = returned;
                    backoff.snooze();
                }
                AddOutcome::Refused(returned) => {
                    trace!(segment = tail.sequence(), "delivery refused by canceled awaiter, retrying");
                    counter!("segq_deliveries_refused").increment(1);
                    item = returned;
                }
            }
        }
    }

    /// Take the next item, waiting for one if the queue is empty.
    pub fn take(&self) -> TakeFuture<T> {
        self.claim_awaiter(None)
    }

    /// Like [`take`](Self::take), but the future resolves to
    /// [`TakeError::Canceled`](crate::TakeError::Canceled) if `token` fires
    /// before an item is delivered. An already-fired token claims nothing.
    pub fn take_with_cancellation(&self, token: CancellationToken) -> TakeFuture<T> {
        if token.is_cancelled() {
            return TakeFuture::canceled();
        }
        self.claim_awaiter(Some(token))
    }

    fn claim_awaiter(&self, token: Option<CancellationToken>) -> TakeFuture<T> {
        let mut promise = Promise::with_token(token);
        let backoff = Backoff::new();
        loop {
            let tail = self.chain.awaiter_tail();
            match tail.try_take(promise, &self.chain) {
                TakeOutcome::Matched(item) => return TakeFuture::ready(item),
                TakeOutcome::Parked(promise) => return TakeFuture::waiting(promise),
                TakeOutcome::Overflow(returned) => {
                    promise = returned;
                    backoff.snooze();
                }
            }
        }
    }

    pub fn count(&self) -> usize {
        self.chain.count()
    }

    pub fn awaiter_count(&self) -> usize {
        self.chain.awaiter_count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Clones of the items currently waiting, oldest first.
    ///
    /// Stops after the segment that was accepting items when iteration began,
    /// so a steady stream of producers cannot make it run forever.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        let last_sequence = self.chain.item_tail().sequence();
        Iter::new(self.chain.head(), last_sequence)
    }

    /// An endless stream of items, one take per element.
    pub fn stream(&self) -> TakeStream<'_, T> {
        TakeStream::new(self, None)
    }

    /// A stream that ends once `token` fires.
    pub fn stream_until(&self, token: CancellationToken) -> TakeStream<'_, T> {
        TakeStream::new(self, Some(token))
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            count: self.count(),
            awaiter_count: self.awaiter_count(),
            live_segments: self.chain.segments().count(),
            segment_capacity: self.segment_capacity(),
            segments_allocated: self.chain.segments_allocated(),
        }
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<T> for AsyncQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::with_items(iter)
    }
}

impl<T> Extend<T> for AsyncQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        iter.into_iter().for_each(|item| self.add(item));
    }
}

impl<T> std::fmt::Debug for AsyncQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("count", &self.count())
            .field("awaiter_count", &self.awaiter_count())
            .field("segment_capacity", &self.segment_capacity())
            .finish()
    }
}

impl<T> Drop for AsyncQueue<T> {
    fn drop(&mut self) {
        self.chain.unlink_all();
    }
}

/// Iterator returned by [`AsyncQueue::iter`].
pub struct Iter<'a, T> {
    segment: Option<Arc<Segment<T>>>,
    index: usize,
    end: usize,
    last_sequence: u64,
    _queue: PhantomData<&'a AsyncQueue<T>>,
}

impl<T> Iter<'_, T> {
    fn new(head: Arc<Segment<T>>, last_sequence: u64) -> Self {
        let mut iter = Self {
            segment: None,
            index: 0,
            end: 0,
            last_sequence,
            _queue: PhantomData,
        };
        iter.enter(head);
        iter
    }

    fn enter(&mut self, segment: Arc<Segment<T>>) {
        self.index = segment.awaiter_cursor();
        self.end = segment.item_cursor();
        self.segment = Some(segment);
    }
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let segment = self.segment.clone()?;
            while self.index < self.end {
                let slot = segment.slot(self.index);
                self.index += 1;
                if let Some(item) = slot.clone_item() {
                    return Some(item);
                }
            }
            self.segment = None;
            if segment.sequence() >= self.last_sequence {
                return None;
            }
            self.enter(segment.next()?);
        }
    }
}

/// Stream returned by [`AsyncQueue::stream`] and [`AsyncQueue::stream_until`].
///
/// Dropping the stream while a take is in flight cancels that take. An item
/// that was already delivered to it is put back with [`AsyncQueue::add`].
pub struct TakeStream<'a, T> {
    queue: &'a AsyncQueue<T>,
    token: Option<CancellationToken>,
    in_flight: Option<TakeFuture<T>>,
}

impl<'a, T> TakeStream<'a, T> {
    fn new(queue: &'a AsyncQueue<T>, token: Option<CancellationToken>) -> Self {
        Self {
            queue,
            token,
            in_flight: None,
        }
    }
}

impl<T> Stream for TakeStream<'_, T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let queue = this.queue;
        let token = &this.token;
        let take = this.in_flight.get_or_insert_with(|| match token {
            Some(token) => queue.take_with_cancellation(token.clone()),
            None => queue.take(),
        });
        match Pin::new(take).poll(cx) {
            Poll::Ready(outcome) => {
                this.in_flight = None;
                Poll::Ready(outcome.ok())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for TakeStream<'_, T> {
    fn drop(&mut self) {
        if let Some(mut take) = self.in_flight.take() {
            if let Some(Ok(item)) = take.try_result() {
                trace!("stream dropped holding a delivered item, re-adding it");
                self.queue.add(item);
            }
        }
    }
}
