//! Lock-free unbounded FIFO queue with suspending consumers.
//!
//! - `queue`: [`AsyncQueue`], the public surface (add, take, counts, iteration, streams)
//! - `segment`: fixed-capacity slot blocks and the chain-growth protocol
//! - `slot`: the per-index rendezvous cell where one item meets one awaiter
//! - `chain`: head/tail pointers and weakly consistent traversal
//! - `promise`: cancellable single-assignment promise backing [`TakeFuture`]

mod chain;
pub mod promise;
pub mod queue;
mod segment;
mod slot;
mod sync;


pub use promise::{Promise, TakeFuture};
pub use queue::{AsyncQueue, Iter, QueueStats, TakeStream};
pub use segq_core::{QueueConfig, TakeError};
pub use tokio_util::sync::CancellationToken;
