//! Atomics used by the matching engine, swapped for loom's in the crate's own
//! model-checking tests. Dependents always get the std atomics.

#[cfg(not(all(test, feature = "loom")))]
pub(crate) use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

#[cfg(all(test, feature = "loom"))]
pub(crate) use loom::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
