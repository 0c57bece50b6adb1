//! The three station kinds plugged into the shared [`Station`](crate::station::Station) engine.

mod clustered;
mod looped;
mod network;

pub use clustered::{CLUSTER_SPEC, ClusteredStation};
pub use looped::LoopedStation;
pub use network::{NetworkStation, container_extension};

use std::sync::{Mutex, MutexGuard, TryLockError};

/// Non-blocking lock; `None` when another thread holds it. Poisoning is ignored.
pub(crate) fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}
