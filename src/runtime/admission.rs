//! Connection admission control.
//!
//! A counting semaphore bounds the number of connections the server has
//! accepted but not yet finished. A permit is taken before every accept and
//! given back only with a [`Returned`] token from the context pool.

use crate::runtime::context::Returned;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// The semaphore was closed during shutdown.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("admission closed")]
pub struct AdmissionClosed;

/// Bounded admission semaphore.
#[derive(Clone)]
pub struct Admission {
    semaphore: Arc<Semaphore>,
    max_connections: usize,
}

impl Admission {
    pub fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionClosed> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionClosed)?;
        trace!(available = self.available(), "Admission permit acquired");
        Ok(AdmissionPermit { permit })
    }

    /// Wake all waiters with [`AdmissionClosed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held by connections or pending accepts.
    pub fn in_use(&self) -> usize {
        self.max_connections - self.available()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// One admitted connection.
///
/// Dropping the permit without [`release`](Self::release) still returns it to
/// the semaphore, so an aborted task cannot leak a slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    /// Release the slot once the connection's context is back in its pool.
    pub fn release(self, returned: Returned) {
        trace!(context = returned.context_id(), "Admission permit released");
        drop(self.permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::arena::BufferArena;
    use crate::runtime::context::ContextPool;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_are_bounded_and_restored() {
        let admission = Admission::new(3);
        let pool = ContextPool::new(BufferArena::new(3, 16, 16).unwrap());

        let mut held = Vec::new();
        for i in 1..=3 {
            let permit = admission.acquire().await.unwrap();
            held.push((permit, pool.pop()));
            assert_eq!(admission.in_use(), i);
            assert!(admission.in_use() <= admission.max_connections());
        }

        for (permit, ctx) in held {
            permit.release(pool.push(ctx));
        }
        assert_eq!(admission.available(), 3);
        assert_eq!(admission.in_use(), 0);
    }

    #[tokio::test]
    async fn test_saturated_acquire_waits() {
        let admission = Admission::new(1);
        let pool = ContextPool::new(BufferArena::new(1, 16, 16).unwrap());

        let first = admission.acquire().await.unwrap();
        let ctx = pool.pop();

        let waiting = tokio::time::timeout(Duration::from_millis(50), admission.acquire()).await;
        assert!(waiting.is_err(), "second acquire should block");

        first.release(pool.push(ctx));
        let second = tokio::time::timeout(Duration::from_millis(500), admission.acquire())
            .await
            .expect("permit after release")
            .unwrap();
        drop(second);
        assert_eq!(admission.available(), 1);
    }

    #[tokio::test]
    async fn test_dropped_permit_is_returned() {
        let admission = Admission::new(2);
        let permit = admission.acquire().await.unwrap();
        assert_eq!(admission.in_use(), 1);
        drop(permit);
        assert_eq!(admission.in_use(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let admission = Admission::new(1);
        let _held = admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        admission.close();
        assert_eq!(waiter.await.unwrap(), Err(AdmissionClosed));
        assert!(admission.is_closed());
    }
}
