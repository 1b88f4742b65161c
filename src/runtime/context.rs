//! Operation contexts and the pool that recycles them.
//!
//! A context carries everything one connection episode needs: its arena
//! slice, the receive fill level, the request line and the response that is
//! still being sent. Contexts are leased from the pool on accept and pushed
//! back on close. Pushing hands out a [`Returned`] token, which is the only
//! way to release the admission permit of that connection.

use crate::runtime::arena::{BufferArena, Slice};
use bytes::Bytes;
use slab::Slab;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// A framed response plus how much of it has gone out.
#[derive(Debug)]
pub struct PendingResponse {
    data: Bytes,
    sent: usize,
}

impl PendingResponse {
    pub fn new(data: Bytes) -> Self {
        Self { data, sent: 0 }
    }

    /// Copy the next chunk into `out`, returning its length.
    ///
    /// At most `out.len()` bytes are copied; the caller sends them and then
    /// reports the accepted count through [`advance`](Self::advance).
    pub fn fill(&self, out: &mut [u8]) -> usize {
        let n = self.remaining().min(out.len());
        out[..n].copy_from_slice(&self.data[self.sent..self.sent + n]);
        n
    }

    /// Record that `n` bytes were accepted by the socket.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining(), "advanced past end of response");
        self.sent = (self.sent + n).min(self.data.len());
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.sent
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }
}

/// Per-connection state bound to one arena slice.
#[derive(Debug)]
pub struct OperationContext {
    id: usize,
    slice: Slice,
    /// Bytes received into the receive region so far.
    pub received: usize,
    /// Decoded request target, HTTP version still attached.
    pub request_line: String,
    /// Response currently being written.
    pub pending: Option<PendingResponse>,
    /// Bytes written for the current response.
    pub sent: usize,
    lease: Option<usize>,
}

impl OperationContext {
    fn new(id: usize, slice: Slice) -> Self {
        Self {
            id,
            slice,
            received: 0,
            request_line: String::new(),
            pending: None,
            sent: 0,
            lease: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn slice(&self) -> &Slice {
        &self.slice
    }

    pub fn slice_mut(&mut self) -> &mut Slice {
        &mut self.slice
    }

    /// Bytes received so far.
    pub fn received_bytes(&self) -> &[u8] {
        &self.slice.receive()[..self.received]
    }

    /// Clear all per-connection state. The slice assignment is kept.
    pub fn reset(&mut self) {
        self.received = 0;
        self.request_line.clear();
        self.pending = None;
        self.sent = 0;
    }
}

/// Proof that a context went back to its pool.
///
/// Only [`ContextPool::push`] creates one, so a permit release that requires
/// it cannot happen before the context is available again.
#[derive(Debug)]
#[must_use = "a Returned token should be spent on releasing the admission permit"]
pub struct Returned {
    context_id: usize,
}

impl Returned {
    pub fn context_id(&self) -> usize {
        self.context_id
    }
}

struct PoolInner {
    free: Vec<OperationContext>,
    /// Lease key -> context id for every context currently handed out.
    leases: Slab<usize>,
    created: usize,
    closed: bool,
}

/// LIFO pool of operation contexts.
pub struct ContextPool {
    inner: Mutex<PoolInner>,
    arena: Mutex<BufferArena>,
}

impl ContextPool {
    /// Pre-fill the pool with one context per slice of `arena`.
    pub fn new(mut arena: BufferArena) -> Arc<Self> {
        let mut free = Vec::with_capacity(arena.remaining());
        while let Some(slice) = arena.assign() {
            free.push(OperationContext::new(free.len(), slice));
        }
        // Pop from the end, so reverse to hand out slice 0 first.
        free.reverse();

        let created = free.len();
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                leases: Slab::with_capacity(created),
                free,
                created,
                closed: false,
            }),
            arena: Mutex::new(arena),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // A panic while holding the lock leaves the free list intact.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a context, creating one if the pool is empty.
    pub fn pop(&self) -> OperationContext {
        let mut inner = self.lock();

        let mut ctx = match inner.free.pop() {
            Some(ctx) => ctx,
            None => {
                let id = inner.created;
                inner.created += 1;
                let arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
                let slice = arena.detached();
                warn!(context = id, "Context pool exhausted, allocating detached buffers");
                OperationContext::new(id, slice)
            }
        };

        ctx.lease = Some(inner.leases.insert(ctx.id));
        ctx
    }

    /// Reset `ctx` and put it back.
    pub fn push(&self, mut ctx: OperationContext) -> Returned {
        ctx.reset();
        let context_id = ctx.id;

        let mut inner = self.lock();
        match ctx.lease.take() {
            Some(key) if inner.leases.try_remove(key) == Some(context_id) => {}
            _ => warn!(context = context_id, "Pushed a context that was not leased"),
        }

        if inner.closed {
            debug!(context = context_id, "Pool closed, dropping context");
        } else {
            inner.free.push(ctx);
        }

        Returned { context_id }
    }

    /// Drop every free context and refuse further pooling.
    ///
    /// Returns the number of contexts dropped.
    pub fn drain(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let dropped = inner.free.len();
        inner.free.clear();
        dropped
    }

    /// Contexts waiting in the pool.
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Contexts currently leased to connections.
    pub fn in_use(&self) -> usize {
        self.lock().leases.len()
    }

    /// Contexts ever created, pre-allocated or not.
    pub fn created(&self) -> usize {
        self.lock().created
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize) -> Arc<ContextPool> {
        ContextPool::new(BufferArena::new(count, 64, 64).unwrap())
    }

    #[test]
    fn test_pop_push_lifo() {
        let pool = pool(3);
        assert_eq!(pool.available(), 3);

        let a = pool.pop();
        let b = pool.pop();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 1);

        let returned = pool.push(a);
        assert_eq!(returned.context_id(), 0);

        // Last released is reused first
        let c = pool.pop();
        assert_eq!(c.id(), 0);

        let _ = pool.push(b);
        let _ = pool.push(c);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_push_then_pop_is_clean() {
        let pool = pool(1);
        let mut ctx = pool.pop();
        ctx.slice_mut().receive_mut()[..5].copy_from_slice(b"GET /");
        ctx.received = 5;
        ctx.request_line.push_str("music-play HTTP/1.1");
        ctx.pending = Some(PendingResponse::new(Bytes::from_static(b"HTTP/1.1 200 OK\r\n")));
        ctx.sent = 3;

        let _ = pool.push(ctx);
        let ctx = pool.pop();

        assert_eq!(ctx.received, 0);
        assert!(ctx.request_line.is_empty());
        assert!(ctx.pending.is_none());
        assert_eq!(ctx.sent, 0);
        assert!(ctx.received_bytes().is_empty());
        // Slice assignment survives the reset
        assert_eq!(ctx.slice().receive_offset(), Some(0));
    }

    #[test]
    fn test_exhausted_pool_grows_detached() {
        let pool = pool(1);
        let a = pool.pop();
        let b = pool.pop();

        assert!(!a.slice().is_detached());
        assert!(b.slice().is_detached());
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.in_use(), 2);

        let _ = pool.push(a);
        let _ = pool.push(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_each_context_in_exactly_one_place() {
        let pool = pool(4);
        let mut leased = Vec::new();
        for _ in 0..4 {
            leased.push(pool.pop());
            assert_eq!(pool.available() + pool.in_use(), 4);
        }
        for ctx in leased {
            let _ = pool.push(ctx);
            assert_eq!(pool.available() + pool.in_use(), 4);
        }
    }

    #[test]
    fn test_drain_closes_pool() {
        let pool = pool(2);
        let ctx = pool.pop();
        assert_eq!(pool.drain(), 1);
        assert_eq!(pool.available(), 0);

        // Late returns are accepted but not pooled
        let returned = pool.push(ctx);
        assert_eq!(returned.context_id(), 0);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_pending_response_chunks() {
        let mut pending = PendingResponse::new(Bytes::from_static(b"0123456789"));
        let mut out = [0u8; 4];

        let n = pending.fill(&mut out);
        assert_eq!(&out[..n], b"0123");
        // Socket only took part of the chunk
        pending.advance(2);
        assert_eq!(pending.remaining(), 8);

        let n = pending.fill(&mut out);
        assert_eq!(&out[..n], b"2345");
        pending.advance(n);

        let n = pending.fill(&mut out);
        assert_eq!(&out[..n], b"6789");
        pending.advance(n);
        assert!(pending.is_done());
        assert_eq!(pending.sent(), 10);
    }
}
