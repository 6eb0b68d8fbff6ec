//! Request context pooling.
//!
//! Contexts are recycled through a lock-free bounded free list. Acquire never
//! fails: an empty free list means a fresh allocation. Release resets the
//! context and pushes it back; if the free list is already at its ceiling
//! the context is dropped instead.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use tracing::trace;

use crate::context::RequestContext;
use crate::request::Request;

/// Configuration for context pooling.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle contexts kept for reuse. At least 1.
    pub ceiling: usize,

    /// Contexts allocated up front when the pool is built.
    pub prewarm: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { ceiling: 1024, prewarm: 0 }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    #[must_use]
    pub fn prewarm(mut self, count: usize) -> Self {
        self.prewarm = count;
        self
    }
}

/// A pool of reusable [`RequestContext`]s.
pub struct ContextPool {
    free: ArrayQueue<Box<RequestContext>>,
    allocations: AtomicU64,
    reuses: AtomicU64,
    acquires: AtomicU64,
    releases: AtomicU64,
    discards: AtomicU64,
    in_use: AtomicUsize,
}

impl ContextPool {
    pub fn new(config: PoolConfig) -> Self {
        let pool = Self {
            free: ArrayQueue::new(config.ceiling.max(1)),
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            in_use: AtomicUsize::new(0),
        };
        for _ in 0..config.prewarm.min(pool.free.capacity()) {
            let _ = pool.free.push(pool.allocate());
        }
        pool
    }

    fn allocate(&self) -> Box<RequestContext> {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Box::new(RequestContext::blank(true))
    }

    /// Hands out a context for `request`, with an empty store and the
    /// cursor before the first handler.
    pub fn acquire(&self, request: Request) -> Box<RequestContext> {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::Relaxed);

        let mut ctx = match self.free.pop() {
            Some(ctx) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                ctx
            }
            None => self.allocate(),
        };
        ctx.attach(request);
        ctx
    }

    /// Returns `ctx` to the pool.
    ///
    /// Taking the box by value makes a second release of the same context
    /// impossible. Contexts that did not come from a pool, that still have a
    /// live [`SharedState`](crate::SharedState) handle, or that arrive while
    /// the free list is full are dropped.
    pub fn release(&self, mut ctx: Box<RequestContext>) {
        if !ctx.is_pooled() {
            return;
        }
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);

        if !ctx.reset() {
            trace!("context still shared at release, dropping");
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.free.push(ctx).is_err() {
            self.discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Settles the in-use gauge for a context that was dropped instead of
    /// released, e.g. by a panic unwinding through the chain.
    pub(crate) fn abandon(&self) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of idle contexts ready for reuse.
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn ceiling(&self) -> usize {
        self.free.capacity()
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            acquires: self.acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            idle: self.free.len(),
        }
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolMetrics {
    pub allocations: u64,
    pub reuses: u64,
    pub acquires: u64,
    pub releases: u64,
    /// Contexts dropped instead of pooled, at release or abandoned.
    pub discards: u64,
    pub in_use: usize,
    pub idle: usize,
}

impl PoolMetrics {
    /// Fraction of acquires served from the free list, `0.0..=1.0`.
    pub fn reuse_rate(&self) -> f64 {
        if self.acquires == 0 {
            return 0.0;
        }
        self.reuses as f64 / self.acquires as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn round_trip_returns_clean_context() {
        let pool = ContextPool::new(PoolConfig::new().ceiling(4));

        let mut ctx = pool.acquire(Request::new(Method::POST, "/a"));
        ctx.set("user", 42u32);
        ctx.abort();
        pool.release(ctx);

        let ctx = pool.acquire(Request::new(Method::GET, "/b"));
        assert_eq!(ctx.value_count(), 0);
        assert_eq!(ctx.index(), None);
        assert!(!ctx.is_aborted());
        assert!(ctx.chain().is_none());
        assert_eq!(ctx.request().map(|r| r.path()), Some("/b"));

        let m = pool.metrics();
        assert_eq!(m.allocations, 1);
        assert_eq!(m.reuses, 1);
        assert_eq!(m.in_use, 1);
    }

    #[test]
    fn abandoned_context_leaves_gauge_balanced() {
        let pool = ContextPool::default();
        let ctx = pool.acquire(Request::default());
        drop(ctx);
        pool.abandon();

        let m = pool.metrics();
        assert_eq!(m.in_use, 0);
        assert_eq!(m.discards, 1);
        assert_eq!(m.idle, 0);
    }

    #[test]
    fn sequential_load_reuses_nearly_everything() {
        let pool = ContextPool::new(PoolConfig::new().ceiling(100));
        for i in 0..10_000 {
            let ctx = pool.acquire(Request::default());
            ctx.set("i", i);
            pool.release(ctx);
        }
        let m = pool.metrics();
        assert!(m.allocations <= 100);
        assert!(m.reuse_rate() > 0.99);
        assert_eq!(m.acquires, 10_000);
        assert_eq!(m.releases, 10_000);
        assert_eq!(m.in_use, 0);
    }

    #[test]
    fn overflow_beyond_ceiling_is_discarded() {
        let pool = ContextPool::new(PoolConfig::new().ceiling(2));
        let held: Vec<_> = (0..3).map(|_| pool.acquire(Request::default())).collect();
        for ctx in held {
            pool.release(ctx);
        }
        let m = pool.metrics();
        assert_eq!(m.allocations, 3);
        assert_eq!(m.idle, 2);
        assert_eq!(m.discards, 1);
    }

    #[test]
    fn prewarm_fills_free_list() {
        let pool = ContextPool::new(PoolConfig::new().ceiling(8).prewarm(8));
        assert_eq!(pool.idle(), 8);
        let ctx = pool.acquire(Request::default());
        assert_eq!(pool.metrics().reuses, 1);
        pool.release(ctx);
        assert_eq!(pool.metrics().allocations, 8);
    }

    #[test]
    fn foreign_contexts_are_not_pooled() {
        let pool = ContextPool::new(PoolConfig::new().ceiling(2));
        pool.release(Box::new(RequestContext::new(Request::default())));
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.metrics().releases, 0);
    }

    #[test]
    fn still_shared_context_is_dropped() {
        let pool = ContextPool::new(PoolConfig::new().ceiling(2));
        let ctx = pool.acquire(Request::default());
        let leaked = ctx.shared();
        pool.release(ctx);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.metrics().discards, 1);
        drop(leaked);
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = std::sync::Arc::new(ContextPool::new(PoolConfig::new().ceiling(16)));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = std::sync::Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let ctx = pool.acquire(Request::default());
                        pool.release(ctx);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let m = pool.metrics();
        assert_eq!(m.acquires, 8_000);
        assert_eq!(m.in_use, 0);
        assert!(m.allocations <= 16 + m.discards);
    }
}
