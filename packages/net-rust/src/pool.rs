//! Pool of reusable [`OperationContext`]s.
//!
//! Acquire and release go through a lock-free `SegQueue`. The resize lock is
//! only taken when an acquire finds the queue empty, so growth never blocks
//! the common path.

use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::context::OperationContext;

/// Anything that can lend and take back operation contexts.
pub trait ContextSource: Send + Sync {
    /// Hands out an idle context, creating more if needed. Never fails.
    fn acquire(&self) -> OperationContext;

    /// Takes a context back. Must be called exactly once per acquire.
    fn release(&self, ctx: OperationContext);
}

/// Growable, thread-safe pool of operation contexts.
///
/// Shared as `Arc<ContextPool>` by every connection and listener that uses
/// it. After [`dispose`](Self::dispose) the pool keeps working as a plain
/// allocator: acquires hand out fresh contexts and releases drop them.
#[derive(Debug)]
pub struct ContextPool {
    idle: SegQueue<OperationContext>,
    resize_lock: Mutex<()>,
    disposed: AtomicBool,
    created: AtomicUsize,
    config: PoolConfig,
}

impl ContextPool {
    /// Creates a pool pre-filled with `config.initial_size` contexts.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let pool = Self {
            idle: SegQueue::new(),
            resize_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            config,
        };
        pool.extend(pool.config.initial_size);
        pool
    }

    /// Number of contexts currently waiting in the idle queue.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Total contexts this pool has ever created for pooled use.
    #[must_use]
    pub fn total_created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Pops an idle context, growing the pool when it is empty.
    pub fn acquire(&self) -> OperationContext {
        if self.is_disposed() {
            trace!("context pool disposed, handing out unpooled context");
            return OperationContext::new(self.config.buffer_size);
        }

        loop {
            if let Some(ctx) = self.idle.pop() {
                return ctx;
            }
            self.grow();
        }
    }

    /// Resets `ctx` and puts it back, or drops it if the pool is disposed.
    pub fn release(&self, mut ctx: OperationContext) {
        if self.is_disposed() {
            return;
        }

        ctx.reset(self.config.buffer_size);
        self.idle.push(ctx);
        fence(Ordering::SeqCst);

        // A dispose may have drained the queue between the check and the push.
        if self.is_disposed() {
            self.drain_idle();
        }
    }

    /// Marks the pool disposed and drops every idle context. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = self.drain_idle();
        debug!(dropped, "context pool disposed");
    }

    fn grow(&self) {
        let _guard = self.resize_lock.lock();
        if !self.idle.is_empty() {
            return;
        }

        let increment = self.config.growth.increment(self.config.initial_size);
        self.extend(increment);
        debug!(
            increment,
            total = self.total_created(),
            "context pool grown"
        );
    }

    fn extend(&self, count: usize) {
        for _ in 0..count {
            self.idle
                .push(OperationContext::new(self.config.buffer_size));
        }
        self.created.fetch_add(count, Ordering::AcqRel);
    }

    fn drain_idle(&self) -> usize {
        let mut dropped = 0;
        while self.idle.pop().is_some() {
            dropped += 1;
        }
        dropped
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ContextSource for ContextPool {
    fn acquire(&self) -> OperationContext {
        ContextPool::acquire(self)
    }

    fn release(&self, ctx: OperationContext) {
        ContextPool::release(self, ctx);
    }
}
