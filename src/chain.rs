//! Compiled chains.
//!
//! A [`CompiledChain`] is the immutable product of one successful compile.
//! Once it is in the cache it is never modified in place, only replaced
//! wholesale; the only thing that changes afterwards is its atomic
//! statistics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::context::RequestContext;
use crate::handler::Handler;
use crate::layer::{Layer, LayerSet};
use crate::registry::EntryStats;

/// Upper bound on handlers per chain.
///
/// Every wrapping handler that calls
/// [`proceed`](crate::RequestContext::proceed) adds a stack frame, so chain
/// length bounds stack depth. Compiling a longer chain fails with
/// [`Error::ChainTooLong`](crate::Error::ChainTooLong).
pub const MAX_CHAIN_LEN: usize = 128;

/// One slot of a compiled chain.
#[derive(Clone, Debug)]
pub struct ChainLink {
    pub(crate) name: Arc<str>,
    pub(crate) layer: Layer,
    pub(crate) priority: i32,
    pub(crate) handler: Handler,
    pub(crate) stats: Arc<EntryStats>,
}

impl ChainLink {
    pub fn name(&self) -> &str { &self.name }
    pub fn layer(&self) -> Layer { self.layer }
    pub fn priority(&self) -> i32 { self.priority }
    pub fn handler(&self) -> &Handler { &self.handler }

    pub(crate) fn invoke(&self, ctx: &mut RequestContext) {
        let start = Instant::now();
        self.handler.call(ctx);
        self.stats.record(start.elapsed());
    }
}

/// An ordered, executable list of handlers.
#[derive(Debug)]
pub struct CompiledChain {
    pub(crate) links: Vec<ChainLink>,
    pub(crate) layers: LayerSet,
    pub(crate) generation: u64,
    pub(crate) created_at: Instant,
    pub(crate) compile_duration: Duration,
    pub(crate) original_len: usize,
    pub(crate) stats: ChainStats,
}

impl CompiledChain {
    pub fn links(&self) -> &[ChainLink] { &self.links }
    pub fn len(&self) -> usize { self.links.len() }
    pub fn is_empty(&self) -> bool { self.links.is_empty() }

    /// Middleware names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(ChainLink::name).collect()
    }

    pub fn layers(&self) -> LayerSet { self.layers }

    /// Registry generation this chain was compiled against.
    pub fn generation(&self) -> u64 { self.generation }

    pub fn created_at(&self) -> Instant { self.created_at }
    pub fn age(&self) -> Duration { self.created_at.elapsed() }
    pub fn compile_duration(&self) -> Duration { self.compile_duration }

    /// Handler count before optimization.
    pub fn original_len(&self) -> usize { self.original_len }

    /// Handler count after optimization.
    pub fn optimized_len(&self) -> usize { self.links.len() }

    pub fn stats(&self) -> ChainStatsSnapshot { self.stats.snapshot() }
}

/// Lock-free execution counters for one chain.
#[derive(Debug, Default)]
pub(crate) struct ChainStats {
    completed: AtomicU64,
    aborted: AtomicU64,
    total_nanos: AtomicU64,
    last_nanos: AtomicU64,
}

impl ChainStats {
    pub(crate) fn record_completed(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.last_nanos.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ChainStatsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let total = self.total_nanos.load(Ordering::Relaxed);
        ChainStatsSnapshot {
            executions: completed,
            aborted: self.aborted.load(Ordering::Relaxed),
            average: Duration::from_nanos(total.checked_div(completed).unwrap_or(0)),
            last: Duration::from_nanos(self.last_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time view of a chain's counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainStatsSnapshot {
    /// Runs that reached the end of the chain.
    pub executions: u64,
    /// Runs stopped by an abort.
    pub aborted: u64,
    /// Mean duration of completed runs, first handler to last.
    pub average: Duration,
    /// Duration of the most recent completed run.
    pub last: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_covers_completed_runs_only() {
        let stats = ChainStats::default();
        stats.record_completed(Duration::from_millis(10));
        stats.record_completed(Duration::from_millis(30));
        stats.record_aborted();

        let snap = stats.snapshot();
        assert_eq!(snap.executions, 2);
        assert_eq!(snap.aborted, 1);
        assert_eq!(snap.average, Duration::from_millis(20));
        assert_eq!(snap.last, Duration::from_millis(30));
    }

    #[test]
    fn empty_stats_average_is_zero() {
        assert_eq!(ChainStats::default().snapshot().average, Duration::ZERO);
    }
}
