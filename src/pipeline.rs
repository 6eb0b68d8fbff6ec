//! The pipeline: registry, compiler, pool and executor in one explicitly
//! constructed object.
//!
//! Build one at startup and share it by reference (usually an `Arc`) with
//! whatever serves requests. Nothing here is process-global, so tests can
//! create as many isolated pipelines as they like.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::chain::{ChainStatsSnapshot, CompiledChain};
use crate::compiler::{ChainCompiler, Compiled, CompilerConfig, CompilerStats};
use crate::context::RequestContext;
use crate::error::Error;
use crate::handler::Handler;
use crate::layer::{Layer, LayerSet};
use crate::pool::{ContextPool, PoolConfig, PoolMetrics};
use crate::registry::{LayerRegistry, Middleware, MiddlewareInfo};
use crate::request::Request;

/// Pipeline settings.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub pool: PoolConfig,
    pub compiler: CompilerConfig,
}

impl PipelineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn compiler(mut self, compiler: CompilerConfig) -> Self {
        self.compiler = compiler;
        self
    }
}

/// How one execution ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Every handler was reached.
    Completed,
    /// A handler set the abort flag; later handlers were skipped.
    Aborted,
}

/// Layered middleware pipeline.
///
/// ```rust
/// use strata::{Layer, LayerSet, Middleware, Outcome, Pipeline, Request, RequestContext};
///
/// let pipeline = Pipeline::new();
/// pipeline.register(Layer::Controller, "auth", |ctx: &mut RequestContext| ctx.set("user", 7u32), 1);
/// pipeline.add(
///     Layer::Controller,
///     Middleware::new("log", |ctx: &mut RequestContext| ctx.proceed()).priority(2).depends_on("auth"),
/// );
///
/// let chain = pipeline.compile(LayerSet::all()).unwrap().chain;
/// assert_eq!(chain.names(), ["auth", "log"]);
///
/// let mut ctx = pipeline.acquire(Request::default());
/// assert_eq!(pipeline.execute(&chain, &mut ctx), Outcome::Completed);
/// assert_eq!(ctx.get::<u32>("user"), Some(7));
/// pipeline.release(ctx);
/// ```
pub struct Pipeline {
    registry: LayerRegistry,
    compiler: ChainCompiler,
    pool: ContextPool,
    executions: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            registry: LayerRegistry::new(),
            compiler: ChainCompiler::new(config.compiler),
            pool: ContextPool::new(config.pool),
            executions: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &LayerRegistry { &self.registry }
    pub fn compiler(&self) -> &ChainCompiler { &self.compiler }
    pub fn pool(&self) -> &ContextPool { &self.pool }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Registers `handler` as `name` in `layer`. Last write wins.
    pub fn register(&self, layer: Layer, name: &str, handler: impl Into<Handler>, priority: i32) {
        self.registry.register(layer, name, handler, priority);
    }

    /// Registers a middleware with dependencies or a disabled flag.
    pub fn add(&self, layer: Layer, middleware: Middleware) {
        self.registry.add(layer, middleware);
    }

    pub fn set_enabled(&self, layer: Layer, name: &str, enabled: bool) -> bool {
        self.registry.set_enabled(layer, name, enabled)
    }

    pub fn enable(&self, layer: Layer, name: &str) -> bool {
        self.registry.enable(layer, name)
    }

    pub fn disable(&self, layer: Layer, name: &str) -> bool {
        self.registry.disable(layer, name)
    }

    pub fn remove(&self, layer: Layer, name: &str) -> bool {
        self.registry.remove(layer, name)
    }

    pub fn lookup(&self, layer: Layer, name: &str) -> Option<MiddlewareInfo> {
        self.registry.lookup(layer, name)
    }

    // ── Compile / execute ─────────────────────────────────────────────────────

    /// Returns the chain for `layers`, from cache when possible.
    pub fn compile(&self, layers: impl Into<LayerSet>) -> Result<Compiled, Error> {
        self.compiler.compile(&self.registry, layers.into())
    }

    pub fn acquire(&self, request: Request) -> Box<RequestContext> {
        self.pool.acquire(request)
    }

    pub fn release(&self, ctx: Box<RequestContext>) {
        self.pool.release(ctx);
    }

    /// Runs `chain` against `ctx` from its first handler.
    ///
    /// `ctx` must be freshly acquired: its cursor is only reset on pool
    /// return, so a context executes one chain per acquisition. A panic in
    /// a handler propagates to the caller unless a recovery handler earlier
    /// in the chain catches it.
    pub fn execute(&self, chain: &Arc<CompiledChain>, ctx: &mut RequestContext) -> Outcome {
        ctx.set_chain(Arc::clone(chain));

        let start = Instant::now();
        ctx.proceed();
        let elapsed = start.elapsed();

        self.executions.fetch_add(1, Ordering::Relaxed);
        if ctx.is_aborted() {
            chain.stats.record_aborted();
            self.aborted.fetch_add(1, Ordering::Relaxed);
            Outcome::Aborted
        } else {
            debug_assert!(ctx.is_exhausted());
            chain.stats.record_completed(elapsed);
            self.completed.fetch_add(1, Ordering::Relaxed);
            Outcome::Completed
        }
    }

    // ── Observability ─────────────────────────────────────────────────────────

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            executions: self.executions.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            compiler: self.compiler.stats(),
            pool: self.pool.metrics(),
        }
    }

    /// Entry counts and summed invocations per layer.
    pub fn layer_stats(&self) -> Vec<LayerStats> {
        Layer::ALL
            .into_iter()
            .map(|layer| {
                let entries = self.registry.entries(layer);
                LayerStats {
                    layer,
                    registered: entries.len(),
                    enabled: entries.iter().filter(|e| e.enabled).count(),
                    invocations: entries.iter().map(|e| e.stats.invocations).sum(),
                    total_time: entries.iter().map(|e| e.stats.total_time).sum(),
                }
            })
            .collect()
    }

    /// Every entry of `layer` with its counters, in priority order.
    pub fn middleware_stats(&self, layer: Layer) -> Vec<MiddlewareInfo> {
        self.registry.entries(layer)
    }

    /// A printable snapshot of registry and cache state.
    pub fn debug_dump(&self) -> DebugDump {
        DebugDump {
            generation: self.registry.generation(),
            layers: Layer::ALL
                .into_iter()
                .map(|layer| (layer, self.registry.entries(layer)))
                .collect(),
            chains: self
                .compiler
                .cached_chains()
                .iter()
                .map(|c| CachedChainInfo {
                    layers: c.layers(),
                    names: c.names().into_iter().map(str::to_owned).collect(),
                    original_len: c.original_len(),
                    generation: c.generation(),
                    age: c.age(),
                    stats: c.stats(),
                })
                .collect(),
            stats: self.stats(),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate pipeline counters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PipelineStats {
    pub executions: u64,
    pub completed: u64,
    pub aborted: u64,
    pub compiler: CompilerStats,
    pub pool: PoolMetrics,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayerStats {
    pub layer: Layer,
    pub registered: usize,
    pub enabled: usize,
    pub invocations: u64,
    pub total_time: Duration,
}

#[derive(Clone, Debug)]
pub struct CachedChainInfo {
    pub layers: LayerSet,
    pub names: Vec<String>,
    pub original_len: usize,
    pub generation: u64,
    pub age: Duration,
    pub stats: ChainStatsSnapshot,
}

/// Registry and cache state, rendered by its `Display` impl.
#[derive(Clone, Debug)]
pub struct DebugDump {
    pub generation: u64,
    pub layers: Vec<(Layer, Vec<MiddlewareInfo>)>,
    pub chains: Vec<CachedChainInfo>,
    pub stats: PipelineStats,
}

impl fmt::Display for DebugDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "registry (generation {})", self.generation)?;
        for (layer, entries) in &self.layers {
            writeln!(f, "  {layer}: {} entries", entries.len())?;
            for e in entries {
                write!(
                    f,
                    "    {:<20} priority={:<5} {} calls={}",
                    e.name,
                    e.priority,
                    if e.enabled { "on " } else { "off" },
                    e.stats.invocations,
                )?;
                if !e.dependencies.is_empty() {
                    write!(f, " after={}", e.dependencies.join(","))?;
                }
                writeln!(f)?;
            }
        }

        writeln!(f, "cache ({} chains)", self.chains.len())?;
        for c in &self.chains {
            writeln!(
                f,
                "  {} gen={} age={:?} handlers={}/{} runs={} aborted={} avg={:?}: {}",
                c.layers,
                c.generation,
                c.age,
                c.names.len(),
                c.original_len,
                c.stats.executions,
                c.stats.aborted,
                c.stats.average,
                c.names.join(" -> "),
            )?;
        }

        let s = &self.stats;
        writeln!(
            f,
            "executions={} completed={} aborted={} compiles={} hits={} misses={} evictions={}",
            s.executions,
            s.completed,
            s.aborted,
            s.compiler.compiles,
            s.compiler.hits,
            s.compiler.misses,
            s.compiler.evictions,
        )?;
        write!(
            f,
            "pool: allocations={} reuses={} in_use={} idle={} reuse_rate={:.3}",
            s.pool.allocations,
            s.pool.reuses,
            s.pool.in_use,
            s.pool.idle,
            s.pool.reuse_rate(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// A handler that appends `name` to a shared trace.
    fn mark(trace: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Handler {
        let trace = Arc::clone(trace);
        Handler::new(move |_: &mut RequestContext| trace.lock().push(name.to_owned()))
    }

    fn run(pipeline: &Pipeline, layers: LayerSet) -> Outcome {
        let chain = pipeline.compile(layers).unwrap().chain;
        let mut ctx = pipeline.acquire(Request::default());
        let outcome = pipeline.execute(&chain, &mut ctx);
        pipeline.release(ctx);
        outcome
    }

    #[test]
    fn handlers_run_in_compiled_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let p = Pipeline::new();
        p.register(Layer::Route, "ten", mark(&trace, "ten"), 10);
        p.register(Layer::Route, "five", mark(&trace, "five"), 5);
        p.register(Layer::Global, "glob", mark(&trace, "glob"), 100);

        assert_eq!(run(&p, LayerSet::all()), Outcome::Completed);
        assert_eq!(*trace.lock(), ["glob", "five", "ten"]);
    }

    #[test]
    fn abort_skips_remaining_handlers() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let p = Pipeline::new();
        p.register(Layer::Global, "first", mark(&trace, "first"), 0);
        p.register(Layer::Global, "stop", |ctx: &mut RequestContext| ctx.abort(), 1);
        p.register(Layer::Global, "never", mark(&trace, "never"), 2);

        assert_eq!(run(&p, Layer::Global.into()), Outcome::Aborted);
        assert_eq!(*trace.lock(), ["first"]);
        assert_eq!(p.stats().aborted, 1);
    }

    #[test]
    fn wrapping_handler_finishes_after_abort() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let p = Pipeline::new();
        let outer = Arc::clone(&trace);
        p.register(
            Layer::Global,
            "wrap",
            move |ctx: &mut RequestContext| {
                outer.lock().push("before".to_owned());
                ctx.proceed();
                outer.lock().push("after".to_owned());
            },
            0,
        );
        p.register(Layer::Global, "stop", |ctx: &mut RequestContext| ctx.abort(), 1);
        p.register(Layer::Global, "never", mark(&trace, "never"), 2);

        assert_eq!(run(&p, Layer::Global.into()), Outcome::Aborted);
        assert_eq!(*trace.lock(), ["before", "after"]);
    }

    #[test]
    fn index_advances_monotonically() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let p = Pipeline::new();
        for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
            let seen = Arc::clone(&seen);
            p.register(
                Layer::Route,
                name,
                move |ctx: &mut RequestContext| seen.lock().push(ctx.index()),
                i as i32,
            );
        }
        run(&p, LayerSet::all());
        assert_eq!(*seen.lock(), [Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn completed_runs_update_chain_and_entry_stats() {
        let p = Pipeline::new();
        p.register(Layer::Route, "a", |_: &mut RequestContext| {}, 0);
        for _ in 0..3 {
            run(&p, LayerSet::all());
        }

        let chain = p.compile(LayerSet::all()).unwrap().chain;
        assert_eq!(chain.stats().executions, 3);
        assert_eq!(p.lookup(Layer::Route, "a").unwrap().stats.invocations, 3);
        assert_eq!(p.stats().completed, 3);

        let route = p.layer_stats().into_iter().find(|s| s.layer == Layer::Route).unwrap();
        assert_eq!((route.registered, route.enabled, route.invocations), (1, 1, 3));
    }

    #[test]
    fn replacing_an_entry_resets_its_stats() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let p = Pipeline::new();
        p.register(Layer::Route, "a", mark(&trace, "a"), 0);
        run(&p, LayerSet::all());
        run(&p, LayerSet::all());
        assert_eq!(p.lookup(Layer::Route, "a").unwrap().stats.invocations, 2);

        p.register(Layer::Route, "a", mark(&trace, "a2"), 0);
        assert_eq!(p.lookup(Layer::Route, "a").unwrap().stats.invocations, 0);

        run(&p, LayerSet::all());
        assert_eq!(p.lookup(Layer::Route, "a").unwrap().stats.invocations, 1);
        assert_eq!(*trace.lock(), ["a", "a", "a2"]);
    }

    #[test]
    fn removal_forces_recompile() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let p = Pipeline::new();
        p.register(Layer::Route, "a", mark(&trace, "a"), 0);
        p.register(Layer::Route, "b", mark(&trace, "b"), 1);
        assert_eq!(p.compile(LayerSet::all()).unwrap().chain.names(), ["a", "b"]);

        assert!(p.remove(Layer::Route, "b"));
        let out = p.compile(LayerSet::all()).unwrap();
        assert!(!out.cache_hit);
        assert_eq!(out.chain.names(), ["a"]);

        run(&p, LayerSet::all());
        assert_eq!(*trace.lock(), ["a"]);
    }

    #[test]
    fn disabled_entries_are_skipped() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let p = Pipeline::new();
        p.register(Layer::Route, "a", mark(&trace, "a"), 0);
        p.register(Layer::Route, "b", mark(&trace, "b"), 1);
        assert!(p.disable(Layer::Route, "a"));

        run(&p, LayerSet::all());
        assert_eq!(*trace.lock(), ["b"]);
    }

    #[test]
    fn empty_pipeline_completes() {
        let p = Pipeline::new();
        let compiled = p.compile(LayerSet::all()).unwrap();
        assert!(compiled.chain.is_empty());
        assert_eq!(run(&p, LayerSet::all()), Outcome::Completed);
    }

    #[test]
    fn debug_dump_mentions_entries_and_chains() {
        let p = Pipeline::new();
        p.add(Layer::Controller, Middleware::new("auth", |_: &mut RequestContext| {}).priority(1));
        p.add(
            Layer::Controller,
            Middleware::new("log", |_: &mut RequestContext| {}).priority(2).depends_on("auth"),
        );
        run(&p, LayerSet::all());

        let dump = p.debug_dump().to_string();
        assert!(dump.contains("controller: 2 entries"));
        assert!(dump.contains("after=auth"));
        assert!(dump.contains("auth -> log"));
        assert!(dump.contains("reuse_rate"));
    }
}
