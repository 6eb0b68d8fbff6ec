//! Chain compilation and caching.
//!
//! Compiling snapshots the enabled entries of the requested layers, orders
//! them through the dependency graph, runs the optimization passes and
//! caches the result under a key derived from the layer set and the active
//! configuration.
//!
//! The cache is a bounded map keyed by the layer set together with the
//! configuration, behind its own reader/writer lock. Lookups
//! take the read lock; a miss takes the write lock, checks again, and
//! compiles while holding it, so concurrent misses on the same key compile
//! once. On overflow the entry with the oldest creation time is evicted
//! (insertion age, not access recency).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::chain::{ChainLink, ChainStats, CompiledChain, MAX_CHAIN_LEN};
use crate::error::Error;
use crate::graph::DependencyGraph;
use crate::layer::LayerSet;
use crate::registry::LayerRegistry;

/// Compiler and cache settings.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Maximum number of cached chains. At least 1.
    pub max_entries: usize,

    /// Cached chains older than this are recompiled. `None` never expires.
    pub expiry: Option<Duration>,

    /// Run the optimization passes.
    pub optimize: bool,

    /// Treat a cached chain as stale as soon as the registry has changed
    /// since it was compiled. With `false`, only `expiry` retires entries.
    pub invalidate_on_change: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            expiry: Some(Duration::from_secs(300)),
            optimize: true,
            invalidate_on_change: true,
        }
    }
}

impl CompilerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    #[must_use]
    pub fn expiry(mut self, expiry: Option<Duration>) -> Self {
        self.expiry = expiry;
        self
    }

    #[must_use]
    pub fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    #[must_use]
    pub fn invalidate_on_change(mut self, invalidate: bool) -> Self {
        self.invalidate_on_change = invalidate;
        self
    }
}

/// The result of one [`ChainCompiler::compile`] call.
#[derive(Clone, Debug)]
pub struct Compiled {
    pub chain: Arc<CompiledChain>,
    /// `true` if the chain came from the cache.
    pub cache_hit: bool,
}

type Pass = fn(Vec<ChainLink>) -> Vec<ChainLink>;

/// Passes run in order. None of them may change observable behavior.
const PASSES: &[(&str, Pass)] = &[
    ("dead-handler-elimination", eliminate_dead_handlers),
    ("inline", inline_handlers),
];

/// Drops empty handler slots. The executor skips them anyway.
fn eliminate_dead_handlers(mut links: Vec<ChainLink>) -> Vec<ChainLink> {
    links.retain(|link| !link.handler.is_noop());
    links
}

/// Extension point for fusing adjacent handlers; currently the identity.
fn inline_handlers(links: Vec<ChainLink>) -> Vec<ChainLink> {
    links
}

/// Compiles chains from a [`LayerRegistry`] and caches them.
pub struct ChainCompiler {
    config: RwLock<CompilerConfig>,
    cache: RwLock<HashMap<CacheKey, Arc<CompiledChain>>>,
    compiles: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    cycle_errors: AtomicU64,
}

impl ChainCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            cache: RwLock::new(HashMap::new()),
            compiles: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            cycle_errors: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> CompilerConfig {
        self.config.read().clone()
    }

    /// Swaps the active configuration. Chains cached under the old one stay
    /// until they age out or are evicted; they are unreachable because the
    /// cache key covers the configuration.
    pub fn reconfigure(&self, config: CompilerConfig) {
        *self.config.write() = config;
    }

    /// Returns the chain for `layers`, compiling it on a cache miss.
    ///
    /// A dependency cycle fails this call only; nothing is cached and
    /// chains cached earlier stay valid.
    pub fn compile(&self, registry: &LayerRegistry, layers: LayerSet) -> Result<Compiled, Error> {
        let config = self.config();
        let key: CacheKey = (layers, config);
        let config = &key.1;

        {
            let cache = self.cache.read();
            if let Some(chain) = cache.get(&key) {
                if is_fresh(chain, config, registry.generation()) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(%layers, "chain cache hit");
                    return Ok(Compiled { chain: Arc::clone(chain), cache_hit: true });
                }
            }
        }

        let mut cache = self.cache.write();
        if let Some(chain) = cache.get(&key) {
            if is_fresh(chain, config, registry.generation()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Compiled { chain: Arc::clone(chain), cache_hit: true });
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let chain = match build(registry, layers, config) {
            Ok(chain) => Arc::new(chain),
            Err(err) => {
                if err.is_cycle() {
                    self.cycle_errors.fetch_add(1, Ordering::Relaxed);
                }
                warn!(%layers, error = %err, "chain compilation failed");
                return Err(err);
            }
        };
        self.compiles.fetch_add(1, Ordering::Relaxed);

        if !cache.contains_key(&key) {
            while cache.len() >= config.max_entries.max(1) {
                let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, c)| c.created_at)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                cache.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        cache.insert(key, Arc::clone(&chain));

        debug!(
            %layers,
            handlers = chain.optimized_len(),
            original = chain.original_len,
            elapsed = ?chain.compile_duration,
            "chain compiled"
        );
        Ok(Compiled { chain, cache_hit: false })
    }

    /// Drops every cached chain.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }

    /// Cached chains, oldest first.
    pub fn cached_chains(&self) -> Vec<Arc<CompiledChain>> {
        let mut chains: Vec<_> = self.cache.read().values().cloned().collect();
        chains.sort_by_key(|c| c.created_at);
        chains
    }

    pub fn stats(&self) -> CompilerStats {
        CompilerStats {
            compiles: self.compiles.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            cycle_errors: self.cycle_errors.load(Ordering::Relaxed),
            cached: self.cached(),
        }
    }
}

impl Default for ChainCompiler {
    fn default() -> Self {
        Self::new(CompilerConfig::default())
    }
}

/// Point-in-time compiler counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CompilerStats {
    pub compiles: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub cycle_errors: u64,
    pub cached: usize,
}

type CacheKey = (LayerSet, CompilerConfig);

fn is_fresh(chain: &CompiledChain, config: &CompilerConfig, generation: u64) -> bool {
    if config.invalidate_on_change && chain.generation != generation {
        return false;
    }
    config.expiry.is_none_or(|expiry| chain.age() < expiry)
}

fn build(registry: &LayerRegistry, layers: LayerSet, config: &CompilerConfig) -> Result<CompiledChain, Error> {
    let start = Instant::now();
    let (nodes, generation) = registry.snapshot(layers);
    let graph = DependencyGraph::build(nodes);
    trace!(%layers, nodes = graph.len(), edges = graph.edge_count(), "dependency graph built");
    let sorted = graph.sort()?;

    let mut links: Vec<ChainLink> = sorted
        .into_iter()
        .map(|node| ChainLink {
            name: node.name,
            layer: node.layer,
            priority: node.priority,
            handler: node.handler,
            stats: node.stats,
        })
        .collect();
    let original_len = links.len();

    if config.optimize {
        for (name, pass) in PASSES {
            let before = links.len();
            links = pass(links);
            trace!(pass = name, before, after = links.len(), "optimization pass");
        }
    }

    if links.len() > MAX_CHAIN_LEN {
        return Err(Error::ChainTooLong { len: links.len(), max: MAX_CHAIN_LEN });
    }

    Ok(CompiledChain {
        links,
        layers,
        generation,
        created_at: Instant::now(),
        compile_duration: start.elapsed(),
        original_len,
        stats: ChainStats::default(),
    })
}
