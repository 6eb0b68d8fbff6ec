//! Middleware registry.
//!
//! Entries are grouped by [`Layer`] and kept sorted by priority (lower first,
//! ties in insertion order). The registry itself never compiles anything and
//! never touches the chain cache; every mutation bumps a generation counter
//! that the compiler may compare against.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::graph::Node;
use crate::handler::Handler;
use crate::layer::{Layer, LayerSet};

/// Description of a middleware to register.
///
/// ```rust
/// use strata::{Middleware, RequestContext};
///
/// let log = Middleware::new("log", |ctx: &mut RequestContext| ctx.proceed())
///     .priority(2)
///     .depends_on("auth");
/// ```
#[derive(Clone, Debug)]
pub struct Middleware {
    name: String,
    handler: Handler,
    priority: i32,
    enabled: bool,
    dependencies: Vec<String>,
}

impl Middleware {
    pub fn new(name: impl Into<String>, handler: impl Into<Handler>) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            priority: 0,
            enabled: true,
            dependencies: Vec::new(),
        }
    }

    /// Lower runs first within a layer. Defaults to 0.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Run after `name` whenever both are part of the same compilation.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Registers the entry but keeps it out of compiled chains.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Invocation counters shared by a registry entry and every chain link
/// compiled from it.
#[derive(Debug, Default)]
pub struct EntryStats {
    invocations: AtomicU64,
    total_nanos: AtomicU64,
}

impl EntryStats {
    /// `elapsed` is inclusive: a wrapping handler counts the downstream
    /// handlers it ran through `proceed`.
    pub(crate) fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EntryStatsSnapshot {
        EntryStatsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            total_time: Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EntryStatsSnapshot {
    pub invocations: u64,
    pub total_time: Duration,
}

/// A read-only view of one registered entry.
#[derive(Clone, Debug, PartialEq)]
pub struct MiddlewareInfo {
    pub name: String,
    pub layer: Layer,
    pub priority: i32,
    pub enabled: bool,
    pub dependencies: Vec<String>,
    pub stats: EntryStatsSnapshot,
}

struct Entry {
    name: Arc<str>,
    handler: Handler,
    priority: i32,
    enabled: bool,
    dependencies: Vec<String>,
    seq: u64,
    stats: Arc<EntryStats>,
}

impl Entry {
    fn info(&self, layer: Layer) -> MiddlewareInfo {
        MiddlewareInfo {
            name: self.name.to_string(),
            layer,
            priority: self.priority,
            enabled: self.enabled,
            dependencies: self.dependencies.clone(),
            stats: self.stats.snapshot(),
        }
    }
}

#[derive(Default)]
struct Layers {
    lists: [Vec<Entry>; 4],
    next_seq: u64,
}

/// Middleware entries grouped by layer, behind one reader/writer lock.
#[derive(Default)]
pub struct LayerRegistry {
    inner: RwLock<Layers>,
    generation: AtomicU64,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` as `name` in `layer`.
    pub fn register(&self, layer: Layer, name: &str, handler: impl Into<Handler>, priority: i32) {
        self.add(layer, Middleware::new(name, handler).priority(priority));
    }

    /// Registers a fully described middleware.
    ///
    /// A second registration under the same name in the same layer replaces
    /// the first (last write wins). The replacement keeps the original
    /// insertion position for tie-breaking and starts with fresh statistics.
    pub fn add(&self, layer: Layer, mw: Middleware) {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        let list = &mut inner.lists[layer.index()];

        let replaced = match list.iter_mut().find(|e| *e.name == *mw.name) {
            Some(existing) => {
                existing.handler = mw.handler;
                existing.priority = mw.priority;
                existing.enabled = mw.enabled;
                existing.dependencies = mw.dependencies;
                existing.stats = Arc::new(EntryStats::default());
                true
            }
            None => {
                list.push(Entry {
                    name: Arc::from(mw.name.as_str()),
                    handler: mw.handler,
                    priority: mw.priority,
                    enabled: mw.enabled,
                    dependencies: mw.dependencies,
                    seq,
                    stats: Arc::new(EntryStats::default()),
                });
                false
            }
        };
        list.sort_by_key(|e| (e.priority, e.seq));
        if !replaced {
            inner.next_seq += 1;
        }
        self.generation.fetch_add(1, Ordering::Release);

        debug!(%layer, name = %mw.name, priority = mw.priority, replaced, "middleware registered");
    }

    /// Toggles participation in future compilations. Returns `false` if no
    /// such entry exists.
    pub fn set_enabled(&self, layer: Layer, name: &str, enabled: bool) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.lists[layer.index()].iter_mut().find(|e| &*e.name == name) else {
            return false;
        };
        if entry.enabled != enabled {
            entry.enabled = enabled;
            self.generation.fetch_add(1, Ordering::Release);
            debug!(%layer, name, enabled, "middleware toggled");
        }
        true
    }

    pub fn enable(&self, layer: Layer, name: &str) -> bool {
        self.set_enabled(layer, name, true)
    }

    pub fn disable(&self, layer: Layer, name: &str) -> bool {
        self.set_enabled(layer, name, false)
    }

    /// Removes an entry outright.
    pub fn remove(&self, layer: Layer, name: &str) -> bool {
        let mut inner = self.inner.write();
        let list = &mut inner.lists[layer.index()];
        let before = list.len();
        list.retain(|e| &*e.name != name);
        let removed = list.len() != before;
        if removed {
            self.generation.fetch_add(1, Ordering::Release);
        }
        removed
    }

    pub fn lookup(&self, layer: Layer, name: &str) -> Option<MiddlewareInfo> {
        let inner = self.inner.read();
        inner.lists[layer.index()]
            .iter()
            .find(|e| &*e.name == name)
            .map(|e| e.info(layer))
    }

    /// Every entry of `layer`, enabled or not, in priority order.
    pub fn entries(&self, layer: Layer) -> Vec<MiddlewareInfo> {
        let inner = self.inner.read();
        inner.lists[layer.index()].iter().map(|e| e.info(layer)).collect()
    }

    /// Number of entries in `layer`, and how many of them are enabled.
    pub fn count(&self, layer: Layer) -> (usize, usize) {
        let inner = self.inner.read();
        let list = &inner.lists[layer.index()];
        (list.len(), list.iter().filter(|e| e.enabled).count())
    }

    /// Incremented by every mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Enabled entries of `layers` in discovery order (layer, then
    /// priority, then insertion), together with the generation they were
    /// read at.
    pub(crate) fn snapshot(&self, layers: LayerSet) -> (Vec<Node>, u64) {
        let inner = self.inner.read();
        let generation = self.generation.load(Ordering::Acquire);
        let nodes = layers
            .iter()
            .flat_map(|layer| {
                inner.lists[layer.index()]
                    .iter()
                    .filter(|e| e.enabled)
                    .map(move |e| Node {
                        name: Arc::clone(&e.name),
                        layer,
                        priority: e.priority,
                        handler: e.handler.clone(),
                        dependencies: e.dependencies.clone(),
                        stats: Arc::clone(&e.stats),
                    })
            })
            .collect();
        (nodes, generation)
    }
}
