//! Radix-tree request router.
//!
//! One tree per HTTP method, O(path-length) lookup. Each route carries the
//! [`LayerSet`] whose middleware run in front of it; routes sharing a layer
//! set share one cached chain.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::handler::{BoxedEndpoint, Endpoint};
use crate::layer::LayerSet;

#[derive(Clone)]
struct Route {
    endpoint: BoxedEndpoint,
    layers: LayerSet,
}

/// A matched route.
pub(crate) struct Matched {
    pub(crate) endpoint: BoxedEndpoint,
    pub(crate) layers: LayerSet,
    pub(crate) params: HashMap<String, String>,
}

/// The application router. Build it once at startup and pass it to
/// [`Server::serve`](crate::Server::serve).
///
/// ```rust,no_run
/// # use strata::{Layer, LayerSet, Request, Response, Router};
/// # use http::Method;
/// # async fn get_user(_: Request) -> Response { Response::text("") }
/// # async fn healthz(_: Request) -> Response { Response::text("ok") }
/// Router::new()
///     .get("/users/{id}", get_user)
///     .on_layers(Method::GET, "/healthz", Layer::Global, healthz);
/// ```
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Registers `endpoint` behind the middleware of every layer.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with one already
    /// registered for `method`.
    pub fn on(self, method: Method, path: &str, endpoint: impl Endpoint) -> Self {
        self.on_layers(method, path, LayerSet::all(), endpoint)
    }

    /// Registers `endpoint` behind the middleware of `layers` only.
    pub fn on_layers(
        mut self,
        method: Method,
        path: &str,
        layers: impl Into<LayerSet>,
        endpoint: impl Endpoint,
    ) -> Self {
        let route = Route { endpoint: endpoint.into_boxed_endpoint(), layers: layers.into() };
        self.routes
            .entry(method)
            .or_default()
            .insert(path, route)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, endpoint: impl Endpoint) -> Self {
        self.on(Method::GET, path, endpoint)
    }

    pub fn post(self, path: &str, endpoint: impl Endpoint) -> Self {
        self.on(Method::POST, path, endpoint)
    }

    pub fn put(self, path: &str, endpoint: impl Endpoint) -> Self {
        self.on(Method::PUT, path, endpoint)
    }

    pub fn delete(self, path: &str, endpoint: impl Endpoint) -> Self {
        self.on(Method::DELETE, path, endpoint)
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Option<Matched> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some(Matched {
            endpoint: Arc::clone(&matched.value.endpoint),
            layers: matched.value.layers,
            params,
        })
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}
