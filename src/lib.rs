//! # strata
//!
//! The request-processing core of a web framework: a layered middleware
//! pipeline.
//!
//! Middleware are registered into four fixed layers (`Global`, `Group`,
//! `Route`, `Controller`), each with a priority and optional named
//! dependencies. Compiling a set of layers resolves those dependencies into
//! one deterministic order, caches it as an immutable chain, and every
//! request then runs that chain against a pooled, reusable context.
//!
//! ## Ordering rules
//!
//! - A middleware runs after every middleware it depends on, if that
//!   dependency is part of the same compilation. Missing dependencies are
//!   ignored; a cycle fails the compile.
//! - Otherwise lower layers run first, then lower priorities, then earlier
//!   registrations.
//!
//! ## Quick start
//!
//! ```rust
//! use strata::{Layer, LayerSet, Middleware, Outcome, Pipeline, Request, RequestContext, middleware};
//! use http::StatusCode;
//!
//! let pipeline = Pipeline::new();
//! pipeline.register(Layer::Global, "recovery", middleware::recovery(), i32::MIN);
//! pipeline.add(
//!     Layer::Controller,
//!     Middleware::new("auth", |ctx: &mut RequestContext| {
//!         if ctx.request().and_then(|r| r.header("authorization")).is_none() {
//!             ctx.abort_with(StatusCode::UNAUTHORIZED);
//!         }
//!     })
//!     .priority(1),
//! );
//!
//! let chain = pipeline.compile(LayerSet::all()).unwrap().chain;
//! let mut ctx = pipeline.acquire(Request::default());
//! assert_eq!(pipeline.execute(&chain, &mut ctx), Outcome::Aborted);
//! assert_eq!(ctx.response().status_code(), StatusCode::UNAUTHORIZED);
//! pipeline.release(ctx);
//! ```
//!
//! ## Serving
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata::{Pipeline, Request, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), strata::Error> {
//!     let pipeline = Arc::new(Pipeline::new());
//!     let app = Router::new().get("/users/{id}", get_user);
//!     Server::bind("0.0.0.0:3000")?.serve(app, pipeline).await
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     Response::text(req.param("id").unwrap_or("unknown").to_owned())
//! }
//! ```

mod chain;
mod compiler;
mod context;
mod error;
mod graph;
mod handler;
mod layer;
mod pipeline;
mod pool;
mod registry;
mod request;
mod response;
mod router;
mod server;

pub mod middleware;

pub use chain::{ChainLink, ChainStatsSnapshot, CompiledChain, MAX_CHAIN_LEN};
pub use compiler::{ChainCompiler, Compiled, CompilerConfig, CompilerStats};
pub use context::{RequestContext, SharedState};
pub use error::{Error, RequestError, RequestErrorKind};
pub use handler::{Endpoint, Handler};
pub use layer::{Layer, LayerSet};
pub use pipeline::{
    CachedChainInfo, DebugDump, LayerStats, Outcome, Pipeline, PipelineConfig, PipelineStats,
};
pub use pool::{ContextPool, PoolConfig, PoolMetrics};
pub use registry::{EntryStats, EntryStatsSnapshot, LayerRegistry, Middleware, MiddlewareInfo};
pub use request::Request;
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
