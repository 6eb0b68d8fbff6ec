//! HTTP server: the pipeline's request lifecycle on top of hyper.
//!
//! Per request:
//! 1. Route lookup picks the endpoint and the layer set in front of it.
//! 2. The chain for that layer set is compiled, normally a cache hit.
//! 3. A context is acquired from the pool and the chain executed.
//! 4. If the chain completed, the endpoint runs and produces the response;
//!    if it aborted, whatever the middleware wrote is sent instead.
//! 5. The context goes back to the pool.
//!
//! On SIGTERM or Ctrl-C the server stops accepting, lets in-flight
//! connections finish, then returns from [`Server::serve`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::pipeline::{Outcome, Pipeline};
use crate::pool::ContextPool;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` (`host:port`) when
    /// [`serve`](Server::serve) is called.
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let addr = addr.parse().map_err(|_| Error::InvalidAddress(addr.to_owned()))?;
        Ok(Self { addr })
    }

    /// Accepts connections and runs every request through `pipeline` and
    /// `router` until a shutdown signal arrives and in-flight connections
    /// have drained.
    pub async fn serve(self, router: Router, pipeline: Arc<Pipeline>) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        let router = Arc::new(router);

        info!(addr = %self.addr, "strata listening");

        let mut tasks = tokio::task::JoinSet::new();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Shutdown first, so a signal stops accepting even while
                // connections are queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let pipeline = Arc::clone(&pipeline);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let router = Arc::clone(&router);
                            let pipeline = Arc::clone(&pipeline);
                            async move { dispatch(&router, &pipeline, req).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(%peer, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("strata stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Reads the body and hands the request to [`respond`]. Never fails towards
/// hyper: every problem becomes a status code.
async fn dispatch(
    router: &Router,
    pipeline: &Pipeline,
    req: hyper::Request<Incoming>,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("failed to read request body: {e}");
            return Ok(Response::status(StatusCode::BAD_REQUEST).into_http());
        }
    };
    let req = Request::from_parts(parts.method, parts.uri.path().to_owned(), parts.headers, body);
    Ok(respond(router, pipeline, req).await.into_http())
}

/// The hot path: one request in, one response out.
pub(crate) async fn respond(router: &Router, pipeline: &Pipeline, mut req: Request) -> Response {
    let Some(matched) = router.lookup(req.method(), req.path()) else {
        return Response::status(StatusCode::NOT_FOUND);
    };

    let chain = match pipeline.compile(matched.layers) {
        Ok(compiled) => compiled.chain,
        Err(e) => {
            error!(layers = %matched.layers, "cannot build middleware chain: {e}");
            return Response::status(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    req.set_params(matched.params);
    let mut ctx = pipeline.acquire(req);
    let mut lease = Lease { pool: pipeline.pool(), settled: false };
    let outcome = pipeline.execute(&chain, &mut ctx);

    let response = match (outcome, ctx.take_request()) {
        (Outcome::Completed, Some(req)) => {
            let written = ctx.take_response();
            let mut res = matched.endpoint.call(req).await;
            written.merge_headers_into(&mut res);
            res
        }
        _ => ctx.take_response(),
    };

    pipeline.release(ctx);
    lease.settled = true;
    response
}

/// Keeps the pool's in-use gauge honest when a request never reaches
/// `release`: a handler or endpoint panicked with no recovery middleware in
/// front of it, or hyper dropped the response future mid-flight.
struct Lease<'a> {
    pool: &'a ContextPool,
    settled: bool,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("request context dropped without release");
            self.pool.abandon();
        }
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on SIGTERM or SIGINT (Ctrl-C). On Windows only Ctrl-C exists.
/// A signal that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}
