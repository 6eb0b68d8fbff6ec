//! Handler types and type erasure.
//!
//! Two kinds of callable flow through strata:
//!
//! - [`Handler`] — a middleware. One uniform, synchronous closure type
//!   `Fn(&mut RequestContext)`. It runs inside a compiled chain and either
//!   returns (the executor moves on), calls
//!   [`RequestContext::proceed`](crate::RequestContext::proceed) to run the
//!   rest of the chain inline, or aborts.
//! - [`Endpoint`] — the async route handler the router dispatches to once the
//!   chain has completed without aborting.
//!
//! ```text
//! |ctx: &mut RequestContext| { … }         ← user writes this
//!        ↓ Handler::from(closure)
//! Some(Arc<dyn Fn(&mut RequestContext)>)   ← shared by every chain that uses it
//!        ↓ compiled into ChainLink
//! link.invoke(ctx)                         ← one vtable call per hop
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

// ── Middleware handlers ───────────────────────────────────────────────────────

type HandlerFn = dyn Fn(&mut RequestContext) + Send + Sync + 'static;

/// A middleware handler.
///
/// Cloning is one atomic increment. `Handler::noop()` is an empty slot:
/// invoking it does nothing, and the compiler's dead-handler pass removes it.
#[derive(Clone)]
pub struct Handler(Option<Arc<HandlerFn>>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut RequestContext) + Send + Sync + 'static,
    {
        Self(Some(Arc::new(f)))
    }

    /// An empty slot.
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn is_noop(&self) -> bool {
        self.0.is_none()
    }

    pub(crate) fn call(&self, ctx: &mut RequestContext) {
        if let Some(f) = &self.0 {
            f(ctx);
        }
    }
}

impl<F> From<F> for Handler
where
    F: Fn(&mut RequestContext) + Send + Sync + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_noop() { "Handler(noop)" } else { "Handler(fn)" })
    }
}

// ── Endpoints ─────────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future that resolves to a [`Response`].
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

#[doc(hidden)]
pub trait ErasedEndpoint {
    fn call(&self, req: Request) -> BoxFuture;
}

#[doc(hidden)]
pub type BoxedEndpoint = Arc<dyn ErasedEndpoint + Send + Sync + 'static>;

/// Implemented for every valid route endpoint:
///
/// ```text
/// async fn name(req: Request) -> impl IntoResponse
/// ```
///
/// Sealed: only the blanket impl below satisfies it.
pub trait Endpoint: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_endpoint(self) -> BoxedEndpoint;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Endpoint for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_endpoint(self) -> BoxedEndpoint {
        Arc::new(FnEndpoint(self))
    }
}

struct FnEndpoint<F>(F);

impl<F, Fut, R> ErasedEndpoint for FnEndpoint<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_handler_does_nothing() {
        let mut ctx = RequestContext::new(Request::default());
        let h = Handler::noop();
        assert!(h.is_noop());
        h.call(&mut ctx);
        assert!(!ctx.is_aborted());
    }

    #[test]
    fn closure_converts_into_handler() {
        let h: Handler = (|ctx: &mut RequestContext| ctx.abort()).into();
        assert!(!h.is_noop());

        let mut ctx = RequestContext::new(Request::default());
        h.call(&mut ctx);
        assert!(ctx.is_aborted());
    }
}
