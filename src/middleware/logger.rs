//! Request logging.

use std::time::Instant;

use tracing::{info, warn};

use crate::context::RequestContext;
use crate::handler::Handler;

/// Times the rest of the chain and emits one event per request.
///
/// Requests that reported errors are logged at `WARN` with the last one;
/// everything else at `INFO`.
pub fn logger() -> Handler {
    Handler::new(|ctx: &mut RequestContext| {
        let start = Instant::now();
        ctx.proceed();
        let elapsed = start.elapsed();

        let req = ctx.request();
        let method = req.map(|r| r.method().as_str()).unwrap_or("-");
        let path = req.map(|r| r.path()).unwrap_or("-");
        let status = ctx.is_written().then(|| ctx.response().status_code().as_u16());

        match ctx.last_error() {
            Some(err) => warn!(
                method,
                path,
                status,
                ?elapsed,
                aborted = ctx.is_aborted(),
                errors = ctx.error_count(),
                last_error = %err,
                "request"
            ),
            None => info!(method, path, status, ?elapsed, aborted = ctx.is_aborted(), "request"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestError;
    use crate::layer::{Layer, LayerSet};
    use crate::pipeline::{Outcome, Pipeline};
    use crate::request::Request;

    #[test]
    fn logger_passes_control_through() {
        let p = Pipeline::new();
        p.register(Layer::Global, "logger", logger(), 0);
        p.register(
            Layer::Route,
            "work",
            |ctx: &mut RequestContext| ctx.push_error(RequestError::new("soft failure")),
            0,
        );

        let chain = p.compile(LayerSet::all()).unwrap().chain;
        let mut ctx = p.acquire(Request::default());
        assert_eq!(p.execute(&chain, &mut ctx), Outcome::Completed);
        assert_eq!(ctx.error_count(), 1);
        assert_eq!(ctx.index(), Some(1));
    }
}
