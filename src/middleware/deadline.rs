//! Per-request time budget.

use std::time::{Duration, Instant};

use http::StatusCode;
use tracing::warn;

use crate::context::RequestContext;
use crate::error::RequestError;
use crate::handler::Handler;
use crate::response::Response;

/// Gives the rest of the chain `budget` to finish.
///
/// Handlers are synchronous, so nothing is preempted: the deadline is
/// published on the context (an earlier one already set is kept) for
/// downstream handlers to poll through
/// [`RequestContext::is_expired`], and an overrun is reported once the
/// remainder returns by recording a timeout error, aborting, and writing
/// `504` unless a response was already written.
pub fn deadline(budget: Duration) -> Handler {
    Handler::new(move |ctx: &mut RequestContext| {
        let start = Instant::now();
        let deadline = start + budget;
        if ctx.deadline().is_none_or(|d| d > deadline) {
            ctx.set_deadline(deadline);
        }

        ctx.proceed();

        let elapsed = start.elapsed();
        if elapsed > budget {
            warn!(?elapsed, ?budget, "request exceeded its deadline");
            ctx.abort_with_error(RequestError::timeout(elapsed, budget));
            if !ctx.is_written() {
                ctx.respond(Response::status(StatusCode::GATEWAY_TIMEOUT));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestErrorKind;
    use crate::layer::{Layer, LayerSet};
    use crate::pipeline::{Outcome, Pipeline};
    use crate::request::Request;

    #[test]
    fn overrun_aborts_with_gateway_timeout() {
        let p = Pipeline::new();
        p.register(Layer::Global, "deadline", deadline(Duration::from_millis(5)), 0);
        p.register(
            Layer::Route,
            "slow",
            |ctx: &mut RequestContext| {
                std::thread::sleep(Duration::from_millis(20));
                ctx.set("expired", ctx.is_expired());
            },
            0,
        );

        let chain = p.compile(LayerSet::all()).unwrap().chain;
        let mut ctx = p.acquire(Request::default());
        assert_eq!(p.execute(&chain, &mut ctx), Outcome::Aborted);
        assert_eq!(ctx.get::<bool>("expired"), Some(true));
        assert_eq!(ctx.response().status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ctx.last_error().unwrap().kind(), RequestErrorKind::Timeout);
    }

    #[test]
    fn fast_chain_completes() {
        let p = Pipeline::new();
        p.register(Layer::Global, "deadline", deadline(Duration::from_secs(5)), 0);
        let chain = p.compile(LayerSet::all()).unwrap().chain;
        let mut ctx = p.acquire(Request::default());
        assert_eq!(p.execute(&chain, &mut ctx), Outcome::Completed);
        assert!(ctx.deadline().is_some());
        assert!(!ctx.is_expired());
    }

    #[test]
    fn tighter_existing_deadline_is_kept() {
        let mut ctx = RequestContext::new(Request::default());
        let tight = Instant::now() + Duration::from_millis(1);
        ctx.set_deadline(tight);
        deadline(Duration::from_secs(60)).call(&mut ctx);
        assert_eq!(ctx.deadline(), Some(tight));
    }
}
