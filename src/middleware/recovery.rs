//! Panic recovery.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use http::StatusCode;
use tracing::error;

use crate::context::RequestContext;
use crate::error::RequestError;
use crate::handler::Handler;
use crate::response::Response;

/// Runs the rest of the chain and turns a panic anywhere downstream into a
/// recorded [`RequestError`], an abort and a `500`.
///
/// Without it a panicking handler unwinds out of
/// [`Pipeline::execute`](crate::Pipeline::execute) into the serving task.
pub fn recovery() -> Handler {
    Handler::new(|ctx: &mut RequestContext| {
        let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| ctx.proceed())) else {
            return;
        };
        let message = panic_message(payload.as_ref());
        error!(
            path = ctx.request().map(|r| r.path()).unwrap_or("-"),
            handler = ?ctx.index(),
            %message,
            "handler panicked"
        );
        ctx.abort_with_error(RequestError::panic(message));
        ctx.respond(Response::status(StatusCode::INTERNAL_SERVER_ERROR));
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestErrorKind;
    use crate::layer::{Layer, LayerSet};
    use crate::pipeline::{Outcome, Pipeline};
    use crate::request::Request;

    #[test]
    fn panic_downstream_is_recorded_and_aborts() {
        let p = Pipeline::new();
        p.register(Layer::Global, "recovery", recovery(), 0);
        p.register(Layer::Route, "boom", Handler::new(|_: &mut RequestContext| panic!("boom")), 0);
        p.register(Layer::Route, "after", |ctx: &mut RequestContext| ctx.set("reached", true), 1);

        let chain = p.compile(LayerSet::all()).unwrap().chain;
        let mut ctx = p.acquire(Request::default());
        assert_eq!(p.execute(&chain, &mut ctx), Outcome::Aborted);

        assert_eq!(ctx.get::<bool>("reached"), None);
        assert_eq!(ctx.response().status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let err = ctx.last_error().unwrap();
        assert_eq!(err.kind(), RequestErrorKind::Panic);
        assert_eq!(err.message(), "boom");
        p.release(ctx);
    }

    #[test]
    fn quiet_chain_is_untouched() {
        let p = Pipeline::new();
        p.register(Layer::Global, "recovery", recovery(), 0);
        let chain = p.compile(LayerSet::all()).unwrap().chain;
        let mut ctx = p.acquire(Request::default());
        assert_eq!(p.execute(&chain, &mut ctx), Outcome::Completed);
        assert_eq!(ctx.error_count(), 0);
        assert!(!ctx.is_written());
    }

    #[test]
    fn formatted_panic_message_is_kept() {
        let payload: Box<dyn Any + Send> = Box::new(format!("code {}", 7));
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }
}
