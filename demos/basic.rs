//! Minimal strata example: a few middleware across layers in front of two
//! endpoints.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/users/42
//!   curl -i -H 'authorization: token' http://localhost:3000/users/42
//!   curl -i http://localhost:3000/healthz

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use strata::{Layer, Middleware, Pipeline, Request, RequestContext, Response, Router, Server, middleware};

#[tokio::main]
async fn main() -> Result<(), strata::Error> {
    tracing_subscriber::fmt::init();

    let pipeline = Arc::new(Pipeline::new());
    pipeline.register(Layer::Global, "recovery", middleware::recovery(), i32::MIN);
    pipeline.register(Layer::Global, "logger", middleware::logger(), 0);
    pipeline.register(Layer::Route, "deadline", middleware::deadline(Duration::from_secs(2)), 0);
    pipeline.add(Layer::Controller, Middleware::new("auth", auth).priority(1));
    pipeline.add(
        Layer::Controller,
        Middleware::new("audit", audit).priority(0).depends_on("auth"),
    );

    // Fail at startup, not on the first request, if the wiring is cyclic.
    pipeline.compile(strata::LayerSet::all())?;

    let app = Router::new()
        .get("/users/{id}", get_user)
        .on_layers(Method::GET, "/healthz", Layer::Global, healthz);

    Server::bind("0.0.0.0:3000")?.serve(app, pipeline).await
}

fn auth(ctx: &mut RequestContext) {
    match ctx.request().and_then(|r| r.header("authorization")).map(str::to_owned) {
        Some(token) => ctx.set("token", token),
        None => ctx.abort_with(StatusCode::UNAUTHORIZED),
    }
}

// Runs after `auth` despite its lower priority.
fn audit(ctx: &mut RequestContext) {
    if let Some(token) = ctx.get::<String>("token") {
        tracing::info!(token_len = token.len(), "audited");
    }
}

async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(format!(r#"{{"id":"{id}","name":"alice"}}"#).into_bytes())
}

async fn healthz(_req: Request) -> Response {
    Response::text("ok")
}
