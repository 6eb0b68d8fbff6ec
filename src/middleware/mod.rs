//! Built-in middleware.
//!
//! Each function returns a [`Handler`](crate::Handler) ready to register on
//! any layer. Where they sit in a chain matters:
//!
//! - [`recovery`] goes first (lowest priority in [`Layer::Global`](crate::Layer::Global))
//!   so it wraps everything that can panic.
//! - [`logger`] wraps the rest of the chain to time it.
//! - [`deadline`] bounds how long the remainder may run.
//!
//! ```rust
//! use strata::{Layer, Pipeline, middleware};
//! use std::time::Duration;
//!
//! let pipeline = Pipeline::new();
//! pipeline.register(Layer::Global, "recovery", middleware::recovery(), i32::MIN);
//! pipeline.register(Layer::Global, "logger",   middleware::logger(),   0);
//! pipeline.register(Layer::Global, "deadline", middleware::deadline(Duration::from_secs(5)), 1);
//! ```

mod deadline;
mod logger;
mod recovery;

pub use deadline::deadline;
pub use logger::logger;
pub use recovery::recovery;
