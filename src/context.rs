//! Per-request state.
//!
//! A [`RequestContext`] is exclusively owned by the task handling one request.
//! It is acquired from a [`ContextPool`](crate::ContextPool) when the request
//! starts and released back when it ends; the pool resets it in between.
//!
//! The key/value store and the error list live behind a [`SharedState`]
//! handle with their own locks, because helper threads spawned by a request
//! may write to them. Everything else is plain data touched only through
//! `&mut self`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use http::StatusCode;
use parking_lot::Mutex;

use crate::chain::CompiledChain;
use crate::error::RequestError;
use crate::request::Request;
use crate::response::Response;

type Value = Box<dyn Any + Send + Sync>;

/// The lock-protected part of a context, shareable with helper threads.
///
/// A context whose `SharedState` is still referenced elsewhere at release
/// time is dropped instead of being pooled.
#[derive(Default)]
pub struct SharedState {
    values: Mutex<HashMap<String, Value>>,
    errors: Mutex<Vec<RequestError>>,
}

impl SharedState {
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values.lock().insert(key.into(), Box::new(value));
    }

    /// Clones the value stored under `key` if it exists and is a `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.values.lock().get(key)?.downcast_ref::<T>().cloned()
    }

    pub fn push_error(&self, err: RequestError) {
        self.errors.lock().push(err);
    }

    fn clear(&self) {
        // `clear` keeps the table's capacity for the next request.
        self.values.lock().clear();
        self.errors.lock().clear();
    }
}

/// Mutable state for one in-flight request.
pub struct RequestContext {
    shared: Arc<SharedState>,
    request: Option<Request>,
    response: Response,
    written: bool,
    aborted: bool,
    /// Index of the next chain link to invoke.
    cursor: usize,
    chain: Option<Arc<CompiledChain>>,
    deadline: Option<Instant>,
    pooled: bool,
}

impl RequestContext {
    /// A standalone context. Contexts built this way are never pooled.
    pub fn new(request: Request) -> Self {
        Self::blank(false).with_request(request)
    }

    pub(crate) fn blank(pooled: bool) -> Self {
        Self {
            shared: Arc::new(SharedState::default()),
            request: None,
            response: Response::default(),
            written: false,
            aborted: false,
            cursor: 0,
            chain: None,
            deadline: None,
            pooled,
        }
    }

    fn with_request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub(crate) fn attach(&mut self, request: Request) {
        self.request = Some(request);
        self.response.reset();
        self.written = false;
        self.cursor = 0;
    }

    /// Clears everything a later request could observe. Returns `false` if
    /// the context must not be reused.
    pub(crate) fn reset(&mut self) -> bool {
        if Arc::strong_count(&self.shared) > 1 {
            return false;
        }
        self.shared.clear();
        self.request = None;
        self.response.reset();
        self.written = false;
        self.aborted = false;
        self.cursor = 0;
        self.chain = None;
        self.deadline = None;
        true
    }

    pub(crate) fn is_pooled(&self) -> bool {
        self.pooled
    }

    // ── Request / response ────────────────────────────────────────────────────

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn request_mut(&mut self) -> Option<&mut Request> {
        self.request.as_mut()
    }

    /// Moves the request out, e.g. to hand it to the endpoint.
    pub fn take_request(&mut self) -> Option<Request> {
        self.request.take()
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Mutable access to the response writer. Marks the response as written.
    pub fn response_mut(&mut self) -> &mut Response {
        self.written = true;
        &mut self.response
    }

    /// Replaces the response.
    pub fn respond(&mut self, response: Response) {
        self.response = response;
        self.written = true;
    }

    /// `true` once any handler wrote to the response.
    pub fn is_written(&self) -> bool {
        self.written
    }

    pub(crate) fn take_response(&mut self) -> Response {
        self.written = false;
        std::mem::take(&mut self.response)
    }

    // ── Key/value store ───────────────────────────────────────────────────────

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.shared.set(key, value);
    }

    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.shared.get(key)
    }

    /// Runs `f` against the value under `key` without cloning it.
    pub fn with_value<T: Any, R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        let values = self.shared.values.lock();
        values.get(key)?.downcast_ref::<T>().map(f)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.shared.values.lock().remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.values.lock().contains_key(key)
    }

    pub fn value_count(&self) -> usize {
        self.shared.values.lock().len()
    }

    /// A handle for helper threads. Must be dropped before the request ends.
    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    // ── Errors ────────────────────────────────────────────────────────────────

    pub fn push_error(&self, err: RequestError) {
        self.shared.push_error(err);
    }

    pub fn errors(&self) -> Vec<RequestError> {
        self.shared.errors.lock().clone()
    }

    pub fn last_error(&self) -> Option<RequestError> {
        self.shared.errors.lock().last().cloned()
    }

    pub fn error_count(&self) -> usize {
        self.shared.errors.lock().len()
    }

    // ── Flow control ──────────────────────────────────────────────────────────

    /// Runs the rest of the chain inline, then returns to the caller.
    ///
    /// Each call advances the cursor past every handler it invokes, so when a
    /// wrapping handler's `proceed` returns the chain is exhausted (or
    /// aborted) and the executor invokes nothing further. Outside a chain
    /// this does nothing.
    pub fn proceed(&mut self) {
        let Some(chain) = self.chain.clone() else {
            return;
        };
        let links = chain.links();
        while self.cursor < links.len() && !self.aborted {
            let link = &links[self.cursor];
            self.cursor += 1;
            link.invoke(self);
        }
    }

    /// Stops forward progress. Handlers that already called
    /// [`proceed`](Self::proceed) still finish their own after-logic.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Aborts and writes an empty response with `status`.
    pub fn abort_with(&mut self, status: StatusCode) {
        self.response_mut().set_status(status);
        self.abort();
    }

    /// Records `err` and aborts.
    pub fn abort_with_error(&mut self, err: RequestError) {
        self.push_error(err);
        self.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Index of the handler currently running (or last run), `None` before
    /// the first one.
    pub fn index(&self) -> Option<usize> {
        self.cursor.checked_sub(1)
    }

    /// The chain this context is executing, if any.
    pub fn chain(&self) -> Option<&CompiledChain> {
        self.chain.as_deref()
    }

    pub(crate) fn set_chain(&mut self, chain: Arc<CompiledChain>) {
        self.chain = Some(chain);
    }

    /// `true` once the cursor has passed every link of the attached chain.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.chain.as_ref().is_some_and(|c| self.cursor >= c.len())
    }

    // ── Deadline ──────────────────────────────────────────────────────────────

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new(Request::default())
    }

    #[test]
    fn values_round_trip_by_type() {
        let ctx = ctx();
        ctx.set("user", String::from("alice"));
        ctx.set("attempts", 3u32);

        assert_eq!(ctx.get::<String>("user").as_deref(), Some("alice"));
        assert_eq!(ctx.get::<u32>("attempts"), Some(3));
        assert_eq!(ctx.get::<u64>("attempts"), None);
        assert_eq!(ctx.with_value("user", |s: &String| s.len()), Some(5));
        assert!(ctx.remove("user"));
        assert!(!ctx.contains_key("user"));
        assert_eq!(ctx.value_count(), 1);
    }

    #[test]
    fn errors_keep_report_order() {
        let ctx = ctx();
        ctx.push_error(RequestError::new("first"));
        ctx.push_error(RequestError::new("second"));
        assert_eq!(ctx.error_count(), 2);
        assert_eq!(ctx.last_error().map(|e| e.message().to_owned()).as_deref(), Some("second"));
        assert_eq!(ctx.errors()[0].message(), "first");
    }

    #[test]
    fn helper_threads_write_through_shared_handle() {
        let ctx = ctx();
        let shared = ctx.shared();
        std::thread::spawn(move || {
            shared.set("from-helper", true);
            shared.push_error(RequestError::new("helper failed"));
        })
        .join()
        .unwrap();

        assert_eq!(ctx.get::<bool>("from-helper"), Some(true));
        assert_eq!(ctx.error_count(), 1);
    }

    #[test]
    fn reset_refuses_while_shared_handle_alive() {
        let mut ctx = ctx();
        let handle = ctx.shared();
        assert!(!ctx.reset());
        drop(handle);
        assert!(ctx.reset());
    }

    #[test]
    fn reset_clears_everything() {
        let mut ctx = ctx();
        ctx.set("k", 1u8);
        ctx.abort_with(StatusCode::FORBIDDEN);
        ctx.set_deadline(Instant::now());
        assert!(ctx.reset());

        assert_eq!(ctx.value_count(), 0);
        assert!(!ctx.is_aborted());
        assert!(!ctx.is_written());
        assert_eq!(ctx.response().status_code(), StatusCode::OK);
        assert!(ctx.request().is_none());
        assert!(ctx.deadline().is_none());
        assert_eq!(ctx.index(), None);
    }

    #[test]
    fn proceed_without_chain_is_noop() {
        let mut ctx = ctx();
        ctx.proceed();
        assert_eq!(ctx.index(), None);
    }
}
