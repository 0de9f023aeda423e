//! Builder DSL for handler chains.
//!
//! ```
//! use trestle_core::chain::Chain;
//! use trestle_core::handler::handler;
//!
//! let app = Chain::new()
//!     .get("users/:id", handler(|ctx| async move {
//!         let id = ctx.path_tokens().get("id").unwrap_or_default().to_string();
//!         ctx.response().send_text(id);
//!         Ok(())
//!     }))
//!     .prefix("admin", |admin| admin.all(trestle_core::handlers::client_error(403)))
//!     .build()
//!     .unwrap();
//! # drop(app);
//! ```
//!
//! Pattern errors are collected while building and reported by
//! [`Chain::build`].

use crate::handler::{BoxedHandler, Handler, Handlers, IntoHandler};
use crate::handlers::{self, MethodFallback, MethodTracker};
use crate::logging::warn;
use crate::registry::Registry;
use crate::static_assets::FileHandlerSpec;
use crate::{Context, Error};
use async_trait::async_trait;
use http::Method;

/// Accumulates handlers in declaration order.
#[derive(Debug, Default)]
pub struct Chain {
    handlers: Vec<BoxedHandler>,
    error: Option<Error>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, handler: Result<BoxedHandler, Error>) -> Self {
        match handler {
            Ok(handler) => self.handlers.push(handler),
            Err(e) => {
                warn!(error = %e, "Invalid chain declaration");
                self.error.get_or_insert(e);
            }
        }
        self
    }

    fn nested(build: impl FnOnce(Chain) -> Chain) -> Result<BoxedHandler, Error> {
        build(Chain::new()).build().map(IntoHandler::into_handler)
    }

    /// Add a handler that sees every request reaching this point.
    pub fn all(self, handler: impl IntoHandler) -> Self {
        self.push(Ok(handler.into_handler()))
    }

    /// Run `handler` when the remaining path matches `pattern` exactly.
    pub fn path(self, pattern: &str, handler: impl IntoHandler) -> Self {
        self.push(handlers::path(pattern, [handler.into_handler()]))
    }

    /// Build a nested chain for requests under `pattern`.
    pub fn prefix(self, pattern: &str, build: impl FnOnce(Chain) -> Chain) -> Self {
        let handler = Self::nested(build).and_then(|chain| handlers::prefix(pattern, [chain]));
        self.push(handler)
    }

    /// Run `handler` for `method` requests on `pattern`. An empty pattern
    /// matches any path.
    pub fn route(self, method: Method, pattern: &str, handler: impl IntoHandler) -> Self {
        let filtered = handlers::method([method], handler);
        if pattern.is_empty() {
            self.push(Ok(filtered))
        } else {
            self.push(handlers::path(pattern, [filtered]))
        }
    }

    pub fn get(self, pattern: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post(self, pattern: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::POST, pattern, handler)
    }

    pub fn put(self, pattern: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::PUT, pattern, handler)
    }

    pub fn patch(self, pattern: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::PATCH, pattern, handler)
    }

    pub fn delete(self, pattern: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::DELETE, pattern, handler)
    }

    pub fn options(self, pattern: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::OPTIONS, pattern, handler)
    }

    /// Serve static files as configured by `spec`.
    pub fn files(self, spec: FileHandlerSpec) -> Self {
        self.push(spec.build())
    }

    /// Build a nested chain with the file system rebound to `path`.
    pub fn file_system(self, path: &str, build: impl FnOnce(Chain) -> Chain) -> Self {
        let handler = Self::nested(build).map(|chain| handlers::file_system(path, [chain]));
        self.push(handler)
    }

    /// Build a nested chain that sees `registry` layered over the current
    /// registry.
    pub fn register(self, registry: Registry, build: impl FnOnce(Chain) -> Chain) -> Self {
        let handler = Self::nested(build).map(|chain| handlers::register(registry, [chain]));
        self.push(handler)
    }

    pub fn when<P>(self, predicate: P, handler: impl IntoHandler) -> Self
    where
        P: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.push(Ok(handlers::when(predicate, handler)))
    }

    pub fn redirect(self, status: u16, location: &str) -> Self {
        self.push(Ok(handlers::redirect(status, location)))
    }

    /// Finish the chain, or return the first declaration error.
    pub fn build(self) -> Result<ChainHandler, Error> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let handlers: Handlers = self
            .handlers
            .into_iter()
            .chain(std::iter::once(MethodFallback.into_handler()))
            .collect();
        Ok(ChainHandler { handlers })
    }
}

/// A built chain. Runs its handlers with a fresh method tracker, then
/// continues after itself when every handler passed.
#[derive(Debug, Clone)]
pub struct ChainHandler {
    handlers: Handlers,
}

impl ChainHandler {
    /// Number of declared handlers.
    pub fn len(&self) -> usize {
        self.handlers.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Handler for ChainHandler {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        let tracker = MethodTracker::new(ctx.maybe_get::<MethodTracker>());
        ctx.insert_with(Registry::single(tracker), self.handlers.clone())
            .await
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
