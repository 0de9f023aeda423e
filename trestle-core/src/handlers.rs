//! Built-in handlers.
//!
//! These are the building blocks the [`Chain`](crate::chain::Chain) DSL is
//! made of. Each one either handles the request, inserts a nested chain, or
//! passes control on with `next`.

use crate::file::FileSystemBinding;
use crate::handler::{BoxedHandler, Handler, Handlers, IntoHandler};
use crate::logging::{debug, trace};
use crate::path::PathBinder;
use crate::registry::Registry;
use crate::{Context, Error};
use async_trait::async_trait;
use http::header::{self, HeaderValue};
use http::Method;
use parking_lot::Mutex;
use std::sync::Arc;

/// Terminates every request with a fixed client error.
#[derive(Debug, Clone, Copy)]
pub struct ClientErrorForwarder {
    status: u16,
}

impl ClientErrorForwarder {
    pub fn new(status: u16) -> Self {
        Self { status }
    }
}

#[async_trait]
impl Handler for ClientErrorForwarder {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        ctx.client_error(self.status).await
    }

    fn name(&self) -> &'static str {
        "client-error"
    }
}

pub fn client_error(status: u16) -> BoxedHandler {
    ClientErrorForwarder::new(status).into_handler()
}

pub fn not_found() -> BoxedHandler {
    client_error(404)
}

/// Passes every request on unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Next;

#[async_trait]
impl Handler for Next {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        ctx.next().await
    }

    fn name(&self) -> &'static str {
        "next"
    }
}

pub fn next() -> BoxedHandler {
    Next.into_handler()
}

/// Binds a path pattern and runs nested handlers when it matches.
#[derive(Debug, Clone)]
pub struct PathHandler {
    binder: PathBinder,
    handlers: Handlers,
}

impl PathHandler {
    pub fn new(binder: PathBinder, handlers: impl Into<Handlers>) -> Self {
        Self {
            binder,
            handlers: handlers.into(),
        }
    }
}

#[async_trait]
impl Handler for PathHandler {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        let parent = ctx.path_binding();
        match self.binder.bind(ctx.request().path(), parent.as_deref()) {
            Some(binding) => {
                trace!(pattern = %self.binder, bound_to = binding.bound_to(), "Path bound");
                ctx.insert_with(Registry::single(binding), self.handlers.clone())
                    .await
            }
            None => ctx.next().await,
        }
    }

    fn name(&self) -> &'static str {
        "path"
    }
}

/// Handlers run only when the remaining path matches `pattern` exactly.
pub fn path<I>(pattern: &str, handlers: I) -> Result<BoxedHandler, Error>
where
    I: IntoIterator,
    I::Item: IntoHandler,
{
    let binder = PathBinder::parse(pattern, true)?;
    Ok(PathHandler::new(binder, crate::handler::handlers(handlers)).into_handler())
}

/// Handlers run when the remaining path starts with `pattern`. The rest of
/// the path is left for nested bindings.
pub fn prefix<I>(pattern: &str, handlers: I) -> Result<BoxedHandler, Error>
where
    I: IntoIterator,
    I::Item: IntoHandler,
{
    let binder = PathBinder::parse(pattern, false)?;
    Ok(PathHandler::new(binder, crate::handler::handlers(handlers)).into_handler())
}

/// Methods declared by handlers that did not match the request method.
///
/// Each chain installs its own tracker for the duration of a request. A
/// tracker with a parent hands its methods up when its chain is exhausted;
/// the outermost tracker answers `405`.
#[derive(Debug, Default)]
pub struct MethodTracker {
    parent: Option<Arc<MethodTracker>>,
    allowed: Mutex<Vec<Method>>,
}

impl MethodTracker {
    pub fn new(parent: Option<Arc<MethodTracker>>) -> Self {
        Self {
            parent,
            allowed: Mutex::new(Vec::new()),
        }
    }

    pub fn record<'a>(&self, methods: impl IntoIterator<Item = &'a Method>) {
        let mut allowed = self.allowed.lock();
        for method in methods {
            if !allowed.contains(method) {
                allowed.push(method.clone());
            }
        }
    }

    pub fn allowed(&self) -> Vec<Method> {
        self.allowed.lock().clone()
    }

    pub fn parent(&self) -> Option<&Arc<MethodTracker>> {
        self.parent.as_ref()
    }
}

/// `Allow` header value for `methods`, sorted for stable output.
pub fn allow_header(methods: &[Method]) -> String {
    let mut names: Vec<&str> = methods.iter().map(Method::as_str).collect();
    names.sort_unstable();
    names.dedup();
    names.join(", ")
}

fn set_allow(ctx: &Context, methods: &[Method]) {
    if let Ok(allow) = HeaderValue::from_str(&allow_header(methods)) {
        ctx.response().header(header::ALLOW, allow);
    }
}

/// Runs at the end of every built chain: hands recorded methods to the
/// enclosing chain, or answers `405` when there is none.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MethodFallback;

#[async_trait]
impl Handler for MethodFallback {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        let Some(tracker) = ctx.maybe_get::<MethodTracker>() else {
            return ctx.next().await;
        };

        let allowed = tracker.allowed();
        if allowed.is_empty() {
            return ctx.next().await;
        }

        match tracker.parent() {
            Some(parent) => {
                parent.record(&allowed);
                ctx.next().await
            }
            None => {
                debug!(allow = %allow_header(&allowed), "No handler for request method");
                set_allow(&ctx, &allowed);
                ctx.client_error(405).await
            }
        }
    }

    fn name(&self) -> &'static str {
        "method-fallback"
    }
}

fn accepts(methods: &[Method], method: &Method) -> bool {
    methods.contains(method) || (method == Method::HEAD && methods.contains(&Method::GET))
}

/// Runs its handler only for the given request methods. `HEAD` is accepted
/// wherever `GET` is.
#[derive(Debug, Clone)]
pub struct MethodHandler {
    methods: Arc<[Method]>,
    handler: BoxedHandler,
}

impl MethodHandler {
    pub fn new(methods: impl IntoIterator<Item = Method>, handler: impl IntoHandler) -> Self {
        Self {
            methods: methods.into_iter().collect(),
            handler: handler.into_handler(),
        }
    }
}

#[async_trait]
impl Handler for MethodHandler {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        if accepts(&self.methods, ctx.request().method()) {
            return self.handler.handle(ctx).await;
        }

        if let Some(tracker) = ctx.maybe_get::<MethodTracker>() {
            tracker.record(self.methods.iter());
        }
        ctx.next().await
    }

    fn name(&self) -> &'static str {
        "method"
    }
}

pub fn method(methods: impl IntoIterator<Item = Method>, handler: impl IntoHandler) -> BoxedHandler {
    MethodHandler::new(methods, handler).into_handler()
}

/// Dispatches on the request method within a single path.
///
/// `OPTIONS` is answered with the declared methods unless a handler was
/// given for it, `HEAD` falls back to the `GET` handler, and anything else
/// is a `405`.
#[derive(Debug, Clone, Default)]
pub struct ByMethod {
    routes: Vec<(Method, BoxedHandler)>,
}

impl ByMethod {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, method: Method, handler: impl IntoHandler) -> Self {
        self.routes.push((method, handler.into_handler()));
        self
    }

    pub fn get(self, handler: impl IntoHandler) -> Self {
        self.on(Method::GET, handler)
    }

    pub fn post(self, handler: impl IntoHandler) -> Self {
        self.on(Method::POST, handler)
    }

    pub fn put(self, handler: impl IntoHandler) -> Self {
        self.on(Method::PUT, handler)
    }

    pub fn patch(self, handler: impl IntoHandler) -> Self {
        self.on(Method::PATCH, handler)
    }

    pub fn delete(self, handler: impl IntoHandler) -> Self {
        self.on(Method::DELETE, handler)
    }

    fn find(&self, method: &Method) -> Option<&BoxedHandler> {
        self.routes
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, handler)| handler)
    }

    fn methods(&self) -> Vec<Method> {
        self.routes.iter().map(|(m, _)| m.clone()).collect()
    }
}

#[async_trait]
impl Handler for ByMethod {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        let method = ctx.request().method().clone();

        if let Some(handler) = self.find(&method) {
            return handler.handle(ctx).await;
        }
        if method == Method::HEAD
            && let Some(handler) = self.find(&Method::GET)
        {
            return handler.handle(ctx).await;
        }

        let mut methods = self.methods();
        if method == Method::OPTIONS {
            methods.push(Method::OPTIONS);
            set_allow(&ctx, &methods);
            ctx.response().status(200).send_empty();
            return Ok(());
        }

        set_allow(&ctx, &methods);
        ctx.client_error(405).await
    }

    fn name(&self) -> &'static str {
        "by-method"
    }
}

pub fn by_method() -> ByMethod {
    ByMethod::new()
}

/// Runs nested handlers with extra registry entries.
#[derive(Debug, Clone)]
pub struct RegistryHandler {
    registry: Registry,
    handlers: Handlers,
}

#[async_trait]
impl Handler for RegistryHandler {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        ctx.insert_with(self.registry.clone(), self.handlers.clone())
            .await
    }

    fn name(&self) -> &'static str {
        "register"
    }
}

pub fn register<I>(registry: Registry, handlers: I) -> BoxedHandler
where
    I: IntoIterator,
    I::Item: IntoHandler,
{
    RegistryHandler {
        registry,
        handlers: crate::handler::handlers(handlers),
    }
    .into_handler()
}

/// Runs nested handlers, then continues with the rest of the chain.
pub fn insert<I>(handlers: I) -> BoxedHandler
where
    I: IntoIterator,
    I::Item: IntoHandler,
{
    register(Registry::empty(), handlers)
}

/// Continues the chain with `registry` layered on top.
#[derive(Debug, Clone)]
pub struct NextWith {
    registry: Registry,
}

#[async_trait]
impl Handler for NextWith {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        ctx.next_with(self.registry.clone()).await
    }

    fn name(&self) -> &'static str {
        "next-with"
    }
}

pub fn next_with(registry: Registry) -> BoxedHandler {
    NextWith { registry }.into_handler()
}

/// Rebinds the file system to a subdirectory for nested handlers.
#[derive(Debug, Clone)]
pub struct FileSystemHandler {
    path: String,
    handlers: Handlers,
}

#[async_trait]
impl Handler for FileSystemHandler {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        let current = ctx.get::<FileSystemBinding>()?;
        match current.binding(&self.path) {
            Some(binding) => {
                trace!(root = %binding.root().display(), "File system rebound");
                ctx.insert_with(Registry::single(binding), self.handlers.clone())
                    .await
            }
            None => ctx.client_error(404).await,
        }
    }

    fn name(&self) -> &'static str {
        "file-system"
    }
}

pub fn file_system<I>(path: impl Into<String>, handlers: I) -> BoxedHandler
where
    I: IntoIterator,
    I::Item: IntoHandler,
{
    FileSystemHandler {
        path: path.into(),
        handlers: crate::handler::handlers(handlers),
    }
    .into_handler()
}

/// Sends a redirect to a fixed location.
#[derive(Debug, Clone)]
pub struct Redirect {
    status: u16,
    location: String,
}

#[async_trait]
impl Handler for Redirect {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        ctx.redirect(self.status, &self.location)
    }

    fn name(&self) -> &'static str {
        "redirect"
    }
}

pub fn redirect(status: u16, location: impl Into<String>) -> BoxedHandler {
    Redirect {
        status,
        location: location.into(),
    }
    .into_handler()
}

/// Runs `handler` when the predicate holds, otherwise passes on.
pub struct When<P> {
    predicate: P,
    handler: BoxedHandler,
}

#[async_trait]
impl<P> Handler for When<P>
where
    P: Fn(&Context) -> bool + Send + Sync + 'static,
{
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        if (self.predicate)(&ctx) {
            self.handler.handle(ctx).await
        } else {
            ctx.next().await
        }
    }

    fn name(&self) -> &'static str {
        "when"
    }
}

pub fn when<P>(predicate: P, handler: impl IntoHandler) -> BoxedHandler
where
    P: Fn(&Context) -> bool + Send + Sync + 'static,
{
    When {
        predicate,
        handler: handler.into_handler(),
    }
    .into_handler()
}
