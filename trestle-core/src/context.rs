//! Per-step request context and the chain execution engine.
//!
//! Every handler invocation receives its own [`Context`]. The context
//! carries the request state shared by all steps, the registry in effect
//! for this step, and a continuation describing what runs on
//! [`Context::next`]. Continuations are plain values: a handler list, an
//! index, a registry and an optional rejoin point for inserted chains. They
//! can be moved to another task or thread and resumed later.
//!
//! Errors returned by a handler are wrapped once with the registry of the
//! failing step and bubble up to the start of the pipeline, where they are
//! dispatched to that registry's [`ServerErrorHandler`](crate::ServerErrorHandler)
//! exactly once.

use crate::blocking::{BlockingExecutor, TokioBlockingExecutor};
use crate::error_handler;
use crate::file::FileSystemBinding;
use crate::handler::{BoxedHandler, Handlers, IntoHandler};
use crate::handlers::ClientErrorForwarder;
use crate::http::{Request, Response, ResponseTransmitter};
use crate::logging::{Instrument, debug, info_span, trace, warn};
use crate::path::{PathBinding, PathTokens};
use crate::registry::Registry;
use crate::render::{DefaultRenderController, RenderController, Renderable};
use crate::Error;
use futures_util::future::BoxFuture;
use http::header::{self, HeaderValue};
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

/// State shared by every step of one request.
pub(crate) struct RequestState {
    pub(crate) request: Request,
    pub(crate) response: Response,
    root: Registry,
    exhausted: BoxedHandler,
    exhausted_ran: AtomicBool,
    dispatched: AtomicBool,
}

impl RequestState {
    /// Marks the request as error-dispatched. Returns false if an error
    /// handler already ran for this request.
    pub(crate) fn begin_dispatch(&self) -> bool {
        !self.dispatched.swap(true, Ordering::SeqCst)
    }
}

/// Position in a handler chain.
#[derive(Clone)]
struct Step {
    registry: Registry,
    handlers: Handlers,
    index: usize,
    rejoin: Option<Arc<Step>>,
}

impl Step {
    fn advanced(mut self) -> Self {
        self.index += 1;
        self
    }
}

/// The view of a request given to one handler.
pub struct Context {
    state: Arc<RequestState>,
    step: Step,
}

impl Context {
    /// A context with nothing left to run, used for error handlers.
    pub(crate) fn detached(state: Arc<RequestState>, registry: Registry) -> Self {
        Self {
            state,
            step: Step {
                registry,
                handlers: Arc::from(Vec::new()),
                index: 0,
                rejoin: None,
            },
        }
    }

    pub fn request(&self) -> &Request {
        &self.state.request
    }

    pub fn response(&self) -> &Response {
        &self.state.response
    }

    /// The registry in effect for this step.
    pub fn registry(&self) -> &Registry {
        &self.step.registry
    }

    pub fn maybe_get<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.step.registry.maybe_get::<T>()
    }

    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, Error> {
        self.step.registry.get::<T>()
    }

    pub fn get_all<T: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        self.step.registry.get_all::<T>()
    }

    /// The innermost path binding, if any path handler matched.
    pub fn path_binding(&self) -> Option<Arc<PathBinding>> {
        self.maybe_get::<PathBinding>()
    }

    /// Tokens of every enclosing path binding.
    pub fn path_tokens(&self) -> PathTokens {
        self.path_binding()
            .map(|binding| binding.all_tokens().clone())
            .unwrap_or_default()
    }

    /// Path not yet consumed by path bindings, without a leading `/`.
    pub fn remaining_path(&self) -> String {
        match self.path_binding() {
            Some(binding) => binding.past_binding().to_string(),
            None => self.request().path().to_string(),
        }
    }

    /// Resolve `path` against the current file system binding.
    pub fn file(&self, path: &str) -> Option<PathBuf> {
        self.maybe_get::<FileSystemBinding>()
            .and_then(|binding| binding.file(path))
    }

    /// Run the next handler in the chain.
    pub async fn next(self) -> Result<(), Error> {
        execute(self.state, self.step.advanced()).await
    }

    /// Run the next handler with `registry` layered over the current one.
    pub async fn next_with(self, registry: Registry) -> Result<(), Error> {
        let mut step = self.step.advanced();
        step.registry = step.registry.join(&registry);
        execute(self.state, step).await
    }

    /// Run `handlers` as a nested chain. When they are exhausted, execution
    /// continues with the handler after this one.
    pub async fn insert(self, handlers: impl Into<Handlers>) -> Result<(), Error> {
        self.insert_with(Registry::empty(), handlers).await
    }

    /// Like [`Context::insert`], with `registry` layered over the current
    /// registry for the nested chain only.
    pub async fn insert_with(
        self,
        registry: Registry,
        handlers: impl Into<Handlers>,
    ) -> Result<(), Error> {
        let nested = Step {
            registry: self.step.registry.join(&registry),
            handlers: handlers.into(),
            index: 0,
            rejoin: Some(Arc::new(self.step.advanced())),
        };
        execute(self.state, nested).await
    }

    /// Terminate with a client error, handled by the registry's
    /// [`ClientErrorHandler`](crate::ClientErrorHandler).
    pub async fn client_error(self, status: u16) -> Result<(), Error> {
        error_handler::dispatch_client_error(self.state, self.step.registry, status).await;
        Ok(())
    }

    /// Client error dispatch for code that only holds a reference, such as
    /// renderers.
    pub(crate) async fn signal_client_error(&self, status: u16) {
        error_handler::dispatch_client_error(
            self.state.clone(),
            self.step.registry.clone(),
            status,
        )
        .await;
    }

    /// Terminate with a server error, handled by the registry's
    /// [`ServerErrorHandler`](crate::ServerErrorHandler).
    pub async fn error(self, error: Error) -> Result<(), Error> {
        let (source, registry) = error.into_parts();
        let registry = registry.unwrap_or(self.step.registry);
        error_handler::dispatch_server_error(self.state, registry, source).await;
        Ok(())
    }

    /// Render `value` with the registry's render controller.
    pub async fn render<T: Any + Send + Sync>(&self, value: T) -> Result<(), Error> {
        let controller: Arc<dyn RenderController> = self
            .maybe_get::<dyn RenderController>()
            .unwrap_or_else(|| Arc::new(DefaultRenderController));
        controller.render(self, Renderable::new(value)).await
    }

    /// Send a redirect to `location`.
    pub fn redirect(&self, status: u16, location: &str) -> Result<(), Error> {
        let location = HeaderValue::from_str(location)
            .map_err(|e| Error::Http(format!("invalid redirect location {location:?}: {e}")))?;
        self.response()
            .status(status)
            .header(header::LOCATION, location)
            .send_empty();
        Ok(())
    }

    /// Run blocking work on the registry's [`BlockingExecutor`] and resume
    /// once it finishes. The request-processing thread is not blocked.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let executor: Arc<dyn BlockingExecutor> = self
            .maybe_get::<dyn BlockingExecutor>()
            .unwrap_or_else(|| Arc::new(TokioBlockingExecutor));

        let (tx, rx) = oneshot::channel();
        executor.submit(Box::new(move || {
            // The receiver is gone if the request was abandoned.
            let _ = tx.send(f());
        }))?;

        rx.await
            .map_err(|_| Error::Blocking("blocking job ended without a result".to_string()))
    }
}

fn execute(state: Arc<RequestState>, step: Step) -> BoxFuture<'static, Result<(), Error>> {
    Box::pin(async move {
        let Some(handler) = step.handlers.get(step.index).cloned() else {
            return match step.rejoin {
                Some(rejoin) => execute(state, Step::clone(&rejoin)).await,
                None => exhaust(state).await,
            };
        };

        trace!(handler = handler.name(), index = step.index, "Invoking handler");
        let registry = step.registry.clone();
        handler
            .handle(Context { state, step })
            .await
            .map_err(|e| e.in_pipeline(&registry))
    })
}

async fn exhaust(state: Arc<RequestState>) -> Result<(), Error> {
    if state.exhausted_ran.swap(true, Ordering::SeqCst) {
        warn!(
            request_id = %state.request.id(),
            "next() called after the handler chain was exhausted"
        );
        return Err(Error::internal(
            "next() called after the handler chain was exhausted",
        ));
    }

    debug!(request_id = %state.request.id(), "Handler chain exhausted");
    let root = state.root.clone();
    let handler = state.exhausted.clone();
    let ctx = Context::detached(state, root.clone());
    handler.handle(ctx).await.map_err(|e| e.in_pipeline(&root))
}

/// A root registry plus a handler chain, ready to process requests.
#[derive(Clone)]
pub struct Pipeline {
    registry: Registry,
    handlers: Handlers,
    exhausted: BoxedHandler,
}

impl Pipeline {
    /// When every handler calls `next`, the request ends with a 404 client
    /// error.
    pub fn new(registry: Registry, handlers: impl Into<Handlers>) -> Self {
        Self {
            registry,
            handlers: handlers.into(),
            exhausted: BoxedHandler::new(ClientErrorForwarder::new(404)),
        }
    }

    /// Replace what runs when the chain is exhausted.
    pub fn with_exhausted(mut self, handler: impl IntoHandler) -> Self {
        self.exhausted = handler.into_handler();
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Process one request. Completes when the chain has finished running,
    /// which is not necessarily when the response was sent.
    pub async fn handle(&self, request: Request, transmitter: Arc<dyn ResponseTransmitter>) {
        let span = info_span!(
            "request",
            id = %request.id(),
            method = %request.method(),
            path = %request.uri().path(),
        );

        let response = Response::new(transmitter, request.id().clone());
        let state = Arc::new(RequestState {
            request,
            response,
            root: self.registry.clone(),
            exhausted: self.exhausted.clone(),
            exhausted_ran: AtomicBool::new(false),
            dispatched: AtomicBool::new(false),
        });

        let step = Step {
            registry: self.registry.clone(),
            handlers: self.handlers.clone(),
            index: 0,
            rejoin: None,
        };

        let root = self.registry.clone();
        async move {
            if let Err(error) = execute(state.clone(), step).await {
                let (source, registry) = error.into_parts();
                error_handler::dispatch_server_error(state, registry.unwrap_or(root), source)
                    .await;
            }
        }
        .instrument(span)
        .await
    }
}
