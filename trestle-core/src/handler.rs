// Handler abstraction for the request pipeline
//
// A handler receives the context for its step of the chain and either
// responds, delegates with `ctx.next()`, inserts a nested chain, or fails.
// Handlers are type-erased into `BoxedHandler` for storage in chains.

use crate::{Context, Error};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// One step of a handler chain.
///
/// # Example
///
/// ```
/// use trestle_core::{Context, Error, Handler};
/// use async_trait::async_trait;
///
/// struct Hello;
///
/// #[async_trait]
/// impl Handler for Hello {
///     async fn handle(&self, ctx: Context) -> Result<(), Error> {
///         ctx.response().send_text("hello");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: Context) -> Result<(), Error>;

    /// Name used in log output.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A handler backed by an async function or closure.
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        (self.f)(ctx).await
    }

    fn name(&self) -> &'static str {
        "fn"
    }
}

/// Create a handler from an async function.
///
/// ```
/// use trestle_core::handler::handler;
///
/// let hello = handler(|ctx| async move {
///     ctx.response().send_text("hello");
///     Ok(())
/// });
/// ```
pub fn handler<F, Fut>(f: F) -> BoxedHandler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    BoxedHandler::new(FnHandler::new(f))
}

/// Type-erased, cheaply cloneable handler.
#[derive(Clone)]
pub struct BoxedHandler {
    inner: Arc<dyn Handler>,
}

impl BoxedHandler {
    pub fn new<H: Handler>(handler: H) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub fn from_arc(handler: Arc<dyn Handler>) -> Self {
        Self { inner: handler }
    }

    pub async fn handle(&self, ctx: Context) -> Result<(), Error> {
        self.inner.handle(ctx).await
    }

    pub fn name(&self) -> &'static str {
        self.inner.name()
    }
}

impl fmt::Debug for BoxedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoxedHandler").field(&self.name()).finish()
    }
}

/// Conversion into a [`BoxedHandler`].
pub trait IntoHandler {
    fn into_handler(self) -> BoxedHandler;
}

impl<H: Handler> IntoHandler for H {
    fn into_handler(self) -> BoxedHandler {
        BoxedHandler::new(self)
    }
}

impl IntoHandler for BoxedHandler {
    fn into_handler(self) -> BoxedHandler {
        self
    }
}

/// An immutable handler list shared by every request.
pub type Handlers = Arc<[BoxedHandler]>;

/// Collect handlers into a shareable list.
pub fn handlers<I>(items: I) -> Handlers
where
    I: IntoIterator,
    I::Item: IntoHandler,
{
    items.into_iter().map(IntoHandler::into_handler).collect()
}
