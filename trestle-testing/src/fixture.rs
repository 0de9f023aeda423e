//! Running handlers against a simulated request.
//!
//! The fixture replaces the error handlers, the render controller, the
//! response transmitter and the exhausted-chain handler with recorders.
//! Whichever fires first becomes the [`HandlingResult`].

use crate::result::{HandlingResult, Outcome};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use trestle_core::http::parse_uri;
use trestle_core::{
    Chain, ClientErrorHandler, Context, Error, Handler, IntoHandler, PathBinding, PathTokens,
    Pipeline, Registry, RegistryBuilder, RegistryEntry, RenderController, Renderable,
    Request, ResponseTransmitter, SentResponse, ServerConfig, ServerErrorHandler, base_registry,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by the harness itself, as opposed to the handler.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("No signal within {0:?}")]
    Timeout(Duration),

    #[error("Handling finished without sending, rendering, delegating or raising")]
    NoSignal,

    #[error("Invalid fixture: {0}")]
    Setup(#[from] Error),
}

struct Signal {
    outcome: Outcome,
    status: StatusCode,
    headers: HeaderMap,
}

#[derive(Clone)]
struct Recorder {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Recorder {
    fn record(&self, ctx: &Context, outcome: Outcome) {
        let signal = Signal {
            outcome,
            status: ctx.response().get_status(),
            headers: ctx.response().headers(),
        };
        // Only the first signal is read; later ones are dropped with the
        // receiver.
        let _ = self.tx.send(signal);
    }
}

impl ResponseTransmitter for Recorder {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn transmit(&self, response: SentResponse) {
        let signal = Signal {
            status: response.status,
            headers: response.headers.clone(),
            outcome: Outcome::Sent(response),
        };
        let _ = self.tx.send(signal);
    }
}

#[async_trait]
impl ClientErrorHandler for Recorder {
    async fn error(&self, ctx: &Context, status: u16) -> Result<(), Error> {
        self.record(ctx, Outcome::ClientError(status));
        Ok(())
    }
}

#[async_trait]
impl ServerErrorHandler for Recorder {
    async fn error(&self, ctx: &Context, error: Error) -> Result<(), Error> {
        self.record(ctx, Outcome::Exception(error));
        Ok(())
    }
}

#[async_trait]
impl RenderController for Recorder {
    async fn render(&self, ctx: &Context, value: Renderable) -> Result<(), Error> {
        self.record(ctx, Outcome::Rendered(value));
        Ok(())
    }
}

struct NextRecorder(Recorder);

#[async_trait]
impl Handler for NextRecorder {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        self.0.record(&ctx, Outcome::CalledNext);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "next-recorder"
    }
}

/// A request to run a handler against, with the registry it sees.
///
/// ```
/// use trestle_testing::RequestFixture;
/// use trestle_core::handler;
///
/// # tokio_test::block_on(async {
/// let result = RequestFixture::new()
///     .uri("/greet?name=ada")
///     .handle(handler(|ctx| async move {
///         let name = ctx.request().query_param("name").unwrap_or_default();
///         ctx.response().send_text(format!("hello {name}"));
///         Ok(())
///     }))
///     .await
///     .unwrap();
/// assert_eq!(result.body_text(), "hello ada");
/// # });
/// ```
pub struct RequestFixture {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Bytes,
    config: ServerConfig,
    registry: RegistryBuilder,
    path_binding: Option<(String, PathTokens)>,
    timeout: Duration,
}

impl Default for RequestFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestFixture {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            uri: "/".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            config: ServerConfig::default(),
            registry: Registry::builder(),
            path_binding: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Configuration placed in the root registry.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Root the file system binding at `dir`.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config = self.config.with_base_dir(dir);
        self
    }

    /// Add a value to the registry.
    pub fn register<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.registry = self.registry.add(value);
        self
    }

    pub fn register_entry(mut self, entry: RegistryEntry) -> Self {
        self.registry = self.registry.add_entry(entry);
        self
    }

    /// Run as if an enclosing path binding had captured `tokens` and left
    /// `past_binding` unconsumed.
    pub fn path_binding<I, K, V>(mut self, past_binding: &str, tokens: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.path_binding = Some((past_binding.to_string(), tokens.into_iter().collect()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self) -> Result<Request, Error> {
        let mut request = Request::new(self.method.clone(), parse_uri(&self.uri)?)
            .with_body(self.body.clone());
        for (name, value) in &self.headers {
            request = request.with_header(name.clone(), value.clone());
        }
        Ok(request)
    }

    /// Run `handler` and wait for the first signal.
    pub async fn handle(self, handler: impl IntoHandler) -> Result<HandlingResult, HarnessError> {
        let request = self.request()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recorder = Recorder { tx };

        let captures = Registry::builder()
            .add_shared::<dyn ClientErrorHandler>(Arc::new(recorder.clone()))
            .add_shared::<dyn ServerErrorHandler>(Arc::new(recorder.clone()))
            .add_shared::<dyn RenderController>(Arc::new(recorder.clone()))
            .build();
        let mut root = base_registry(&self.config).join(&captures);
        if let Some((past_binding, tokens)) = self.path_binding {
            root = root.with(PathBinding::new(&past_binding, "", tokens, None));
        }
        let root = root.join(&self.registry.build());

        let pipeline = Pipeline::new(root, [handler.into_handler()])
            .with_exhausted(NextRecorder(recorder.clone()));
        let transmitter: Arc<dyn ResponseTransmitter> = Arc::new(recorder);

        debug!(method = %request.method(), uri = %request.uri(), "Running fixture request");
        tokio::spawn(async move { pipeline.handle(request, transmitter).await });

        match tokio::time::timeout(self.timeout, rx.recv()).await {
            Ok(Some(signal)) => Ok(HandlingResult::new(
                signal.outcome,
                signal.status,
                signal.headers,
            )),
            Ok(None) => Err(HarnessError::NoSignal),
            Err(_) => Err(HarnessError::Timeout(self.timeout)),
        }
    }

    /// Build a chain and run it.
    pub async fn handle_chain(
        self,
        build: impl FnOnce(Chain) -> Chain,
    ) -> Result<HandlingResult, HarnessError> {
        let chain = build(Chain::new()).build()?;
        self.handle(chain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trestle_core::handler;

    #[tokio::test]
    async fn test_records_next() {
        let result = RequestFixture::new()
            .handle(handler(|ctx| async move { ctx.next().await }))
            .await
            .unwrap();
        assert!(result.called_next());
    }

    #[tokio::test]
    async fn test_times_out() {
        let result = RequestFixture::new()
            .timeout(Duration::from_millis(20))
            .handle(handler(|ctx| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ctx.next().await
            }))
            .await;
        assert!(matches!(result, Err(HarnessError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_no_signal() {
        let result = RequestFixture::new()
            .handle(handler(|_ctx| async move { Ok(()) }))
            .await;
        assert!(matches!(result, Err(HarnessError::NoSignal)));
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        let result = RequestFixture::new()
            .uri("http://[bad")
            .handle(handler(|ctx| async move { ctx.next().await }))
            .await;
        assert!(matches!(result, Err(HarnessError::Setup(_))));
    }
}
