// HTTP server and root registry assembly

use crate::blocking::{BlockingExecutor, TokioBlockingExecutor};
use crate::config::ServerConfig;
use crate::context::Pipeline;
use crate::file::FileSystemBinding;
use crate::handler::{BoxedHandler, IntoHandler};
use crate::http::{Request, ResponseTransmitter, SentResponse};
use crate::logging::{debug, error, info, warn};
use crate::mime::{ExtensionMimeTypes, MimeTypes};
use crate::registry::Registry;
use crate::render::default_renderers;
use crate::Error;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::body::Incoming as IncomingBody;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// The registry every request starts from: the configuration, a file
/// system binding on `base_dir`, and the default mime types, blocking
/// executor and renderers.
pub fn base_registry(config: &ServerConfig) -> Registry {
    let builder = Registry::builder()
        .add(config.clone())
        .add(FileSystemBinding::new(config.base_dir.clone()))
        .add_shared::<dyn MimeTypes>(Arc::new(ExtensionMimeTypes::new()))
        .add_shared::<dyn BlockingExecutor>(Arc::new(TokioBlockingExecutor));

    default_renderers()
        .into_iter()
        .fold(builder, |builder, entry| builder.add_entry(entry))
        .build()
}

/// Delivers the committed response to the connection task waiting on it.
struct OneshotTransmitter {
    sender: Mutex<Option<oneshot::Sender<SentResponse>>>,
}

impl OneshotTransmitter {
    fn new(sender: oneshot::Sender<SentResponse>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }
}

impl ResponseTransmitter for OneshotTransmitter {
    fn is_open(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    fn transmit(&self, response: SentResponse) {
        if let Some(sender) = self.sender.lock().take() {
            // The connection may have closed since is_open was checked.
            let _ = sender.send(response);
        }
    }
}

/// An HTTP/1 server running one pipeline.
pub struct Server {
    config: ServerConfig,
    registry: Registry,
    handler: BoxedHandler,
}

impl Server {
    pub fn new(config: ServerConfig, handler: impl IntoHandler) -> Self {
        let registry = base_registry(&config);
        Self {
            config,
            registry,
            handler: handler.into_handler(),
        }
    }

    /// Layer application entries over the base registry.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = self.registry.join(&registry);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.registry.clone(), [self.handler.clone()])
    }

    /// Build a runtime sized from the configuration and serve until the
    /// listener fails.
    pub fn run(self) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads.max(1))
            .max_blocking_threads(self.config.blocking_threads.max(1))
            .thread_name("trestle-worker")
            .enable_all()
            .build()?;
        runtime.block_on(self.serve())
    }

    /// Bind the configured address and serve on the current runtime.
    pub async fn serve(self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.serve_on(listener).await
    }

    /// Serve connections accepted from `listener`.
    pub async fn serve_on(self, listener: TcpListener) -> Result<(), Error> {
        let addr = listener.local_addr()?;
        info!(%addr, development = self.config.development, "Server listening");

        let pipeline = Arc::new(self.pipeline());
        let max_body_size = self.config.max_body_size;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let pipeline = pipeline.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: hyper::Request<IncomingBody>| {
                    let pipeline = pipeline.clone();
                    async move {
                        Ok::<_, Infallible>(handle_request(req, pipeline, max_body_size).await)
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(%peer, error = %err, "Error serving connection");
                }
            });
        }
    }
}

async fn handle_request(
    req: hyper::Request<IncomingBody>,
    pipeline: Arc<Pipeline>,
    max_body_size: usize,
) -> hyper::Response<Full<Bytes>> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, limit = max_body_size, "Rejecting request body");
            return plain(StatusCode::PAYLOAD_TOO_LARGE);
        }
    };

    let request = Request::from_parts(parts, body);
    let is_head = request.method() == Method::HEAD;
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let (tx, rx) = oneshot::channel();
    let transmitter: Arc<dyn ResponseTransmitter> = Arc::new(OneshotTransmitter::new(tx));
    tokio::spawn(async move { pipeline.handle(request, transmitter).await });

    let sent = match rx.await {
        Ok(sent) => sent,
        Err(_) => {
            error!(%method, path = %path, "Request processing finished without sending a response");
            return plain(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    info!(
        %method,
        path = %path,
        status = sent.status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );
    into_hyper(sent, is_head)
}

/// Convert a committed response. HEAD keeps the `Content-Length` the body
/// would have had.
fn into_hyper(sent: SentResponse, is_head: bool) -> hyper::Response<Full<Bytes>> {
    let SentResponse {
        status,
        mut headers,
        body,
    } = sent;
    let body = if is_head {
        headers
            .entry(header::CONTENT_LENGTH)
            .or_insert_with(|| HeaderValue::from(body.len()));
        Bytes::new()
    } else {
        body
    };
    let mut response = hyper::Response::new(Full::new(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn plain(status: StatusCode) -> hyper::Response<Full<Bytes>> {
    let text = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );
    let mut response = hyper::Response::new(Full::new(Bytes::from(text)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain;charset=UTF-8"),
    );
    response
}
