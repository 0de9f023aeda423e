//! Chain execution, method fallthrough and error dispatch, driven through
//! `Pipeline` with a capturing transmitter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use ::http::{Method, StatusCode, Uri};
use tokio::sync::mpsc;
use trestle_core::handler::handlers;
use trestle_core::handlers::{self as builtin, by_method};
use trestle_core::{
    BoxedHandler, Chain, ClientErrorHandler, Context, Error, IntoHandler, Pipeline, Registry,
    Request, ResponseTransmitter, SentResponse, ServerConfig, ServerErrorHandler, handler, render,
};

struct Capture(mpsc::UnboundedSender<SentResponse>);

impl ResponseTransmitter for Capture {
    fn is_open(&self) -> bool {
        !self.0.is_closed()
    }

    fn transmit(&self, response: SentResponse) {
        let _ = self.0.send(response);
    }
}

async fn run_all(pipeline: &Pipeline, request: Request) -> Vec<SentResponse> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    pipeline.handle(request, Arc::new(Capture(tx))).await;

    let mut sent = Vec::new();
    while let Ok(Some(response)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        sent.push(response);
    }
    sent
}

async fn run(pipeline: &Pipeline, request: Request) -> SentResponse {
    let mut sent = run_all(pipeline, request).await;
    assert_eq!(sent.len(), 1, "expected exactly one response");
    sent.remove(0)
}

fn get(uri: &str) -> Request {
    Request::get(uri).unwrap()
}

fn request(method: Method, uri: &str) -> Request {
    Request::new(method, Uri::try_from(uri).unwrap())
}

fn text(body: &'static str) -> BoxedHandler {
    handler(move |ctx| async move {
        ctx.response().send_text(body);
        Ok(())
    })
}

fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> BoxedHandler {
    let log = log.clone();
    handler(move |ctx| {
        let log = log.clone();
        async move {
            log.lock().push(name);
            ctx.next().await
        }
    })
}

// =============================================================================
// Chain order
// =============================================================================

#[tokio::test]
async fn test_handlers_run_in_declaration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new(
        Registry::empty(),
        [recording(&log, "first"), recording(&log, "second"), text("done")],
    );

    let sent = run(&pipeline, get("/")).await;
    assert_eq!(sent.body_text(), "done");
    assert_eq!(*log.lock(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_exhausted_chain_is_404() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new(Registry::empty(), [recording(&log, "only")]);

    let sent = run(&pipeline, get("/missing")).await;
    assert_eq!(sent.status, StatusCode::NOT_FOUND);
    assert_eq!(sent.body_text(), "404 Not Found");
    assert_eq!(*log.lock(), vec!["only"]);
}

#[tokio::test]
async fn test_custom_exhausted_handler() {
    let pipeline = Pipeline::new(Registry::empty(), [builtin::next()]).with_exhausted(text("fallback"));
    assert_eq!(run(&pipeline, get("/")).await.body_text(), "fallback");
}

#[tokio::test]
async fn test_insert_rejoins_outer_chain() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let inner = [recording(&log, "inner-1"), recording(&log, "inner-2")];
    let outer_log = log.clone();
    let pipeline = Pipeline::new(
        Registry::empty(),
        [
            handler(move |ctx| {
                let inner = inner.clone();
                async move { ctx.insert(handlers(inner)).await }
            }),
            handler(move |ctx| {
                let log = outer_log.clone();
                async move {
                    log.lock().push("outer");
                    ctx.response().send_text("ok");
                    Ok(())
                }
            }),
        ],
    );

    run(&pipeline, get("/")).await;
    assert_eq!(*log.lock(), vec!["inner-1", "inner-2", "outer"]);
}

#[tokio::test]
async fn test_inserted_registry_is_scoped_to_nested_chain() {
    let pipeline = Pipeline::new(
        Registry::empty(),
        [
            builtin::register(Registry::single(String::from("scoped")), [builtin::next()]),
            handler(|ctx| async move {
                let seen = ctx.maybe_get::<String>().map(|s| s.to_string());
                ctx.response().send_text(format!("{seen:?}"));
                Ok(())
            }),
        ],
    );
    assert_eq!(run(&pipeline, get("/")).await.body_text(), "None");
}

#[tokio::test]
async fn test_next_with_layers_registry() {
    let pipeline = Pipeline::new(
        Registry::single(String::from("root")),
        [
            builtin::next_with(Registry::single(String::from("layered"))),
            handler(|ctx| async move {
                let all: Vec<String> = ctx.get_all::<String>().iter().map(|s| s.to_string()).collect();
                ctx.response().send_text(all.join(","));
                Ok(())
            }),
        ],
    );
    assert_eq!(run(&pipeline, get("/")).await.body_text(), "layered,root");
}

#[tokio::test]
async fn test_next_resumed_on_another_task() {
    let pipeline = Pipeline::new(
        Registry::empty(),
        [
            handler(|ctx| async move {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ctx.next().await
                });
                Ok(())
            }),
            text("resumed"),
        ],
    );
    assert_eq!(run(&pipeline, get("/")).await.body_text(), "resumed");
}

#[tokio::test]
async fn test_blocking_result_returned_to_handler() {
    let pipeline = Pipeline::new(
        Registry::empty(),
        [handler(|ctx| async move {
            let sum = ctx.blocking(|| (1..=10).sum::<u32>()).await?;
            ctx.response().send_text(sum.to_string());
            Ok(())
        })],
    );
    assert_eq!(run(&pipeline, get("/")).await.body_text(), "55");
}

// =============================================================================
// Methods
// =============================================================================

#[tokio::test]
async fn test_method_mismatch_is_405_with_allow() {
    let chain = Chain::new()
        .get("users", text("list"))
        .post("users", text("create"))
        .build()
        .unwrap();
    let pipeline = Pipeline::new(Registry::empty(), [chain.into_handler()]);

    let sent = run(&pipeline, request(Method::DELETE, "/users")).await;
    assert_eq!(sent.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(sent.header("allow"), Some("GET, POST"));
}

#[tokio::test]
async fn test_nested_mismatch_reported_by_outermost_chain() {
    let chain = Chain::new()
        .prefix("api", |api| api.get("items", text("items")))
        .build()
        .unwrap();
    let pipeline = Pipeline::new(Registry::empty(), [chain.into_handler()]);

    let sent = run(&pipeline, request(Method::POST, "/api/items")).await;
    assert_eq!(sent.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(sent.header("allow"), Some("GET"));
}

#[tokio::test]
async fn test_nested_mismatch_falls_through_to_later_match() {
    let chain = Chain::new()
        .prefix("api", |api| api.get("items", text("read")))
        .post("api/items", text("write"))
        .build()
        .unwrap();
    let pipeline = Pipeline::new(Registry::empty(), [chain.into_handler()]);

    let sent = run(&pipeline, request(Method::POST, "/api/items")).await;
    assert_eq!(sent.status, StatusCode::OK);
    assert_eq!(sent.body_text(), "write");
}

#[tokio::test]
async fn test_unmatched_path_is_404_not_405() {
    let chain = Chain::new().get("users", text("list")).build().unwrap();
    let pipeline = Pipeline::new(Registry::empty(), [chain.into_handler()]);

    let sent = run(&pipeline, request(Method::POST, "/teams")).await;
    assert_eq!(sent.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_by_method_dispatch() {
    let pipeline = Pipeline::new(
        Registry::empty(),
        [by_method().get(text("read")).put(text("write")).into_handler()],
    );

    assert_eq!(run(&pipeline, get("/")).await.body_text(), "read");
    assert_eq!(
        run(&pipeline, request(Method::HEAD, "/")).await.body_text(),
        "read"
    );

    let options = run(&pipeline, request(Method::OPTIONS, "/")).await;
    assert_eq!(options.status, StatusCode::OK);
    assert_eq!(options.header("allow"), Some("GET, OPTIONS, PUT"));

    let rejected = run(&pipeline, request(Method::DELETE, "/")).await;
    assert_eq!(rejected.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(rejected.header("allow"), Some("GET, PUT"));
}

// =============================================================================
// Error dispatch
// =============================================================================

struct Tagged(&'static str);

#[async_trait]
impl ServerErrorHandler for Tagged {
    async fn error(&self, ctx: &Context, error: Error) -> Result<(), Error> {
        ctx.response().status(error.status_code()).send_text(format!("{}: {error}", self.0));
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl ServerErrorHandler for Failing {
    async fn error(&self, _ctx: &Context, _error: Error) -> Result<(), Error> {
        Err(Error::internal("error handler broke"))
    }
}

#[async_trait]
impl ClientErrorHandler for Failing {
    async fn error(&self, _ctx: &Context, _status: u16) -> Result<(), Error> {
        Err(Error::internal("client error handler broke"))
    }
}

fn failing_handler() -> BoxedHandler {
    handler(|_ctx| async move { Err(Error::BadRequest("bad input".into())) })
}

#[tokio::test]
async fn test_default_server_error_handler() {
    let pipeline = Pipeline::new(Registry::empty(), [failing_handler()]);
    let sent = run(&pipeline, get("/")).await;
    assert_eq!(sent.status, StatusCode::BAD_REQUEST);
    assert_eq!(sent.body_text(), "400 Bad Request");
}

#[tokio::test]
async fn test_development_mode_includes_message() {
    let registry = Registry::single(ServerConfig::new().with_development(true));
    let pipeline = Pipeline::new(registry, [failing_handler()]);
    let sent = run(&pipeline, get("/")).await;
    assert!(sent.body_text().contains("bad input"));
}

#[tokio::test]
async fn test_error_dispatched_with_failing_step_registry() {
    let root = Registry::builder()
        .add_shared::<dyn ServerErrorHandler>(Arc::new(Tagged("root")))
        .build();
    let nested = Registry::builder()
        .add_shared::<dyn ServerErrorHandler>(Arc::new(Tagged("nested")))
        .build();
    let pipeline = Pipeline::new(root, [builtin::register(nested, [failing_handler()])]);

    let sent = run(&pipeline, get("/")).await;
    assert_eq!(sent.body_text(), "nested: Bad Request: bad input");
}

#[tokio::test]
async fn test_error_after_nested_chain_uses_outer_registry() {
    let root = Registry::builder()
        .add_shared::<dyn ServerErrorHandler>(Arc::new(Tagged("root")))
        .build();
    let nested = Registry::builder()
        .add_shared::<dyn ServerErrorHandler>(Arc::new(Tagged("nested")))
        .build();
    let pipeline = Pipeline::new(
        root,
        [builtin::register(nested, [builtin::next()]), failing_handler()],
    );

    let sent = run(&pipeline, get("/")).await;
    assert!(sent.body_text().starts_with("root:"));
}

#[tokio::test]
async fn test_explicit_error_dispatch() {
    let pipeline = Pipeline::new(
        Registry::empty(),
        [handler(|ctx| async move { ctx.error(Error::NotFound("gone".into())).await })],
    );
    assert_eq!(run(&pipeline, get("/")).await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failing_server_error_handler_falls_back_to_500() {
    let registry = Registry::builder()
        .add_shared::<dyn ServerErrorHandler>(Arc::new(Failing))
        .build();
    let pipeline = Pipeline::new(registry, [failing_handler()]);

    let sent = run(&pipeline, get("/")).await;
    assert_eq!(sent.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(sent.body_text(), "500 Internal Server Error");
}

#[tokio::test]
async fn test_failing_client_error_handler_falls_back_to_500() {
    let registry = Registry::builder()
        .add_shared::<dyn ClientErrorHandler>(Arc::new(Failing))
        .build();
    let pipeline = Pipeline::new(registry, [builtin::not_found()]);

    let sent = run(&pipeline, get("/")).await;
    assert_eq!(sent.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_error_after_send_does_not_overwrite() {
    let pipeline = Pipeline::new(
        Registry::empty(),
        [handler(|ctx| async move {
            ctx.response().send_text("first");
            Err(Error::internal("late failure"))
        })],
    );

    let sent = run_all(&pipeline, get("/")).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body_text(), "first");
}

#[tokio::test]
async fn test_missing_registry_entry_is_server_error() {
    struct Database;
    let pipeline = Pipeline::new(
        Registry::empty(),
        [handler(|ctx| async move {
            ctx.get::<Database>()?;
            ctx.response().send_text("unreachable");
            Ok(())
        })],
    );
    let sent = run(&pipeline, get("/")).await;
    assert_eq!(sent.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_render_without_renderer_is_server_error() {
    struct Opaque;
    let pipeline = Pipeline::new(
        Registry::empty(),
        [handler(|ctx| async move { ctx.render(Opaque).await })],
    );
    let sent = run(&pipeline, get("/")).await;
    assert_eq!(sent.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_render_with_registered_renderer() {
    struct Point(i32, i32);
    let registry = Registry::builder()
        .add_entry(render::renderer_entry(render::renderer_for(|ctx, p: &Point| {
            ctx.response().send_text(format!("({}, {})", p.0, p.1));
            Ok(())
        })))
        .build();
    let pipeline = Pipeline::new(
        registry,
        [handler(|ctx| async move { ctx.render(Point(3, 4)).await })],
    );
    assert_eq!(run(&pipeline, get("/")).await.body_text(), "(3, 4)");
}
