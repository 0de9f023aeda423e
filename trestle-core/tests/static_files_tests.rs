//! Static file serving against a temporary directory tree.

use ::http::header::{self, HeaderValue};
use ::http::{Method, StatusCode, Uri};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use trestle_core::{
    Chain, FileHandlerSpec, IntoHandler, Pipeline, Request, ResponseTransmitter, SentResponse,
    ServerConfig, base_registry, handler,
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

struct Site {
    dir: TempDir,
    pipeline: Pipeline,
}

impl Site {
    fn new(chain: Chain, index_files: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
        fs::write(dir.path().join("style.css"), "body {}").unwrap();
        fs::create_dir_all(dir.path().join("docs/empty")).unwrap();
        fs::write(dir.path().join("docs/index.html"), "<h1>docs</h1>").unwrap();
        fs::write(dir.path().join("docs/default.htm"), "default").unwrap();
        fs::write(dir.path().join(".secret"), "hidden").unwrap();

        let config = ServerConfig::new()
            .with_base_dir(dir.path())
            .with_index_files(index_files.iter().copied());
        let pipeline = Pipeline::new(base_registry(&config), [chain.build().unwrap().into_handler()]);
        Self { dir, pipeline }
    }

    fn files(index_files: &[&str]) -> Self {
        Self::new(Chain::new().files(FileHandlerSpec::new()), index_files)
    }

    async fn send(&self, request: Request) -> SentResponse {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pipeline.handle(request, Arc::new(Capture(tx))).await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("no response sent")
    }

    async fn get(&self, uri: &str) -> SentResponse {
        self.send(Request::get(uri).unwrap()).await
    }
}

fn request(method: Method, uri: &str) -> Request {
    Request::new(method, Uri::try_from(uri).unwrap())
}

#[tokio::test]
async fn test_serves_file_with_content_type() {
    let site = Site::files(&[]);
    let sent = site.get("/hello.txt").await;

    assert_eq!(sent.status, StatusCode::OK);
    assert_eq!(sent.body_text(), "hello world");
    assert!(sent.header("content-type").unwrap().starts_with("text/plain"));
    assert!(sent.header("last-modified").is_some());

    let css = site.get("/style.css").await;
    assert!(css.header("content-type").unwrap().starts_with("text/css"));
}

#[tokio::test]
async fn test_first_existing_index_file_served() {
    let site = Site::files(&["missing.html", "index.html", "default.htm"]);
    let sent = site.get("/docs").await;
    assert_eq!(sent.status, StatusCode::OK);
    assert_eq!(sent.body_text(), "<h1>docs</h1>");

    let slash = site.get("/docs/").await;
    assert_eq!(slash.body_text(), "<h1>docs</h1>");
}

#[tokio::test]
async fn test_handler_index_files_override_config() {
    let site = Site::new(
        Chain::new().files(FileHandlerSpec::new().index_files(["default.htm"])),
        &["index.html"],
    );
    assert_eq!(site.get("/docs").await.body_text(), "default");
}

#[tokio::test]
async fn test_directory_without_index_is_403() {
    let site = Site::files(&["index.html"]);
    assert_eq!(site.get("/docs/empty").await.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_directory_without_index_files_configured_is_403() {
    let site = Site::files(&[]);
    assert_eq!(site.get("/docs").await.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_missing_file_is_404() {
    let site = Site::files(&[]);
    assert_eq!(site.get("/nope.txt").await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_traversal_and_hidden_paths_are_404() {
    let site = Site::files(&[]);
    for uri in [
        "/../etc/passwd",
        "/docs/../hello.txt",
        "/%2e%2e/hello.txt",
        "/.secret",
        "/docs/./index.html",
        "/hello.txt.",
    ] {
        let sent = site.get(uri).await;
        assert_eq!(sent.status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_non_read_method_is_405() {
    let site = Site::files(&["index.html"]);
    assert_eq!(
        site.send(request(Method::POST, "/hello.txt")).await.status,
        StatusCode::METHOD_NOT_ALLOWED
    );
    assert_eq!(
        site.send(request(Method::DELETE, "/docs")).await.status,
        StatusCode::METHOD_NOT_ALLOWED
    );
    assert_eq!(
        site.send(request(Method::POST, "/nope.txt")).await.status,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_head_is_served() {
    let site = Site::files(&[]);
    let sent = site.send(request(Method::HEAD, "/hello.txt")).await;
    assert_eq!(sent.status, StatusCode::OK);
}

fn modified_since(site: &Site, name: &str, offset: Duration, later: bool) -> HeaderValue {
    let modified = fs::metadata(site.dir.path().join(name))
        .unwrap()
        .modified()
        .unwrap();
    let since = if later { modified + offset } else { modified - offset };
    HeaderValue::from_str(&httpdate::fmt_http_date(since)).unwrap()
}

#[tokio::test]
async fn test_if_modified_since_equal_to_mtime_returns_304() {
    let site = Site::files(&[]);
    let since = modified_since(&site, "hello.txt", Duration::ZERO, true);

    let sent = site
        .send(Request::get("/hello.txt").unwrap().with_header(header::IF_MODIFIED_SINCE, since))
        .await;
    assert_eq!(sent.status, StatusCode::NOT_MODIFIED);
    assert!(sent.body.is_empty());
}

#[tokio::test]
async fn test_later_if_modified_since_sends_file() {
    let site = Site::files(&[]);
    let since = modified_since(&site, "hello.txt", Duration::from_secs(3600), true);

    let sent = site
        .send(Request::get("/hello.txt").unwrap().with_header(header::IF_MODIFIED_SINCE, since))
        .await;
    assert_eq!(sent.status, StatusCode::OK);
    assert_eq!(sent.body_text(), "hello world");
}

#[tokio::test]
async fn test_stale_if_modified_since_sends_file() {
    let site = Site::files(&[]);
    let since = HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT");

    let sent = site
        .send(Request::get("/hello.txt").unwrap().with_header(header::IF_MODIFIED_SINCE, since))
        .await;
    assert_eq!(sent.status, StatusCode::OK);
    assert_eq!(sent.body_text(), "hello world");
    assert!(sent.header("last-modified").is_some());
}

#[tokio::test]
async fn test_path_and_dir_options() {
    let site = Site::new(
        Chain::new().files(FileHandlerSpec::new().path("static").dir("docs").index_files(["index.html"])),
        &[],
    );

    assert_eq!(site.get("/static/index.html").await.body_text(), "<h1>docs</h1>");
    assert_eq!(site.get("/static").await.body_text(), "<h1>docs</h1>");
    assert_eq!(site.get("/hello.txt").await.status, StatusCode::NOT_FOUND);
    assert_eq!(site.get("/static/../hello.txt").await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_file_system_binding_is_scoped() {
    let site = Site::new(
        Chain::new()
            .file_system("docs", |docs| docs.prefix("d", |d| d.files(FileHandlerSpec::new())))
            .files(FileHandlerSpec::new()),
        &[],
    );

    assert_eq!(site.get("/d/default.htm").await.body_text(), "default");
    assert_eq!(site.get("/hello.txt").await.body_text(), "hello world");
}

#[tokio::test]
async fn test_handlers_before_files_take_precedence() {
    let site = Site::new(
        Chain::new()
            .get("hello.txt", handler(|ctx| async move {
                ctx.response().send_text("dynamic");
                Ok(())
            }))
            .files(FileHandlerSpec::new()),
        &[],
    );
    assert_eq!(site.get("/hello.txt").await.body_text(), "dynamic");
    assert_eq!(site.get("/style.css").await.body_text(), "body {}");
}

#[tokio::test]
async fn test_missing_file_falls_through_to_later_handlers() {
    let site = Site::new(
        Chain::new()
            .files(FileHandlerSpec::new())
            .get("api/hello", handler(|ctx| async move {
                ctx.response().send_text("hi");
                Ok(())
            })),
        &[],
    );

    let sent = site.get("/api/hello").await;
    assert_eq!(sent.status, StatusCode::OK);
    assert_eq!(sent.body_text(), "hi");

    let missing = site.get("/nope").await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.body_text(), "404 Not Found");
}
