// HTTP request and response types

use crate::Error;
use crate::logging::{debug, warn};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identifier attached to every request, taken from `X-Request-Id` when the
/// client supplies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| Self(v.to_string()))
            .unwrap_or_else(Self::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An incoming request. Immutable once the pipeline starts.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    id: RequestId,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            id: RequestId::generate(),
        }
    }

    pub fn from_parts(parts: http::request::Parts, body: Bytes) -> Self {
        let id = RequestId::from_headers(&parts.headers);
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            id,
        }
    }

    pub fn get(uri: &str) -> Result<Self, Error> {
        Ok(Self::new(Method::GET, parse_uri(uri)?))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if name == REQUEST_ID_HEADER
            && let Ok(id) = value.to_str()
        {
            self.id = RequestId(id.to_string());
        }
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request path without the leading `/`.
    pub fn path(&self) -> &str {
        self.uri.path().trim_start_matches('/')
    }

    /// Raw query string, empty if absent.
    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    /// Decoded query parameters. Later duplicates win.
    pub fn query_params(&self) -> HashMap<String, String> {
        serde_urlencoded::from_str::<Vec<(String, String)>>(self.query())
            .map(|pairs| pairs.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_params().remove(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Parse the request body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|e| Error::BadRequest(e.to_string()))
    }

    /// The `If-Modified-Since` header, if present and well formed.
    pub fn if_modified_since(&self) -> Option<SystemTime> {
        self.header(header::IF_MODIFIED_SINCE.as_str())
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }
}

pub fn parse_uri(uri: &str) -> Result<Uri, Error> {
    uri.parse::<Uri>()
        .map_err(|e| Error::BadRequest(format!("invalid uri {uri:?}: {e}")))
}

/// A response that has been committed.
#[derive(Debug, Clone)]
pub struct SentResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SentResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Delivers a committed response to whoever is waiting for it.
pub trait ResponseTransmitter: Send + Sync {
    /// Whether the receiving side still wants a response.
    fn is_open(&self) -> bool;

    fn transmit(&self, response: SentResponse);
}

/// The response under construction for one request.
///
/// Status and headers can be changed until one of the `send` methods
/// commits the response. Only the first commit is transmitted; later ones
/// are logged and dropped.
pub struct Response {
    status: Mutex<StatusCode>,
    headers: Mutex<HeaderMap>,
    committed: AtomicBool,
    transmitter: Arc<dyn ResponseTransmitter>,
    request_id: RequestId,
}

impl Response {
    pub fn new(transmitter: Arc<dyn ResponseTransmitter>, request_id: RequestId) -> Self {
        Self {
            status: Mutex::new(StatusCode::OK),
            headers: Mutex::new(HeaderMap::new()),
            committed: AtomicBool::new(false),
            transmitter,
            request_id,
        }
    }

    /// Set the status. Codes outside 100..=999 become 500.
    pub fn status(&self, code: u16) -> &Self {
        let status = StatusCode::from_u16(code).unwrap_or_else(|_| {
            warn!(code, "Invalid status code, using 500");
            StatusCode::INTERNAL_SERVER_ERROR
        });
        *self.status.lock() = status;
        self
    }

    pub fn get_status(&self) -> StatusCode {
        *self.status.lock()
    }

    /// Replace a header.
    pub fn header(&self, name: HeaderName, value: HeaderValue) -> &Self {
        self.headers.lock().insert(name, value);
        self
    }

    /// Replace a header given as strings.
    pub fn set_header(&self, name: &str, value: &str) -> Result<&Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Http(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Http(format!("invalid header value {value:?}: {e}")))?;
        Ok(self.header(name, value))
    }

    pub fn content_type(&self, mime: &str) -> &Self {
        match HeaderValue::from_str(mime) {
            Ok(value) => self.header(header::CONTENT_TYPE, value),
            Err(_) => {
                warn!(mime, "Ignoring invalid content type");
                self
            }
        }
    }

    pub fn headers(&self) -> HeaderMap {
        self.headers.lock().clone()
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Commit with `body`. Returns whether the response was transmitted.
    pub fn send(&self, body: impl Into<Bytes>) -> bool {
        if self.committed.swap(true, Ordering::SeqCst) {
            warn!(
                request_id = %self.request_id,
                "Response already committed, ignoring second send"
            );
            return false;
        }

        if !self.transmitter.is_open() {
            debug!(request_id = %self.request_id, "Client went away, response dropped");
            return false;
        }

        let response = SentResponse {
            status: self.get_status(),
            headers: self.headers(),
            body: body.into(),
        };
        debug!(
            request_id = %self.request_id,
            status = response.status.as_u16(),
            bytes = response.body.len(),
            "Response sent"
        );
        self.transmitter.transmit(response);
        true
    }

    pub fn send_empty(&self) -> bool {
        self.send(Bytes::new())
    }

    /// Send text, defaulting the content type to `text/plain`.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.default_content_type("text/plain;charset=UTF-8");
        self.send(Bytes::from(text.into()))
    }

    /// Serialize `value` and send it as `application/json`.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<bool, Error> {
        let body = serde_json::to_vec(value)?;
        self.content_type("application/json");
        Ok(self.send(body))
    }

    fn default_content_type(&self, mime: &'static str) {
        self.headers
            .lock()
            .entry(header::CONTENT_TYPE)
            .or_insert(HeaderValue::from_static(mime));
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.get_status())
            .field("committed", &self.is_committed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Capture {
        open: bool,
        sent: Mutex<Vec<SentResponse>>,
    }

    impl ResponseTransmitter for Capture {
        fn is_open(&self) -> bool {
            self.open
        }

        fn transmit(&self, response: SentResponse) {
            self.sent.lock().push(response);
        }
    }

    fn response(open: bool) -> (Arc<Capture>, Response) {
        let capture = Arc::new(Capture {
            open,
            ..Default::default()
        });
        let response = Response::new(capture.clone(), RequestId::generate());
        (capture, response)
    }

    #[test]
    fn test_request_path_and_query() {
        let request = Request::get("/users/42?sort=asc&page=2").unwrap();
        assert_eq!(request.path(), "users/42");
        assert_eq!(request.query(), "sort=asc&page=2");
        assert_eq!(request.query_param("page").as_deref(), Some("2"));
    }

    #[test]
    fn test_request_id_from_header() {
        let request = Request::get("/")
            .unwrap()
            .with_header(
                HeaderName::from_static(REQUEST_ID_HEADER),
                HeaderValue::from_static("abc-123"),
            );
        assert_eq!(request.id().as_str(), "abc-123");
    }

    #[test]
    fn test_if_modified_since() {
        let request = Request::get("/")
            .unwrap()
            .with_header(
                header::IF_MODIFIED_SINCE,
                HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"),
            );
        assert!(request.if_modified_since().is_some());
    }

    #[test]
    fn test_single_commit() {
        let (capture, response) = response(true);
        assert!(response.status(201).send("first"));
        assert!(!response.status(500).send("second"));

        let sent = capture.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, StatusCode::CREATED);
        assert_eq!(sent[0].body_text(), "first");
    }

    #[test]
    fn test_closed_transmitter_is_noop() {
        let (capture, response) = response(false);
        assert!(!response.send("late"));
        assert!(response.is_committed());
        assert!(capture.sent.lock().is_empty());
    }

    #[test]
    fn test_send_text_keeps_explicit_content_type() {
        let (capture, response) = response(true);
        response.content_type("text/html");
        response.send_text("<p>hi</p>");
        assert_eq!(capture.sent.lock()[0].header("content-type"), Some("text/html"));
    }

    #[test]
    fn test_send_json() {
        let (capture, response) = response(true);
        response.send_json(&serde_json::json!({"ok": true})).unwrap();
        let sent = capture.sent.lock();
        assert_eq!(sent[0].header("content-type"), Some("application/json"));
        assert_eq!(sent[0].body_text(), r#"{"ok":true}"#);
    }

    #[test]
    fn test_invalid_status_becomes_500() {
        let (_, response) = response(true);
        response.status(42);
        assert_eq!(response.get_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
