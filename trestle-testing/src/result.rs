// Outcome of running a handler under a request fixture

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use trestle_core::{Error, Renderable, SentResponse};

/// How the handler finished with the request.
pub enum Outcome {
    /// A response was committed.
    Sent(SentResponse),
    /// Every handler delegated and the chain ran out.
    CalledNext,
    ClientError(u16),
    Exception(Error),
    Rendered(Renderable),
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Sent(sent) => f.debug_tuple("Sent").field(&sent.status).finish(),
            Outcome::CalledNext => f.write_str("CalledNext"),
            Outcome::ClientError(code) => f.debug_tuple("ClientError").field(code).finish(),
            Outcome::Exception(e) => f.debug_tuple("Exception").field(&e.to_string()).finish(),
            Outcome::Rendered(value) => f.debug_tuple("Rendered").field(value).finish(),
        }
    }
}

/// The first signal raised while handling a fixture request, with the
/// response state at that moment.
#[derive(Debug)]
pub struct HandlingResult {
    outcome: Outcome,
    status: StatusCode,
    headers: HeaderMap,
}

impl HandlingResult {
    pub(crate) fn new(outcome: Outcome, status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            outcome,
            status,
            headers,
        }
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Status of the sent response, the client error code, or the status
    /// of the raised error. Otherwise the status set on the response.
    pub fn status(&self) -> u16 {
        match &self.outcome {
            Outcome::Sent(sent) => sent.status.as_u16(),
            Outcome::ClientError(code) => *code,
            Outcome::Exception(e) => e.status_code(),
            Outcome::CalledNext | Outcome::Rendered(_) => self.status.as_u16(),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match &self.outcome {
            Outcome::Sent(sent) => &sent.headers,
            _ => &self.headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Body of the sent response; empty for any other outcome.
    pub fn body_bytes(&self) -> Bytes {
        match &self.outcome {
            Outcome::Sent(sent) => sent.body.clone(),
            _ => Bytes::new(),
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body_bytes()).into_owned()
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body_bytes())
    }

    pub fn called_next(&self) -> bool {
        matches!(self.outcome, Outcome::CalledNext)
    }

    pub fn client_error(&self) -> Option<u16> {
        match self.outcome {
            Outcome::ClientError(code) => Some(code),
            _ => None,
        }
    }

    pub fn exception(&self) -> Option<&Error> {
        match &self.outcome {
            Outcome::Exception(e) => Some(e),
            _ => None,
        }
    }

    /// The rendered value, if one of type `T` was rendered.
    pub fn rendered<T: 'static>(&self) -> Option<&T> {
        match &self.outcome {
            Outcome::Rendered(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn sent_response(&self) -> Option<&SentResponse> {
        match &self.outcome {
            Outcome::Sent(sent) => Some(sent),
            _ => None,
        }
    }
}
