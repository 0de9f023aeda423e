// Server-sent event encoding

use std::fmt;

pub const EVENT_STREAM: &str = "text/event-stream;charset=UTF-8";

/// A single server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSentEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    /// Reconnection delay in milliseconds
    pub retry: Option<u64>,
}

impl ServerSentEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_retry(mut self, millis: u64) -> Self {
        self.retry = Some(millis);
        self
    }

    /// Event whose data is `value` serialized as JSON.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, crate::Error> {
        Ok(Self::new(serde_json::to_string(value)?))
    }
}

impl fmt::Display for ServerSentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.id {
            writeln!(f, "id: {id}")?;
        }
        if let Some(event) = &self.event {
            writeln!(f, "event: {event}")?;
        }
        if self.data.is_empty() {
            writeln!(f, "data: ")?;
        }
        for line in self.data.lines() {
            writeln!(f, "data: {line}")?;
        }
        if let Some(retry) = self.retry {
            writeln!(f, "retry: {retry}")?;
        }
        writeln!(f)
    }
}

/// A finite sequence of events, rendered as one `text/event-stream` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSentEvents {
    events: Vec<ServerSentEvent>,
}

impl ServerSentEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, event: ServerSentEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn encode(&self) -> String {
        self.events.iter().map(ToString::to_string).collect()
    }
}

impl FromIterator<ServerSentEvent> for ServerSentEvents {
    fn from_iter<I: IntoIterator<Item = ServerSentEvent>>(iter: I) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}
