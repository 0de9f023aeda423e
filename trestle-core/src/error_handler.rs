// Client and server error dispatch

use crate::context::{Context, RequestState};
use crate::config::ServerConfig;
use crate::logging::{debug, error, warn};
use crate::registry::Registry;
use crate::Error;
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;

/// Handles `ctx.client_error(status)`. Resolved from the registry as
/// `dyn ClientErrorHandler`.
#[async_trait]
pub trait ClientErrorHandler: Send + Sync {
    async fn error(&self, ctx: &Context, status: u16) -> Result<(), Error>;
}

/// Handles errors raised by handlers. Resolved from the registry as
/// `dyn ServerErrorHandler`.
#[async_trait]
pub trait ServerErrorHandler: Send + Sync {
    async fn error(&self, ctx: &Context, error: Error) -> Result<(), Error>;
}

/// Sends the status with its reason phrase as a plain-text body.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClientErrorHandler;

#[async_trait]
impl ClientErrorHandler for DefaultClientErrorHandler {
    async fn error(&self, ctx: &Context, status: u16) -> Result<(), Error> {
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Client Error");
        ctx.response().status(status).send_text(format!("{status} {reason}"));
        Ok(())
    }
}

/// Logs the error and responds with its status code. The error message is
/// only included in the body when the server runs in development mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultServerErrorHandler;

#[async_trait]
impl ServerErrorHandler for DefaultServerErrorHandler {
    async fn error(&self, ctx: &Context, err: Error) -> Result<(), Error> {
        let status = err.status();
        error!(
            request_id = %ctx.request().id(),
            status = status.as_u16(),
            error = %err,
            "Error processing request"
        );

        let development = ctx
            .maybe_get::<ServerConfig>()
            .is_some_and(|config| config.development);

        let reason = status.canonical_reason().unwrap_or("Internal Server Error");
        let body = if development {
            format!("{} {}\n\n{}", status.as_u16(), reason, err)
        } else {
            format!("{} {}", status.as_u16(), reason)
        };
        ctx.response().status(status.as_u16()).send_text(body);
        Ok(())
    }
}

pub(crate) async fn dispatch_client_error(state: Arc<RequestState>, registry: Registry, status: u16) {
    if !state.begin_dispatch() {
        error!(
            request_id = %state.request.id(),
            status,
            "Client error raised after the request was already dispatched to an error handler"
        );
        send_fallback(&state);
        return;
    }

    debug!(request_id = %state.request.id(), status, "Dispatching client error");
    let handler: Arc<dyn ClientErrorHandler> = registry
        .maybe_get::<dyn ClientErrorHandler>()
        .unwrap_or_else(|| Arc::new(DefaultClientErrorHandler));

    let ctx = Context::detached(state.clone(), registry);
    if let Err(secondary) = handler.error(&ctx, status).await {
        error!(
            request_id = %state.request.id(),
            status,
            error = %secondary,
            "Client error handler failed"
        );
        send_fallback(&state);
    }
}

pub(crate) async fn dispatch_server_error(state: Arc<RequestState>, registry: Registry, err: Error) {
    if !state.begin_dispatch() {
        error!(
            request_id = %state.request.id(),
            error = %err,
            "Error raised after the request was already dispatched to an error handler"
        );
        send_fallback(&state);
        return;
    }

    let handler: Arc<dyn ServerErrorHandler> = registry
        .maybe_get::<dyn ServerErrorHandler>()
        .unwrap_or_else(|| Arc::new(DefaultServerErrorHandler));

    let ctx = Context::detached(state.clone(), registry);
    if let Err(secondary) = handler.error(&ctx, err).await {
        error!(
            request_id = %state.request.id(),
            error = %secondary,
            "Server error handler failed"
        );
        send_fallback(&state);
    }
}

fn send_fallback(state: &RequestState) {
    if state.response.is_committed() {
        warn!(
            request_id = %state.request.id(),
            "Response already committed, no fallback sent"
        );
        return;
    }
    state
        .response
        .status(StatusCode::INTERNAL_SERVER_ERROR.as_u16())
        .send_text("500 Internal Server Error");
}
