//! Rendering of arbitrary values into responses.
//!
//! `ctx.render(value)` hands the value to the registry's
//! [`RenderController`]. The default controller picks the first
//! [`Renderer`] in the registry that accepts the value's runtime type, so a
//! renderer registered closer to the handler shadows the built-ins.
//!
//! ```
//! use trestle_core::render::{renderer_for, renderer_entry};
//! use trestle_core::registry::Registry;
//!
//! struct Point(i32, i32);
//!
//! let registry = Registry::builder()
//!     .add_entry(renderer_entry(renderer_for(|ctx, p: &Point| {
//!         ctx.response().send_text(format!("({}, {})", p.0, p.1));
//!         Ok(())
//!     })))
//!     .build();
//! assert_eq!(registry.len(), 1);
//! ```

use crate::file::FileSystemBinding;
use crate::logging::{debug, trace};
use crate::registry::RegistryEntry;
use crate::sse::{EVENT_STREAM, ServerSentEvents};
use crate::static_assets::{io_status, send_file};
use crate::{Context, Error};
use async_trait::async_trait;
use http::header::{self, HeaderValue};
use serde::Serialize;
use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

/// A value passed to `ctx.render`, with its type erased.
pub struct Renderable {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Renderable {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_name: type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the value back out, or return `self` if it is not a `T`.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        let type_name = self.type_name;
        self.value
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|value| Self { value, type_name })
    }
}

impl fmt::Debug for Renderable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Renderable").field(&self.type_name).finish()
    }
}

/// Turns values of some type into a response.
#[async_trait]
pub trait Renderer: Send + Sync {
    fn accepts(&self, value: &Renderable) -> bool;

    async fn render(&self, ctx: &Context, value: Renderable) -> Result<(), Error>;

    fn name(&self) -> &'static str {
        type_name::<Self>()
    }
}

/// Decides how `ctx.render` handles a value. Resolved from the registry as
/// `dyn RenderController`.
#[async_trait]
pub trait RenderController: Send + Sync {
    async fn render(&self, ctx: &Context, value: Renderable) -> Result<(), Error>;
}

/// Delegates to the first registered renderer that accepts the value.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRenderController;

#[async_trait]
impl RenderController for DefaultRenderController {
    async fn render(&self, ctx: &Context, value: Renderable) -> Result<(), Error> {
        let renderer = ctx
            .registry()
            .first::<dyn Renderer, _>(|renderer| renderer.accepts(&value).then_some(renderer));

        match renderer {
            Some(renderer) => {
                trace!(renderer = renderer.name(), value = value.type_name(), "Rendering");
                renderer.render(ctx, value).await
            }
            None => Err(Error::NoSuchRenderer(value.type_name())),
        }
    }
}

/// A renderer for `T` backed by a closure.
pub struct TypedRenderer<T, F> {
    f: F,
    _marker: PhantomData<fn(&T)>,
}

#[async_trait]
impl<T, F> Renderer for TypedRenderer<T, F>
where
    T: Any + Send + Sync,
    F: Fn(&Context, &T) -> Result<(), Error> + Send + Sync,
{
    fn accepts(&self, value: &Renderable) -> bool {
        value.is::<T>()
    }

    async fn render(&self, ctx: &Context, value: Renderable) -> Result<(), Error> {
        let value = value
            .downcast_ref::<T>()
            .ok_or(Error::NoSuchRenderer(type_name::<T>()))?;
        (self.f)(ctx, value)
    }

    fn name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// Build a renderer for `T` from a closure.
pub fn renderer_for<T, F>(f: F) -> TypedRenderer<T, F>
where
    T: Any + Send + Sync,
    F: Fn(&Context, &T) -> Result<(), Error> + Send + Sync,
{
    TypedRenderer {
        f,
        _marker: PhantomData,
    }
}

/// A registry entry exposing `renderer` as `dyn Renderer`.
pub fn renderer_entry<R: Renderer + 'static>(renderer: R) -> RegistryEntry {
    RegistryEntry::shared::<dyn Renderer>(Arc::new(renderer))
}

/// A JSON document to render as `application/json`.
#[derive(Debug, Clone, PartialEq)]
pub struct Json(pub serde_json::Value);

/// Serialize `value` into a renderable [`Json`].
pub fn json<T: Serialize>(value: &T) -> Result<Json, Error> {
    Ok(Json(serde_json::to_value(value)?))
}

/// Renders `String` and `&'static str` as plain text.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextRenderer;

#[async_trait]
impl Renderer for TextRenderer {
    fn accepts(&self, value: &Renderable) -> bool {
        value.is::<String>() || value.is::<&'static str>()
    }

    async fn render(&self, ctx: &Context, value: Renderable) -> Result<(), Error> {
        let text = match value.downcast::<String>() {
            Ok(text) => text,
            Err(value) => value
                .downcast::<&'static str>()
                .map(str::to_string)
                .map_err(|value| Error::NoSuchRenderer(value.type_name()))?,
        };
        ctx.response().send_text(text);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "text"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRenderer;

#[async_trait]
impl Renderer for JsonRenderer {
    fn accepts(&self, value: &Renderable) -> bool {
        value.is::<Json>()
    }

    async fn render(&self, ctx: &Context, value: Renderable) -> Result<(), Error> {
        let Json(document) = value
            .downcast::<Json>()
            .map_err(|value| Error::NoSuchRenderer(value.type_name()))?;
        ctx.response().send_json(&document)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Renders a `PathBuf` as a file download with conditional GET support.
///
/// Relative paths resolve against the current [`FileSystemBinding`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FileRenderer;

#[async_trait]
impl Renderer for FileRenderer {
    fn accepts(&self, value: &Renderable) -> bool {
        value.is::<PathBuf>()
    }

    async fn render(&self, ctx: &Context, value: Renderable) -> Result<(), Error> {
        let path = value
            .downcast::<PathBuf>()
            .map_err(|value| Error::NoSuchRenderer(value.type_name()))?;

        let resolved = if path.is_absolute() {
            Some(path)
        } else {
            match ctx.maybe_get::<FileSystemBinding>() {
                Some(binding) => binding.file(&path.to_string_lossy()),
                None => Some(path),
            }
        };
        let Some(resolved) = resolved else {
            ctx.signal_client_error(404).await;
            return Ok(());
        };

        let lookup = resolved.clone();
        match ctx.blocking(move || std::fs::metadata(lookup)).await? {
            Ok(metadata) if metadata.is_file() => send_file(ctx, &resolved, &metadata).await,
            Ok(_) => {
                debug!(path = %resolved.display(), "Rendered path is not a file");
                ctx.signal_client_error(404).await;
                Ok(())
            }
            Err(e) => {
                debug!(path = %resolved.display(), error = %e, "Rendered file unavailable");
                ctx.signal_client_error(io_status(&e)).await;
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Renders [`ServerSentEvents`] as a `text/event-stream` body.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventStreamRenderer;

#[async_trait]
impl Renderer for EventStreamRenderer {
    fn accepts(&self, value: &Renderable) -> bool {
        value.is::<ServerSentEvents>()
    }

    async fn render(&self, ctx: &Context, value: Renderable) -> Result<(), Error> {
        let events = value
            .downcast::<ServerSentEvents>()
            .map_err(|value| Error::NoSuchRenderer(value.type_name()))?;
        ctx.response()
            .content_type(EVENT_STREAM)
            .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .send(events.encode());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "event-stream"
    }
}

/// Entries for the built-in renderers.
pub fn default_renderers() -> Vec<RegistryEntry> {
    vec![
        renderer_entry(TextRenderer),
        renderer_entry(JsonRenderer),
        renderer_entry(FileRenderer),
        renderer_entry(EventStreamRenderer),
    ]
}
