//! Static file serving.
//!
//! [`FileHandler`] serves the part of the request path not consumed by
//! enclosing path bindings, resolved against the current
//! [`FileSystemBinding`]:
//!
//! - any segment that is `.`, `..`, or starts or ends with `.` is a 404,
//!   decided before the file system is touched
//! - a missing path delegates to the next handler, an unreadable one is
//!   a 403
//! - a directory is served through the first configured index file that
//!   exists, or answered with 403 when none does
//! - anything but GET or HEAD on a file or directory is a 405
//! - `If-Modified-Since` equal to the file's modification time (second
//!   precision) is a 304 with an empty body
//!
//! All file system access goes through the blocking executor.

use crate::config::ServerConfig;
use crate::file::FileSystemBinding;
use crate::handler::{BoxedHandler, Handler, IntoHandler};
use crate::handlers;
use crate::logging::{debug, trace};
use crate::mime::{ExtensionMimeTypes, MimeTypes};
use crate::path::decode_component;
use crate::{Context, Error};
use async_trait::async_trait;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Configuration for [`FileHandler`] and the handlers wrapped around it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHandlerSpec {
    path: Option<String>,
    dir: Option<String>,
    index_files: Vec<String>,
}

impl FileHandlerSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only serve requests under this request path prefix.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Serve from this subdirectory of the current file system binding.
    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Index files tried in order when a directory is requested.
    pub fn index_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Build the handler: a [`FileHandler`], nested in a file system
    /// binding for `dir` and a prefix binding for `path` when set.
    pub fn build(self) -> Result<BoxedHandler, Error> {
        let mut handler = FileHandler::new(self.index_files).into_handler();
        if let Some(dir) = self.dir {
            handler = handlers::file_system(dir, [handler]);
        }
        if let Some(path) = self.path {
            handler = handlers::prefix(&path, [handler])?;
        }
        Ok(handler)
    }
}

/// Serves files from the current [`FileSystemBinding`].
#[derive(Debug, Clone)]
pub struct FileHandler {
    index_files: Arc<[String]>,
}

impl FileHandler {
    pub fn new<I, S>(index_files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            index_files: index_files.into_iter().map(Into::into).collect(),
        }
    }

    /// The handler's own index files, or the server's when it has none.
    fn index_files(&self, ctx: &Context) -> Vec<String> {
        if !self.index_files.is_empty() {
            return self.index_files.to_vec();
        }
        ctx.maybe_get::<ServerConfig>()
            .map(|config| config.index_files.clone())
            .unwrap_or_default()
    }

    async fn serve_directory(&self, ctx: Context, dir: PathBuf) -> Result<(), Error> {
        for name in self.index_files(&ctx) {
            let candidate = dir.join(&name);
            let lookup = candidate.clone();
            if let Ok(metadata) = ctx.blocking(move || std::fs::metadata(lookup)).await?
                && metadata.is_file()
            {
                trace!(index = %candidate.display(), "Serving index file");
                return send_file(&ctx, &candidate, &metadata).await;
            }
        }

        debug!(dir = %dir.display(), "Directory has no index file");
        ctx.client_error(403).await
    }
}

#[async_trait]
impl Handler for FileHandler {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        let remaining = ctx.remaining_path();
        let decoded = decode_component(&remaining);

        if !is_safe_path(&decoded) {
            debug!(path = %decoded, "Rejecting unsafe asset path");
            return ctx.client_error(404).await;
        }

        let binding = ctx.get::<FileSystemBinding>()?;
        let Some(target) = binding.file(&decoded) else {
            return ctx.client_error(404).await;
        };

        let lookup = target.clone();
        let metadata = ctx.blocking(move || std::fs::metadata(lookup)).await?;

        match metadata {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(file = %target.display(), "No such file, delegating");
                ctx.next().await
            }
            Err(e) => ctx.client_error(io_status(&e)).await,
            Ok(metadata) if metadata.is_file() || metadata.is_dir() => {
                if !is_read(ctx.request().method()) {
                    return ctx.client_error(405).await;
                }
                if metadata.is_file() {
                    send_file(&ctx, &target, &metadata).await
                } else {
                    self.serve_directory(ctx, target).await
                }
            }
            Ok(_) => ctx.next().await,
        }
    }

    fn name(&self) -> &'static str {
        "files"
    }
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// Whether every segment of a decoded request path is safe to resolve.
pub fn is_safe_path(decoded: &str) -> bool {
    decoded
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .all(|segment| !segment.starts_with('.') && !segment.ends_with('.'))
}

pub(crate) fn io_status(err: &std::io::Error) -> u16 {
    match err.kind() {
        ErrorKind::PermissionDenied => 403,
        _ => 404,
    }
}

fn epoch_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Send `path` as the response, honouring `If-Modified-Since`.
///
/// `metadata` must describe `path`. Read failures become 404 or 403 client
/// errors.
pub async fn send_file(ctx: &Context, path: &Path, metadata: &Metadata) -> Result<(), Error> {
    let modified = metadata.modified().ok();

    if let (Some(modified), Some(since)) = (modified, ctx.request().if_modified_since())
        && epoch_seconds(since) == epoch_seconds(modified)
    {
        trace!(file = %path.display(), "Not modified");
        ctx.response()
            .status(StatusCode::NOT_MODIFIED.as_u16())
            .send_empty();
        return Ok(());
    }

    let read_path = path.to_path_buf();
    let body = match ctx.blocking(move || std::fs::read(read_path)).await? {
        Ok(body) => body,
        Err(e) => {
            debug!(file = %path.display(), error = %e, "Failed to read file");
            ctx.signal_client_error(io_status(&e)).await;
            return Ok(());
        }
    };

    let mime: Arc<dyn MimeTypes> = ctx
        .maybe_get::<dyn MimeTypes>()
        .unwrap_or_else(|| Arc::new(ExtensionMimeTypes::new()));
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let response = ctx.response();
    response
        .status(StatusCode::OK.as_u16())
        .content_type(&mime.content_type(&filename));
    if let Some(modified) = modified
        && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified))
    {
        response.header(header::LAST_MODIFIED, value);
    }
    response.send(body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_paths() {
        assert!(is_safe_path(""));
        assert!(is_safe_path("css/site.css"));
        assert!(is_safe_path("dir1/"));
        assert!(is_safe_path("a/b.c/d"));
    }

    #[test]
    fn test_unsafe_paths() {
        assert!(!is_safe_path(".."));
        assert!(!is_safe_path("assets/../../etc/passwd"));
        assert!(!is_safe_path("./a"));
        assert!(!is_safe_path(".hidden"));
        assert!(!is_safe_path("trailing./x"));
        assert!(!is_safe_path("a\\..\\b"));
    }

    #[test]
    fn test_spec_builder() {
        let spec = FileHandlerSpec::new()
            .path("static")
            .dir("public")
            .index_files(["index.html"]);
        assert_eq!(spec.index_files, vec!["index.html".to_string()]);
        assert!(spec.build().is_ok());
    }

    #[test]
    fn test_spec_rejects_bad_path() {
        assert!(FileHandlerSpec::new().path(":a?/:b").build().is_err());
    }

    #[test]
    fn test_epoch_seconds_truncates() {
        let time = UNIX_EPOCH + std::time::Duration::from_millis(5_999);
        assert_eq!(epoch_seconds(time), 5);
    }
}
