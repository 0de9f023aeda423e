// Content type resolution for served files

use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Maps file names to content types. Resolved from the registry as
/// `dyn MimeTypes`.
pub trait MimeTypes: Send + Sync {
    fn content_type(&self, filename: &str) -> String;
}

/// Extension-based lookup with a built-in table and optional overrides.
#[derive(Debug, Clone, Default)]
pub struct ExtensionMimeTypes {
    overrides: HashMap<String, String>,
}

impl ExtensionMimeTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `extension` (without the dot) to `content_type`, taking
    /// precedence over the built-in table.
    pub fn with_type(mut self, extension: &str, content_type: impl Into<String>) -> Self {
        self.overrides
            .insert(extension.to_ascii_lowercase(), content_type.into());
        self
    }

    fn builtin(extension: &str) -> Option<&'static str> {
        let mime = match extension {
            "html" | "htm" => "text/html",
            "txt" | "text" => "text/plain",
            "css" => "text/css",
            "csv" => "text/csv",
            "md" => "text/markdown",
            "xml" => "application/xml",
            "js" | "mjs" => "application/javascript",
            "json" | "map" => "application/json",
            "wasm" => "application/wasm",
            "pdf" => "application/pdf",
            "zip" => "application/zip",
            "gz" => "application/gzip",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "svg" => "image/svg+xml",
            "webp" => "image/webp",
            "avif" => "image/avif",
            "ico" => "image/x-icon",
            "woff" => "font/woff",
            "woff2" => "font/woff2",
            "ttf" => "font/ttf",
            "otf" => "font/otf",
            "eot" => "application/vnd.ms-fontobject",
            "mp4" => "video/mp4",
            "webm" => "video/webm",
            "ogv" => "video/ogg",
            "mp3" => "audio/mpeg",
            "wav" => "audio/wav",
            "ogg" => "audio/ogg",
            "m4a" => "audio/mp4",
            _ => return None,
        };
        Some(mime)
    }
}

impl MimeTypes for ExtensionMimeTypes {
    fn content_type(&self, filename: &str) -> String {
        let Some(extension) = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
        else {
            return DEFAULT_CONTENT_TYPE.to_string();
        };

        if let Some(custom) = self.overrides.get(&extension) {
            return custom.clone();
        }

        match Self::builtin(&extension) {
            Some(mime) if mime.starts_with("text/") => format!("{mime};charset=UTF-8"),
            Some(mime) => mime.to_string(),
            None => DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}
