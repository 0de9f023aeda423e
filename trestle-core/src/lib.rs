// Core library for the Trestle HTTP framework
// Requests flow through composable handler chains that share a layered,
// type-indexed registry.

pub mod blocking;
pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod error_handler;
pub mod file;
pub mod handler;
pub mod handlers;
pub mod health;
pub mod http;
pub mod logging;
pub mod mime;
pub mod path;
pub mod registry;
pub mod render;
pub mod server;
pub mod sse;
pub mod static_assets;

// Re-export commonly used types
pub use blocking::{BlockingExecutor, InlineExecutor, TokioBlockingExecutor};
pub use chain::{Chain, ChainHandler};
pub use config::{EnvLoader, ServerConfig};
pub use context::{Context, Pipeline};
pub use error::*;
pub use error_handler::{
    ClientErrorHandler, DefaultClientErrorHandler, DefaultServerErrorHandler, ServerErrorHandler,
};
pub use file::FileSystemBinding;
pub use handler::{BoxedHandler, Handler, Handlers, IntoHandler, handler};
pub use health::{HealthCheckHandler, HealthCheckResult, HealthIndicator, HealthStatus};
pub use self::http::{Request, RequestId, Response, ResponseTransmitter, SentResponse};
pub use mime::{ExtensionMimeTypes, MimeTypes};
pub use path::{PathBinder, PathBinding, PathTokens};
pub use registry::{Registry, RegistryBuilder, RegistryEntry};
pub use render::{Json, RenderController, Renderable, Renderer, json, renderer_for};
pub use server::{Server, base_registry};
pub use sse::{ServerSentEvent, ServerSentEvents};
pub use static_assets::{FileHandler, FileHandlerSpec};
