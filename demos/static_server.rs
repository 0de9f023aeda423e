//! Static file server with a health endpoint.
//!
//! Configuration comes from `TRESTLE_*` environment variables:
//!
//! ```bash
//! TRESTLE_BASE_DIR=./public TRESTLE_INDEX_FILES=index.html \
//!     cargo run --example static_server
//! ```

use trestle::health::{UptimeHealthIndicator, health_entry};
use trestle::logging::{LogConfig, info};
use trestle::{
    Chain, Error, FileHandlerSpec, HealthCheckHandler, Registry, Server, ServerConfig,
    ServerSentEvent, ServerSentEvents, handler,
};

fn main() -> Result<(), Error> {
    let _guard = LogConfig::from_env().init()?;
    let config = ServerConfig::from_env()?;

    let app = Chain::new()
        .get("health/:name?", HealthCheckHandler::default())
        .get("events", handler(|ctx| async move {
            let events: ServerSentEvents = (1..=3)
                .map(|n| ServerSentEvent::new(format!("tick {n}")).with_id(n.to_string()))
                .collect();
            ctx.render(events).await
        }))
        .files(FileHandlerSpec::new())
        .build()?;

    info!(base_dir = %config.base_dir.display(), port = config.port, "Starting static server");

    Server::new(config, app)
        .with_registry(
            Registry::builder()
                .add_entry(health_entry(UptimeHealthIndicator::new()))
                .build(),
        )
        .run()
}
