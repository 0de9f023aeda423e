//! Health checks.
//!
//! Indicators are registered under the `dyn HealthIndicator` capability and
//! run by [`HealthCheckHandler`]:
//!
//! ```rust
//! use trestle_core::health::{HealthCheckResult, HealthIndicator, health_entry};
//! use trestle_core::registry::Registry;
//! use async_trait::async_trait;
//!
//! struct DatabaseHealthIndicator;
//!
//! #[async_trait]
//! impl HealthIndicator for DatabaseHealthIndicator {
//!     fn name(&self) -> &str {
//!         "database"
//!     }
//!
//!     async fn check(&self) -> HealthCheckResult {
//!         HealthCheckResult::up("database").with_detail("pool_size", "10")
//!     }
//! }
//!
//! let registry = Registry::builder()
//!     .add_entry(health_entry(DatabaseHealthIndicator))
//!     .build();
//! # assert_eq!(registry.len(), 1);
//! ```
//!
//! The handler answers `200` when every check is healthy and `503`
//! otherwise. A path token (default `name`) selects a single check.

use crate::handler::Handler;
use crate::logging::{debug, warn};
use crate::registry::RegistryEntry;
use crate::{Context, Error};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Health status of a component or the overall application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
    /// Working, with issues
    Degraded,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Up | HealthStatus::Degraded)
    }

    pub fn http_status_code(&self) -> u16 {
        if self.is_healthy() { 200 } else { 503 }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Up => write!(f, "UP"),
            HealthStatus::Down => write!(f, "DOWN"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Result of a health check for a single component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            details: BTreeMap::new(),
            duration_ms: None,
            error: None,
        }
    }

    pub fn up(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Up)
    }

    pub fn down(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Down)
    }

    pub fn degraded(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Sets the error message and marks the component down.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.status = HealthStatus::Down;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Aggregated results of one run of the health checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: BTreeMap<String, HealthCheckResult>,
    pub timestamp: u64,
}

impl HealthReport {
    pub fn new(results: impl IntoIterator<Item = HealthCheckResult>) -> Self {
        let checks: BTreeMap<_, _> = results
            .into_iter()
            .map(|result| (result.name.clone(), result))
            .collect();
        let status = aggregate(checks.values().map(|c| c.status));
        Self {
            status,
            checks,
            timestamp: current_timestamp(),
        }
    }
}

/// Down beats degraded beats unknown beats up. No checks at all is up.
fn aggregate(statuses: impl Iterator<Item = HealthStatus>) -> HealthStatus {
    statuses
        .max_by_key(|status| match status {
            HealthStatus::Up => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Down => 3,
        })
        .unwrap_or(HealthStatus::Up)
}

/// A component whose health can be checked.
#[async_trait]
pub trait HealthIndicator: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> HealthCheckResult;
}

/// A registry entry exposing `indicator` as `dyn HealthIndicator`.
pub fn health_entry<H: HealthIndicator + 'static>(indicator: H) -> RegistryEntry {
    RegistryEntry::shared::<dyn HealthIndicator>(Arc::new(indicator))
}

/// Reports the time since it was created.
pub struct UptimeHealthIndicator {
    start_time: Instant,
}

impl Default for UptimeHealthIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl UptimeHealthIndicator {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[async_trait]
impl HealthIndicator for UptimeHealthIndicator {
    fn name(&self) -> &str {
        "uptime"
    }

    async fn check(&self) -> HealthCheckResult {
        HealthCheckResult::up("uptime")
            .with_detail("uptime_seconds", self.uptime().as_secs().to_string())
    }
}

/// Runs the registered health indicators concurrently and sends a JSON
/// [`HealthReport`].
#[derive(Debug, Clone)]
pub struct HealthCheckHandler {
    token: String,
}

impl Default for HealthCheckHandler {
    fn default() -> Self {
        Self::new("name")
    }
}

impl HealthCheckHandler {
    /// A handler selecting a single check through the path token `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

async fn timed_check(indicator: Arc<dyn HealthIndicator>) -> HealthCheckResult {
    let start = Instant::now();
    let mut result = indicator.check().await;
    if result.duration_ms.is_none() {
        result = result.with_duration(start.elapsed());
    }
    if !result.status.is_healthy() {
        warn!(check = indicator.name(), status = %result.status, "Health check failed");
    }
    result
}

#[async_trait]
impl Handler for HealthCheckHandler {
    async fn handle(&self, ctx: Context) -> Result<(), Error> {
        let mut indicators = ctx.get_all::<dyn HealthIndicator>();
        if let Some(name) = ctx.path_tokens().get(&self.token) {
            indicators.retain(|indicator| indicator.name() == name);
            if indicators.is_empty() {
                debug!(check = name, "Unknown health check");
                return ctx.client_error(404).await;
            }
        }

        // Registry order puts shadowing entries first; keep one per name.
        let mut seen = Vec::new();
        indicators.retain(|indicator| {
            let name = indicator.name().to_string();
            let first = !seen.contains(&name);
            seen.push(name);
            first
        });

        let results = join_all(indicators.into_iter().map(timed_check)).await;
        let report = HealthReport::new(results);
        debug!(status = %report.status, checks = report.checks.len(), "Health checks complete");

        ctx.response()
            .status(report.status.http_status_code())
            .send_json(&report)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "health"
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate() {
        assert_eq!(aggregate(std::iter::empty()), HealthStatus::Up);
        assert_eq!(
            aggregate([HealthStatus::Up, HealthStatus::Degraded].into_iter()),
            HealthStatus::Degraded
        );
        assert_eq!(
            aggregate([HealthStatus::Down, HealthStatus::Degraded].into_iter()),
            HealthStatus::Down
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(HealthStatus::Up.http_status_code(), 200);
        assert_eq!(HealthStatus::Degraded.http_status_code(), 200);
        assert_eq!(HealthStatus::Unknown.http_status_code(), 503);
    }

    #[test]
    fn test_with_error_marks_down() {
        let result = HealthCheckResult::up("db").with_error("timeout");
        assert_eq!(result.status, HealthStatus::Down);
    }

    #[test]
    fn test_report_serialization() {
        let report = HealthReport::new([HealthCheckResult::up("a")]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "UP");
        assert_eq!(json["checks"]["a"]["status"], "UP");
    }

    #[tokio::test]
    async fn test_uptime_indicator() {
        let result = UptimeHealthIndicator::new().check().await;
        assert_eq!(result.status, HealthStatus::Up);
        assert!(result.details.contains_key("uptime_seconds"));
    }
}
