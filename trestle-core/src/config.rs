// Server configuration

use crate::Error;
use crate::logging::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 5050;
pub const DEFAULT_BLOCKING_THREADS: usize = 512;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Settings consumed when launching a server and assembling its root
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    /// Root of the application's file system binding.
    pub base_dir: PathBuf,
    /// Request-processing threads. Defaults to the number of CPUs.
    pub worker_threads: usize,
    /// Upper bound for the blocking offload pool.
    pub blocking_threads: usize,
    /// Include error details in default error responses.
    pub development: bool,
    /// Index files tried, in order, when a directory is requested.
    pub index_files: Vec<String>,
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            base_dir: PathBuf::from("."),
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            blocking_threads: DEFAULT_BLOCKING_THREADS,
            development: false,
            index_files: Vec::new(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_blocking_threads(mut self, threads: usize) -> Self {
        self.blocking_threads = threads.max(1);
        self
    }

    pub fn with_development(mut self, development: bool) -> Self {
        self.development = development;
        self
    }

    pub fn with_index_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Defaults overlaid with `TRESTLE_*` environment variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::default().merge_env(&EnvLoader::new("TRESTLE"))
    }

    /// Overlay values found through `loader` onto this configuration.
    pub fn merge_env(mut self, loader: &EnvLoader) -> Result<Self, Error> {
        if let Some(value) = loader.var("ADDRESS") {
            self.address = parse("ADDRESS", &value)?;
        }
        if let Some(value) = loader.var("PORT") {
            self.port = parse("PORT", &value)?;
        }
        if let Some(value) = loader.var("BASE_DIR") {
            self.base_dir = PathBuf::from(value);
        }
        if let Some(value) = loader.var("THREADS") {
            self = self.with_worker_threads(parse("THREADS", &value)?);
        }
        if let Some(value) = loader.var("BLOCKING_THREADS") {
            self = self.with_blocking_threads(parse("BLOCKING_THREADS", &value)?);
        }
        if let Some(value) = loader.var("DEVELOPMENT") {
            self.development = parse_flag(&value)
                .ok_or_else(|| Error::Config(format!("DEVELOPMENT: not a boolean: {value}")))?;
        }
        if let Some(value) = loader.var("INDEX_FILES") {
            self.index_files = value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = loader.var("MAX_BODY_SIZE") {
            self.max_body_size = parse("MAX_BODY_SIZE", &value)?;
        }

        debug!(
            port = self.port,
            worker_threads = self.worker_threads,
            development = self.development,
            "Server configuration loaded"
        );
        Ok(self)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Prefixed variable lookup. `var("PORT")` with prefix `TRESTLE` reads
/// `TRESTLE_PORT`.
pub struct EnvLoader {
    prefix: String,
    overrides: Option<HashMap<String, String>>,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            overrides: None,
        }
    }

    /// A loader reading from a fixed map instead of the process environment.
    pub fn from_map(prefix: impl Into<String>, vars: HashMap<String, String>) -> Self {
        Self {
            prefix: prefix.into(),
            overrides: Some(vars),
        }
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_uppercase()
        } else {
            format!("{}_{}", self.prefix, name.to_uppercase())
        }
    }

    pub fn var(&self, name: &str) -> Option<String> {
        let key = self.key(name);
        match &self.overrides {
            Some(vars) => vars.get(&key).cloned(),
            None => env::var(&key).ok(),
        }
    }

    pub fn var_or(&self, name: &str, default: &str) -> String {
        self.var(name).unwrap_or_else(|| default.to_string())
    }
}
