// Copyright 2024 the tjs authors. MIT license.

//! Core runtime substrate for the tjs JavaScript/TypeScript execution
//! environment: module resolution and transpilation, a TLS record pipe,
//! a pooled connection layer, an HTTP/1.1 message engine, and a
//! RFC 6455 WebSocket codec.
//!
//! The script engine, OS-level socket/file primitives and the TLS
//! cryptography itself are consumed from `deno_core`, `tokio` and
//! `rustls` respectively; this crate is the glue and the protocol logic
//! that sits between them.

pub mod error;
pub mod http;
pub mod module_loader;
pub mod net;
pub mod pool;
pub mod server;
pub mod tls;
pub mod ws;

pub use error::CoreError;
pub use error::CoreResult;

use std::path::Path;
use std::path::PathBuf;

/// Resolves the default module cache directory, `<home>/.tjs/cache`
/// (spec §6, "Module cache on disk").
pub fn default_cache_dir() -> PathBuf {
  let home = std::env::var_os("HOME")
    .or_else(|| std::env::var_os("USERPROFILE"))
    .map(PathBuf::from)
    .unwrap_or_else(std::env::temp_dir);
  home.join(".tjs").join("cache")
}

/// Process-wide configuration threaded through the module loader and
/// connection layer. Constructed once at startup by the CLI and shared
/// via `Rc`/`Arc` as each subsystem needs it.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  pub cache_dir: PathBuf,
  pub max_sockets_per_pool: usize,
  pub pool_acquire_timeout_ms: u64,
  pub keep_alive_idle_timeout_ms: u64,
  pub max_requests_per_connection: u64,
  pub unsafely_ignore_certificate_errors: bool,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      cache_dir: default_cache_dir(),
      max_sockets_per_pool: 6,
      pool_acquire_timeout_ms: 30_000,
      keep_alive_idle_timeout_ms: 5_000,
      max_requests_per_connection: 1_000,
      unsafely_ignore_certificate_errors: false,
    }
  }
}

impl RuntimeConfig {
  pub fn node_builtin_dir(&self) -> PathBuf {
    self.cache_dir.join("node")
  }

  pub fn http_cache_dir(&self) -> PathBuf {
    self.cache_dir.join("http")
  }

  pub fn jsr_cache_dir(&self) -> PathBuf {
    self.cache_dir.join("jsr")
  }
}

/// Installs the process-wide logger. Mirrors the reference runtime's
/// `cli::util::logger::init`: an `env_logger` backend, a `TJS_LOG`
/// environment override, and filters that quiet chatty dependencies.
pub fn init_logging(level: log::LevelFilter) {
  let mut builder = env_logger::Builder::from_env(
    env_logger::Env::new()
      .filter_or("TJS_LOG", level.to_string())
      .write_style("TJS_LOG_STYLE"),
  );
  builder
    .filter_module("rustls", log::LevelFilter::Off)
    .filter_module("httparse", log::LevelFilter::Off)
    .format_timestamp_millis();
  let _ = builder.try_init();
}

pub(crate) fn path_extension(path: &Path) -> Option<&str> {
  path.extension().and_then(|e| e.to_str())
}
