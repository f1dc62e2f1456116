// Copyright 2024 the tjs authors. MIT license.

//! `node:NAME` resolution (spec §4.A step 1): first consult a
//! caller-registered builtin resolver (the host embedding this crate may
//! ship its own `node:fs`-shaped polyfills), else fall back to
//! `<cacheDir>/node/<name>`.

use std::path::PathBuf;

/// Implemented by the embedder to short-circuit `node:NAME` resolution
/// for builtins it ships inline (e.g. snapshotted alongside the script
/// engine). Returning `None` falls through to the on-disk convention.
pub trait BuiltinResolver: Send + Sync {
  fn resolve_builtin(&self, name: &str) -> Option<PathBuf>;
}

/// The default resolver: nothing is inlined, every `node:NAME` probes
/// the disk cache.
pub struct NoBuiltins;

impl BuiltinResolver for NoBuiltins {
  fn resolve_builtin(&self, _name: &str) -> Option<PathBuf> {
    None
  }
}
