// Copyright 2024 the tjs authors. MIT license.

//! On-disk and in-memory caches backing the module loader (spec §3, §6
//! "Module cache on disk"). Mirrors the reference's split between
//! `cli/cache/http_cache.rs` (remote bytes on disk) and an in-process
//! `HashMap` of parsed [`ModuleRecord`]s.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use sha1::Digest;
use sha1::Sha1;
use url::Url;

use crate::module_loader::record::ModuleRecord;

/// `(raw specifier, importing module path)` → resolved path (spec §3
/// "Resolution Cache Key"). Pure for filesystem specifiers; for
/// network-backed specifiers the memoized value still depends on the
/// state of the on-disk cache at first resolution, per invariant 1 in
/// spec §8 ("identical inputs after caching yield identical outputs
/// without network access").
#[derive(Default)]
pub struct ResolutionCache {
  inner: Mutex<HashMap<(String, PathBuf), PathBuf>>,
}

impl ResolutionCache {
  pub fn get(&self, specifier: &str, parent: &Path) -> Option<PathBuf> {
    self
      .inner
      .lock()
      .unwrap()
      .get(&(specifier.to_string(), parent.to_path_buf()))
      .cloned()
  }

  pub fn insert(&self, specifier: &str, parent: &Path, resolved: PathBuf) {
    self
      .inner
      .lock()
      .unwrap()
      .insert((specifier.to_string(), parent.to_path_buf()), resolved);
  }
}

/// Resolved local cache path → original remote URL (spec §3 "Remote URL
/// Map"). Consulted whenever a relative import is resolved from a module
/// whose `resolved_path` has no filesystem meaning of its own.
#[derive(Default)]
pub struct RemoteUrlMap {
  inner: Mutex<HashMap<PathBuf, Url>>,
}

impl RemoteUrlMap {
  pub fn get(&self, local_path: &Path) -> Option<Url> {
    self.inner.lock().unwrap().get(local_path).cloned()
  }

  pub fn insert(&self, local_path: PathBuf, url: Url) {
    self.inner.lock().unwrap().insert(local_path, url);
  }
}

/// path → parsed [`ModuleRecord`]. Never evicted during process lifetime
/// (spec §3 "never destroyed during process lifetime").
#[derive(Default)]
pub struct ModuleCache {
  inner: Mutex<HashMap<PathBuf, ModuleRecord>>,
}

impl ModuleCache {
  pub fn get(&self, path: &Path) -> Option<ModuleRecord> {
    self.inner.lock().unwrap().get(path).cloned()
  }

  pub fn insert(&self, record: ModuleRecord) {
    self
      .inner
      .lock()
      .unwrap()
      .insert(record.resolved_path.clone(), record);
  }
}

/// `sha1(url)` hex-encoded, used as the cache filename stem for remote
/// modules (spec §4.A step 2 `<cacheDir>/http/<host>/<hash(url)><ext>`).
pub fn hash_url(url: &Url) -> String {
  let mut hasher = Sha1::new();
  hasher.update(url.as_str().as_bytes());
  let digest = hasher.finalize();
  digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Computes `<cacheDir>/http/<host>/<hash(url)><ext>` for an `http(s)://`
/// specifier. The extension is taken from the URL path when present (so
/// `https://x/mod.ts` still round-trips through the extension-sniffing
/// resolver), defaulting to `.js`.
pub fn http_cache_path(cache_dir: &Path, url: &Url) -> PathBuf {
  let host = url.host_str().unwrap_or("unknown-host");
  let ext = Path::new(url.path())
    .extension()
    .and_then(|e| e.to_str())
    .unwrap_or("js");
  cache_dir
    .join("http")
    .join(host)
    .join(format!("{}.{}", hash_url(url), ext))
}

/// Computes the directory `<cacheDir>/jsr/<scope>/<name>/<version>/` that
/// holds every file downloaded for a pinned JSR package version, plus its
/// `_meta.json` sibling.
pub fn jsr_package_dir(cache_dir: &Path, scope: &str, name: &str, version: &str) -> PathBuf {
  cache_dir.join("jsr").join(scope).join(name).join(version)
}

pub fn jsr_meta_path(cache_dir: &Path, scope: &str, name: &str, version: &str) -> PathBuf {
  jsr_package_dir(cache_dir, scope, name, version).join("_meta.json")
}

/// `<cacheDir>/node/<name>` — where a `node:NAME` builtin resolves when
/// not satisfied by the caller-registered builtin resolver (spec §4.A
/// step 1).
pub fn node_builtin_path(cache_dir: &Path, name: &str) -> PathBuf {
  cache_dir.join("node").join(name)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hash_is_deterministic() {
    let u = Url::parse("https://deno.land/std/path/mod.ts").unwrap();
    assert_eq!(hash_url(&u), hash_url(&u));
  }

  #[test]
  fn http_cache_path_uses_host_and_extension() {
    let u = Url::parse("https://deno.land/std@1.2.3/mod.ts").unwrap();
    let p = http_cache_path(Path::new("/cache"), &u);
    assert!(p.starts_with("/cache/http/deno.land"));
    assert_eq!(p.extension().unwrap(), "ts");
  }

  #[test]
  fn resolution_cache_roundtrips() {
    let cache = ResolutionCache::default();
    let parent = PathBuf::from("/a/b.ts");
    assert!(cache.get("./c.ts", &parent).is_none());
    cache.insert("./c.ts", &parent, PathBuf::from("/a/c.ts"));
    assert_eq!(cache.get("./c.ts", &parent), Some(PathBuf::from("/a/c.ts")));
  }
}
