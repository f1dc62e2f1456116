// Copyright 2024 the tjs authors. MIT license.

//! `jsr:@scope/name[@version][/path]` resolution (spec §4.A step 3).
//!
//! A JSR package publishes two JSON documents per the real registry
//! shape used by spec §8 scenario 6: a package-level `meta.json` naming
//! the `latest` version, and a per-version `<version>_meta.json` naming
//! the package's `exports` map and a `manifest` of every file it ships.
//! We pin a version, download the whole manifest once, and resolve the
//! requested subpath (or the `.` export, or a `mod.ts`/`index.ts`-style
//! fallback) against the files we just wrote to disk.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use url::Url;

use crate::error::CoreError;
use crate::module_loader::cache::jsr_meta_path;
use crate::module_loader::cache::jsr_package_dir;
use crate::module_loader::fetcher::RemoteFetcher;

pub const DEFAULT_REGISTRY: &str = "https://jsr.io/";

/// A parsed `jsr:` specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsrSpecifier {
  pub scope: String,
  pub name: String,
  pub version: Option<String>,
  pub path: Option<String>,
}

/// Parses `jsr:@scope/name`, `jsr:@scope/name@1.2.3`, and
/// `jsr:@scope/name@1.2.3/sub/path.ts` (the `@version` segment is
/// optional, `/path` is optional and independent of it).
pub fn parse_jsr_specifier(specifier: &str) -> Result<JsrSpecifier, CoreError> {
  let rest = specifier
    .strip_prefix("jsr:")
    .ok_or_else(|| CoreError::ResolutionFailed {
      specifier: specifier.to_string(),
      referrer: String::new(),
    })?;
  let rest = rest.strip_prefix('@').ok_or_else(|| CoreError::ResolutionFailed {
    specifier: specifier.to_string(),
    referrer: "expected a scoped package name".to_string(),
  })?;
  let (scope, rest) = rest.split_once('/').ok_or_else(|| CoreError::ResolutionFailed {
    specifier: specifier.to_string(),
    referrer: "expected @scope/name".to_string(),
  })?;
  // `rest` is now `name[@version][/path...]`.
  let (name_and_version, path) = match rest.split_once('/') {
    Some((a, b)) => (a, Some(b.to_string())),
    None => (rest, None),
  };
  let (name, version) = match name_and_version.split_once('@') {
    Some((n, v)) => (n, Some(v.to_string())),
    None => (name_and_version, None),
  };
  Ok(JsrSpecifier {
    scope: scope.to_string(),
    name: name.to_string(),
    version,
    path,
  })
}

#[derive(Debug, Deserialize)]
struct PackageMeta {
  latest: String,
}

#[derive(Debug, Deserialize)]
struct VersionMeta {
  #[serde(default)]
  exports: indexmap::IndexMap<String, String>,
  manifest: indexmap::IndexMap<String, ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
  #[allow(dead_code)]
  #[serde(default)]
  checksum: Option<String>,
}

pub struct JsrResolver<'a, F: RemoteFetcher> {
  pub fetcher: &'a F,
  pub cache_dir: PathBuf,
  pub registry_base: Url,
}

impl<'a, F: RemoteFetcher> JsrResolver<'a, F> {
  pub fn new(fetcher: &'a F, cache_dir: PathBuf) -> Self {
    Self {
      fetcher,
      cache_dir,
      registry_base: Url::parse(DEFAULT_REGISTRY).unwrap(),
    }
  }

  /// Pins a version (fetching `meta.json` when unspecified), downloads
  /// every manifest file into `<cacheDir>/jsr/scope/name/version/` if not
  /// already cached, and returns the resolved local path plus the
  /// registry URL it corresponds to (for the [`crate::module_loader::cache::RemoteUrlMap`]).
  pub async fn resolve(&self, spec: &JsrSpecifier) -> Result<(PathBuf, Url), CoreError> {
    let version = match &spec.version {
      Some(v) => v.clone(),
      None => self.fetch_latest_version(&spec.scope, &spec.name).await?,
    };

    let dir = jsr_package_dir(&self.cache_dir, &spec.scope, &spec.name, &version);
    let meta_path = jsr_meta_path(&self.cache_dir, &spec.scope, &spec.name, &version);

    let version_meta = if meta_path.exists() {
      let bytes = std::fs::read(&meta_path).map_err(|e| CoreError::FetchFailed {
        url: meta_path.display().to_string(),
        reason: e.to_string(),
      })?;
      serde_json::from_slice::<VersionMeta>(&bytes).map_err(|e| CoreError::FetchFailed {
        url: meta_path.display().to_string(),
        reason: e.to_string(),
      })?
    } else {
      let url = self
        .registry_base
        .join(&format!("@{}/{}/{}_meta.json", spec.scope, spec.name, version))
        .unwrap();
      let fetched = self.fetcher.fetch(&url).await?;
      std::fs::create_dir_all(&dir).map_err(|e| CoreError::FetchFailed {
        url: dir.display().to_string(),
        reason: e.to_string(),
      })?;
      std::fs::write(&meta_path, &fetched.body).map_err(|e| CoreError::FetchFailed {
        url: meta_path.display().to_string(),
        reason: e.to_string(),
      })?;
      serde_json::from_slice::<VersionMeta>(&fetched.body).map_err(|e| CoreError::FetchFailed {
        url: url.to_string(),
        reason: e.to_string(),
      })?
    };

    for file_path in version_meta.manifest.keys() {
      let local = dir.join(file_path.trim_start_matches('/'));
      if local.exists() {
        continue;
      }
      if let Some(parent) = local.parent() {
        std::fs::create_dir_all(parent).ok();
      }
      let file_url = self
        .registry_base
        .join(&format!(
          "@{}/{}/{}{}",
          spec.scope, spec.name, version, file_path
        ))
        .unwrap();
      let fetched = self.fetcher.fetch(&file_url).await?;
      std::fs::write(&local, &fetched.body).map_err(|e| CoreError::FetchFailed {
        url: local.display().to_string(),
        reason: e.to_string(),
      })?;
    }

    let entry_rel = self.pick_entry(&spec.path, &version_meta, &dir)?;
    let local_path = dir.join(entry_rel.trim_start_matches('/'));
    let registry_url = self
      .registry_base
      .join(&format!("@{}/{}/{}/{}", spec.scope, spec.name, version, entry_rel))
      .unwrap();
    Ok((local_path, registry_url))
  }

  async fn fetch_latest_version(&self, scope: &str, name: &str) -> Result<String, CoreError> {
    let url = self
      .registry_base
      .join(&format!("@{}/{}/meta.json", scope, name))
      .unwrap();
    let fetched = self.fetcher.fetch(&url).await?;
    let meta: PackageMeta =
      serde_json::from_slice(&fetched.body).map_err(|e| CoreError::FetchFailed {
        url: url.to_string(),
        reason: e.to_string(),
      })?;
    Ok(meta.latest)
  }

  fn pick_entry(
    &self,
    requested_path: &Option<String>,
    version_meta: &VersionMeta,
    dir: &Path,
  ) -> Result<String, CoreError> {
    if let Some(path) = requested_path {
      return Ok(format!("/{}", path.trim_start_matches('/')));
    }
    if let Some(dot_export) = version_meta.exports.get(".") {
      return Ok(dot_export.clone());
    }
    for candidate in ["mod.ts", "mod.js", "index.ts", "index.js"] {
      if dir.join(candidate).exists() || version_meta.manifest.contains_key(&format!("/{candidate}")) {
        return Ok(format!("/{candidate}"));
      }
    }
    Err(CoreError::ResolutionFailed {
      specifier: format!("jsr package at {}", dir.display()),
      referrer: "no `.` export and no mod.{ts,js}/index.{ts,js} fallback".to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_bare_package() {
    let s = parse_jsr_specifier("jsr:@std/path").unwrap();
    assert_eq!(s.scope, "std");
    assert_eq!(s.name, "path");
    assert_eq!(s.version, None);
    assert_eq!(s.path, None);
  }

  #[test]
  fn parses_versioned_subpath() {
    let s = parse_jsr_specifier("jsr:@std/path@1.2.3/posix.ts").unwrap();
    assert_eq!(s.scope, "std");
    assert_eq!(s.name, "path");
    assert_eq!(s.version.as_deref(), Some("1.2.3"));
    assert_eq!(s.path.as_deref(), Some("posix.ts"));
  }

  #[test]
  fn rejects_non_jsr_specifier() {
    assert!(parse_jsr_specifier("npm:left-pad").is_err());
  }
}
