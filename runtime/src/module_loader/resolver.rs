// Copyright 2024 the tjs authors. MIT license.

//! Ties specifier classification (§4.A.5-6), the HTTP/JSR/node disk
//! caches (§4.A.1-3), and relative-import recomposition (§4.A.4) into a
//! single [`Resolver::resolve`] entry point, memoized by
//! `(specifier, parent)` per spec §3.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use crate::error::CoreError;
use crate::module_loader::cache::http_cache_path;
use crate::module_loader::cache::node_builtin_path;
use crate::module_loader::cache::ModuleCache;
use crate::module_loader::cache::RemoteUrlMap;
use crate::module_loader::cache::ResolutionCache;
use crate::module_loader::fetcher::RemoteFetcher;
use crate::module_loader::jsr::parse_jsr_specifier;
use crate::module_loader::jsr::JsrResolver;
use crate::module_loader::node_builtin::BuiltinResolver;
use crate::module_loader::node_builtin::NoBuiltins;
use crate::module_loader::record::ModuleRecord;
use crate::module_loader::record::SourceLang;
use crate::module_loader::specifier::classify;
use crate::module_loader::specifier::probe_extensions;
use crate::module_loader::specifier::resolve_node_modules_package;
use crate::module_loader::specifier::split_package_specifier;
use crate::module_loader::specifier::SpecifierKind;
use crate::module_loader::transform;

/// Whether disabled-protocol configuration (spec §4.A "Failure modes")
/// rejects HTTP, JSR, or node: resolution outright.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolPolicy {
  pub allow_http: bool,
  pub allow_jsr: bool,
  pub allow_node: bool,
}

impl ProtocolPolicy {
  pub fn allow_all() -> Self {
    Self {
      allow_http: true,
      allow_jsr: true,
      allow_node: true,
    }
  }
}

/// Where a resolved specifier's bytes live, and — for remote modules —
/// the URL they were addressed by (spec §3 "Remote URL Map").
#[derive(Debug, Clone)]
pub enum Resolved {
  Local(PathBuf),
  Remote { local_path: PathBuf, url: Url },
}

impl Resolved {
  pub fn local_path(&self) -> &Path {
    match self {
      Resolved::Local(p) => p,
      Resolved::Remote { local_path, .. } => local_path,
    }
  }
}

pub struct Resolver<F: RemoteFetcher> {
  pub cache_dir: PathBuf,
  pub fetcher: F,
  pub policy: ProtocolPolicy,
  pub builtins: Arc<dyn BuiltinResolver>,
  pub resolution_cache: ResolutionCache,
  pub remote_url_map: RemoteUrlMap,
  pub module_cache: ModuleCache,
}

impl<F: RemoteFetcher> Resolver<F> {
  pub fn new(cache_dir: PathBuf, fetcher: F) -> Self {
    Self {
      cache_dir,
      fetcher,
      policy: ProtocolPolicy::allow_all(),
      builtins: Arc::new(NoBuiltins),
      resolution_cache: ResolutionCache::default(),
      remote_url_map: RemoteUrlMap::default(),
      module_cache: ModuleCache::default(),
    }
  }

  /// Resolves `specifier` relative to `parent` (spec §4.A "Resolution
  /// algorithm"). `parent` is the importing module's resolved local
  /// path; if it's a remote module, its original URL is looked up in the
  /// [`RemoteUrlMap`] so relative imports recompose against it rather
  /// than the local cache path.
  pub async fn resolve(&self, specifier: &str, parent: &Path) -> Result<Resolved, CoreError> {
    if let Some(cached) = self.resolution_cache.get(specifier, parent) {
      return Ok(self.reconstruct(cached));
    }

    let resolved = self.resolve_uncached(specifier, parent).await?;
    self
      .resolution_cache
      .insert(specifier, parent, resolved.local_path().to_path_buf());
    if let Resolved::Remote { local_path, url } = &resolved {
      self.remote_url_map.insert(local_path.clone(), url.clone());
    }
    Ok(resolved)
  }

  fn reconstruct(&self, local_path: PathBuf) -> Resolved {
    match self.remote_url_map.get(&local_path) {
      Some(url) => Resolved::Remote { local_path, url },
      None => Resolved::Local(local_path),
    }
  }

  async fn resolve_uncached(&self, specifier: &str, parent: &Path) -> Result<Resolved, CoreError> {
    match classify(specifier) {
      SpecifierKind::Node(name) => self.resolve_node(&name),
      SpecifierKind::Http(url) => self.resolve_http(&url).await,
      SpecifierKind::Jsr(spec) => self.resolve_jsr(&spec).await,
      SpecifierKind::Absolute(path) => probe_extensions(Path::new(&path))
        .map(Resolved::Local)
        .ok_or_else(|| not_found(specifier, parent)),
      SpecifierKind::Relative(rel) => self.resolve_relative(&rel, specifier, parent).await,
      SpecifierKind::Package(pkg) => self.resolve_package(&pkg, specifier, parent),
    }
  }

  fn resolve_node(&self, name: &str) -> Result<Resolved, CoreError> {
    if !self.policy.allow_node {
      return Err(CoreError::NotSupported("node: specifiers are disabled"));
    }
    if let Some(path) = self.builtins.resolve_builtin(name) {
      return Ok(Resolved::Local(path));
    }
    Ok(Resolved::Local(node_builtin_path(&self.cache_dir, name)))
  }

  async fn resolve_http(&self, url_str: &str) -> Result<Resolved, CoreError> {
    if !self.policy.allow_http {
      return Err(CoreError::NotSupported("http(s): specifiers are disabled"));
    }
    let url = Url::parse(url_str).map_err(|e| CoreError::ResolutionFailed {
      specifier: url_str.to_string(),
      referrer: e.to_string(),
    })?;
    let local_path = http_cache_path(&self.cache_dir, &url);
    if !local_path.exists() {
      let fetched = self.fetcher.fetch(&url).await?;
      if let Some(parent) = local_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CoreError::FetchFailed {
          url: url.to_string(),
          reason: e.to_string(),
        })?;
      }
      std::fs::write(&local_path, &fetched.body).map_err(|e| CoreError::FetchFailed {
        url: url.to_string(),
        reason: e.to_string(),
      })?;
    }
    Ok(Resolved::Remote {
      local_path,
      url,
    })
  }

  async fn resolve_jsr(&self, spec_str: &str) -> Result<Resolved, CoreError> {
    if !self.policy.allow_jsr {
      return Err(CoreError::NotSupported("jsr: specifiers are disabled"));
    }
    let spec = parse_jsr_specifier(spec_str)?;
    let jsr = JsrResolver::new(&self.fetcher, self.cache_dir.clone());
    let (local_path, url) = jsr.resolve(&spec).await?;
    Ok(Resolved::Remote { local_path, url })
  }

  async fn resolve_relative(
    &self,
    rel: &str,
    full_specifier: &str,
    parent: &Path,
  ) -> Result<Resolved, CoreError> {
    match self.remote_url_map.get(parent) {
      // The importing module is remote: recompose the relative path
      // against its original URL and re-enter the HTTP/JSR branch
      // (spec §4.A step 4, "re-enter step 2 or 3").
      Some(parent_url) => {
        let joined = parent_url.join(rel).map_err(|e| CoreError::ResolutionFailed {
          specifier: full_specifier.to_string(),
          referrer: e.to_string(),
        })?;
        self.resolve_http(joined.as_str()).await
      }
      None => {
        let base = parent.parent().unwrap_or(parent);
        probe_extensions(&base.join(rel))
          .map(Resolved::Local)
          .ok_or_else(|| not_found(full_specifier, parent))
      }
    }
  }

  fn resolve_package(
    &self,
    pkg_specifier: &str,
    full_specifier: &str,
    parent: &Path,
  ) -> Result<Resolved, CoreError> {
    let (name, subpath) = split_package_specifier(pkg_specifier);
    let base = parent.parent().unwrap_or(parent);
    resolve_node_modules_package(base, &name, subpath.as_deref())
      .map(Resolved::Local)
      .map_err(|_| not_found(full_specifier, parent))
  }

  /// Loads (reading from disk if needed) and, if the language requires
  /// it, transforms the module at `resolved`, caching the result in the
  /// process-wide [`ModuleCache`] (spec §3 "Module Record").
  pub fn load(&self, resolved: &Resolved, is_main: bool) -> Result<ModuleRecord, CoreError> {
    let path = resolved.local_path();
    if let Some(existing) = self.module_cache.get(path) {
      return Ok(existing);
    }

    let source = std::fs::read_to_string(path).map_err(|e| CoreError::ResolutionFailed {
      specifier: path.display().to_string(),
      referrer: e.to_string(),
    })?;
    let lang = SourceLang::from_path(path);
    let origin_url = match resolved {
      Resolved::Remote { url, .. } => Some(url.clone()),
      Resolved::Local(_) => None,
    };

    let transform_url = origin_url.clone().unwrap_or_else(|| {
      Url::from_file_path(path).unwrap_or_else(|_| Url::parse("file:///unknown").unwrap())
    });

    let transformed = if lang.needs_transform() {
      transform::transform(&transform_url, lang, &source)?.text
    } else {
      source.clone()
    };

    let record = ModuleRecord {
      resolved_path: path.to_path_buf(),
      origin_url,
      lang,
      source,
      transformed,
      is_main,
    };
    self.module_cache.insert(record.clone());
    Ok(record)
  }
}

fn not_found(specifier: &str, parent: &Path) -> CoreError {
  CoreError::ResolutionFailed {
    specifier: specifier.to_string(),
    referrer: parent.display().to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::module_loader::fetcher::test_support::MockFetcher;
  use std::fs;
  use tempfile_like::TempDir;

  // A tiny self-contained stand-in for `tempfile` so these tests don't
  // need an extra dev-dependency: a directory under the OS temp dir,
  // removed on drop.
  mod tempfile_like {
    use std::path::PathBuf;

    pub struct TempDir(pub PathBuf);
    impl TempDir {
      pub fn new(label: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
          "tjs-resolver-test-{label}-{:?}",
          std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        TempDir(dir)
      }
      pub fn path(&self) -> &std::path::Path {
        &self.0
      }
    }
    impl Drop for TempDir {
      fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
      }
    }
  }

  #[tokio::test]
  async fn resolves_relative_filesystem_import() {
    let dir = TempDir::new("relative");
    fs::write(dir.path().join("a.ts"), "import './b.ts';").unwrap();
    fs::write(dir.path().join("b.ts"), "export const x = 1;").unwrap();

    let resolver = Resolver::new(dir.path().join("cache"), MockFetcher::default());
    let parent = dir.path().join("a.ts");
    let resolved = resolver.resolve("./b.ts", &parent).await.unwrap();
    assert_eq!(resolved.local_path(), dir.path().join("b.ts"));
  }

  #[tokio::test]
  async fn resolution_is_memoized_without_network() {
    let dir = TempDir::new("memo");
    fs::write(dir.path().join("a.ts"), "").unwrap();
    fs::write(dir.path().join("b.ts"), "").unwrap();
    let resolver = Resolver::new(dir.path().join("cache"), MockFetcher::default());
    let parent = dir.path().join("a.ts");
    let first = resolver.resolve("./b.ts", &parent).await.unwrap();
    fs::remove_file(dir.path().join("b.ts")).unwrap();
    let second = resolver.resolve("./b.ts", &parent).await.unwrap();
    assert_eq!(first.local_path(), second.local_path());
  }

  #[tokio::test]
  async fn http_import_populates_cache_and_remote_url_map() {
    let dir = TempDir::new("http");
    let fetcher = MockFetcher::default();
    fetcher.insert("https://example.com/mod.ts", "export const x = 1;".as_bytes());
    let resolver = Resolver::new(dir.path().join("cache"), fetcher);
    let parent = dir.path().join("entry.ts");
    let resolved = resolver
      .resolve("https://example.com/mod.ts", &parent)
      .await
      .unwrap();
    let local = resolved.local_path();
    assert!(local.exists());
    assert_eq!(std::fs::read_to_string(local).unwrap(), "export const x = 1;");
  }

  #[tokio::test]
  async fn relative_import_from_remote_module_recomposes_url() {
    let dir = TempDir::new("http-relative");
    let fetcher = MockFetcher::default();
    fetcher.insert(
      "https://example.com/pkg/mod.ts",
      "import './helper.ts';".as_bytes(),
    );
    fetcher.insert("https://example.com/pkg/helper.ts", "export const h = 1;".as_bytes());
    let resolver = Resolver::new(dir.path().join("cache"), fetcher);
    let parent = dir.path().join("entry.ts");
    let mod_resolved = resolver
      .resolve("https://example.com/pkg/mod.ts", &parent)
      .await
      .unwrap();
    let helper_resolved = resolver
      .resolve("./helper.ts", mod_resolved.local_path())
      .await
      .unwrap();
    match helper_resolved {
      Resolved::Remote { url, .. } => {
        assert_eq!(url.as_str(), "https://example.com/pkg/helper.ts")
      }
      Resolved::Local(_) => panic!("expected a remote resolution"),
    }
  }

  #[tokio::test]
  async fn missing_specifier_is_resolution_failed() {
    let dir = TempDir::new("missing");
    let resolver = Resolver::new(dir.path().join("cache"), MockFetcher::default());
    let parent = dir.path().join("a.ts");
    let err = resolver.resolve("./nope.ts", &parent).await.unwrap_err();
    assert!(matches!(err, CoreError::ResolutionFailed { .. }));
  }
}
