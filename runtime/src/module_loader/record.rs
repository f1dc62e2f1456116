// Copyright 2024 the tjs authors. MIT license.

use std::path::Path;
use std::path::PathBuf;

use url::Url;

/// Source-language tag attached to every [`ModuleRecord`] (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceLang {
  Ts,
  Tsx,
  Jsx,
  Js,
  Json,
  Mjs,
  Cjs,
}

impl SourceLang {
  /// Classifies a resolved path by extension. Anything unrecognized is
  /// treated as plain JS, matching the reference compiler's fallback.
  pub fn from_path(path: &Path) -> Self {
    match crate::path_extension(path) {
      Some("ts") | Some("mts") => SourceLang::Ts,
      Some("tsx") => SourceLang::Tsx,
      Some("jsx") => SourceLang::Jsx,
      Some("json") => SourceLang::Json,
      Some("mjs") => SourceLang::Mjs,
      Some("cjs") => SourceLang::Cjs,
      _ => SourceLang::Js,
    }
  }

  /// Whether this language requires a transform pass before the script
  /// engine can compile it (spec §4.A "Transformation").
  pub fn needs_transform(self) -> bool {
    matches!(self, SourceLang::Ts | SourceLang::Tsx | SourceLang::Jsx | SourceLang::Json)
  }
}

/// The extension probe order used when a specifier names a file with no
/// extension, or a bare directory (spec §4.A "Extension probing order").
pub const EXTENSION_PROBE_ORDER: &[&str] =
  &["ts", "tsx", "js", "jsx", "mjs", "cjs", "json"];

/// A fully resolved, loaded, and (if needed) transformed module (spec §3
/// "Module Record"). Immutable once constructed; the loader never mutates
/// a record in place, it replaces the cache entry.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
  /// Absolute resolved path. For remote modules this is the on-disk cache
  /// path, not the original URL.
  pub resolved_path: PathBuf,
  /// The original `http:`, `https:`, or `jsr:` URL this module was
  /// fetched from, or `None` for filesystem modules.
  pub origin_url: Option<Url>,
  pub lang: SourceLang,
  /// Raw source text as read from disk/network.
  pub source: String,
  /// Text actually handed to the script engine: equal to `source` unless
  /// `lang.needs_transform()`.
  pub transformed: String,
  pub is_main: bool,
}

impl ModuleRecord {
  pub fn specifier_string(&self) -> String {
    match &self.origin_url {
      Some(url) => url.to_string(),
      None => Url::from_file_path(&self.resolved_path)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| self.resolved_path.display().to_string()),
    }
  }
}
