// Copyright 2024 the tjs authors. MIT license.

//! Specifier classification and filesystem-side resolution helpers:
//! extension probing, directory→index recursion, and `node_modules`
//! package resolution with `package.json` `exports`/`module`/`main`
//! (spec §4.A steps 5 and 6).

use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;

use crate::error::CoreError;
use crate::module_loader::record::EXTENSION_PROBE_ORDER;

/// How a raw specifier string is dispatched (spec §4.A "Resolution
/// algorithm", tried in this order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecifierKind {
  Node(String),
  Http(String),
  Jsr(String),
  Relative(String),
  Absolute(String),
  Package(String),
}

pub fn classify(specifier: &str) -> SpecifierKind {
  if let Some(name) = specifier.strip_prefix("node:") {
    SpecifierKind::Node(name.to_string())
  } else if specifier.starts_with("http://") || specifier.starts_with("https://") {
    SpecifierKind::Http(specifier.to_string())
  } else if specifier.starts_with("jsr:") {
    SpecifierKind::Jsr(specifier.to_string())
  } else if specifier.starts_with("./") || specifier.starts_with("../") {
    SpecifierKind::Relative(specifier.to_string())
  } else if specifier.starts_with('/') {
    SpecifierKind::Absolute(specifier.to_string())
  } else {
    SpecifierKind::Package(specifier.to_string())
  }
}

/// Probes `base`, `base.<ext>` for each extension in
/// [`EXTENSION_PROBE_ORDER`], then recurses into `base/index` if `base`
/// is a directory (spec §4.A "A directory resolves by recursing with
/// `<dir>/index`").
pub fn probe_extensions(base: &Path) -> Option<PathBuf> {
  if base.is_file() {
    return Some(base.to_path_buf());
  }
  for ext in EXTENSION_PROBE_ORDER {
    let candidate = append_extension(base, ext);
    if candidate.is_file() {
      return Some(candidate);
    }
  }
  if base.is_dir() {
    return probe_extensions(&base.join("index"));
  }
  None
}

fn append_extension(base: &Path, ext: &str) -> PathBuf {
  match base.extension() {
    Some(_) => base.to_path_buf(),
    None => {
      let mut s = base.as_os_str().to_owned();
      s.push(".");
      s.push(ext);
      PathBuf::from(s)
    }
  }
}

/// Splits a bare specifier into `(packageName, subpath)`, honoring the
/// `@scope/name` form (spec §4.A step 6).
pub fn split_package_specifier(specifier: &str) -> (String, Option<String>) {
  if let Some(rest) = specifier.strip_prefix('@') {
    if let Some((scope, after_scope)) = rest.split_once('/') {
      return match after_scope.split_once('/') {
        Some((name, subpath)) => (format!("@{scope}/{name}"), Some(subpath.to_string())),
        None => (format!("@{scope}/{after_scope}"), None),
      };
    }
  }
  match specifier.split_once('/') {
    Some((name, subpath)) => (name.to_string(), Some(subpath.to_string())),
    None => (specifier.to_string(), None),
  }
}

/// Walks the parent directory chain looking for `node_modules/<name>`,
/// then resolves `package.json` `exports` (string, object, or
/// conditional-with-`default`), then `module`, then `main`, falling back
/// to `index` (spec §4.A step 6).
pub fn resolve_node_modules_package(
  start_dir: &Path,
  package_name: &str,
  subpath: Option<&str>,
) -> Result<PathBuf, CoreError> {
  let mut dir = Some(start_dir);
  while let Some(d) = dir {
    let candidate = d.join("node_modules").join(package_name);
    if candidate.is_dir() {
      return resolve_package_entry(&candidate, subpath);
    }
    dir = d.parent();
  }
  Err(CoreError::ResolutionFailed {
    specifier: package_name.to_string(),
    referrer: start_dir.display().to_string(),
  })
}

fn resolve_package_entry(pkg_dir: &Path, subpath: Option<&str>) -> Result<PathBuf, CoreError> {
  let pkg_json_path = pkg_dir.join("package.json");
  let pkg_json: Value = if pkg_json_path.is_file() {
    let text = std::fs::read_to_string(&pkg_json_path).map_err(|e| CoreError::ResolutionFailed {
      specifier: pkg_json_path.display().to_string(),
      referrer: e.to_string(),
    })?;
    serde_json::from_str(&text).unwrap_or(Value::Null)
  } else {
    Value::Null
  };

  if let Some(sub) = subpath {
    if let Some(resolved) = resolve_via_exports(&pkg_json, &format!("./{sub}")) {
      let p = pkg_dir.join(resolved.trim_start_matches("./"));
      if let Some(found) = probe_extensions(&p) {
        return Ok(found);
      }
    }
    if let Some(found) = probe_extensions(&pkg_dir.join(sub)) {
      return Ok(found);
    }
    return Err(CoreError::ResolutionFailed {
      specifier: sub.to_string(),
      referrer: pkg_dir.display().to_string(),
    });
  }

  if let Some(resolved) = resolve_via_exports(&pkg_json, ".") {
    let p = pkg_dir.join(resolved.trim_start_matches("./"));
    if let Some(found) = probe_extensions(&p) {
      return Ok(found);
    }
  }
  for field in ["module", "main"] {
    if let Some(Value::String(s)) = pkg_json.get(field) {
      if let Some(found) = probe_extensions(&pkg_dir.join(s)) {
        return Ok(found);
      }
    }
  }
  probe_extensions(&pkg_dir.join("index")).ok_or_else(|| CoreError::ResolutionFailed {
    specifier: pkg_dir.display().to_string(),
    referrer: "no exports/module/main/index".to_string(),
  })
}

/// Resolves `package.json#exports` for a single export key, handling the
/// string form (`"exports": "./mod.js"`), the map form
/// (`"exports": {".": "./mod.js"}`), and the conditional form
/// (`"exports": {".": {"import": "./mod.mjs", "default": "./mod.js"}}`).
fn resolve_via_exports(pkg_json: &Value, key: &str) -> Option<String> {
  let exports = pkg_json.get("exports")?;
  match exports {
    Value::String(s) if key == "." => Some(s.clone()),
    Value::Object(map) => {
      if let Some(v) = map.get(key) {
        return resolve_condition(v);
      }
      if key == "." && !map.contains_key(".") {
        // `exports` itself may *be* the conditional map for the root export.
        return resolve_condition(exports);
      }
      None
    }
    _ => None,
  }
}

fn resolve_condition(v: &Value) -> Option<String> {
  match v {
    Value::String(s) => Some(s.clone()),
    Value::Object(map) => {
      for cond in ["import", "require", "default"] {
        if let Some(inner) = map.get(cond) {
          if let Some(s) = resolve_condition(inner) {
            return Some(s);
          }
        }
      }
      None
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_every_kind() {
    assert_eq!(classify("node:fs"), SpecifierKind::Node("fs".into()));
    assert!(matches!(classify("https://x/y.ts"), SpecifierKind::Http(_)));
    assert!(matches!(classify("jsr:@std/path"), SpecifierKind::Jsr(_)));
    assert!(matches!(classify("./a.ts"), SpecifierKind::Relative(_)));
    assert!(matches!(classify("../a.ts"), SpecifierKind::Relative(_)));
    assert!(matches!(classify("/abs/a.ts"), SpecifierKind::Absolute(_)));
    assert!(matches!(classify("left-pad"), SpecifierKind::Package(_)));
  }

  #[test]
  fn splits_scoped_and_plain_packages() {
    assert_eq!(
      split_package_specifier("@scope/name/sub/path"),
      ("@scope/name".to_string(), Some("sub/path".to_string()))
    );
    assert_eq!(
      split_package_specifier("@scope/name"),
      ("@scope/name".to_string(), None)
    );
    assert_eq!(
      split_package_specifier("left-pad/index"),
      ("left-pad".to_string(), Some("index".to_string()))
    );
    assert_eq!(
      split_package_specifier("left-pad"),
      ("left-pad".to_string(), None)
    );
  }

  #[test]
  fn resolves_string_export_condition() {
    let pkg = serde_json::json!({"exports": {".": {"import": "./mod.mjs", "default": "./mod.js"}}});
    assert_eq!(resolve_via_exports(&pkg, "."), Some("./mod.mjs".to_string()));
  }
}
