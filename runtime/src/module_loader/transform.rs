// Copyright 2024 the tjs authors. MIT license.

//! Transpilation of TS/TSX/JSX/JSON to plain script text (spec §4.A
//! "Transformation"). Parsing and code generation are delegated to
//! `deno_ast`, the reference runtime's own TypeScript/JSX transpiler
//! binding; this module only decides *whether* and *how* to call it and
//! synthesizes the JSON pseudo-module.

use deno_ast::EmitOptions;
use deno_ast::MediaType;
use deno_ast::ParseParams;
use deno_ast::SourceMapOption;
use url::Url;

use crate::error::CoreError;
use crate::module_loader::record::SourceLang;

/// The outcome of a transform pass: the text to hand to the script
/// engine, and an optional inline source map to register with the
/// engine's source-map sink (spec §4.A, last sentence).
pub struct TransformResult {
  pub text: String,
  pub source_map: Option<String>,
}

fn media_type_for(lang: SourceLang) -> MediaType {
  match lang {
    SourceLang::Ts => MediaType::TypeScript,
    SourceLang::Tsx => MediaType::Tsx,
    SourceLang::Jsx => MediaType::Jsx,
    SourceLang::Js | SourceLang::Mjs | SourceLang::Cjs => MediaType::JavaScript,
    SourceLang::Json => MediaType::Json,
  }
}

/// Strips types (`.ts`), strips types and desugars JSX (`.tsx`), desugars
/// JSX only (`.jsx`), synthesizes a default-export module for `.json`, or
/// passes through unchanged for everything else.
pub fn transform(
  specifier: &Url,
  lang: SourceLang,
  source: &str,
) -> Result<TransformResult, CoreError> {
  match lang {
    SourceLang::Json => Ok(TransformResult {
      text: synthesize_json_module(source).map_err(|e| CoreError::TransformFailed {
        specifier: specifier.to_string(),
        reason: e,
      })?,
      source_map: None,
    }),
    SourceLang::Js | SourceLang::Mjs | SourceLang::Cjs => Ok(TransformResult {
      text: source.to_string(),
      source_map: None,
    }),
    SourceLang::Ts | SourceLang::Tsx | SourceLang::Jsx => {
      transpile_with_swc(specifier, lang, source)
    }
  }
}

fn transpile_with_swc(
  specifier: &Url,
  lang: SourceLang,
  source: &str,
) -> Result<TransformResult, CoreError> {
  let parsed = deno_ast::parse_module(ParseParams {
    specifier: specifier.clone(),
    text: source.into(),
    media_type: media_type_for(lang),
    capture_tokens: false,
    scope_analysis: false,
    maybe_syntax: None,
  })
  .map_err(|e| CoreError::TransformFailed {
    specifier: specifier.to_string(),
    reason: e.to_string(),
  })?;

  let transpiled = parsed
    .transpile(
      &deno_ast::TranspileOptions {
        imports_not_used_as_values: deno_ast::ImportsNotUsedAsValues::Remove,
        ..Default::default()
      },
      &deno_ast::TranspileModuleOptions::default(),
      &EmitOptions {
        source_map: SourceMapOption::Separate,
        ..Default::default()
      },
    )
    .map_err(|e| CoreError::TransformFailed {
      specifier: specifier.to_string(),
      reason: e.to_string(),
    })?
    .into_source();

  Ok(TransformResult {
    text: transpiled.text,
    source_map: transpiled.source_map,
  })
}

/// A `.json` import becomes a synthetic ES module whose default export is
/// the parsed JSON literal (spec §4.A). We round-trip through
/// `serde_json::Value` so malformed JSON surfaces as `TransformFailed`
/// rather than a confusing script-engine parse error.
fn synthesize_json_module(source: &str) -> Result<String, String> {
  let value: serde_json::Value =
    serde_json::from_str(source).map_err(|e| e.to_string())?;
  Ok(format!("export default {};\n", value))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn strips_types_from_ts() {
    let out = transform(
      &url("file:///mod.ts"),
      SourceLang::Ts,
      "const x: number = 1; export { x };",
    )
    .unwrap();
    assert!(!out.text.contains(": number"));
    assert!(out.text.contains("export"));
  }

  #[test]
  fn desugars_jsx() {
    let out = transform(
      &url("file:///mod.jsx"),
      SourceLang::Jsx,
      "export const el = <div>hi</div>;",
    )
    .unwrap();
    assert!(!out.text.contains("<div>"));
  }

  #[test]
  fn json_becomes_default_export() {
    let out = transform(&url("file:///data.json"), SourceLang::Json, r#"{"x":1}"#).unwrap();
    assert!(out.text.starts_with("export default"));
    assert!(out.text.contains("\"x\":1") || out.text.contains("\"x\": 1"));
  }

  #[test]
  fn rejects_malformed_json() {
    let err = transform(&url("file:///data.json"), SourceLang::Json, "{not json").unwrap_err();
    assert!(matches!(err, CoreError::TransformFailed { .. }));
  }

  #[test]
  fn js_passes_through_unchanged() {
    let out = transform(&url("file:///mod.js"), SourceLang::Js, "export const x = 1;").unwrap();
    assert_eq!(out.text, "export const x = 1;");
  }
}
