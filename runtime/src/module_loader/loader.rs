// Copyright 2024 the tjs authors. MIT license.

//! Wires [`Resolver`] into the script engine's three module hooks
//! (spec §4.A "Integrates with the script engine via three hooks") by
//! implementing `deno_core::ModuleLoader`.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::rc::Rc;

use deno_core::ModuleLoadOptions;
use deno_core::ModuleLoadReferrer;
use deno_core::ModuleLoadResponse;
use deno_core::ModuleLoader;
use deno_core::ModuleSource;
use deno_core::ModuleSourceCode;
use deno_core::ModuleSpecifier;
use deno_core::ModuleType;
use deno_core::ResolutionKind;
use deno_core::error::ModuleLoaderError;

use crate::module_loader::fetcher::RemoteFetcher;
use crate::module_loader::record::SourceLang;
use crate::module_loader::resolver::Resolved;
use crate::module_loader::resolver::Resolver;

/// Adapts [`Resolver`] to `deno_core::ModuleLoader`. One instance is
/// constructed per `JsRuntime` (spec §5 "process-wide singletons...
/// encapsulate them as objects owned by a runtime-init step").
pub struct TjsModuleLoader<F: RemoteFetcher + 'static> {
  resolver: Rc<Resolver<F>>,
}

impl<F: RemoteFetcher + 'static> TjsModuleLoader<F> {
  pub fn new(resolver: Rc<Resolver<F>>) -> Self {
    Self { resolver }
  }
}

fn module_type_for(lang: SourceLang) -> ModuleType {
  match lang {
    SourceLang::Json => ModuleType::Json,
    _ => ModuleType::JavaScript,
  }
}

impl<F: RemoteFetcher + 'static> ModuleLoader for TjsModuleLoader<F> {
  fn resolve(
    &self,
    specifier: &str,
    referrer: &str,
    _kind: ResolutionKind,
  ) -> Result<ModuleSpecifier, ModuleLoaderError> {
    // `resolve` in `deno_core` is synchronous; the actual (possibly
    // network-bound) resolution already happened in `prepare_load` via
    // `Resolver::resolve`, whose result is memoized by
    // `(specifier, parent)` (spec §3) so this lookup never touches the
    // network on the happy path.
    let referrer_path = specifier_to_path(referrer);
    let cached = self
      .resolver
      .resolution_cache
      .get(specifier, &referrer_path)
      .ok_or_else(|| {
        ModuleLoaderError::generic(format!(
          "'{specifier}' was not pre-resolved from '{referrer}'; call prepare_load first"
        ))
      })?;
    path_to_specifier(&cached, &self.resolver, referrer)
  }

  fn load(
    &self,
    module_specifier: &ModuleSpecifier,
    _maybe_referrer: Option<&ModuleLoadReferrer>,
    _options: ModuleLoadOptions,
  ) -> ModuleLoadResponse {
    let resolver = self.resolver.clone();
    let specifier = module_specifier.clone();
    let is_main = false;
    let result = (|| {
      let path = specifier_to_path(specifier.as_str());
      let resolved = if specifier.scheme() == "file" {
        Resolved::Local(path)
      } else {
        match resolver.remote_url_map.get(&path) {
          Some(url) => Resolved::Remote { local_path: path, url },
          None => Resolved::Local(path),
        }
      };
      let record = resolver
        .load(&resolved, is_main)
        .map_err(|e| e.to_string())?;
      Ok::<_, String>(ModuleSource::new(
        module_type_for(record.lang),
        ModuleSourceCode::String(record.transformed.clone().into()),
        &specifier,
        None,
      ))
    })();
    ModuleLoadResponse::Sync(result.map_err(ModuleLoaderError::generic))
  }

  /// Walks the static import graph rooted at `specifier`, driving
  /// `Resolver::resolve` (and its network fetches) to completion so the
  /// later synchronous `resolve` calls `deno_core` makes while building
  /// the module record all hit the memoized cache (spec §4.A "Integrates
  /// with the script engine via three hooks").
  fn prepare_load(
    &self,
    specifier: &ModuleSpecifier,
    _maybe_referrer: Option<String>,
    _maybe_content: Option<String>,
    _options: ModuleLoadOptions,
  ) -> Pin<Box<dyn Future<Output = Result<(), ModuleLoaderError>>>> {
    let resolver = self.resolver.clone();
    let root = specifier.clone();
    Box::pin(async move { walk_module_graph(&resolver, &root).await })
  }
}

/// Loads `root` and every module it statically imports, transitively,
/// caching each `(specifier, parent)` resolution as it goes. Dynamic
/// `import()` targets are not walked here — each one becomes its own
/// `prepare_load` root when the script actually evaluates it.
async fn walk_module_graph<F: RemoteFetcher + 'static>(
  resolver: &Resolver<F>,
  root: &ModuleSpecifier,
) -> Result<(), ModuleLoaderError> {
  let root_resolved = if root.scheme() == "file" {
    let path = root
      .to_file_path()
      .map_err(|_| ModuleLoaderError::generic(format!("'{root}' is not a valid file specifier")))?;
    Resolved::Local(path)
  } else {
    resolver
      .resolve(root.as_str(), Path::new(""))
      .await
      .map_err(|e| ModuleLoaderError::generic(e.to_string()))?
  };

  let mut visited = HashSet::new();
  let mut queue = VecDeque::new();
  queue.push_back(root_resolved);

  while let Some(resolved) = queue.pop_front() {
    let path = resolved.local_path().to_path_buf();
    if !visited.insert(path.clone()) {
      continue;
    }

    let record = resolver
      .load(&resolved, false)
      .map_err(|e| ModuleLoaderError::generic(e.to_string()))?;
    if record.lang == SourceLang::Json {
      continue;
    }

    for child_specifier in static_import_specifiers(&record.source) {
      let child = resolver
        .resolve(&child_specifier, &path)
        .await
        .map_err(|e| ModuleLoaderError::generic(e.to_string()))?;
      queue.push_back(child);
    }
  }
  Ok(())
}

/// Scans `source` for the module specifier named by every static
/// `import`/`export ... from` declaration, including bare side-effect
/// imports (`import "./x.ts"`). Dynamic `import(...)` calls are
/// deliberately excluded: the `(` right after `import` invalidates the
/// tracked keyword before the string literal inside it is reached, so
/// it never matches.
fn static_import_specifiers(source: &str) -> Vec<String> {
  let mut specifiers = Vec::new();
  // The identifier currently being accumulated, and the most recently
  // *completed* one — whitespace finalizes `current` into `last_ident`
  // without losing it, punctuation finalizes and then invalidates it,
  // since nothing but whitespace may sit between `from`/`import` and
  // the specifier string it introduces.
  let mut current = String::new();
  let mut last_ident = String::new();
  let mut chars = source.char_indices().peekable();

  while let Some((i, c)) = chars.next() {
    match c {
      '/' if source[i..].starts_with("//") => {
        while let Some(&(_, next)) = chars.peek() {
          if next == '\n' {
            break;
          }
          chars.next();
        }
        current.clear();
        last_ident.clear();
      }
      '/' if source[i..].starts_with("/*") => {
        chars.next();
        while let Some((j, next)) = chars.next() {
          if next == '*' && source[j + 1..].starts_with('/') {
            chars.next();
            break;
          }
        }
        current.clear();
        last_ident.clear();
      }
      '\'' | '"' | '`' => {
        if !current.is_empty() {
          last_ident = std::mem::take(&mut current);
        }
        let quote = c;
        let start = i + 1;
        let mut end = start;
        while let Some((j, next)) = chars.next() {
          if next == quote {
            end = j;
            break;
          }
          end = j + next.len_utf8();
        }
        if last_ident == "from" || last_ident == "import" {
          specifiers.push(source[start..end].to_string());
        }
        last_ident.clear();
      }
      c if c.is_alphanumeric() || c == '_' || c == '$' => {
        current.push(c);
      }
      c if c.is_whitespace() => {
        if !current.is_empty() {
          last_ident = std::mem::take(&mut current);
        }
      }
      _ => {
        current.clear();
        last_ident.clear();
      }
    }
  }
  specifiers
}

fn specifier_to_path(specifier: &str) -> std::path::PathBuf {
  if let Ok(url) = ModuleSpecifier::parse(specifier) {
    if url.scheme() == "file" {
      if let Ok(path) = url.to_file_path() {
        return path;
      }
    }
  }
  std::path::PathBuf::from(specifier)
}

fn path_to_specifier<F: RemoteFetcher + 'static>(
  path: &std::path::Path,
  resolver: &Resolver<F>,
  referrer: &str,
) -> Result<ModuleSpecifier, ModuleLoaderError> {
  if let Some(url) = resolver.remote_url_map.get(path) {
    return Ok(url);
  }
  ModuleSpecifier::from_file_path(path).map_err(|_| {
    ModuleLoaderError::generic(format!(
      "cannot convert resolved path '{}' (from referrer '{referrer}') into a module specifier",
      path.display()
    ))
  })
}
