// Copyright 2024 the tjs authors. MIT license.

//! Component A: module resolution and transformation (spec §4.A).
//!
//! [`resolver::Resolver`] implements the specifier-dispatch algorithm and
//! owns the resolution/remote-URL/module caches (spec §3). [`loader`]
//! adapts it to `deno_core::ModuleLoader`. [`transform`] wraps `deno_ast`
//! for the TS/TSX/JSX/JSON transform pass. [`jsr`] and [`node_builtin`]
//! implement the two non-filesystem, non-HTTP specifier schemes.

pub mod cache;
pub mod fetcher;
pub mod jsr;
pub mod loader;
pub mod node_builtin;
pub mod record;
pub mod resolver;
pub mod specifier;
pub mod transform;

pub use fetcher::FetchedModule;
pub use fetcher::HttpRemoteFetcher;
pub use fetcher::RemoteFetcher;
pub use loader::TjsModuleLoader;
pub use record::ModuleRecord;
pub use record::SourceLang;
pub use resolver::Resolved;
pub use resolver::Resolver;
