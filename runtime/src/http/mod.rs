// Copyright 2024 the tjs authors. MIT license.

//! Component D: the HTTP/1.1 message engine (spec §4.D). [`parser`] is
//! the incremental `httparse` wrapper; [`request`] builds outbound
//! requests; [`body`] is the pull-based streaming body shared by both
//! directions; [`client`] is the pooled `fetch` pipeline; [`server`] is
//! the per-request server pipeline driven by [`crate::server`]'s accept
//! loop.

pub mod body;
pub mod client;
pub mod parser;
pub mod request;
pub mod server;

pub use client::HttpClient;
pub use client::Response;
pub use parser::Parser;
pub use parser::ParserEvent;
pub use parser::ParserKind;
pub use request::Method;
pub use request::Request;
pub use request::RequestBuilder;
