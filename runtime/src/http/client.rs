// Copyright 2024 the tjs authors. MIT license.

//! The client fetch pipeline (spec §4.D "Client fetch pipeline"): pool
//! acquisition, request serialization, redirect following, and handing
//! back a [`Response`] whose body is a lazy pull from the connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use url::Url;

use crate::error::CoreError;
use crate::error::PoolKey;
use crate::http::body::BodySink;
use crate::http::body::BodyStream;
use crate::http::parser::Parser;
use crate::http::parser::ParserEvent;
use crate::http::parser::ParserKind;
use crate::http::request::Method;
use crate::http::request::RequestBuilder;
use crate::http::request::serialize_request;
use crate::net::Conn;
use crate::pool::ConnectionPool;
use crate::tls::TlsContext;

const MAX_REDIRECTS: u32 = 20;

pub struct Response {
  pub status: u16,
  pub reason: String,
  pub headers: HashMap<String, String>,
  pub final_url: Url,
  pub redirected: bool,
  body: BodyStream,
}

impl Response {
  pub async fn read_all_body(&mut self) -> Result<Vec<u8>, CoreError> {
    let bytes = self.body.collect_to_end().await;
    self.body.finalize().await;
    Ok(bytes)
  }

  pub async fn body_chunk(&mut self) -> Result<Option<Vec<u8>>, CoreError> {
    let chunk = self.body.pull().await?;
    if chunk.is_none() {
      self.body.finalize().await;
    }
    Ok(chunk)
  }

  pub async fn cancel(&mut self) {
    self.body.cancel().await;
  }
}

/// Owns the pool and TLS contexts shared by every `fetch` call from one
/// runtime (spec §9 "Global mutable state... encapsulate them as
/// objects owned by a runtime-init step").
pub struct HttpClient {
  pool: Arc<ConnectionPool>,
  unsafely_ignore_certificate_errors: bool,
}

impl HttpClient {
  pub fn new(pool: Arc<ConnectionPool>, unsafely_ignore_certificate_errors: bool) -> Self {
    Self {
      pool,
      unsafely_ignore_certificate_errors,
    }
  }

  pub async fn fetch(
    &self,
    url: &str,
    method: &str,
    headers: &[(&str, &str)],
    body: Option<Vec<u8>>,
  ) -> Result<Response, CoreError> {
    let url = Url::parse(url).map_err(|e| CoreError::FetchFailed {
      url: url.to_string(),
      reason: e.to_string(),
    })?;
    self
      .fetch_inner(url, Method::parse(method), headers, body, 0, false)
      .await
  }

  fn fetch_inner<'a>(
    &'a self,
    url: Url,
    method: Method,
    headers: &'a [(&'a str, &'a str)],
    body: Option<Vec<u8>>,
    redirect_count: u32,
    redirected: bool,
  ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, CoreError>> + 'a>> {
    Box::pin(async move {
      if redirect_count >= MAX_REDIRECTS {
        return Err(CoreError::TooManyRedirects { max: MAX_REDIRECTS });
      }

      let mut builder = RequestBuilder::new(url.clone(), method);
      for (name, value) in headers {
        builder = builder.header(name, value);
      }
      if let Some(bytes) = &body {
        builder = builder.body(bytes.clone());
      }
      let request = builder.build();

      let scheme = if url.scheme() == "https" { "https" } else { "http" };
      let host = url.host_str().unwrap_or_default().to_string();
      let port = url
        .port_or_known_default()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });
      let key = PoolKey {
        scheme: if scheme == "https" { "https" } else { "http" },
        host: host.clone(),
        port,
      };

      let unsafely_ignore_certificate_errors = self.unsafely_ignore_certificate_errors;
      let connect_host = host.clone();
      let pooled = self
        .pool
        .acquire(key.clone(), || {
          let host = connect_host.clone();
          async move {
            if scheme == "https" {
              let ctx = TlsContext::build(crate::tls::context_options_for_client(
                unsafely_ignore_certificate_errors,
              ))?;
              Conn::connect_tls(&host, port, &ctx).await
            } else {
              Conn::connect_plain(&host, port).await
            }
          }
        })
        .await?;

      let conn = Arc::new(Mutex::new(pooled.conn));
      {
        let mut guard = conn.lock().await;
        let wire = serialize_request(&request);
        guard.write(&wire).await?;
      }

      let mut parser = Parser::new(ParserKind::Response);
      let mut status = 0u16;
      let mut reason = String::new();
      let mut response_headers: HashMap<String, String> = HashMap::new();
      let mut leftover_body_chunks = Vec::new();
      let mut headers_complete = false;

      while !headers_complete {
        let chunk = {
          let mut guard = conn.lock().await;
          guard.read_chunk().await?
        };
        if chunk.is_empty() {
          return Err(CoreError::ConnectionClosed {
            context: Some("peer closed before response headers completed".into()),
          });
        }
        for event in parser.feed(&chunk)? {
          match event {
            ParserEvent::Status { code, reason: r, .. } => {
              status = code;
              reason = r;
            }
            ParserEvent::Header { name, value } => {
              response_headers
                .entry(name)
                .and_modify(|existing| {
                  existing.push_str(", ");
                  existing.push_str(&value);
                })
                .or_insert(value);
            }
            ParserEvent::HeadersComplete { .. } => headers_complete = true,
            ParserEvent::Body(bytes) => leftover_body_chunks.push(bytes),
            ParserEvent::MessageComplete | ParserEvent::PausedUpgrade | ParserEvent::RequestLine { .. } => {}
          }
        }
      }

      if matches!(status, 301 | 302 | 303 | 307 | 308) {
        if let Some(location) = response_headers.get("location") {
          let next_url = url.join(location).map_err(|e| CoreError::FetchFailed {
            url: location.clone(),
            reason: e.to_string(),
          })?;
          // The connection's response body (if any, e.g. a redirect
          // with an explanatory HTML page) is discarded, not streamed
          // to the caller, before the connection is released.
          let pooled_back = crate::pool::PooledConnection {
            conn: Arc::try_unwrap(conn).ok().map(Mutex::into_inner).unwrap_or_else(|| {
              // Still held elsewhere only if a clone leaked; in practice
              // this is the sole owner at this point.
              unreachable!("fetch pipeline holds the only reference to its connection")
            }),
            state: crate::pool::ConnState::Active,
            last_used: std::time::Instant::now(),
            requests_served: 1,
            keep_alive: !response_headers
              .get("connection")
              .map(|v| v.eq_ignore_ascii_case("close"))
              .unwrap_or(false),
          };
          self.pool.release(key, pooled_back).await;

          let (next_method, next_body) = downgrade_for_redirect(status, method, body);
          return self
            .fetch_inner(next_url, next_method, headers, next_body, redirect_count + 1, true)
            .await;
        }
      }

      let sink = BodySink::Pool {
        pool: Arc::clone(&self.pool),
        key,
      };
      let body = BodyStream::from_connection(conn, sink, parser, leftover_body_chunks);

      Ok(Response {
        status,
        reason,
        headers: response_headers,
        final_url: url,
        redirected,
        body,
      })
    })
  }
}

/// Spec §4.D step 5: `303` always downgrades to `GET` with no body;
/// `301`/`302` downgrade `POST` to `GET` per WHATWG; everything else
/// (307/308, or a non-POST 301/302) keeps method and body.
fn downgrade_for_redirect(status: u16, method: Method, body: Option<Vec<u8>>) -> (Method, Option<Vec<u8>>) {
  match status {
    303 => (Method::Get, None),
    301 | 302 if method == Method::Post => (Method::Get, None),
    _ => (method, body),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn downgrade_303_always_becomes_get_with_no_body() {
    let (method, body) = downgrade_for_redirect(303, Method::Post, Some(b"x".to_vec()));
    assert_eq!(method, Method::Get);
    assert!(body.is_none());
  }

  #[test]
  fn downgrade_301_post_becomes_get() {
    let (method, body) = downgrade_for_redirect(301, Method::Post, Some(b"x".to_vec()));
    assert_eq!(method, Method::Get);
    assert!(body.is_none());
  }

  #[test]
  fn downgrade_307_preserves_method_and_body() {
    let (method, body) = downgrade_for_redirect(307, Method::Post, Some(b"x".to_vec()));
    assert_eq!(method, Method::Post);
    assert_eq!(body, Some(b"x".to_vec()));
  }
}
