// Copyright 2024 the tjs authors. MIT license.

//! The server request pipeline (spec §4.D "Server request pipeline").
//! [`crate::server`] owns the accept loop and per-connection keep-alive
//! bookkeeping; this module is the single-request state machine it
//! drives: reset, parse to headers-complete (or paused-upgrade), expose
//! the body as a lazy sequence, run the handler, and decide keep-alive.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::http::body::BodySink;
use crate::http::body::BodyStream;
use crate::http::body::encode_chunk;
use crate::http::body::encode_chunked_end;
use crate::http::parser::Parser;
use crate::http::parser::ParserEvent;
use crate::net::Conn;

pub struct ServerRequest {
  pub method: String,
  pub target: String,
  pub version_minor: u8,
  pub headers: HashMap<String, String>,
  pub body: BodyStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
  KeepAlive,
  Close,
  /// The handler called `upgrade()`; the caller must stop running the
  /// HTTP loop on this connection (spec §4.C "Upgraded connections
  /// leave the HTTP loop and are not closed by it").
  Upgraded,
}

enum HeaderState {
  Pending {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
  },
  Sent {
    chunked: bool,
  },
}

/// `writeHead`/`write`/`end`/`upgrade` (spec §4.D point 4). Headers are
/// buffered until the first byte actually needs to go out, so the
/// chunked-vs-content-length decision (spec point 5) can be made at that
/// point rather than guessed up front.
pub struct ResponseWriter {
  conn: Arc<Mutex<Conn>>,
  state: HeaderState,
  keep_alive: bool,
  ended: bool,
}

impl ResponseWriter {
  fn new(conn: Arc<Mutex<Conn>>, keep_alive: bool) -> Self {
    Self {
      conn,
      state: HeaderState::Pending {
        status: 200,
        reason: "OK".to_string(),
        headers: Vec::new(),
      },
      keep_alive,
      ended: false,
    }
  }

  pub fn write_head(&mut self, status: u16, reason: &str, headers: &[(&str, &str)]) -> Result<(), CoreError> {
    match &mut self.state {
      HeaderState::Pending { .. } => {
        self.state = HeaderState::Pending {
          status,
          reason: reason.to_string(),
          headers: headers.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect(),
        };
        Ok(())
      }
      HeaderState::Sent { .. } => Err(CoreError::ProtocolError(
        "headers already sent for this response".into(),
      )),
    }
  }

  fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
  }

  /// Flushes buffered headers. `content_length`, when given, is written
  /// as-is and the response uses the content-length framing; otherwise
  /// chunked transfer is enabled (spec point 5).
  async fn flush_headers(&mut self, content_length: Option<usize>) -> Result<bool, CoreError> {
    let HeaderState::Pending { status, reason, mut headers } =
      std::mem::replace(&mut self.state, HeaderState::Sent { chunked: false })
    else {
      let HeaderState::Sent { chunked } = self.state else { unreachable!() };
      return Ok(chunked);
    };

    let explicit_length = Self::has_header(&headers, "content-length");
    let chunked = !explicit_length && content_length.is_none();
    if let Some(len) = content_length {
      if !explicit_length {
        headers.push(("Content-Length".to_string(), len.to_string()));
      }
    } else if chunked {
      headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
    }
    if !Self::has_header(&headers, "connection") {
      headers.push((
        "Connection".to_string(),
        if self.keep_alive { "keep-alive" } else { "close" }.to_string(),
      ));
    }

    let mut wire = format!("HTTP/1.1 {status} {reason}\r\n").into_bytes();
    for (name, value) in &headers {
      wire.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    wire.extend_from_slice(b"\r\n");
    self.conn.lock().await.write(&wire).await?;
    self.state = HeaderState::Sent { chunked };
    Ok(chunked)
  }

  pub async fn write(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
    let chunked = self.flush_headers(None).await?;
    let payload = if chunked { encode_chunk(bytes) } else { bytes.to_vec() };
    self.conn.lock().await.write(&payload).await?;
    Ok(())
  }

  pub async fn end(&mut self, bytes: Option<&[u8]>) -> Result<(), CoreError> {
    if self.ended {
      return Ok(());
    }
    self.ended = true;
    let was_pending = matches!(self.state, HeaderState::Pending { .. });
    if was_pending {
      // Nothing written yet: spec point 5, "auto-emit 200 OK with
      // Content-Length: 0" generalizes to "emit Content-Length equal to
      // whatever `end` was given".
      let len = bytes.map(|b| b.len()).unwrap_or(0);
      self.flush_headers(Some(len)).await?;
      if let Some(bytes) = bytes {
        self.conn.lock().await.write(bytes).await?;
      }
      return Ok(());
    }
    let HeaderState::Sent { chunked } = self.state else { unreachable!() };
    let mut conn = self.conn.lock().await;
    if let Some(bytes) = bytes {
      let payload = if chunked { encode_chunk(bytes) } else { bytes.to_vec() };
      conn.write(&payload).await?;
    }
    if chunked {
      conn.write(encode_chunked_end()).await?;
    }
    Ok(())
  }

  /// Sends the buffered status line and headers verbatim, with no
  /// `Content-Length`/chunked framing decision — used for the `101
  /// Switching Protocols` response, which has no body (spec §4.E
  /// "Upgrade handshake (server)").
  pub async fn send_headers_only(&mut self) -> Result<(), CoreError> {
    let HeaderState::Pending { status, reason, headers } =
      std::mem::replace(&mut self.state, HeaderState::Sent { chunked: false })
    else {
      return Ok(());
    };
    let mut wire = format!("HTTP/1.1 {status} {reason}\r\n").into_bytes();
    for (name, value) in &headers {
      wire.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    wire.extend_from_slice(b"\r\n");
    self.conn.lock().await.write(&wire).await?;
    Ok(())
  }

  /// Returns the raw connection for the caller to hand to the WebSocket
  /// layer; marks this writer as ended so the pipeline's trailing
  /// `end(None)` call becomes a no-op (spec §4.C "Upgraded connections
  /// leave the HTTP loop and are not closed by it").
  pub fn upgrade(&mut self) -> Arc<Mutex<Conn>> {
    self.ended = true;
    Arc::clone(&self.conn)
  }
}

#[async_trait(?Send)]
pub trait Handler {
  async fn handle(&self, req: ServerRequest, res: &mut ResponseWriter) -> Result<RequestOutcome, CoreError>;
}

/// Runs one request-response cycle on `conn` with a fresh (or `reset`)
/// `parser` (spec §4.D "Server request pipeline" steps 1-6).
pub async fn serve_one_request<H: Handler>(
  conn: Arc<Mutex<Conn>>,
  parser: &mut Parser,
  handler: &H,
  requests_served_before: u64,
) -> Result<RequestOutcome, CoreError> {
  parser.reset();

  let mut method = String::new();
  let mut target = String::new();
  let mut version_minor = 1u8;
  let mut headers: HashMap<String, String> = HashMap::new();
  let mut leftover_body_chunks = Vec::new();
  let mut headers_complete = false;
  let mut upgrade_requested = false;

  while !headers_complete {
    let chunk = {
      let mut guard = conn.lock().await;
      guard.read_chunk().await?
    };
    if chunk.is_empty() {
      return Err(CoreError::ConnectionClosed {
        context: Some("peer closed before request headers completed".into()),
      });
    }
    for event in parser.feed(&chunk)? {
      match event {
        ParserEvent::RequestLine {
          method: m,
          target: t,
          version_minor: v,
        } => {
          method = m;
          target = t;
          version_minor = v;
        }
        ParserEvent::Header { name, value } => {
          headers
            .entry(name)
            .and_modify(|existing| {
              existing.push_str(", ");
              existing.push_str(&value);
            })
            .or_insert(value);
        }
        ParserEvent::HeadersComplete { .. } => headers_complete = true,
        ParserEvent::PausedUpgrade => {
          headers_complete = true;
          upgrade_requested = true;
        }
        ParserEvent::Body(bytes) => leftover_body_chunks.push(bytes),
        ParserEvent::MessageComplete | ParserEvent::Status { .. } => {}
      }
    }
  }

  let keep_alive_requested = decide_keep_alive(version_minor, headers.get("connection"));

  if upgrade_requested {
    let body = BodyStream::already_complete(Vec::new());
    let req = ServerRequest {
      method,
      target,
      version_minor,
      headers,
      body,
    };
    let mut res = ResponseWriter::new(Arc::clone(&conn), false);
    handler.handle(req, &mut res).await?;
    return Ok(RequestOutcome::Upgraded);
  }

  let body = BodyStream::from_connection(
    Arc::clone(&conn),
    BodySink::Owned,
    std::mem::replace(parser, Parser::new(crate::http::parser::ParserKind::Request)),
    leftover_body_chunks,
  );
  let req = ServerRequest {
    method,
    target,
    version_minor,
    headers,
    body,
  };

  let mut res = ResponseWriter::new(Arc::clone(&conn), keep_alive_requested);
  let outcome = handler.handle(req, &mut res).await;
  res.end(None).await.ok();
  let outcome = outcome?;

  let _ = requests_served_before;
  Ok(match outcome {
    RequestOutcome::Upgraded => RequestOutcome::Upgraded,
    _ if keep_alive_requested => RequestOutcome::KeepAlive,
    _ => RequestOutcome::Close,
  })
}

/// Spec §4.D point 6: HTTP/1.1 defaults to keep-alive unless `Connection:
/// close`; HTTP/1.0 requires an explicit `Connection: keep-alive`.
fn decide_keep_alive(version_minor: u8, connection_header: Option<&String>) -> bool {
  let says_close = connection_header
    .map(|v| v.to_ascii_lowercase().contains("close"))
    .unwrap_or(false);
  let says_keep_alive = connection_header
    .map(|v| v.to_ascii_lowercase().contains("keep-alive"))
    .unwrap_or(false);
  if says_close {
    return false;
  }
  match version_minor {
    0 => says_keep_alive,
    _ => true,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn http_1_1_defaults_to_keep_alive() {
    assert!(decide_keep_alive(1, None));
  }

  #[test]
  fn http_1_1_with_connection_close_disables_keep_alive() {
    assert!(!decide_keep_alive(1, Some(&"close".to_string())));
  }

  #[test]
  fn http_1_0_requires_explicit_keep_alive() {
    assert!(!decide_keep_alive(0, None));
    assert!(decide_keep_alive(0, Some(&"keep-alive".to_string())));
  }
}
