// Copyright 2024 the tjs authors. MIT license.

//! The incremental wrapper around `httparse` named in spec §4.D
//! "Response parser" / §6 "HTTP parser interface". `httparse` itself
//! parses one complete header block per call; this module adds the
//! incremental-feed, callback-event, body-streaming and `reset` surface
//! the spec describes, the same shape the reference runtime gets for
//! free from its bundled llhttp binding.

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
  RequestLine {
    method: String,
    target: String,
    version_minor: u8,
  },
  Status {
    code: u16,
    reason: String,
    version_minor: u8,
  },
  /// Header names are lowercased and, for a repeated name, merged with
  /// `", "` before this event fires (spec §4.D "Response parser").
  Header {
    name: String,
    value: String,
  },
  HeadersComplete {
    content_length: Option<u64>,
    chunked: bool,
    upgrade: bool,
  },
  /// Emitted instead of further body events when the request line bears
  /// `Upgrade` and the caller should stop feeding this parser (spec
  /// §4.D "PAUSED_UPGRADE").
  PausedUpgrade,
  Body(Vec<u8>),
  MessageComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
  Request,
  Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkState {
  Size,
  Data(u64),
  DataTrailingCrLf,
  Trailers,
  Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BodyMode {
  None,
  ContentLength(u64),
  Chunked(ChunkState),
  UntilEof,
}

/// One parser instance per `ServerConnection`/outbound request, `reset`
/// between messages on a keep-alive connection (spec §4.D, §4.C).
pub struct Parser {
  kind: ParserKind,
  headers_done: bool,
  header_buf: Vec<u8>,
  body_buf: Vec<u8>,
  body_mode: BodyMode,
  upgrade: bool,
  done: bool,
}

impl Parser {
  pub fn new(kind: ParserKind) -> Self {
    Self {
      kind,
      headers_done: false,
      header_buf: Vec::new(),
      body_buf: Vec::new(),
      body_mode: BodyMode::None,
      upgrade: false,
      done: false,
    }
  }

  pub fn reset(&mut self) {
    self.headers_done = false;
    self.header_buf.clear();
    self.body_buf.clear();
    self.body_mode = BodyMode::None;
    self.upgrade = false;
    self.done = false;
  }

  pub fn is_message_complete(&self) -> bool {
    self.done
  }

  /// Feeds a chunk of socket bytes in, returning every event the chunk
  /// produced. Never blocks; an empty return just means "not enough
  /// bytes yet".
  pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ParserEvent>, CoreError> {
    let mut events = Vec::new();
    if !self.headers_done {
      self.header_buf.extend_from_slice(data);
      if let Some((consumed, mut head_events)) = self.try_parse_head()? {
        events.append(&mut head_events);
        self.headers_done = true;
        let leftover = self.header_buf.split_off(consumed);
        self.header_buf.clear();
        if self.upgrade {
          events.push(ParserEvent::PausedUpgrade);
          self.done = true;
          return Ok(events);
        }
        self.body_buf.extend_from_slice(&leftover);
        self.drain_body(&mut events)?;
      }
      return Ok(events);
    }

    self.body_buf.extend_from_slice(data);
    self.drain_body(&mut events)?;
    Ok(events)
  }

  /// Signals socket EOF; only meaningful for `BodyMode::UntilEof`
  /// responses (no `Content-Length`, no chunked encoding — spec §4.D
  /// governs only the `fetch` side of this case).
  pub fn finish_at_eof(&mut self) -> Vec<ParserEvent> {
    if matches!(self.body_mode, BodyMode::UntilEof) && !self.done {
      self.done = true;
      let mut events = Vec::new();
      if !self.body_buf.is_empty() {
        events.push(ParserEvent::Body(std::mem::take(&mut self.body_buf)));
      }
      events.push(ParserEvent::MessageComplete);
      return events;
    }
    Vec::new()
  }

  fn try_parse_head(&self) -> Result<Option<(usize, Vec<ParserEvent>)>, CoreError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    match self.kind {
      ParserKind::Request => {
        let mut req = httparse::Request::new(&mut header_storage);
        match req
          .parse(&self.header_buf)
          .map_err(|e| CoreError::HttpParseError(e.to_string()))?
        {
          httparse::Status::Partial => Ok(None),
          httparse::Status::Complete(consumed) => {
            let mut events = vec![ParserEvent::RequestLine {
              method: req.method.unwrap_or("GET").to_string(),
              target: req.path.unwrap_or("/").to_string(),
              version_minor: req.version.unwrap_or(1),
            }];
            let (content_length, chunked, upgrade) = push_headers(req.headers, &mut events);
            events.push(ParserEvent::HeadersComplete {
              content_length,
              chunked,
              upgrade,
            });
            Ok(Some((consumed, events)))
          }
        }
      }
      ParserKind::Response => {
        let mut resp = httparse::Response::new(&mut header_storage);
        match resp
          .parse(&self.header_buf)
          .map_err(|e| CoreError::HttpParseError(e.to_string()))?
        {
          httparse::Status::Partial => Ok(None),
          httparse::Status::Complete(consumed) => {
            let mut events = vec![ParserEvent::Status {
              code: resp.code.unwrap_or(0),
              reason: resp.reason.unwrap_or("").to_string(),
              version_minor: resp.version.unwrap_or(1),
            }];
            let (content_length, chunked, upgrade) = push_headers(resp.headers, &mut events);
            events.push(ParserEvent::HeadersComplete {
              content_length,
              chunked,
              upgrade,
            });
            Ok(Some((consumed, events)))
          }
        }
      }
    }
  }

  fn drain_body(&mut self, events: &mut Vec<ParserEvent>) -> Result<(), CoreError> {
    if self.body_mode == BodyMode::None {
      self.body_mode = self.classify_body_mode(events);
    }
    loop {
      match &mut self.body_mode {
        BodyMode::None | BodyMode::UntilEof => {
          if !self.body_buf.is_empty() {
            events.push(ParserEvent::Body(std::mem::take(&mut self.body_buf)));
          }
          break;
        }
        BodyMode::ContentLength(remaining) => {
          if *remaining == 0 {
            self.done = true;
            events.push(ParserEvent::MessageComplete);
            break;
          }
          if self.body_buf.is_empty() {
            break;
          }
          let take = (*remaining as usize).min(self.body_buf.len());
          let chunk: Vec<u8> = self.body_buf.drain(..take).collect();
          *remaining -= take as u64;
          events.push(ParserEvent::Body(chunk));
          if *remaining == 0 {
            self.done = true;
            events.push(ParserEvent::MessageComplete);
          }
          break;
        }
        BodyMode::Chunked(state) => {
          if !advance_chunked(state, &mut self.body_buf, events) {
            break;
          }
          if *state == ChunkState::Done {
            self.done = true;
            events.push(ParserEvent::MessageComplete);
            break;
          }
        }
      }
    }
    Ok(())
  }

  fn classify_body_mode(&self, events: &[ParserEvent]) -> BodyMode {
    for event in events {
      if let ParserEvent::HeadersComplete {
        content_length,
        chunked,
        ..
      } = event
      {
        if *chunked {
          return BodyMode::Chunked(ChunkState::Size);
        }
        if let Some(len) = content_length {
          return BodyMode::ContentLength(*len);
        }
        return match self.kind {
          ParserKind::Response => BodyMode::UntilEof,
          ParserKind::Request => BodyMode::ContentLength(0),
        };
      }
    }
    BodyMode::None
  }
}

fn push_headers(headers: &[httparse::Header], events: &mut Vec<ParserEvent>) -> (Option<u64>, bool, bool) {
  let mut content_length = None;
  let mut chunked = false;
  let mut upgrade = false;
  let mut connection_upgrade = false;
  for header in headers {
    let name = header.name.to_ascii_lowercase();
    let value = String::from_utf8_lossy(header.value).to_string();
    match name.as_str() {
      "content-length" => content_length = value.trim().parse::<u64>().ok(),
      "transfer-encoding" => {
        if value.to_ascii_lowercase().contains("chunked") {
          chunked = true;
        }
      }
      "upgrade" => upgrade = true,
      "connection" => {
        if value.to_ascii_lowercase().contains("upgrade") {
          connection_upgrade = true;
        }
      }
      _ => {}
    }
    events.push(ParserEvent::Header { name, value });
  }
  (content_length, chunked, upgrade && connection_upgrade)
}

/// Scans as much of `buf` as currently forms complete chunk framing,
/// pushing `Body`/advancing `state` in place. Returns whether any
/// progress was made (so the caller's loop can tell "need more bytes"
/// from "made progress, try again").
fn advance_chunked(state: &mut ChunkState, buf: &mut Vec<u8>, events: &mut Vec<ParserEvent>) -> bool {
  match state {
    ChunkState::Size => {
      let Some(pos) = find_crlf(buf) else { return false };
      let line = String::from_utf8_lossy(&buf[..pos]).to_string();
      let size_str = line.split(';').next().unwrap_or("").trim();
      let size = u64::from_str_radix(size_str, 16).unwrap_or(0);
      buf.drain(..pos + 2);
      *state = if size == 0 {
        ChunkState::Trailers
      } else {
        ChunkState::Data(size)
      };
      true
    }
    ChunkState::Data(remaining) => {
      if buf.is_empty() {
        return false;
      }
      let take = (*remaining as usize).min(buf.len());
      let chunk: Vec<u8> = buf.drain(..take).collect();
      *remaining -= take as u64;
      if !chunk.is_empty() {
        events.push(ParserEvent::Body(chunk));
      }
      if *remaining == 0 {
        *state = ChunkState::DataTrailingCrLf;
      }
      true
    }
    ChunkState::DataTrailingCrLf => {
      if buf.len() < 2 {
        return false;
      }
      buf.drain(..2);
      *state = ChunkState::Size;
      true
    }
    ChunkState::Trailers => {
      // No trailer header support: a bare `\r\n` is expected to close
      // the chunked body immediately after the zero-length chunk.
      let Some(pos) = find_crlf(buf) else { return false };
      buf.drain(..pos + 2);
      *state = ChunkState::Done;
      true
    }
    ChunkState::Done => false,
  }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
  buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_request_line_and_headers_in_one_feed() {
    let mut parser = Parser::new(ParserKind::Request);
    let events = parser
      .feed(b"GET /a HTTP/1.1\r\nHost: example.test\r\nContent-Length: 0\r\n\r\n")
      .unwrap();
    assert!(events.iter().any(|e| matches!(e, ParserEvent::RequestLine { method, target, .. } if method == "GET" && target == "/a")));
    assert!(events.contains(&ParserEvent::MessageComplete));
  }

  #[test]
  fn partial_head_returns_no_events_until_complete() {
    let mut parser = Parser::new(ParserKind::Request);
    let events = parser.feed(b"GET /a HTTP/1.1\r\nHost: ex").unwrap();
    assert!(events.is_empty());
    let events = parser.feed(b"ample.test\r\n\r\n").unwrap();
    assert!(events.contains(&ParserEvent::MessageComplete));
  }

  #[test]
  fn content_length_body_split_across_feeds() {
    let mut parser = Parser::new(ParserKind::Response);
    let events = parser
      .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel")
      .unwrap();
    assert!(!events.contains(&ParserEvent::MessageComplete));
    let events = parser.feed(b"lo").unwrap();
    let body: Vec<u8> = events
      .iter()
      .filter_map(|e| match e {
        ParserEvent::Body(b) => Some(b.clone()),
        _ => None,
      })
      .flatten()
      .collect();
    assert_eq!(body, b"lo");
    assert!(events.contains(&ParserEvent::MessageComplete));
  }

  #[test]
  fn chunked_body_reassembles_into_hello_world() {
    let mut parser = Parser::new(ParserKind::Response);
    let events = parser
      .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n")
      .unwrap();
    let body: Vec<u8> = events
      .iter()
      .filter_map(|e| match e {
        ParserEvent::Body(b) => Some(b.clone()),
        _ => None,
      })
      .flatten()
      .collect();
    assert_eq!(body, b"helloworld");
    assert!(events.contains(&ParserEvent::MessageComplete));
  }

  #[test]
  fn request_with_upgrade_header_pauses_before_body() {
    let mut parser = Parser::new(ParserKind::Request);
    let events = parser
      .feed(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
      .unwrap();
    assert!(events.contains(&ParserEvent::PausedUpgrade));
    assert!(parser.is_message_complete());
  }

  #[test]
  fn reset_allows_a_second_message_on_the_same_parser() {
    let mut parser = Parser::new(ParserKind::Request);
    let _ = parser
      .feed(b"GET /a HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
      .unwrap();
    assert!(parser.is_message_complete());
    parser.reset();
    let events = parser
      .feed(b"GET /b HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
      .unwrap();
    assert!(events.iter().any(|e| matches!(e, ParserEvent::RequestLine { target, .. } if target == "/b")));
  }
}
