// Copyright 2024 the tjs authors. MIT license.

//! The "lazy byte sequence" design note (spec §9): a pull-based body
//! producer with an explicit close signal, whose cancellation tears down
//! the Connection it was reading from rather than leaving it half-drained.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::http::parser::Parser;
use crate::http::parser::ParserEvent;
use crate::net::Conn;
use crate::pool::ConnectionPool;

/// What happens to the underlying connection once the body finishes or
/// is cancelled (spec §5 "A Connection is released only after its
/// response body is fully consumed or cancelled").
pub enum BodySink {
  /// Release back to the pool under this key when the body is done.
  Pool { pool: Arc<ConnectionPool>, key: crate::error::PoolKey },
  /// This body owns its connection outright (a `ServerConnection`'s
  /// request body, or an aborted fetch) — closing just shuts it down.
  Owned,
}

/// A finite, non-restartable sequence of byte chunks (spec §9 "Lazy byte
/// sequences"). `next_chunk` pulls exactly one more unit of progress:
/// either a chunk of already-buffered bytes, or one more network read.
pub struct BodyStream {
  conn: Option<Arc<Mutex<Conn>>>,
  sink: BodySink,
  /// Present for a body still being pulled out of the connection; `None`
  /// once parsing has completed or for an already-materialized body.
  parser: Option<Parser>,
  buffered: std::collections::VecDeque<Vec<u8>>,
  finished: bool,
  cancelled: bool,
}

impl BodyStream {
  /// A body whose bytes are still arriving over the wire: `parser` is
  /// the same parser instance that already produced the headers, left
  /// mid-message so body events keep landing on it (spec §4.D "a
  /// consumer may drain them and subscribe to future chunks").
  pub fn from_connection(
    conn: Arc<Mutex<Conn>>,
    sink: BodySink,
    parser: Parser,
    leftover_chunks: Vec<Vec<u8>>,
  ) -> Self {
    let finished = parser.is_message_complete();
    Self {
      conn: Some(conn),
      sink,
      parser: Some(parser),
      buffered: leftover_chunks.into(),
      finished,
      cancelled: false,
    }
  }

  /// A body with no further network pulls — e.g. Content-Length: 0, or
  /// a body already fully parsed out of the initial read.
  pub fn already_complete(chunks: Vec<Vec<u8>>) -> Self {
    Self {
      conn: None,
      sink: BodySink::Owned,
      parser: None,
      buffered: chunks.into(),
      finished: true,
      cancelled: false,
    }
  }

  pub fn push_chunk(&mut self, chunk: Vec<u8>) {
    if !chunk.is_empty() {
      self.buffered.push_back(chunk);
    }
  }

  pub fn mark_complete(&mut self) {
    self.finished = true;
  }

  pub fn is_done(&self) -> bool {
    self.finished && self.buffered.is_empty()
  }

  /// One pull: drains already-buffered bytes first; only reports `None`
  /// (stream end) once both the buffer is empty and the producer has
  /// signalled completion. The consumer governs rate (spec §5
  /// "Backpressure... the consumer governs rate").
  pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
    if self.cancelled {
      return None;
    }
    self.buffered.pop_front()
  }

  pub async fn collect_to_end(&mut self) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = self.pull().await.ok().flatten() {
      out.extend_from_slice(&chunk);
    }
    out
  }

  /// One pull: drains already-buffered bytes first; if the producer is
  /// still live, performs exactly one network read and feeds it to the
  /// parser before trying the buffer again. `Ok(None)` means the body is
  /// exhausted.
  pub async fn pull(&mut self) -> Result<Option<Vec<u8>>, CoreError> {
    if self.cancelled {
      return Ok(None);
    }
    loop {
      if let Some(chunk) = self.buffered.pop_front() {
        return Ok(Some(chunk));
      }
      if self.finished {
        return Ok(None);
      }
      let (Some(conn_arc), Some(parser)) = (self.conn.as_ref(), self.parser.as_mut()) else {
        self.finished = true;
        return Ok(None);
      };
      let chunk = {
        let mut conn = conn_arc.lock().await;
        conn.read_chunk().await?
      };
      let events = if chunk.is_empty() {
        parser.finish_at_eof()
      } else {
        parser.feed(&chunk)?
      };
      let mut saw_complete = chunk.is_empty();
      for event in events {
        match event {
          ParserEvent::Body(bytes) => self.push_chunk(bytes),
          ParserEvent::MessageComplete => saw_complete = true,
          _ => {}
        }
      }
      if saw_complete {
        self.finished = true;
      }
    }
  }

  /// Closing a `ReadableStream` backed by a response body cancels
  /// pulling and releases (or force-closes) the connection (spec §5
  /// "Cancellation").
  pub async fn cancel(&mut self) {
    if self.cancelled {
      return;
    }
    self.cancelled = true;
    self.buffered.clear();
    self.release_connection(/*force_close=*/ true).await;
  }

  /// Called once the producer marks the stream complete and the
  /// consumer has drained it; returns the connection to its pool (spec
  /// §3 "HTTP Response Context... releasing it returns the connection
  /// to its pool").
  pub async fn finalize(&mut self) {
    if self.is_done() {
      self.release_connection(/*force_close=*/ false).await;
    }
  }

  async fn release_connection(&mut self, force_close: bool) {
    let Some(conn_arc) = self.conn.take() else {
      return;
    };
    let Ok(conn) = Arc::try_unwrap(conn_arc) else {
      // Still referenced elsewhere (e.g. the parser loop holds a
      // clone while this finalize races it) — nothing to release yet.
      return;
    };
    let mut conn = conn.into_inner();
    if force_close {
      let _ = conn.shutdown().await;
      return;
    }
    match std::mem::replace(&mut self.sink, BodySink::Owned) {
      BodySink::Pool { pool, key } => {
        let pooled = crate::pool::PooledConnection {
          conn,
          state: crate::pool::ConnState::Active,
          last_used: std::time::Instant::now(),
          requests_served: 1,
          keep_alive: true,
        };
        pool.release(key, pooled).await;
      }
      BodySink::Owned => {
        let _ = conn.shutdown().await;
      }
    }
  }
}

/// Emits `<size-in-hex>\r\n<bytes>\r\n` for one chunk (spec §4.D
/// "Chunked encoding").
pub fn encode_chunk(bytes: &[u8]) -> Vec<u8> {
  let mut out = format!("{:x}\r\n", bytes.len()).into_bytes();
  out.extend_from_slice(bytes);
  out.extend_from_slice(b"\r\n");
  out
}

/// Emits the terminating `0\r\n\r\n`.
pub fn encode_chunked_end() -> &'static [u8] {
  b"0\r\n\r\n"
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn already_complete_drains_in_order_then_reports_done() {
    let mut stream = BodyStream::already_complete(vec![b"hello".to_vec(), b"world".to_vec()]);
    assert_eq!(stream.next_chunk(), Some(b"hello".to_vec()));
    assert_eq!(stream.next_chunk(), Some(b"world".to_vec()));
    assert_eq!(stream.next_chunk(), None);
    assert!(stream.is_done());
  }

  #[test]
  fn chunk_encoding_matches_the_scenario_2_wire_format() {
    let mut out = encode_chunk(b"hello");
    out.extend_from_slice(&encode_chunk(b"world"));
    out.extend_from_slice(encode_chunked_end());
    assert_eq!(out, b"5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n");
  }

  #[tokio::test]
  async fn cancel_clears_buffered_chunks() {
    let mut stream = BodyStream::already_complete(vec![b"hello".to_vec()]);
    stream.cancel().await;
    assert_eq!(stream.next_chunk(), None);
  }
}
