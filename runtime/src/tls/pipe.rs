// Copyright 2024 the tjs authors. MIT license.

use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use rustls::ClientConnection;
use rustls::ServerConnection;

use crate::error::CoreError;
use crate::tls::context::TlsContext;

enum Inner {
  Client(ClientConnection),
  Server(ServerConnection),
}

/// The record-oriented TLS engine named in spec §4.B: `feed`, `read`,
/// `write`, `getOutput`, `handshake`, and a completion flag, built
/// directly on `rustls`'s sans-I/O `Connection` types. Every method here
/// is pure in-memory buffer shuffling; socket I/O is the caller's job
/// (see [`crate::net::Conn`] and [`drive_handshake`]/[`read_plaintext`]/
/// [`write_plaintext`] below, which implement the actual read/write
/// loops against a socket).
pub struct Pipe {
  inner: Inner,
  /// Bytes `feed` could not hand to the engine on the last call (spec
  /// §3 "pending-ciphertext buffer"), retried before any new bytes are
  /// read from the socket.
  pending_ciphertext: Vec<u8>,
}

impl Pipe {
  pub fn new_client(ctx: &TlsContext, server_name: &str) -> Result<Self, CoreError> {
    let TlsContext::Client(config) = ctx else {
      return Err(CoreError::TlsHandshakeFailed(
        "expected a client TlsContext".into(),
      ));
    };
    let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
      .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
    let conn = ClientConnection::new(Arc::clone(config), name)
      .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
    Ok(Self {
      inner: Inner::Client(conn),
      pending_ciphertext: Vec::new(),
    })
  }

  pub fn new_server(ctx: &TlsContext) -> Result<Self, CoreError> {
    let TlsContext::Server(config) = ctx else {
      return Err(CoreError::TlsHandshakeFailed(
        "expected a server TlsContext".into(),
      ));
    };
    let conn = ServerConnection::new(Arc::clone(config))
      .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
    Ok(Self {
      inner: Inner::Server(conn),
      pending_ciphertext: Vec::new(),
    })
  }

  pub fn handshake_complete(&self) -> bool {
    match &self.inner {
      Inner::Client(c) => !c.is_handshaking(),
      Inner::Server(c) => !c.is_handshaking(),
    }
  }

  pub fn wants_write(&self) -> bool {
    match &self.inner {
      Inner::Client(c) => c.wants_write(),
      Inner::Server(c) => c.wants_write(),
    }
  }

  pub fn wants_read(&self) -> bool {
    match &self.inner {
      Inner::Client(c) => c.wants_read(),
      Inner::Server(c) => c.wants_read(),
    }
  }

  pub fn get_alpn_protocol(&self) -> Option<Vec<u8>> {
    match &self.inner {
      Inner::Client(c) => c.alpn_protocol().map(|p| p.to_vec()),
      Inner::Server(c) => c.alpn_protocol().map(|p| p.to_vec()),
    }
  }

  /// `feed(bytes) → consumed ∈ [0, n]` (spec §4.B protocol contract).
  /// `rustls::read_tls` itself only consumes as much of the offered
  /// slice as it has buffer space for and reports exactly how much via
  /// its cursor position — the caller is responsible for retaining the
  /// unconsumed suffix, which is what [`read_plaintext`] below does via
  /// `pending_ciphertext`.
  pub fn feed(&mut self, bytes: &[u8]) -> Result<usize, CoreError> {
    let mut cursor = Cursor::new(bytes);
    let consumed = match &mut self.inner {
      Inner::Client(c) => c.read_tls(&mut cursor),
      Inner::Server(c) => c.read_tls(&mut cursor),
    }
    .map_err(|e| CoreError::TlsProgressFailed(e.to_string()))?;
    let process_result = match &mut self.inner {
      Inner::Client(c) => c.process_new_packets().map(|_| ()),
      Inner::Server(c) => c.process_new_packets().map(|_| ()),
    };
    process_result.map_err(|e| CoreError::TlsProgressFailed(e.to_string()))?;
    Ok(consumed)
  }

  /// `read(max) → plaintext bytes or empty`. Returns `Ok(vec![])` when no
  /// complete plaintext record is currently buffered; distinguishing
  /// "nothing yet" from "peer EOF" is the caller's job (it only calls
  /// `read` after `feed` has run, and treats socket EOF separately — see
  /// [`read_plaintext`]).
  pub fn read(&mut self, max: usize) -> Result<Vec<u8>, CoreError> {
    let mut buf = vec![0u8; max];
    let reader_result = match &mut self.inner {
      Inner::Client(c) => c.reader().read(&mut buf),
      Inner::Server(c) => c.reader().read(&mut buf),
    };
    match reader_result {
      Ok(n) => {
        buf.truncate(n);
        Ok(buf)
      }
      // `WouldBlock` is rustls's signal for "no plaintext buffered yet",
      // which this contract represents as an empty read rather than an
      // error.
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
      Err(e) => Err(CoreError::TlsProgressFailed(e.to_string())),
    }
  }

  /// `write(plaintext) → accepted`.
  pub fn write(&mut self, plaintext: &[u8]) -> Result<usize, CoreError> {
    match &mut self.inner {
      Inner::Client(c) => c.writer().write(plaintext),
      Inner::Server(c) => c.writer().write(plaintext),
    }
    .map_err(|e| CoreError::TlsProgressFailed(e.to_string()))
  }

  /// `getOutput() → pending ciphertext to transmit`.
  pub fn get_output(&mut self) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::new();
    loop {
      if !self.wants_write() {
        break;
      }
      let n = match &mut self.inner {
        Inner::Client(c) => c.write_tls(&mut out),
        Inner::Server(c) => c.write_tls(&mut out),
      }
      .map_err(|e| CoreError::TlsProgressFailed(e.to_string()))?;
      if n == 0 {
        break;
      }
    }
    Ok(out)
  }

  /// Steps the handshake state machine one tick. Paired with
  /// [`get_output`]/`feed` by [`drive_handshake`] to implement spec
  /// §4.B "Handshake".
  pub fn handshake_step(&mut self) -> Result<(), CoreError> {
    // `process_new_packets` (called from `feed`) is what actually
    // advances rustls's internal handshake state machine; this method
    // exists to give the driver loop an explicit "step" to call even
    // before any bytes have arrived, matching the spec's four-part loop.
    let result = match &mut self.inner {
      Inner::Client(c) => c.process_new_packets().map(|_| ()),
      Inner::Server(c) => c.process_new_packets().map(|_| ()),
    };
    result.map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))
  }

  pub(crate) fn take_pending_ciphertext(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.pending_ciphertext)
  }

  pub(crate) fn set_pending_ciphertext(&mut self, bytes: Vec<u8>) {
    self.pending_ciphertext = bytes;
  }
}

/// An abstract byte-stream half of a socket: exactly the
/// `read(n)`/`write(bytes)` contract spec §4.C calls out as shared
/// between the plaintext and TLS connection variants.
#[async_trait::async_trait]
pub trait RawIo {
  async fn read_some(&mut self, max: usize) -> std::io::Result<Vec<u8>>;
  async fn write_all_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

/// Drives the handshake to completion against `io` (spec §4.B
/// "Handshake"): step, drain output to the socket, read ciphertext and
/// feed it (looping on short `feed` returns), repeat. Fails with
/// `TlsHandshakeFailed` if the socket reaches EOF first.
pub async fn drive_handshake(pipe: &mut Pipe, io: &mut dyn RawIo) -> Result<(), CoreError> {
  const READ_CHUNK: usize = 16 * 1024;
  while !pipe.handshake_complete() {
    pipe.handshake_step()?;
    let output = pipe.get_output()?;
    if !output.is_empty() {
      io.write_all_bytes(&output)
        .await
        .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
    }
    if pipe.handshake_complete() {
      break;
    }
    let ciphertext = io
      .read_some(READ_CHUNK)
      .await
      .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
    if ciphertext.is_empty() {
      return Err(CoreError::TlsHandshakeFailed(
        "peer closed the connection before the handshake completed".into(),
      ));
    }
    let mut offset = 0;
    while offset < ciphertext.len() {
      let consumed = pipe.feed(&ciphertext[offset..])?;
      if consumed == 0 {
        // The engine is not ready for more ciphertext this tick; stash
        // the remainder and let the next loop iteration's `feed` retry
        // it once internal buffers drain (spec §4.B step 3).
        pipe.set_pending_ciphertext(ciphertext[offset..].to_vec());
        break;
      }
      offset += consumed;
    }
  }
  Ok(())
}

/// Steady-state plaintext read (spec §4.B "Steady-state read"): drain
/// buffered plaintext first, then retry any pending ciphertext, then
/// pull more ciphertext from the socket. Returns `Ok(vec![])` only on
/// socket EOF.
pub async fn read_plaintext(
  pipe: &mut Pipe,
  io: &mut dyn RawIo,
  max: usize,
) -> Result<Vec<u8>, CoreError> {
  let buffered = pipe.read(max)?;
  if !buffered.is_empty() {
    return Ok(buffered);
  }

  let pending = pipe.take_pending_ciphertext();
  if !pending.is_empty() {
    feed_fully_or_stash(pipe, &pending)?;
    let buffered = pipe.read(max)?;
    if !buffered.is_empty() {
      return Ok(buffered);
    }
  }

  loop {
    let ciphertext = io
      .read_some(16 * 1024)
      .await
      .map_err(|e| CoreError::ConnectionClosed {
        context: Some(e.to_string()),
      })?;
    if ciphertext.is_empty() {
      return Ok(Vec::new());
    }
    feed_fully_or_stash(pipe, &ciphertext)?;
    let buffered = pipe.read(max)?;
    if !buffered.is_empty() {
      return Ok(buffered);
    }
  }
}

fn feed_fully_or_stash(pipe: &mut Pipe, bytes: &[u8]) -> Result<(), CoreError> {
  let mut offset = 0;
  while offset < bytes.len() {
    let consumed = pipe.feed(&bytes[offset..])?;
    if consumed == 0 {
      pipe.set_pending_ciphertext(bytes[offset..].to_vec());
      return Ok(());
    }
    offset += consumed;
  }
  Ok(())
}

/// Steady-state plaintext write (spec §4.B "Steady-state write"): accept
/// into the engine, then fully drain `getOutput()` to the socket before
/// resolving.
pub async fn write_plaintext(
  pipe: &mut Pipe,
  io: &mut dyn RawIo,
  plaintext: &[u8],
) -> Result<usize, CoreError> {
  let accepted = pipe.write(plaintext)?;
  let output = pipe.get_output()?;
  if !output.is_empty() {
    io.write_all_bytes(&output)
      .await
      .map_err(|e| CoreError::TlsProgressFailed(e.to_string()))?;
  }
  Ok(accepted)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tls::context::TlsContextOptions;
  use crate::tls::context::TlsMode;

  fn client_ctx() -> TlsContext {
    TlsContext::build(TlsContextOptions {
      mode: TlsMode::Client,
      verify: false,
      ..Default::default()
    })
    .unwrap()
  }

  #[test]
  fn new_client_rejects_a_server_context() {
    let ctx = TlsContext::build(TlsContextOptions {
      mode: TlsMode::Client,
      ..Default::default()
    })
    .unwrap();
    // A `Server` context handed to `new_client` (or vice versa) is a
    // caller bug, not a protocol error, so this should fail fast
    // rather than silently building the wrong connection type.
    let err = Pipe::new_server(&ctx).unwrap_err();
    assert!(matches!(err, CoreError::TlsHandshakeFailed(_)));
  }

  #[test]
  fn fresh_client_pipe_is_handshaking_and_wants_to_write_first() {
    let pipe = Pipe::new_client(&client_ctx(), "localhost").unwrap();
    assert!(!pipe.handshake_complete());
    // A client always speaks first: ClientHello is queued before any
    // bytes have been fed in.
    assert!(pipe.wants_write());
  }

  #[test]
  fn client_hello_is_available_from_get_output_before_any_feed() {
    let mut pipe = Pipe::new_client(&client_ctx(), "localhost").unwrap();
    let output = pipe.get_output().unwrap();
    assert!(!output.is_empty());
    assert!(!pipe.wants_write());
  }

  #[test]
  fn pending_ciphertext_roundtrips() {
    let mut pipe = Pipe::new_client(&client_ctx(), "localhost").unwrap();
    assert!(pipe.take_pending_ciphertext().is_empty());
    pipe.set_pending_ciphertext(vec![1, 2, 3]);
    assert_eq!(pipe.take_pending_ciphertext(), vec![1, 2, 3]);
    // Taking drains it; a second take sees nothing left behind.
    assert!(pipe.take_pending_ciphertext().is_empty());
  }

  #[test]
  fn feeding_garbage_after_client_hello_fails_progress() {
    let mut pipe = Pipe::new_client(&client_ctx(), "localhost").unwrap();
    let _ = pipe.get_output().unwrap();
    let err = pipe.feed(&[0u8; 64]).unwrap_err();
    assert!(matches!(err, CoreError::TlsProgressFailed(_)));
  }
}
