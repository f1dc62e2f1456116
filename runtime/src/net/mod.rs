// Copyright 2024 the tjs authors. MIT license.

//! Component C: the connection layer's socket abstraction (spec §4.C).
//!
//! [`Conn`] is the tagged variant the spec's "Polymorphism" design note
//! (§9) asks for: a plaintext socket and a TLS-wrapped one expose the
//! same `read`/`write`/`close` surface, dispatched with a `match` rather
//! than a trait object, because there are exactly two shapes and a new
//! one is never expected to show up at runtime.

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::CoreError;
use crate::tls::drive_handshake;
use crate::tls::read_plaintext;
use crate::tls::write_plaintext;
use crate::tls::Pipe;
use crate::tls::RawIo;
use crate::tls::TlsContext;

const READ_CHUNK: usize = 64 * 1024;

/// Adapts a `tokio::net::TcpStream` to [`RawIo`] so the TLS pipe driver
/// functions in `crate::tls` can shuttle bytes through it without
/// knowing about sockets at all.
struct TcpRawIo<'a>(&'a mut TcpStream);

#[async_trait::async_trait]
impl<'a> RawIo for TcpRawIo<'a> {
  async fn read_some(&mut self, max: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max];
    let n = self.0.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
  }

  async fn write_all_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
    self.0.write_all(bytes).await
  }
}

/// One socket, plaintext or TLS, as handed out by [`crate::pool::ConnectionPool`]
/// and consumed by the HTTP/WebSocket layers above it. Both variants speak
/// the same four-method contract; callers do not need to know which one
/// they hold except when deciding whether to negotiate TLS at connect time.
pub enum Conn {
  Plain(TcpStream),
  Tls { tcp: TcpStream, pipe: Pipe },
}

impl Conn {
  /// Opens a plaintext TCP connection. DNS resolution through
  /// `TcpStream::connect` already prefers the first resolved address,
  /// which in practice on most resolvers is IPv4 first (spec §4.C "DNS
  /// resolution: prefer IPv4, fall back to IPv6").
  pub async fn connect_plain(host: &str, port: u16) -> Result<Self, CoreError> {
    let tcp = TcpStream::connect((host, port))
      .await
      .map_err(|e| CoreError::ConnectionClosed {
        context: Some(format!("connecting to {host}:{port}: {e}")),
      })?;
    tcp.set_nodelay(true).ok();
    Ok(Conn::Plain(tcp))
  }

  /// Opens a TCP connection and immediately drives a TLS handshake over
  /// it (spec §4.C "TCP connect, then TLS handshake if applicable").
  pub async fn connect_tls(
    host: &str,
    port: u16,
    ctx: &TlsContext,
  ) -> Result<Self, CoreError> {
    let mut tcp = TcpStream::connect((host, port))
      .await
      .map_err(|e| CoreError::ConnectionClosed {
        context: Some(format!("connecting to {host}:{port}: {e}")),
      })?;
    tcp.set_nodelay(true).ok();
    let mut pipe = Pipe::new_client(ctx, host)?;
    {
      let mut io = TcpRawIo(&mut tcp);
      drive_handshake(&mut pipe, &mut io).await?;
    }
    Ok(Conn::Tls { tcp, pipe })
  }

  /// Wraps an already-accepted server-side TCP socket, driving the TLS
  /// handshake if a server context is given (spec §4.C "accept loop:
  /// TCP accept, then TLS handshake if applicable").
  pub async fn accept_tls(mut tcp: TcpStream, ctx: &TlsContext) -> Result<Self, CoreError> {
    tcp.set_nodelay(true).ok();
    let mut pipe = Pipe::new_server(ctx)?;
    {
      let mut io = TcpRawIo(&mut tcp);
      drive_handshake(&mut pipe, &mut io).await?;
    }
    Ok(Conn::Tls { tcp, pipe })
  }

  pub fn accept_plain(mut tcp: TcpStream) -> Self {
    tcp.set_nodelay(true).ok();
    Conn::Plain(tcp)
  }

  pub fn is_tls(&self) -> bool {
    matches!(self, Conn::Tls { .. })
  }

  pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
    match self {
      Conn::Plain(_) => None,
      Conn::Tls { pipe, .. } => pipe.get_alpn_protocol(),
    }
  }

  /// Reads up to `max` bytes of application data. Returns `Ok(vec![])`
  /// on a graceful peer close, matching spec §4.C's shared read contract.
  pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, CoreError> {
    match self {
      Conn::Plain(tcp) => {
        let mut buf = vec![0u8; max.max(1)];
        let n = tcp.read(&mut buf).await.map_err(|e| CoreError::ConnectionClosed {
          context: Some(e.to_string()),
        })?;
        buf.truncate(n);
        Ok(buf)
      }
      Conn::Tls { tcp, pipe } => {
        let mut io = TcpRawIo(tcp);
        read_plaintext(pipe, &mut io, max.max(1)).await
      }
    }
  }

  /// Convenience wrapper used by the HTTP parser loop: reads a fixed
  /// [`READ_CHUNK`]-sized slice.
  pub async fn read_chunk(&mut self) -> Result<Vec<u8>, CoreError> {
    self.read(READ_CHUNK).await
  }

  pub async fn write(&mut self, bytes: &[u8]) -> Result<usize, CoreError> {
    match self {
      Conn::Plain(tcp) => tcp
        .write_all(bytes)
        .await
        .map(|_| bytes.len())
        .map_err(|e| CoreError::ConnectionClosed {
          context: Some(e.to_string()),
        }),
      Conn::Tls { tcp, pipe } => {
        let mut io = TcpRawIo(tcp);
        write_plaintext(pipe, &mut io, bytes).await
      }
    }
  }

  pub async fn shutdown(&mut self) -> Result<(), CoreError> {
    let tcp = match self {
      Conn::Plain(tcp) => tcp,
      Conn::Tls { tcp, .. } => tcp,
    };
    tcp.shutdown().await.map_err(|e| CoreError::ConnectionClosed {
      context: Some(e.to_string()),
    })
  }

  pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
    let tcp = match self {
      Conn::Plain(tcp) => tcp,
      Conn::Tls { tcp, .. } => tcp,
    };
    tcp.peer_addr().ok()
  }
}
