// Copyright 2024 the tjs authors. MIT license.

//! Component C: the server-side accept loop (spec §4.C "Server accept
//! loop"). The client pool lives in [`crate::pool`]; this module is
//! `Deno.serve`'s plumbing — listen, accept, TLS handshake if
//! configured, then the per-connection request loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::http::parser::Parser;
use crate::http::parser::ParserKind;
use crate::http::server::serve_one_request;
use crate::http::server::Handler;
use crate::http::server::RequestOutcome;
use crate::net::Conn;
use crate::tls::TlsContext;

pub struct ServeOptions {
  pub addr: SocketAddr,
  pub tls: Option<TlsContext>,
  pub request_timeout_ms: u64,
  pub keep_alive_timeout_ms: u64,
  pub max_requests_per_connection: u64,
}

/// Listens on `opts.addr` and runs `handler` against every accepted
/// connection until the listener errors. Must run inside a
/// `tokio::task::LocalSet` since `Handler` is `?Send` (spec §5
/// "Single-threaded, cooperative").
pub async fn serve<H>(opts: ServeOptions, handler: Arc<H>) -> Result<(), CoreError>
where
  H: Handler + 'static,
{
  let listener = TcpListener::bind(opts.addr)
    .await
    .map_err(|e| CoreError::ConnectionClosed {
      context: Some(format!("binding {}: {e}", opts.addr)),
    })?;

  let request_timeout = Duration::from_millis(opts.request_timeout_ms);
  let keep_alive_timeout = Duration::from_millis(opts.keep_alive_timeout_ms);
  let max_requests = opts.max_requests_per_connection;

  loop {
    let (tcp, _peer) = listener
      .accept()
      .await
      .map_err(|e| CoreError::ConnectionClosed {
        context: Some(format!("accept: {e}")),
      })?;
    let handler = Arc::clone(&handler);
    let tls = opts.tls.clone();
    tokio::task::spawn_local(async move {
      if let Err(err) = handle_connection(tcp, tls, handler, request_timeout, keep_alive_timeout, max_requests).await {
        log::debug!("connection ended: {err}");
      }
    });
  }
}

/// One accepted socket's lifetime: HANDSHAKING (TLS only) → repeated
/// PARSING/RESPONDING → CLOSED, or UPGRADING/UPGRADED if a handler
/// upgrades (spec §4.C "Server accept loop").
async fn handle_connection<H: Handler>(
  tcp: TcpStream,
  tls: Option<TlsContext>,
  handler: Arc<H>,
  request_timeout: Duration,
  keep_alive_timeout: Duration,
  max_requests: u64,
) -> Result<(), CoreError> {
  let conn = match tls {
    Some(ctx) => Conn::accept_tls(tcp, &ctx).await?,
    None => Conn::accept_plain(tcp),
  };
  let conn = Arc::new(Mutex::new(conn));
  let mut parser = Parser::new(ParserKind::Request);
  let mut requests_served = 0u64;

  loop {
    if requests_served >= max_requests {
      break;
    }

    let attempt_fut = serve_one_request(Arc::clone(&conn), &mut parser, handler.as_ref(), requests_served);
    let bounded = tokio::time::timeout(request_timeout, attempt_fut);
    let outcome = if requests_served == 0 {
      bounded.await
    } else {
      // The wait for the *next* request on a kept-alive connection is
      // governed by `keepAliveTimeout`, layered outside the per-request
      // `requestTimeout` (spec §4.C "await the next request with an
      // idle timeout (keepAliveTimeout)").
      match tokio::time::timeout(keep_alive_timeout, bounded).await {
        Ok(inner) => inner,
        Err(_) => break,
      }
    };

    let outcome = match outcome {
      Ok(result) => result,
      Err(_elapsed) => {
        break;
      }
    };

    match outcome {
      Ok(RequestOutcome::KeepAlive) => {
        requests_served += 1;
      }
      Ok(RequestOutcome::Close) => break,
      Ok(RequestOutcome::Upgraded) => return Ok(()),
      Err(_err) => break,
    }
  }

  let mut guard = conn.lock().await;
  let _ = guard.shutdown().await;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::server::ResponseWriter;
  use crate::http::server::ServerRequest;
  use async_trait::async_trait;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use tokio::io::AsyncReadExt;
  use tokio::io::AsyncWriteExt;

  struct EchoPathHandler {
    calls: AtomicUsize,
  }

  #[async_trait(?Send)]
  impl Handler for EchoPathHandler {
    async fn handle(&self, req: ServerRequest, res: &mut ResponseWriter) -> Result<RequestOutcome, CoreError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      res.end(Some(req.target.as_bytes())).await?;
      Ok(RequestOutcome::KeepAlive)
    }
  }

  #[tokio::test]
  async fn keep_alive_serves_two_requests_on_one_connection() {
    let local = tokio::task::LocalSet::new();
    local
      .run_until(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handler = Arc::new(EchoPathHandler { calls: AtomicUsize::new(0) });
        let handler_for_serve = Arc::clone(&handler);
        let opts = ServeOptions {
          addr,
          tls: None,
          request_timeout_ms: 2_000,
          keep_alive_timeout_ms: 2_000,
          max_requests_per_connection: 1_000,
        };
        tokio::task::spawn_local(async move {
          let _ = serve(opts, handler_for_serve).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /a HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).ends_with("/a"));

        client.write_all(b"GET /b HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).ends_with("/b"));

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
      })
      .await;
  }
}
