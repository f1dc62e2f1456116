// Copyright 2024 the tjs authors. MIT license.

//! End-to-end coverage for the WebSocket codec's concrete scenarios: a
//! fragmented echo round trip and a clean close handshake, each driven
//! from the client side through [`WebSocket`] against a minimal raw-frame
//! peer on the other end of a loopback socket.

use std::sync::Arc;
use std::time::Duration;

use tjs_runtime::net::Conn;
use tjs_runtime::ws::accept_key;
use tjs_runtime::ws::build_frame;
use tjs_runtime::ws::generate_client_key;
use tjs_runtime::ws::parse_frame;
use tjs_runtime::ws::Frame;
use tjs_runtime::ws::MessageData;
use tjs_runtime::ws::Opcode;
use tjs_runtime::ws::Role;
use tjs_runtime::ws::WebSocket;
use tjs_runtime::ws::WsEvent;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

async fn read_http_head(socket: &mut TcpStream) -> String {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 1024];
  loop {
    let n = socket.read(&mut chunk).await.unwrap();
    buf.extend_from_slice(&chunk[..n]);
    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
      break;
    }
  }
  String::from_utf8_lossy(&buf).into_owned()
}

fn extract_header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
  head.lines().find_map(|line| {
    let (k, v) = line.split_once(':')?;
    k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
  })
}

/// Performs the client side of the upgrade handshake by hand (there is
/// no `connect` helper for the WebSocket client role; only the server
/// side is wired up via `upgrade_server_websocket`) and hands back the
/// raw socket ready to be wrapped in a [`Conn`].
async fn client_handshake(addr: std::net::SocketAddr) -> TcpStream {
  let mut socket = TcpStream::connect(addr).await.unwrap();
  let key = generate_client_key();
  let request = format!(
    "GET /chat HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n\r\n"
  );
  socket.write_all(request.as_bytes()).await.unwrap();
  let response_head = read_http_head(&mut socket).await;
  assert!(response_head.starts_with("HTTP/1.1 101"));
  let accept = extract_header(&response_head, "Sec-WebSocket-Accept").unwrap();
  assert_eq!(accept, accept_key(&key));
  socket
}

fn respond_101(key: &str) -> String {
  format!(
    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
    accept_key(key)
  )
}

/// Scenario 4 — WebSocket echo with fragmentation: a client sends a
/// TEXT/FIN=0 fragment "foo" then a CONTINUATION/FIN=1 fragment "bar"
/// straight onto the wire (bypassing `send_text`, which only ever emits
/// single-frame FIN=1 messages); a raw-frame echo peer mirrors each
/// frame back unmasked, and the client's own [`WebSocket::run`]
/// reassembles the two fragments into one `"foobar"` message event.
#[tokio::test]
async fn fragmented_message_is_echoed_and_reassembled_into_one_event() {
  // `WebSocket` holds `?Send` listener closures, so it must be driven
  // from inside a `LocalSet` via `spawn_local`, same as the server's
  // own connection loop.
  let local = tokio::task::LocalSet::new();
  local
    .run_until(async {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      let addr = listener.local_addr().unwrap();

      tokio::task::spawn_local(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_http_head(&mut socket).await;
        let key = extract_header(&head, "Sec-WebSocket-Key").unwrap().to_string();
        socket.write_all(respond_101(&key).as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let mut received_frames = 0;
        while received_frames < 2 {
          let mut chunk = [0u8; 1024];
          let n = socket.read(&mut chunk).await.unwrap();
          buf.extend_from_slice(&chunk[..n]);
          while let Some((frame, consumed)) = parse_frame(&buf, true).unwrap() {
            buf.drain(..consumed);
            received_frames += 1;
            // Server-to-client frames are never masked (RFC 6455).
            let wire = build_frame(&frame, false);
            socket.write_all(&wire).await.unwrap();
          }
        }
      });

      let socket = client_handshake(addr).await;
      let conn = Arc::new(Mutex::new(Conn::accept_plain(socket)));
      let conn_for_writes = Arc::clone(&conn);

      let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
      let mut ws = WebSocket::new(conn, Role::Client, None);
      ws.on("message", move |event| {
        if let WsEvent::Message(MessageData::Text(text)) = event {
          let _ = tx.send(text.clone());
        }
      });
      tokio::task::spawn_local(async move {
        let _ = ws.run().await;
      });

      let first = build_frame(
        &Frame {
          fin: false,
          opcode: Opcode::Text,
          payload: b"foo".to_vec(),
        },
        true,
      );
      let second = build_frame(
        &Frame {
          fin: true,
          opcode: Opcode::Continuation,
          payload: b"bar".to_vec(),
        },
        true,
      );
      conn_for_writes.lock().await.write(&first).await.unwrap();
      conn_for_writes.lock().await.write(&second).await.unwrap();

      let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("reassembled message within timeout")
        .expect("channel not closed");
      assert_eq!(received, "foobar");
    })
    .await;
}

/// Scenario 5 — close handshake: the client calls `close(1000, "bye")`,
/// the peer echoes a CLOSE frame, and the close event reports
/// `{code: 1000, reason: "bye", was_clean: true}`.
#[tokio::test]
async fn close_handshake_completes_cleanly_when_peer_echoes() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    let head = read_http_head(&mut socket).await;
    let key = extract_header(&head, "Sec-WebSocket-Key").unwrap().to_string();
    socket.write_all(respond_101(&key).as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    loop {
      let mut chunk = [0u8; 1024];
      let n = socket.read(&mut chunk).await.unwrap();
      if n == 0 {
        break;
      }
      buf.extend_from_slice(&chunk[..n]);
      if let Some((frame, consumed)) = parse_frame(&buf, true).unwrap() {
        buf.drain(..consumed);
        if frame.opcode == Opcode::Close {
          let wire = build_frame(&frame, false);
          socket.write_all(&wire).await.unwrap();
          break;
        }
      }
    }
  });

  let socket = client_handshake(addr).await;
  let conn = Arc::new(Mutex::new(Conn::accept_plain(socket)));
  let mut ws = WebSocket::new(conn, Role::Client, None);

  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  ws.on("close", move |event| {
    if let WsEvent::Close { code, reason, was_clean } = event {
      let _ = tx.send((*code, reason.clone(), *was_clean));
    }
  });

  ws.close(1000, "bye").await.unwrap();

  let (code, reason, was_clean) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
    .await
    .expect("close event within timeout")
    .expect("channel not closed");
  assert_eq!(code, 1000);
  assert_eq!(reason, "bye");
  assert!(was_clean);
  assert_eq!(ws.ready_state(), tjs_runtime::ws::ReadyState::Closed);
}
