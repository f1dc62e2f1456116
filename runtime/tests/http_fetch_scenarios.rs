// Copyright 2024 the tjs authors. MIT license.

//! End-to-end coverage for the client fetch pipeline's concrete scenarios.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tjs_runtime::http::client::HttpClient;
use tjs_runtime::pool::ConnectionPool;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

async fn read_request_head(socket: &mut tokio::net::TcpStream) -> String {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 1024];
  loop {
    let n = socket.read(&mut chunk).await.unwrap();
    buf.extend_from_slice(&chunk[..n]);
    if buf.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
      break;
    }
  }
  String::from_utf8_lossy(&buf).into_owned()
}

/// Scenario 1 — GET with keep-alive reuse: one accepted connection serves
/// `/a` then `/b`, and the pool shows exactly one idle entry in between.
#[tokio::test]
async fn keep_alive_reuses_a_single_connection_across_two_fetches() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let accept_count = Arc::new(AtomicUsize::new(0));
  let accept_count_task = Arc::clone(&accept_count);

  tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    accept_count_task.fetch_add(1, Ordering::SeqCst);
    let _ = read_request_head(&mut socket).await;
    socket
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
      .await
      .unwrap();
    let _ = read_request_head(&mut socket).await;
    socket
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nworld")
      .await
      .unwrap();
  });

  let pool = ConnectionPool::new(6, 5_000, 5_000);
  let client = HttpClient::new(Arc::clone(&pool), false);

  let mut response_a = client
    .fetch(&format!("http://{addr}/a"), "GET", &[], None)
    .await
    .unwrap();
  let body_a = response_a.read_all_body().await.unwrap();
  assert_eq!(body_a, b"hello");

  let stats = pool.stats();
  let (_, bucket_stats) = stats.into_iter().next().expect("one pool bucket");
  assert_eq!(bucket_stats.idle, 1);
  assert_eq!(bucket_stats.active, 0);

  let mut response_b = client
    .fetch(&format!("http://{addr}/b"), "GET", &[], None)
    .await
    .unwrap();
  let body_b = response_b.read_all_body().await.unwrap();
  assert_eq!(body_b, b"world");

  assert_eq!(accept_count.load(Ordering::SeqCst), 1);
}

/// Scenario 2 — chunked streaming reassembles to `"helloworld"`.
#[tokio::test]
async fn chunked_response_streams_and_concatenates() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    let _ = read_request_head(&mut socket).await;
    socket
      .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n")
      .await
      .unwrap();
  });

  let pool = ConnectionPool::new(6, 5_000, 5_000);
  let client = HttpClient::new(pool, false);
  let mut response = client
    .fetch(&format!("http://{addr}/stream"), "GET", &[], None)
    .await
    .unwrap();

  let mut chunks = Vec::new();
  while let Some(chunk) = response.body_chunk().await.unwrap() {
    chunks.push(String::from_utf8(chunk).unwrap());
  }
  assert_eq!(chunks, vec!["hello".to_string(), "world".to_string()]);
}

/// Scenario 3 — a 302 redirect chain ends at the final URL with
/// `redirected == true`.
#[tokio::test]
async fn redirect_chain_follows_location_to_the_final_response() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  tokio::spawn(async move {
    // The redirected-from connection is released back to the pool, so the
    // follow-up request to `/final` reuses the same accepted socket.
    let (mut socket, _) = listener.accept().await.unwrap();
    let head = read_request_head(&mut socket).await;
    assert!(head.starts_with("GET /start"));
    socket
      .write_all(b"HTTP/1.1 302 Found\r\nLocation: /final\r\nContent-Length: 0\r\n\r\n")
      .await
      .unwrap();
    let head = read_request_head(&mut socket).await;
    assert!(head.starts_with("GET /final"));
    socket
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone")
      .await
      .unwrap();
  });

  let pool = ConnectionPool::new(6, 5_000, 5_000);
  let client = HttpClient::new(pool, false);
  let mut response = client
    .fetch(&format!("http://{addr}/start"), "GET", &[], None)
    .await
    .unwrap();

  assert!(response.redirected);
  assert!(response.final_url.path().ends_with("/final"));
  let body = response.read_all_body().await.unwrap();
  assert_eq!(body, b"done");
}
