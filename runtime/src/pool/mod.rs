// Copyright 2024 the tjs authors. MIT license.

//! Component C: the client connection pool half of the connection layer
//! (spec §4.C "Client pool"). The server accept loop lives in
//! [`crate::server`]; this module only covers `acquire`/`release`/
//! `closeAll`/`stats`.
//!
//! Per spec §9 Open Questions, waiting callers are woken by a
//! [`tokio::sync::Notify`] fired on every `release`, not by a 100ms poll
//! loop — the "release-signal notifier" the spec calls the preferred
//! resolution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::sync::Notify;

use crate::error::CoreError;
use crate::error::PoolKey;
use crate::net::Conn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
  Connecting,
  Idle,
  Active,
  Closed,
}

/// A checked-out or idle-pooled socket plus the bookkeeping spec §3's
/// Connection data model calls for. `pendingCiphertext` lives inside
/// [`crate::tls::Pipe`] itself (owned by `conn` when it's a TLS
/// variant), so it isn't duplicated here.
pub struct PooledConnection {
  pub conn: Conn,
  pub state: ConnState,
  pub last_used: Instant,
  pub requests_served: u64,
  pub keep_alive: bool,
}

impl PooledConnection {
  fn fresh(conn: Conn) -> Self {
    Self {
      conn,
      state: ConnState::Active,
      last_used: Instant::now(),
      requests_served: 0,
      keep_alive: true,
    }
  }
}

struct Bucket {
  idle: Vec<PooledConnection>,
  active_count: usize,
}

impl Bucket {
  fn new() -> Self {
    Self {
      idle: Vec::new(),
      active_count: 0,
    }
  }

  fn size(&self) -> usize {
    self.idle.len() + self.active_count
  }
}

#[derive(Debug, Clone, Copy)]
pub struct BucketStats {
  pub idle: usize,
  pub active: usize,
}

/// `scheme://host:port → ordered list of Connections` (spec §3
/// "Connection Pool"). `maxSockets` bounds the total idle+active count
/// per key, never just the idle list.
pub struct ConnectionPool {
  buckets: Mutex<HashMap<PoolKey, Bucket>>,
  notify: Notify,
  max_sockets_per_pool: usize,
  acquire_timeout: Duration,
  idle_timeout: Duration,
}

impl ConnectionPool {
  pub fn new(max_sockets_per_pool: usize, acquire_timeout_ms: u64, idle_timeout_ms: u64) -> Arc<Self> {
    Arc::new(Self {
      buckets: Mutex::new(HashMap::new()),
      notify: Notify::new(),
      max_sockets_per_pool,
      acquire_timeout: Duration::from_millis(acquire_timeout_ms),
      idle_timeout: Duration::from_millis(idle_timeout_ms),
    })
  }

  /// Spec §4.C `acquire(cfg)`: reuse an IDLE connection if one exists,
  /// else open a new one while the bucket has headroom, else wait for a
  /// release (or `PoolTimeout`). `connect` is supplied by the caller
  /// because only the caller (the fetch pipeline) knows whether this
  /// key needs a TLS handshake and with which [`crate::tls::TlsContext`].
  pub async fn acquire<F, Fut>(
    self: &Arc<Self>,
    key: PoolKey,
    connect: F,
  ) -> Result<PooledConnection, CoreError>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Conn, CoreError>>,
  {
    let deadline = Instant::now() + self.acquire_timeout;
    loop {
      {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.clone()).or_insert_with(Bucket::new);
        bucket.idle.retain(|c| c.state != ConnState::Closed);

        if let Some(mut conn) = bucket.idle.pop() {
          conn.state = ConnState::Active;
          bucket.active_count += 1;
          return Ok(conn);
        }

        if bucket.size() < self.max_sockets_per_pool {
          // Reserve the slot before dropping the lock so a concurrent
          // acquire can't also see headroom and overrun `maxSockets`.
          bucket.active_count += 1;
          drop(buckets);
          return match connect().await {
            Ok(conn) => Ok(PooledConnection::fresh(conn)),
            Err(err) => {
              let mut buckets = self.buckets.lock().await;
              if let Some(bucket) = buckets.get_mut(&key) {
                bucket.active_count = bucket.active_count.saturating_sub(1);
              }
              drop(buckets);
              self.notify.notify_waiters();
              Err(err)
            }
          };
        }
      }

      let now = Instant::now();
      if now >= deadline {
        return Err(CoreError::PoolTimeout {
          pool_key: key.to_string(),
          timeout_ms: self.acquire_timeout.as_millis() as u64,
        });
      }
      let remaining = deadline - now;
      // `notified()` may spuriously return for an unrelated release; the
      // outer loop just re-checks the bucket, which is always correct.
      let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
    }
  }

  /// Spec §4.C `release(cfg, connection)`. A CLOSED connection is
  /// dropped outright; otherwise it's marked IDLE and, if `keep_alive`,
  /// an idle sweep is scheduled that will close it after
  /// `keepAliveIdleTimeout` of continued inactivity.
  pub async fn release(self: &Arc<Self>, key: PoolKey, mut conn: PooledConnection) {
    {
      let mut buckets = self.buckets.lock().await;
      let bucket = buckets.entry(key.clone()).or_insert_with(Bucket::new);
      bucket.active_count = bucket.active_count.saturating_sub(1);

      if conn.state == ConnState::Closed || !conn.keep_alive {
        drop(buckets);
        self.notify.notify_waiters();
        let _ = conn.conn.shutdown().await;
        return;
      }

      conn.state = ConnState::Idle;
      conn.last_used = Instant::now();
      bucket.idle.push(conn);
    }
    self.notify.notify_waiters();
    self.schedule_idle_sweep(key);
  }

  fn schedule_idle_sweep(self: &Arc<Self>, key: PoolKey) {
    let pool = Arc::clone(self);
    let idle_timeout = self.idle_timeout;
    tokio::spawn(async move {
      tokio::time::sleep(idle_timeout).await;
      pool.sweep_expired_idle(&key).await;
    });
  }

  async fn sweep_expired_idle(&self, key: &PoolKey) {
    let mut closed = Vec::new();
    {
      let mut buckets = self.buckets.lock().await;
      if let Some(bucket) = buckets.get_mut(key) {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        let (keep, expire): (Vec<_>, Vec<_>) = bucket
          .idle
          .drain(..)
          .partition(|c| now.duration_since(c.last_used) < idle_timeout);
        bucket.idle = keep;
        closed = expire;
      }
    }
    for mut conn in closed {
      conn.state = ConnState::Closed;
      let _ = conn.conn.shutdown().await;
    }
  }

  /// Spec §4.C `closeAll()`.
  pub async fn close_all(&self) {
    let mut buckets = self.buckets.lock().await;
    for (_, bucket) in buckets.drain() {
      for mut conn in bucket.idle {
        let _ = conn.conn.shutdown().await;
      }
    }
    self.notify.notify_waiters();
  }

  /// Spec §4.C `stats()`.
  pub async fn stats(&self) -> HashMap<PoolKey, BucketStats> {
    let buckets = self.buckets.lock().await;
    buckets
      .iter()
      .map(|(key, bucket)| {
        (
          key.clone(),
          BucketStats {
            idle: bucket.idle.len(),
            active: bucket.active_count,
          },
        )
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use tokio::io::AsyncWriteExt;
  use tokio::net::TcpListener;

  async fn loopback_conn() -> Conn {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
      let (mut sock, _) = listener.accept().await.unwrap();
      sock.write_all(b"hi").await.unwrap();
    });
    let conn = Conn::connect_plain(&addr.ip().to_string(), addr.port())
      .await
      .unwrap();
    accept.await.unwrap();
    conn
  }

  fn test_key() -> PoolKey {
    PoolKey {
      scheme: "http",
      host: "example.test".into(),
      port: 80,
    }
  }

  #[tokio::test]
  async fn acquire_reuses_released_connection_without_reconnecting() {
    let pool = ConnectionPool::new(6, 1000, 5000);
    let connect_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&connect_calls);
    let connect = move || {
      let calls = Arc::clone(&calls);
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(loopback_conn().await)
      }
    };

    let first = pool.acquire(test_key(), connect.clone()).await.unwrap();
    pool.release(test_key(), first).await;
    let _second = pool.acquire(test_key(), connect).await.unwrap();

    assert_eq!(connect_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn acquire_beyond_max_sockets_times_out() {
    let pool = ConnectionPool::new(1, 50, 5000);
    let connect = || async { Ok(loopback_conn().await) };

    let _held = pool.acquire(test_key(), connect).await.unwrap();
    let err = pool.acquire(test_key(), connect).await.unwrap_err();
    assert!(matches!(err, CoreError::PoolTimeout { .. }));
  }

  #[tokio::test]
  async fn stats_reflect_idle_and_active_counts() {
    let pool = ConnectionPool::new(6, 1000, 5000);
    let connect = || async { Ok(loopback_conn().await) };

    let a = pool.acquire(test_key(), connect).await.unwrap();
    let b = pool.acquire(test_key(), connect).await.unwrap();
    pool.release(test_key(), a).await;

    let stats = pool.stats().await;
    let bucket = stats.get(&test_key()).unwrap();
    assert_eq!(bucket.idle, 1);
    assert_eq!(bucket.active, 1);
    drop(b);
  }

  #[tokio::test]
  async fn a_non_keep_alive_release_does_not_repool_the_connection() {
    let pool = ConnectionPool::new(6, 1000, 5000);
    let mut conn = pool
      .acquire(test_key(), || async { Ok(loopback_conn().await) })
      .await
      .unwrap();
    conn.keep_alive = false;
    pool.release(test_key(), conn).await;

    let stats = pool.stats().await;
    let bucket = stats.get(&test_key()).unwrap();
    assert_eq!(bucket.idle, 0);
    assert_eq!(bucket.active, 0);
  }
}
