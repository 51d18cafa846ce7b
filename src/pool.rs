//! A bounded pool of connections to one endpoint: idle FIFO, in-use count,
//! and a capacity semaphore (§3 "Pool", §4.4).

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::connection::{ConnectOptions, Connection};
use crate::error::{RedisCoreError, Result};
use crate::transport::{TcpOptions, Transport};

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Connection>> + Send>>;

/// Builds a brand new [`Connection`] when a pool's idle FIFO is empty and
/// capacity allows growth.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> ConnectFuture;
}

/// The common case: one fixed TCP endpoint and a fixed set of handshake
/// options, used for a standalone pool or one cluster node's pool.
#[derive(Clone)]
pub struct TcpConnectionFactory {
    pub addr: SocketAddr,
    pub tcp_options: TcpOptions,
    pub connect_options: ConnectOptions,
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(&self) -> ConnectFuture {
        let addr = self.addr;
        let tcp_options = self.tcp_options;
        let connect_options = self.connect_options.clone();
        Box::pin(async move {
            let transport = Transport::connect_tcp(addr, connect_options.connect_timeout, tcp_options).await?;
            Connection::connect(transport, &connect_options).await
        })
    }
}

/// Pool sizing knobs (a slice of the full `Config` in §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolConfig {
    pub max_connections: Option<usize>,
    pub wait_timeout: Option<Duration>,
}

struct PoolState {
    idle: VecDeque<Connection>,
    in_use: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    semaphore: Option<Arc<Semaphore>>,
    wait_timeout: Option<Duration>,
    closed: AtomicBool,
    connector: Box<dyn ConnectionFactory>,
}

/// A bounded pool of connections to one endpoint. Cheap to clone — clones
/// share the same underlying state (§3 "Pool").
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(connector: impl ConnectionFactory + 'static, config: PoolConfig) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState { idle: VecDeque::new(), in_use: 0 }),
                semaphore: config.max_connections.map(|n| Arc::new(Semaphore::new(n))),
                wait_timeout: config.wait_timeout,
                closed: AtomicBool::new(false),
                connector: Box::new(connector),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the idle FIFO length. Best-effort: never blocks on the
    /// state mutex, so a contended pool may report a momentarily stale count.
    pub async fn idle_count(&self) -> usize {
        self.inner.state.lock().await.idle.len()
    }

    pub async fn in_use_count(&self) -> usize {
        self.inner.state.lock().await.in_use
    }

    /// Pops the first healthy idle connection, skipping (and destroying)
    /// closed entries; constructs a new connection if none are usable and
    /// capacity allows it; otherwise waits on the capacity semaphore up to
    /// `wait_timeout` before failing with `PoolExhausted` (§4.4).
    pub async fn take(&self) -> Result<Connection> {
        if self.is_closed() {
            return Err(RedisCoreError::PoolExhausted);
        }

        loop {
            let mut state = self.inner.state.lock().await;
            while let Some(conn) = state.idle.pop_front() {
                if conn.is_closed() {
                    drop(state);
                    self.return_permit();
                    state = self.inner.state.lock().await;
                    continue;
                }
                state.in_use += 1;
                return Ok(conn);
            }
            drop(state);

            let permit = match &self.inner.semaphore {
                Some(sem) => Some(self.acquire_permit(sem.clone()).await?),
                None => None,
            };

            return match self.inner.connector.connect().await {
                Ok(conn) => {
                    // The permit now belongs to this connection for its
                    // entire lifetime; it is returned only when the
                    // connection is destroyed, via `return_permit`.
                    if let Some(p) = permit {
                        std::mem::forget(p);
                    }
                    let mut state = self.inner.state.lock().await;
                    state.in_use += 1;
                    debug!(peer = ?conn.peer_addr(), "opened new pooled connection");
                    Ok(conn)
                }
                Err(e) => Err(e), // `permit`, if any, is dropped here and returned to the semaphore
            };
        }
    }

    async fn acquire_permit(&self, sem: Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
        let acquire = sem.acquire_owned();
        let permit = match self.inner.wait_timeout {
            Some(d) => tokio::time::timeout(d, acquire).await.map_err(|_| RedisCoreError::PoolExhausted)?,
            None => acquire.await,
        };
        permit.map_err(|_| RedisCoreError::PoolExhausted)
    }

    fn return_permit(&self) {
        if let Some(sem) = &self.inner.semaphore {
            sem.add_permits(1);
        }
    }

    /// Returns a connection to the pool. A connection left mid-`MULTI` is
    /// discarded with a best-effort `DISCARD` first (I4); a connection that
    /// observed an error, or a pool that has since been closed, destroys the
    /// connection and returns its capacity permit instead of requeueing it.
    pub async fn release(&self, mut conn: Connection) {
        conn.discard_pending_transaction().await;
        let destroy = conn.is_closed() || self.is_closed();
        trace!(peer = ?conn.peer_addr(), destroy, "release");

        let mut state = self.inner.state.lock().await;
        state.in_use = state.in_use.saturating_sub(1);
        if destroy {
            drop(state);
            drop(conn);
            self.return_permit();
        } else {
            state.idle.push_back(conn);
        }
    }

    /// Marks the pool closed and destroys every idle connection, returning
    /// their permits. Further `take` calls fail with `PoolExhausted`.
    /// Connections currently checked out are destroyed as they are
    /// returned via `release` rather than force-closed here — ownership of
    /// an in-use `Connection` belongs to its caller, not the pool.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut state = self.inner.state.lock().await;
        let drained = std::mem::take(&mut state.idle);
        drop(state);
        for _ in drained {
            self.return_permit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every command with an error so the handshake's `HELLO 3`
    /// falls back to RESP2 with nothing further to authenticate.
    async fn spawn_fake_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {
                                if sock.write_all(b"-ERR unknown command 'HELLO'\r\n").await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    struct CountingFactory {
        addr: SocketAddr,
        calls: Arc<AtomicUsize>,
    }

    impl ConnectionFactory for CountingFactory {
        fn connect(&self) -> ConnectFuture {
            let addr = self.addr;
            let calls = self.calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, AOrdering::SeqCst);
                let transport = Transport::connect_tcp(addr, None, TcpOptions::default()).await?;
                Connection::connect(transport, &ConnectOptions::default()).await
            })
        }
    }

    #[tokio::test]
    async fn take_then_release_reuses_the_same_connection() {
        let addr = spawn_fake_server().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(CountingFactory { addr, calls: calls.clone() }, PoolConfig::default());

        let conn = pool.take().await.unwrap();
        pool.release(conn).await;
        let conn = pool.take().await.unwrap();
        pool.release(conn).await;

        assert_eq!(calls.load(AOrdering::SeqCst), 1);
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn exhausted_capacity_fails_after_wait_timeout() {
        let addr = spawn_fake_server().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(
            CountingFactory { addr, calls },
            PoolConfig { max_connections: Some(1), wait_timeout: Some(Duration::from_millis(20)) },
        );

        let held = pool.take().await.unwrap();
        let err = pool.take().await.unwrap_err();
        assert!(matches!(err, RedisCoreError::PoolExhausted));

        pool.release(held).await;
        let conn = pool.take().await.unwrap();
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn closed_connection_is_destroyed_not_requeued() {
        let addr = spawn_fake_server().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(
            CountingFactory { addr, calls: calls.clone() },
            PoolConfig { max_connections: Some(2), wait_timeout: None },
        );

        let mut conn = pool.take().await.unwrap();
        conn.mark_closed();
        pool.release(conn).await;
        assert_eq!(pool.idle_count().await, 0);

        let _conn = pool.take().await.unwrap();
        assert_eq!(calls.load(AOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_drains_idle_and_rejects_further_take() {
        let addr = spawn_fake_server().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(CountingFactory { addr, calls }, PoolConfig::default());

        let conn = pool.take().await.unwrap();
        pool.release(conn).await;
        pool.close().await;

        assert_eq!(pool.idle_count().await, 0);
        let err = pool.take().await.unwrap_err();
        assert!(matches!(err, RedisCoreError::PoolExhausted));
    }
}
