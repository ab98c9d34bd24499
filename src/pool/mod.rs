//! Connection Pool
//!
//! Bounded set of [`Connection`]s shared by concurrent callers.
//!
//! # Accounting
//! Every live connection occupies one slot, whether idle, checked out, or
//! still being opened: `idle + in_use + opening <= max_size`.
//!
//! # Acquire
//! 1. Idle connection available: hand it out
//! 2. Free slot: reserve it under the lock, connect outside the lock
//! 3. Otherwise: queue a waiter (FIFO) until a release serves it or the
//!    timeout elapses (`PoolExhausted`)
//!
//! # Release
//! Never blocks. A healthy connection goes straight to the oldest waiter, or
//! back to idle. A broken one is discarded and its slot is granted to the
//! oldest waiter, who opens a replacement.
//!
//! All bookkeeping lives behind one `parking_lot::Mutex`, which is never held
//! across an `.await`. Hand-off happens while holding it, so a connection given
//! to a waiter is invisible to every other caller.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::{Connection, Connector, SocketState};
use crate::error::{DocpoolError, Result};
use crate::uri::ConnectionConfig;

/// Connection ids are unique across every pool in the process
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Pool sizing and wait policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    pub max_size: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self { max_size: 10, acquire_timeout: Duration::from_secs(5) }
    }
}

impl PoolOptions {
    /// Defaults overridden by the URI's pool options
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::default().with_config(config)
    }

    /// Apply `maxPoolSize` and `waitQueueTimeoutMS` from the URI on top of `self`
    #[must_use]
    pub fn with_config(self, config: &ConnectionConfig) -> Self {
        Self {
            max_size: config.max_pool_size().unwrap_or(self.max_size),
            acquire_timeout: config.wait_queue_timeout().unwrap_or(self.acquire_timeout),
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opening: usize,
    pub waiters: usize,
    /// Connections opened over the pool's lifetime
    pub opened_total: u64,
    pub closed: bool,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ max_size: {}, idle: {}, in_use: {}, opening: {}, waiters: {}, \
             opened_total: {}, closed: {} }}",
            self.max_size,
            self.idle,
            self.in_use,
            self.opening,
            self.waiters,
            self.opened_total,
            self.closed
        )
    }
}

/// What a queued waiter receives
#[derive(Debug)]
enum Grant {
    /// A ready connection, already counted as in use
    Ready(Connection),
    /// A reserved slot; the waiter opens the connection itself
    Open,
}

/// How an acquire proceeds, decided under the lock
enum Admission {
    Closed,
    Idle(Connection),
    /// A slot was reserved; open outside the lock
    Open,
    Queued { id: u64, receiver: oneshot::Receiver<Grant> },
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    sender: oneshot::Sender<Grant>,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<Connection>,
    in_use: HashSet<u64>,
    opening: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    opened_total: u64,
    closed: bool,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.opening
    }

    /// Give a healthy connection to the oldest live waiter, else park it idle
    fn offer_connection(&mut self, mut connection: Connection) {
        let id = connection.id();
        while let Some(waiter) = self.waiters.pop_front() {
            self.in_use.insert(id);
            match waiter.sender.send(Grant::Ready(connection)) {
                Ok(()) => return,
                Err(returned) => {
                    self.in_use.remove(&id);
                    let Grant::Ready(returned) = returned else { return };
                    connection = returned;
                }
            }
        }
        self.idle.push_back(connection);
    }

    /// Pass a freed slot to the oldest live waiter
    fn offer_slot(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            self.opening += 1;
            if waiter.sender.send(Grant::Open).is_ok() {
                return;
            }
            self.opening -= 1;
        }
    }

    /// Put back a grant that reached a waiter who is no longer listening
    fn restore(&mut self, grant: Grant) {
        match grant {
            Grant::Ready(mut connection) => {
                self.in_use.remove(&connection.id());
                if self.closed {
                    connection.close();
                } else {
                    self.offer_connection(connection);
                }
            }
            Grant::Open => {
                self.opening -= 1;
                self.offer_slot();
            }
        }
    }
}

struct PoolInner {
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    closed: Arc<AtomicBool>,
}

/// Connection pool; cheap to clone, clones share state
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config.to_string())
            .field("status", &self.status())
            .finish()
    }
}

impl Pool {
    /// Create an empty pool; no connection is opened until the first acquire
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        options: PoolOptions,
    ) -> Result<Self> {
        if options.max_size == 0 {
            return Err(DocpoolError::invalid_input("pool max_size must be at least 1"));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                config: Arc::new(config),
                connector,
                options,
                state: Mutex::new(PoolState::default()),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn options(&self) -> PoolOptions {
        self.inner.options
    }

    /// Acquire with the configured `acquire_timeout`
    pub async fn acquire_default(&self) -> Result<Connection> {
        self.acquire(self.inner.options.acquire_timeout).await
    }

    /// Check a connection out of the pool
    ///
    /// Waits at most `timeout` when the pool is saturated. Dropping the
    /// returned future while it waits leaves the pool unchanged.
    pub async fn acquire(&self, timeout: Duration) -> Result<Connection> {
        let (waiter_id, receiver) = match self.admit() {
            Admission::Closed => return Err(DocpoolError::PoolClosed),
            Admission::Idle(connection) => return Ok(connection),
            Admission::Open => return self.open_reserved().await,
            Admission::Queued { id, receiver } => (id, receiver),
        };

        let mut guard = WaitGuard { pool: &self.inner, id: waiter_id, receiver: Some(receiver) };
        let outcome = match guard.receiver.as_mut() {
            Some(receiver) => tokio::time::timeout(timeout, receiver).await,
            None => return Err(DocpoolError::PoolClosed),
        };

        match outcome {
            Ok(Ok(grant)) => {
                guard.disarm();
                self.take_grant(grant).await
            }
            // sender dropped by shutdown
            Ok(Err(_)) => {
                guard.disarm();
                Err(DocpoolError::PoolClosed)
            }
            Err(_elapsed) => {
                if let Some(grant) = guard.resolve_timeout() {
                    return self.take_grant(grant).await;
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return Err(DocpoolError::PoolClosed);
                }
                Err(DocpoolError::pool_exhausted(format!(
                    "no connection available within {}ms (max_size {})",
                    timeout.as_millis(),
                    self.inner.options.max_size
                )))
            }
        }
    }

    /// Return a connection to the pool; never blocks
    pub fn release(&self, mut connection: Connection) {
        let mut state = self.inner.state.lock();
        if !state.in_use.remove(&connection.id()) {
            warn!(
                connection = connection.id(),
                "released connection is not checked out of this pool"
            );
            connection.close();
            return;
        }

        if state.closed {
            connection.close();
            return;
        }

        if connection.is_broken() || connection.state() != SocketState::Connected {
            debug!(
                connection = connection.id(),
                state = ?connection.state(),
                "discarding connection"
            );
            connection.close();
            state.offer_slot();
            return;
        }

        state.offer_connection(connection);
    }

    /// Close the pool
    ///
    /// Idle connections are closed now; checked-out connections fail their
    /// next command with `PoolClosed` and are closed on release. Waiters and
    /// later acquires fail with `PoolClosed`.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.inner.closed.store(true, Ordering::Release);

        let idle = state.idle.len();
        for mut connection in state.idle.drain(..) {
            connection.close();
        }
        // dropping the senders wakes every waiter with PoolClosed
        let waiters = state.waiters.len();
        state.waiters.clear();
        debug!(idle, waiters, in_use = state.in_use.len(), "pool shut down");
    }

    /// Acquire a connection that goes back to the pool when dropped
    pub async fn checkout(&self, timeout: Duration) -> Result<PooledConnection> {
        let connection = self.acquire(timeout).await?;
        Ok(PooledConnection { pool: self.clone(), connection: Some(connection) })
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            max_size: self.inner.options.max_size,
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            opening: state.opening,
            waiters: state.waiters.len(),
            opened_total: state.opened_total,
            closed: state.closed,
        }
    }

    /// Decide under the lock how an acquire proceeds
    fn admit(&self) -> Admission {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Admission::Closed;
        }
        if let Some(connection) = state.idle.pop_back() {
            state.in_use.insert(connection.id());
            return Admission::Idle(connection);
        }
        if state.occupied() < self.inner.options.max_size {
            state.opening += 1;
            return Admission::Open;
        }

        let (sender, receiver) = oneshot::channel();
        state.next_waiter += 1;
        let id = state.next_waiter;
        state.waiters.push_back(Waiter { id, sender });
        debug!(waiter = id, queued = state.waiters.len(), "pool saturated, waiting");
        Admission::Queued { id, receiver }
    }

    async fn take_grant(&self, grant: Grant) -> Result<Connection> {
        match grant {
            Grant::Ready(connection) => self.claim(connection),
            Grant::Open => self.open_reserved().await,
        }
    }

    /// Accept a handed-off connection unless the pool closed after the hand-off
    fn claim(&self, mut connection: Connection) -> Result<Connection> {
        let mut state = self.inner.state.lock();
        if state.closed {
            state.in_use.remove(&connection.id());
            connection.close();
            return Err(DocpoolError::PoolClosed);
        }
        Ok(connection)
    }

    /// Open a connection into a slot already counted in `opening`
    async fn open_reserved(&self) -> Result<Connection> {
        let mut reservation = Reservation { pool: &self.inner, armed: true };
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let config = Arc::clone(&self.inner.config);
        let opened = Connection::open(id, config, self.inner.connector.as_ref()).await;

        reservation.armed = false;
        let mut state = self.inner.state.lock();
        state.opening -= 1;
        match opened {
            Ok(mut connection) if !state.closed => {
                connection.attach_pool(Arc::clone(&self.inner.closed));
                state.in_use.insert(id);
                state.opened_total += 1;
                debug!(connection = id, occupied = state.occupied(), "opened pooled connection");
                Ok(connection)
            }
            Ok(mut connection) => {
                connection.close();
                Err(DocpoolError::PoolClosed)
            }
            Err(err) => {
                state.offer_slot();
                Err(err)
            }
        }
    }
}

/// A checked-out connection, released to its pool on drop
pub struct PooledConnection {
    pool: Pool,
    connection: Option<Connection>,
}

impl PooledConnection {
    /// Take the connection out of the guard; the caller must release it
    #[must_use]
    pub fn detach(mut self) -> Connection {
        self.connection.take().expect("BUG: PooledConnection used after return to pool")
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").field("connection", &self.connection).finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection.as_ref().expect("BUG: PooledConnection used after return to pool")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection.as_mut().expect("BUG: PooledConnection used after return to pool")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

/// Frees a reserved slot if the opening future is dropped midway
struct Reservation<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            state.opening -= 1;
            state.offer_slot();
        }
    }
}

/// Removes a waiter from the queue, or returns its grant, if the acquire
/// future is dropped while waiting
struct WaitGuard<'a> {
    pool: &'a PoolInner,
    id: u64,
    receiver: Option<oneshot::Receiver<Grant>>,
}

impl WaitGuard<'_> {
    fn disarm(&mut self) {
        self.receiver = None;
    }

    /// After a timeout: leave the queue, or collect a grant that raced in
    fn resolve_timeout(&mut self) -> Option<Grant> {
        let mut receiver = self.receiver.take()?;
        let mut state = self.pool.state.lock();
        if let Some(position) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(position);
            return None;
        }
        // no longer queued: any grant was sent while the lock was held
        receiver.try_recv().ok()
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else { return };
        let mut state = self.pool.state.lock();
        if let Some(position) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(position);
            return;
        }
        if let Ok(grant) = receiver.try_recv() {
            state.restore(grant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::MemoryServer;
    use crate::uri;
    use pretty_assertions::assert_eq;

    fn pool(server: &MemoryServer, max_size: usize) -> Pool {
        let config = uri::parse("mongodb://memory:27017").unwrap();
        let options = PoolOptions { max_size, acquire_timeout: Duration::from_millis(200) };
        Pool::new(config, Arc::new(server.connector()), options).unwrap()
    }

    #[test]
    fn test_zero_max_size_rejected() {
        let server = MemoryServer::new();
        let config = uri::parse("mongodb://memory").unwrap();
        let options = PoolOptions { max_size: 0, ..PoolOptions::default() };
        assert!(Pool::new(config, Arc::new(server.connector()), options).is_err());
    }

    #[test]
    fn test_options_from_uri() {
        let config = uri::parse("mongodb://memory/?maxPoolSize=3&waitQueueTimeoutMS=40").unwrap();
        let options = PoolOptions::from_config(&config);
        assert_eq!(options.max_size, 3);
        assert_eq!(options.acquire_timeout, Duration::from_millis(40));

        let config = uri::parse("mongodb://memory").unwrap();
        assert_eq!(PoolOptions::default().with_config(&config), PoolOptions::default());
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_one_connection() {
        let server = MemoryServer::new();
        let pool = pool(&server, 4);
        for _ in 0..25 {
            let conn = pool.acquire_default().await.unwrap();
            pool.release(conn);
        }
        assert_eq!(server.connects(), 1);
        let status = pool.status();
        assert_eq!(status.opened_total, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(status.in_use, 0);
    }

    #[tokio::test]
    async fn test_saturated_acquire_times_out() {
        let server = MemoryServer::new();
        let pool = pool(&server, 2);
        let a = pool.acquire_default().await.unwrap();
        let b = pool.acquire_default().await.unwrap();

        let err = pool.acquire(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, DocpoolError::PoolExhausted(_)));

        let status = pool.status();
        assert_eq!(status.waiters, 0);
        assert_eq!(status.in_use, 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.status().idle, 2);
    }

    #[tokio::test]
    async fn test_release_hands_off_to_waiter() {
        let server = MemoryServer::new();
        let pool = pool(&server, 1);
        let conn = pool.acquire_default().await.unwrap();
        let first_id = conn.id();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        while pool.status().waiters == 0 {
            tokio::task::yield_now().await;
        }

        pool.release(conn);
        let handed = waiting.await.unwrap().unwrap();
        assert_eq!(handed.id(), first_id);
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().in_use, 1);
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test]
    async fn test_broken_release_frees_slot() {
        let server = MemoryServer::new();
        let pool = pool(&server, 2);
        let mut conn = pool.acquire_default().await.unwrap();

        server.break_links();
        let ping = crate::connection::Command::new("store", bson::doc! { "ping": 1 }).unwrap();
        assert!(conn.send_command(&ping).await.is_err());
        assert_eq!(conn.state(), SocketState::Broken);

        let before = pool.status();
        pool.release(conn);
        let after = pool.status();
        assert_eq!(after.in_use, before.in_use - 1);
        assert_eq!(after.idle, before.idle);

        let fresh = pool.acquire_default().await.unwrap();
        assert_eq!(fresh.state(), SocketState::Connected);
        assert_eq!(server.connects(), 2);
        assert_eq!(pool.status().opened_total, 2);
    }

    #[tokio::test]
    async fn test_broken_release_lets_waiter_open_replacement() {
        let server = MemoryServer::new();
        let pool = pool(&server, 1);
        let mut conn = pool.acquire_default().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        while pool.status().waiters == 0 {
            tokio::task::yield_now().await;
        }

        server.break_links();
        let ping = crate::connection::Command::new("store", bson::doc! { "ping": 1 }).unwrap();
        let _ = conn.send_command(&ping).await;
        let broken_id = conn.id();
        pool.release(conn);

        let replacement = waiting.await.unwrap().unwrap();
        assert_ne!(replacement.id(), broken_id);
        assert_eq!(replacement.state(), SocketState::Connected);
        assert_eq!(pool.status().in_use, 1);
    }

    #[tokio::test]
    async fn test_failed_open_frees_slot() {
        let server = MemoryServer::new();
        let pool = pool(&server, 1);
        server.set_refuse_connections(true);
        assert!(matches!(pool.acquire_default().await, Err(DocpoolError::ConnectFailure(_))));
        assert_eq!(pool.status().opening, 0);

        server.set_refuse_connections(false);
        let conn = pool.acquire_default().await.unwrap();
        pool.release(conn);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaks_nothing() {
        let server = MemoryServer::new();
        let pool = pool(&server, 1);
        let conn = pool.acquire_default().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(30)).await })
        };
        while pool.status().waiters == 0 {
            tokio::task::yield_now().await;
        }
        waiting.abort();
        let _ = waiting.await;
        assert_eq!(pool.status().waiters, 0);

        pool.release(conn);
        assert_eq!(pool.status().idle, 1);
        let again = pool.acquire(Duration::from_millis(10)).await.unwrap();
        pool.release(again);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_and_later_acquires() {
        let server = MemoryServer::new();
        let pool = pool(&server, 1);
        let mut conn = pool.acquire_default().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        while pool.status().waiters == 0 {
            tokio::task::yield_now().await;
        }

        pool.shutdown();
        assert_eq!(waiting.await.unwrap().unwrap_err(), DocpoolError::PoolClosed);
        assert_eq!(pool.acquire_default().await.unwrap_err(), DocpoolError::PoolClosed);

        // the checked-out connection is closed on its next use
        let ping = crate::connection::Command::new("store", bson::doc! { "ping": 1 }).unwrap();
        assert_eq!(conn.send_command(&ping).await.unwrap_err(), DocpoolError::PoolClosed);
        pool.release(conn);

        let status = pool.status();
        assert!(status.closed);
        assert_eq!(status.in_use, 0);
        assert_eq!(status.idle, 0);

        // idempotent
        pool.shutdown();
    }

    #[test]
    fn test_acquire_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}
        let server = MemoryServer::new();
        let pool = pool(&server, 1);
        assert_send(&pool.acquire(Duration::from_millis(1)));
        assert_send(&pool.acquire_default());
        assert_send(&pool.checkout(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn test_shutdown_after_hand_off_fails_waiter() {
        let server = MemoryServer::new();
        let pool = pool(&server, 1);
        let held = pool.acquire_default().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        while pool.status().waiters == 0 {
            tokio::task::yield_now().await;
        }

        // the waiter holds a ready grant but has not run yet
        pool.release(held);
        pool.shutdown();

        assert_eq!(waiting.await.unwrap().unwrap_err(), DocpoolError::PoolClosed);
        let status = pool.status();
        assert_eq!((status.idle, status.in_use, status.waiters), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_foreign_connection_is_closed_on_release() {
        let server = MemoryServer::new();
        let left = pool(&server, 1);
        let right = pool(&server, 1);
        let foreign = left.acquire_default().await.unwrap();
        let own = right.acquire_default().await.unwrap();
        assert_ne!(foreign.id(), own.id());

        right.release(foreign);
        assert_eq!(right.status().idle, 0);
        assert_eq!(right.status().in_use, 1);
        right.release(own);
        assert_eq!(right.status().idle, 1);
    }

    #[tokio::test]
    async fn test_checkout_releases_on_drop() {
        let server = MemoryServer::new();
        let pool = pool(&server, 1);
        {
            let mut conn = pool.checkout(Duration::from_millis(50)).await.unwrap();
            let ping = crate::connection::Command::new("store", bson::doc! { "ping": 1 }).unwrap();
            assert!(conn.send_command(&ping).await.unwrap().ok);
            assert_eq!(pool.status().in_use, 1);
        }
        assert_eq!(pool.status().idle, 1);

        let detached = pool.checkout(Duration::from_millis(50)).await.unwrap().detach();
        assert_eq!(pool.status().in_use, 1);
        pool.release(detached);
        assert_eq!(pool.status().idle, 1);
    }
}
