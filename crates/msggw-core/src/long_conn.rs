//! Transport-agnostic long connection contract.
//!
//! Both the WebSocket and the TCP adapters must satisfy [`LongConn`]. The
//! contract is shaped around framed transports: capabilities a transport
//! cannot provide (read limits and keepalive control frames on raw TCP) are
//! accepted and ignored by that adapter rather than emulated.

use crate::error::{GatewayError, GatewayResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Boxed future returned by the async [`LongConn`] operations.
pub type ConnFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback invoked with the payload of a received ping or pong frame.
pub type PingPongHandler = Box<dyn Fn(&[u8]) -> GatewayResult<()> + Send + Sync>;

/// Kind of a message written to or read from a long connection.
///
/// Values match the WebSocket opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

/// A single persistent client connection, independent of its transport.
///
/// All methods take `&self` so a connection can be shared between a reader
/// task and a writer task. Once [`LongConn::set_conn_nil`] has been called
/// (or the connection closed), every I/O and deadline operation fails with
/// [`GatewayError::ConnNil`].
pub trait LongConn: Send + Sync {
    /// Close the underlying transport. Closing an already disposed connection
    /// is a no-op.
    fn close(&self) -> ConnFuture<'_, GatewayResult<()>>;

    /// Write one message. Stream transports ignore `kind`.
    fn write_message<'a>(
        &'a self,
        kind: MessageKind,
        payload: &'a [u8],
    ) -> ConnFuture<'a, GatewayResult<()>>;

    /// Read the next message.
    fn read_message(&self) -> ConnFuture<'_, GatewayResult<(MessageKind, Vec<u8>)>>;

    /// Arm the read deadline at `now + timeout`. Must be re-armed before each
    /// read that needs a bound.
    fn set_read_deadline(&self, timeout: Duration) -> GatewayResult<()>;

    /// Arm the write deadline at `now + timeout`.
    fn set_write_deadline(&self, timeout: Duration) -> GatewayResult<()>;

    /// Whether the transport handle has been disposed.
    fn is_nil(&self) -> bool;

    /// Dispose the transport handle without closing the connection object.
    fn set_conn_nil(&self);

    /// Maximum inbound message size in bytes; `0` means unlimited.
    fn set_read_limit(&self, limit: i64);

    fn set_pong_handler(&self, handler: PingPongHandler);

    fn set_ping_handler(&self, handler: PingPongHandler);

    /// Peer address, for logging.
    fn remote_addr(&self) -> &str;
}

type SharedHandler = Arc<dyn Fn(&[u8]) -> GatewayResult<()> + Send + Sync>;

/// State shared by every [`LongConn`] adapter: disposal flag, relative
/// deadlines, read limit and keepalive handlers.
#[derive(Default)]
pub struct ConnState {
    nil: AtomicBool,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    read_limit: AtomicI64,
    ping_handler: Mutex<Option<SharedHandler>>,
    pong_handler: Mutex<Option<SharedHandler>>,
}

impl ConnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_nil(&self) -> bool {
        self.nil.load(Ordering::Acquire)
    }

    pub fn set_nil(&self) {
        self.nil.store(true, Ordering::Release);
    }

    /// Marks the connection disposed, returning whether this call did it.
    pub fn take_live(&self) -> bool {
        !self.nil.swap(true, Ordering::AcqRel)
    }

    /// `Err(ConnNil)` once the handle has been disposed.
    pub fn ensure_live(&self) -> GatewayResult<()> {
        if self.is_nil() {
            Err(GatewayError::ConnNil)
        } else {
            Ok(())
        }
    }

    pub fn arm_read_deadline(&self, timeout: Duration) -> GatewayResult<()> {
        self.ensure_live()?;
        *lock(&self.read_deadline) = Some(Instant::now() + timeout);
        Ok(())
    }

    pub fn arm_write_deadline(&self, timeout: Duration) -> GatewayResult<()> {
        self.ensure_live()?;
        *lock(&self.write_deadline) = Some(Instant::now() + timeout);
        Ok(())
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        *lock(&self.read_deadline)
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        *lock(&self.write_deadline)
    }

    /// Run a read future bounded by the current read deadline, if any.
    pub async fn with_read_deadline<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        bounded(self.read_deadline(), fut).await
    }

    /// Run a write future bounded by the current write deadline, if any.
    pub async fn with_write_deadline<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        bounded(self.write_deadline(), fut).await
    }

    pub fn set_read_limit(&self, limit: i64) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    pub fn read_limit(&self) -> i64 {
        self.read_limit.load(Ordering::Relaxed)
    }

    /// Check an inbound message size against the read limit.
    pub fn check_read_limit(&self, size: usize) -> GatewayResult<()> {
        let limit = self.read_limit();
        if limit > 0 && size as i64 > limit {
            return Err(GatewayError::ReadLimitExceeded { size, limit });
        }
        Ok(())
    }

    pub fn set_ping_handler(&self, handler: PingPongHandler) {
        *lock(&self.ping_handler) = Some(Arc::from(handler));
    }

    pub fn set_pong_handler(&self, handler: PingPongHandler) {
        *lock(&self.pong_handler) = Some(Arc::from(handler));
    }

    /// Invoke the ping handler, if one is registered.
    pub fn on_ping(&self, payload: &[u8]) -> GatewayResult<()> {
        let handler = lock(&self.ping_handler).clone();
        match handler {
            Some(h) => h(payload),
            None => Ok(()),
        }
    }

    /// Invoke the pong handler, if one is registered.
    pub fn on_pong(&self, payload: &[u8]) -> GatewayResult<()> {
        let handler = lock(&self.pong_handler).clone();
        match handler {
            Some(h) => h(payload),
            None => Ok(()),
        }
    }
}

async fn bounded<T, F>(deadline: Option<Instant>, fut: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| GatewayError::Timeout)?,
        None => fut.await,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn read_deadline_rearms_from_latest_call() {
        let state = ConnState::new();
        let start = Instant::now();

        state.arm_read_deadline(Duration::from_secs(10)).unwrap();
        assert_eq!(state.read_deadline(), Some(start + Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(3)).await;
        state.arm_read_deadline(Duration::from_secs(5)).unwrap();
        assert_eq!(state.read_deadline(), Some(start + Duration::from_secs(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn write_deadline_is_relative() {
        let state = ConnState::new();
        tokio::time::advance(Duration::from_secs(7)).await;
        let now = Instant::now();
        state.arm_write_deadline(Duration::from_millis(250)).unwrap();
        assert_eq!(state.write_deadline(), Some(now + Duration::from_millis(250)));
        assert_eq!(state.read_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_times_out() {
        let state = ConnState::new();
        state.arm_read_deadline(Duration::from_secs(1)).unwrap();
        let result = state
            .with_read_deadline(std::future::pending::<GatewayResult<()>>())
            .await;
        assert!(matches!(result, Err(GatewayError::Timeout)));
    }

    #[tokio::test]
    async fn no_deadline_runs_unbounded() {
        let state = ConnState::new();
        let value = state.with_write_deadline(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn nil_state_rejects_deadlines() {
        let state = ConnState::new();
        assert!(!state.is_nil());
        state.set_nil();
        assert!(state.is_nil());
        assert!(matches!(
            state.arm_read_deadline(Duration::from_secs(1)),
            Err(GatewayError::ConnNil)
        ));
        assert!(matches!(state.ensure_live(), Err(GatewayError::ConnNil)));
    }

    #[test]
    fn take_live_only_once() {
        let state = ConnState::new();
        assert!(state.take_live());
        assert!(!state.take_live());
        assert!(state.is_nil());
    }

    #[test]
    fn read_limit_zero_is_unlimited() {
        let state = ConnState::new();
        assert!(state.check_read_limit(10_000_000).is_ok());
        state.set_read_limit(16);
        assert!(state.check_read_limit(16).is_ok());
        assert!(matches!(
            state.check_read_limit(17),
            Err(GatewayError::ReadLimitExceeded { size: 17, limit: 16 })
        ));
    }

    #[test]
    fn handlers_are_invoked() {
        let state = ConnState::new();
        assert!(state.on_ping(b"x").is_ok());

        let pings = Arc::new(AtomicUsize::new(0));
        let counter = pings.clone();
        state.set_ping_handler(Box::new(move |payload: &[u8]| {
            assert_eq!(payload, b"hb");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        state.set_pong_handler(Box::new(|_: &[u8]| Err(GatewayError::Other("stale".into()))));

        state.on_ping(b"hb").unwrap();
        assert_eq!(pings.load(Ordering::SeqCst), 1);
        assert!(state.on_pong(b"").is_err());
    }
}
