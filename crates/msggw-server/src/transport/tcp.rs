//! Raw TCP long connection and listener loop.
//!
//! TCP carries no handshake, so connections accepted here are handed to the
//! client agent with an identity-less [`ConnContext`]; identity and token
//! checks for TCP sessions belong to the agent (or to an application-level
//! handshake message).

use msggw_core::codec::{read_frame, write_frame};
use msggw_core::{
    ClientAgent, ConnContext, ConnFuture, ConnState, GatewayError, GatewayResult, LongConn,
    MessageKind, PingPongHandler,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn, Instrument};

/// How message boundaries are recovered from the TCP byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TcpFraming {
    /// `[u32 BE length][payload]` per message, in both directions.
    #[default]
    LengthPrefixed,
    /// No framing: a read returns everything up to EOF, so a connection
    /// carries at most one inbound message and later reads report it closed.
    /// Writes are raw bytes.
    UntilEof,
}

/// A raw TCP connection.
///
/// Read limits and ping/pong handlers are accepted and ignored: the stream
/// has no control frames and, in `UntilEof` mode, no message boundaries to
/// measure against.
pub struct TcpConnWrap {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    framing: TcpFraming,
    state: ConnState,
    remote_addr: String,
}

impl TcpConnWrap {
    pub fn new(stream: TcpStream, remote_addr: impl Into<String>, framing: TcpFraming) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            framing,
            state: ConnState::new(),
            remote_addr: remote_addr.into(),
        }
    }

    async fn recv(&self) -> GatewayResult<(MessageKind, Vec<u8>)> {
        self.state.ensure_live()?;
        let data = self
            .state
            .with_read_deadline(async {
                let mut reader = self.reader.lock().await;
                let reader = reader.as_mut().ok_or(GatewayError::ConnNil)?;
                match self.framing {
                    TcpFraming::LengthPrefixed => {
                        read_frame(reader).await?.ok_or(GatewayError::ConnClosed)
                    }
                    TcpFraming::UntilEof => {
                        let mut buf = Vec::new();
                        if reader.read_to_end(&mut buf).await? == 0 {
                            return Err(GatewayError::ConnClosed);
                        }
                        Ok(buf)
                    }
                }
            })
            .await?;
        Ok((MessageKind::Binary, data))
    }

    async fn send(&self, payload: &[u8]) -> GatewayResult<()> {
        self.state.ensure_live()?;
        self.state
            .with_write_deadline(async {
                let mut writer = self.writer.lock().await;
                let writer = writer.as_mut().ok_or(GatewayError::ConnNil)?;
                match self.framing {
                    TcpFraming::LengthPrefixed => write_frame(writer, payload).await,
                    TcpFraming::UntilEof => {
                        writer.write_all(payload).await?;
                        writer.flush().await?;
                        Ok(())
                    }
                }
            })
            .await
    }
}

impl LongConn for TcpConnWrap {
    fn close(&self) -> ConnFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            if !self.state.take_live() {
                return Ok(());
            }
            if let Ok(mut reader) = self.reader.try_lock() {
                reader.take();
            }
            let writer = self.writer.lock().await.take();
            if let Some(mut writer) = writer {
                writer.shutdown().await?;
            }
            Ok(())
        })
    }

    fn write_message<'a>(
        &'a self,
        _kind: MessageKind,
        payload: &'a [u8],
    ) -> ConnFuture<'a, GatewayResult<()>> {
        Box::pin(self.send(payload))
    }

    fn read_message(&self) -> ConnFuture<'_, GatewayResult<(MessageKind, Vec<u8>)>> {
        Box::pin(self.recv())
    }

    fn set_read_deadline(&self, timeout: Duration) -> GatewayResult<()> {
        self.state.arm_read_deadline(timeout)
    }

    fn set_write_deadline(&self, timeout: Duration) -> GatewayResult<()> {
        self.state.arm_write_deadline(timeout)
    }

    fn is_nil(&self) -> bool {
        self.state.is_nil()
    }

    fn set_conn_nil(&self) {
        self.state.set_nil();
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    fn set_read_limit(&self, _limit: i64) {}

    fn set_pong_handler(&self, _handler: PingPongHandler) {}

    fn set_ping_handler(&self, _handler: PingPongHandler) {}

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

/// Source of accepted TCP connections for [`TcpServer::serve`].
pub trait Acceptor: Send {
    fn accept(&mut self) -> ConnFuture<'_, std::io::Result<(TcpStream, SocketAddr)>>;
}

impl Acceptor for TcpListener {
    fn accept(&mut self) -> ConnFuture<'_, std::io::Result<(TcpStream, SocketAddr)>> {
        Box::pin(TcpListener::accept(self))
    }
}

/// Accepts raw TCP connections and dispatches them to the client agent.
pub struct TcpServer {
    addr: String,
    framing: TcpFraming,
    agent: Arc<dyn ClientAgent>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpServer {
    pub fn new(addr: impl Into<String>, framing: TcpFraming, agent: Arc<dyn ClientAgent>) -> Self {
        Self {
            addr: addr.into(),
            framing,
            agent,
            shutdown_tx: watch::channel(false).0,
        }
    }

    /// Resolve the configured address to IPv4 and bind it.
    pub async fn bind(&self) -> GatewayResult<TcpListener> {
        let addr = resolve_ipv4(&self.addr).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("TCP bind failed on {addr}: {e}")))?;
        info!(addr = %listener.local_addr()?, "TCP listener started");
        Ok(listener)
    }

    /// Accept until [`TcpServer::close`] is called. Accept errors are logged and the loop keeps going.
    pub async fn serve<A: Acceptor>(&self, mut acceptor: A) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("TCP accept loop closed");
                    break;
                }
                result = acceptor.accept() => {
                    match result {
                        Ok((stream, peer)) => self.dispatch(stream, peer),
                        Err(e) => warn!(error = %e, "TCP accept failed"),
                    }
                }
            }
        }
    }

    /// Stop accepting. Connections already handed to the agent are left
    /// running.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let remote = peer.to_string();
        let conn = TcpConnWrap::new(stream, remote.clone(), self.framing);
        let ctx = ConnContext::new(remote, "");
        let span = ctx.span();
        let agent = self.agent.clone();

        debug!(parent: &span, "TCP connection accepted");
        tokio::spawn(
            async move {
                agent.handle_conn(ctx, Box::new(conn)).await;
            }
            .instrument(span),
        );
    }
}

async fn resolve_ipv4(addr: &str) -> GatewayResult<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| GatewayError::Transport(format!("cannot resolve {addr}: {e}")))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| GatewayError::Transport(format!("no IPv4 address for {addr}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use msggw_core::codec::frame_encode;
    use tokio::sync::mpsc;

    async fn tcp_pair(framing: TcpFraming) -> (TcpConnWrap, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (TcpConnWrap::new(server, peer.to_string(), framing), client)
    }

    struct RecordingAgent {
        tx: mpsc::UnboundedSender<ConnContext>,
    }

    impl ClientAgent for RecordingAgent {
        fn handle_conn(&self, ctx: ConnContext, conn: Box<dyn LongConn>) -> ConnFuture<'_, ()> {
            let tx = self.tx.clone();
            Box::pin(async move {
                let _ = tx.send(ctx);
                let _ = conn.close().await;
            })
        }
    }

    /// Fails the first `failures` accepts before delegating to a real listener.
    struct FlakyListener {
        inner: TcpListener,
        failures: usize,
    }

    impl Acceptor for FlakyListener {
        fn accept(&mut self) -> ConnFuture<'_, std::io::Result<(TcpStream, SocketAddr)>> {
            Box::pin(async move {
                if self.failures > 0 {
                    self.failures -= 1;
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "transient accept failure",
                    ));
                }
                self.inner.accept().await
            })
        }
    }

    #[tokio::test]
    async fn length_prefixed_read_and_write() {
        let (conn, mut client) = tcp_pair(TcpFraming::LengthPrefixed).await;
        client.write_all(&frame_encode(b"first").unwrap()).await.unwrap();
        client.write_all(&frame_encode(b"second").unwrap()).await.unwrap();

        assert_eq!(
            conn.read_message().await.unwrap(),
            (MessageKind::Binary, b"first".to_vec())
        );
        assert_eq!(
            conn.read_message().await.unwrap(),
            (MessageKind::Binary, b"second".to_vec())
        );

        conn.write_message(MessageKind::Text, b"reply").await.unwrap();
        let reply = read_frame(&mut client).await.unwrap();
        assert_eq!(reply, Some(b"reply".to_vec()));
    }

    #[tokio::test]
    async fn length_prefixed_eof_is_closed() {
        let (conn, client) = tcp_pair(TcpFraming::LengthPrefixed).await;
        drop(client);
        assert!(matches!(conn.read_message().await, Err(GatewayError::ConnClosed)));
    }

    #[tokio::test]
    async fn until_eof_reads_whole_stream() {
        let (conn, mut client) = tcp_pair(TcpFraming::UntilEof).await;
        client.write_all(b"part one, ").await.unwrap();
        client.write_all(b"part two").await.unwrap();
        client.shutdown().await.unwrap();

        let (kind, data) = conn.read_message().await.unwrap();
        assert_eq!(kind, MessageKind::Binary);
        assert_eq!(data, b"part one, part two");
        assert!(matches!(conn.read_message().await, Err(GatewayError::ConnClosed)));
    }

    #[tokio::test]
    async fn read_deadline_times_out() {
        let (conn, _client) = tcp_pair(TcpFraming::LengthPrefixed).await;
        conn.set_read_deadline(Duration::from_millis(50)).unwrap();
        assert!(matches!(conn.read_message().await, Err(GatewayError::Timeout)));
    }

    #[tokio::test]
    async fn nil_conn_fails_io() {
        let (conn, _client) = tcp_pair(TcpFraming::LengthPrefixed).await;
        conn.set_conn_nil();
        assert!(conn.is_nil());
        assert!(matches!(
            conn.write_message(MessageKind::Binary, b"x").await,
            Err(GatewayError::ConnNil)
        ));
        assert!(matches!(conn.read_message().await, Err(GatewayError::ConnNil)));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_twice_is_noop() {
        let (conn, mut client) = tcp_pair(TcpFraming::LengthPrefixed).await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_nil());

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_limit_and_handlers_are_noops() {
        let (conn, mut client) = tcp_pair(TcpFraming::LengthPrefixed).await;
        conn.set_read_limit(1);
        conn.set_ping_handler(Box::new(|_: &[u8]| Err(GatewayError::Other("unused".into()))));
        client.write_all(&frame_encode(b"longer than one").unwrap()).await.unwrap();
        let (_, data) = conn.read_message().await.unwrap();
        assert_eq!(data, b"longer than one");
    }

    #[tokio::test]
    async fn accept_loop_survives_transient_errors() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = Arc::new(TcpServer::new(
            "127.0.0.1:0",
            TcpFraming::LengthPrefixed,
            Arc::new(RecordingAgent { tx }),
        ));
        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = inner.local_addr().unwrap();

        let s = server.clone();
        let task = tokio::spawn(async move {
            s.serve(FlakyListener { inner, failures: 2 }).await;
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let ctx = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.remote_addr(), client.local_addr().unwrap().to_string());
        assert!(ctx.user_id().is_empty());
        assert_eq!(ctx.conn_id().len(), 32);

        let _second = TcpStream::connect(addr).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .is_some());

        server.close();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_before_serve_returns_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = TcpServer::new(
            "127.0.0.1:0",
            TcpFraming::LengthPrefixed,
            Arc::new(RecordingAgent { tx }),
        );
        server.close();
        let listener = server.bind().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.serve(listener))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ipv6_only_address_is_rejected() {
        assert!(resolve_ipv4("[::1]:0").await.is_err());
        let v4 = resolve_ipv4("127.0.0.1:0").await.unwrap();
        assert!(v4.is_ipv4());
    }
}
