//! WebSocket long connection and listener, using tokio-tungstenite.
//!
//! Each accepted TCP connection is handed to the [`WsUpgradeHandler`], which
//! authenticates the upgrade request and wraps the promoted socket in a
//! [`WsConn`].

use crate::handshake::WsUpgradeHandler;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use msggw_core::{
    ConnFuture, ConnState, GatewayError, GatewayResult, LongConn, MessageKind, PingPongHandler,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

type WsStream = WebSocketStream<TcpStream>;

/// A promoted WebSocket connection.
///
/// The socket is split so that one task can block in
/// [`LongConn::read_message`] while another writes. Ping frames are answered
/// by tungstenite itself; registered ping/pong handlers are invoked in
/// addition, from inside `read_message`.
pub struct WsConn {
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    state: ConnState,
    remote_addr: String,
}

impl WsConn {
    pub fn new(ws: WsStream, remote_addr: impl Into<String>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(Some(sink)),
            stream: Mutex::new(Some(stream)),
            state: ConnState::new(),
            remote_addr: remote_addr.into(),
        }
    }

    async fn send(&self, msg: Message) -> GatewayResult<()> {
        self.state.ensure_live()?;
        self.state
            .with_write_deadline(async {
                let mut sink = self.sink.lock().await;
                let sink = sink.as_mut().ok_or(GatewayError::ConnNil)?;
                sink.send(msg)
                    .await
                    .map_err(|e| GatewayError::Transport(format!("WS send failed: {e}")))
            })
            .await
    }

    async fn recv(&self) -> GatewayResult<(MessageKind, Vec<u8>)> {
        self.state.ensure_live()?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(GatewayError::ConnNil)?;

        loop {
            let next = self
                .state
                .with_read_deadline(async { Ok::<_, GatewayError>(stream.next().await) })
                .await?;

            let (kind, data) = match next {
                Some(Ok(Message::Text(text))) => (MessageKind::Text, text.into_bytes()),
                Some(Ok(Message::Binary(data))) => (MessageKind::Binary, data),
                Some(Ok(Message::Ping(payload))) => {
                    self.state.on_ping(&payload)?;
                    continue;
                }
                Some(Ok(Message::Pong(payload))) => {
                    self.state.on_pong(&payload)?;
                    continue;
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(GatewayError::ConnClosed),
                Some(Err(e)) => {
                    return Err(GatewayError::Transport(format!("WS recv failed: {e}")));
                }
            };

            if let Err(e) = self.state.check_read_limit(data.len()) {
                let frame = CloseFrame {
                    code: CloseCode::Size,
                    reason: "message too big".into(),
                };
                let _ = self.send(Message::Close(Some(frame))).await;
                return Err(e);
            }
            return Ok((kind, data));
        }
    }
}

impl LongConn for WsConn {
    fn close(&self) -> ConnFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            if !self.state.take_live() {
                return Ok(());
            }
            if let Ok(mut stream) = self.stream.try_lock() {
                stream.take();
            }
            let sink = self.sink.lock().await.take();
            if let Some(mut sink) = sink {
                sink.close()
                    .await
                    .map_err(|e| GatewayError::Transport(format!("WS close failed: {e}")))?;
            }
            Ok(())
        })
    }

    fn write_message<'a>(
        &'a self,
        kind: MessageKind,
        payload: &'a [u8],
    ) -> ConnFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let msg = match kind {
                MessageKind::Text => {
                    let text = String::from_utf8(payload.to_vec())
                        .map_err(|_| GatewayError::Other("text message is not valid UTF-8".into()))?;
                    Message::Text(text)
                }
                MessageKind::Binary => Message::Binary(payload.to_vec()),
                MessageKind::Ping => Message::Ping(payload.to_vec()),
                MessageKind::Pong => Message::Pong(payload.to_vec()),
                MessageKind::Close => Message::Close(None),
            };
            self.send(msg).await
        })
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
        if let Ok(mut sink) = self.sink.try_lock() {
            sink.take();
        }
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
    }

    fn set_read_limit(&self, limit: i64) {
        self.state.set_read_limit(limit);
    }

    fn set_pong_handler(&self, handler: PingPongHandler) {
        self.state.set_pong_handler(handler);
    }

    fn set_ping_handler(&self, handler: PingPongHandler) {
        self.state.set_ping_handler(handler);
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

/// Start the WebSocket listener.
///
/// Binds `bind_addr`, then accepts connections forever, spawning the upgrade
/// handler for each one. Returns the bound address and the accept-loop task.
/// Accept failures are logged and the loop continues.
pub async fn start_listener(
    bind_addr: &str,
    handler: Arc<WsUpgradeHandler>,
) -> GatewayResult<(SocketAddr, JoinHandle<()>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GatewayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(remote = %addr, "TCP connection accepted for WebSocket upgrade");
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, task))
}
