//! Default client agent.
//!
//! [`EchoAgent`] runs the keepalive discipline a real message pipeline
//! would run and echoes every data frame back. It stands in for the
//! business logic that normally consumes decoded messages.

use msggw_core::{ClientAgent, ConnContext, ConnFuture, GatewayError, LongConn, MessageKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, Instrument, Span};

/// Keepalive timings.
#[derive(Debug, Clone)]
pub struct KeepaliveOptions {
    /// Read deadline, re-armed before each read and on every pong.
    pub pong_wait: Duration,
    /// Interval between pings; `None` disables the pinger (raw TCP has no
    /// control frames).
    pub ping_period: Option<Duration>,
    pub write_wait: Duration,
    /// Read limit; `0` leaves the transport's current limit in place.
    pub max_message_size: i64,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self {
            pong_wait: Duration::from_secs(30),
            ping_period: Some(Duration::from_secs(27)),
            write_wait: Duration::from_secs(10),
            max_message_size: 51200,
        }
    }
}

pub struct EchoAgent {
    options: KeepaliveOptions,
}

impl EchoAgent {
    pub fn new(options: KeepaliveOptions) -> Self {
        Self { options }
    }

    async fn serve(&self, ctx: ConnContext, conn: Arc<dyn LongConn>) {
        let opts = &self.options;
        if opts.max_message_size > 0 {
            conn.set_read_limit(opts.max_message_size);
        }

        let weak = Arc::downgrade(&conn);
        let pong_wait = opts.pong_wait;
        conn.set_pong_handler(Box::new(move |_: &[u8]| match weak.upgrade() {
            Some(conn) => conn.set_read_deadline(pong_wait),
            None => Ok(()),
        }));

        let pinger = opts.ping_period.map(|period| {
            tokio::spawn(ping_loop(conn.clone(), period, opts.write_wait).instrument(Span::current()))
        });

        let mut echoed = 0u64;
        loop {
            if conn.set_read_deadline(opts.pong_wait).is_err() {
                break;
            }
            let (kind, payload) = match conn.read_message().await {
                Ok(msg) => msg,
                Err(GatewayError::ConnClosed) => {
                    debug!("peer closed connection");
                    break;
                }
                Err(e) => {
                    info!(error = %e, "read failed");
                    break;
                }
            };

            if conn.set_write_deadline(opts.write_wait).is_err() {
                break;
            }
            if let Err(e) = conn.write_message(kind, &payload).await {
                info!(error = %e, "write failed");
                break;
            }
            echoed += 1;
        }

        if let Some(pinger) = pinger {
            pinger.abort();
        }
        if let Err(e) = conn.close().await {
            debug!(error = %e, "close failed");
        }
        info!(user_id = %ctx.user_id(), echoed, "connection finished");
    }
}

impl ClientAgent for EchoAgent {
    fn handle_conn(&self, ctx: ConnContext, conn: Box<dyn LongConn>) -> ConnFuture<'_, ()> {
        Box::pin(self.serve(ctx, Arc::from(conn)))
    }
}

async fn ping_loop(conn: Arc<dyn LongConn>, period: Duration, write_wait: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if conn.set_write_deadline(write_wait).is_err() {
            return;
        }
        if let Err(e) = conn.write_message(MessageKind::Ping, &[]).await {
            debug!(error = %e, "ping failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::TcpConnWrap;
    use crate::transport::{TcpFraming, WsConn};
    use futures_util::{SinkExt, StreamExt};
    use msggw_core::codec::{read_frame, write_frame};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    async fn tcp_pair() -> (TcpStream, TcpStream, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (server, client, peer.to_string())
    }

    #[tokio::test]
    async fn echoes_tcp_frames_until_peer_closes() {
        let (server, mut client, peer) = tcp_pair().await;
        let conn = TcpConnWrap::new(server, peer.clone(), TcpFraming::LengthPrefixed);
        let agent = Arc::new(EchoAgent::new(KeepaliveOptions {
            ping_period: None,
            ..KeepaliveOptions::default()
        }));

        let task = tokio::spawn({
            let agent = agent.clone();
            async move { agent.handle_conn(ConnContext::new(peer, ""), Box::new(conn)).await }
        });

        write_frame(&mut client, b"one").await.unwrap();
        assert_eq!(read_frame(&mut client).await.unwrap().unwrap(), b"one");
        write_frame(&mut client, b"two").await.unwrap();
        assert_eq!(read_frame(&mut client).await.unwrap().unwrap(), b"two");

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn websocket_gets_pings_and_echoes() {
        let (server, client, peer) = tcp_pair().await;
        let server_ws = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let mut client_ws = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let agent = Arc::new(EchoAgent::new(KeepaliveOptions {
            ping_period: Some(Duration::from_millis(50)),
            ..KeepaliveOptions::default()
        }));

        let task = tokio::spawn({
            let agent = agent.clone();
            let conn = WsConn::new(server_ws, peer.clone());
            async move { agent.handle_conn(ConnContext::new(peer, "u1"), Box::new(conn)).await }
        });

        client_ws.send(Message::Text("hello".into())).await.unwrap();
        let mut saw_echo = false;
        let mut saw_ping = false;
        while !(saw_echo && saw_ping) {
            let msg = tokio::time::timeout(Duration::from_secs(5), client_ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => {
                    assert_eq!(text, "hello");
                    saw_echo = true;
                }
                Message::Ping(_) => saw_ping = true,
                other => panic!("unexpected message {other:?}"),
            }
        }

        client_ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_read_deadline() {
        let (server, _client, peer) = tcp_pair().await;
        let conn = TcpConnWrap::new(server, peer.clone(), TcpFraming::LengthPrefixed);
        let agent = EchoAgent::new(KeepaliveOptions {
            pong_wait: Duration::from_secs(1),
            ping_period: None,
            ..KeepaliveOptions::default()
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            agent.handle_conn(ConnContext::new(peer, ""), Box::new(conn)),
        )
        .await
        .unwrap();
    }
}
