//! Gateway server: wires configuration into the listeners.
//!
//! Owns the token verifier and store, the connection limiter and the client
//! agents, and runs the WebSocket listener next to the optional raw TCP
//! listener.

use crate::agent::{EchoAgent, KeepaliveOptions};
use crate::config::ServerConfig;
use crate::handshake::{HandshakeOptions, WsUpgradeHandler};
use crate::limit::ConnectionLimiter;
use crate::transport::websocket::start_listener;
use crate::transport::TcpServer;
use msggw_core::{ClientAgent, GatewayError, GatewayResult, HmacTokenVerifier, MemoryTokenStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct GatewayServer {
    config: ServerConfig,
    ws_handler: Arc<WsUpgradeHandler>,
    tcp_server: Option<Arc<TcpServer>>,
    limiter: ConnectionLimiter,
}

/// Listener tasks of a started gateway.
pub struct RunningGateway {
    pub ws_addr: SocketAddr,
    pub tcp_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayServer {
    pub fn new(config: ServerConfig) -> GatewayResult<Self> {
        let verifier = Arc::new(HmacTokenVerifier::new(config.secret.clone()));

        let store = MemoryTokenStore::new();
        for seed in &config.token_seeds {
            store.set_token_status(&seed.user_id, seed.platform_id, &seed.token, seed.status);
        }
        info!(count = config.token_seeds.len(), "token store seeded");

        let limiter = ConnectionLimiter::new(config.max_conn_num);
        let keepalive = KeepaliveOptions {
            pong_wait: config.pong_wait,
            ping_period: Some(config.ping_period),
            write_wait: config.write_wait,
            max_message_size: config.max_message_size,
        };

        let ws_agent: Arc<dyn ClientAgent> = Arc::new(EchoAgent::new(keepalive.clone()));
        let ws_handler = Arc::new(WsUpgradeHandler::new(
            HandshakeOptions {
                handshake_timeout: config.handshake_timeout,
                write_buffer_size: config.write_buffer_size,
                max_message_size: config.max_message_size,
            },
            verifier,
            Arc::new(store),
            limiter.clone(),
            ws_agent,
        ));

        let tcp_server = config.tcp_addr().map(|addr| {
            let tcp_agent: Arc<dyn ClientAgent> = Arc::new(EchoAgent::new(KeepaliveOptions {
                ping_period: None,
                ..keepalive
            }));
            Arc::new(TcpServer::new(addr, config.tcp_framing, tcp_agent))
        });

        Ok(Self {
            config,
            ws_handler,
            tcp_server,
            limiter,
        })
    }

    /// Bind every listener and start accepting. Bind failures are returned
    /// here; nothing is left running when one occurs.
    pub async fn start(&self) -> GatewayResult<RunningGateway> {
        let tcp_listener = match &self.tcp_server {
            Some(tcp) => Some(tcp.bind().await?),
            None => {
                info!("TCP listener disabled");
                None
            }
        };

        let (ws_addr, ws_task) = start_listener(&self.config.ws_addr(), self.ws_handler.clone()).await?;
        let mut tasks = vec![ws_task];

        let mut tcp_addr = None;
        if let (Some(tcp), Some(listener)) = (&self.tcp_server, tcp_listener) {
            tcp_addr = Some(listener.local_addr()?);
            let tcp = tcp.clone();
            tasks.push(tokio::spawn(async move { tcp.serve(listener).await }));
        }

        Ok(RunningGateway {
            ws_addr,
            tcp_addr,
            tasks,
        })
    }

    /// Start and run until a listener task ends.
    pub async fn run(&self) -> GatewayResult<()> {
        let running = self.start().await?;
        info!(
            ws = %running.ws_addr,
            tcp = ?running.tcp_addr,
            max_conn_num = self.config.max_conn_num,
            "gateway running"
        );
        running.wait().await
    }

    /// Stop accepting raw TCP connections. Established connections are left
    /// to finish on their own.
    pub fn close(&self) {
        if let Some(tcp) = &self.tcp_server {
            tcp.close();
        }
        info!(online = self.limiter.active(), "gateway closing");
    }
}

impl RunningGateway {
    /// Wait for the first listener task to end.
    pub async fn wait(self) -> GatewayResult<()> {
        let (result, _, rest) = futures_util::future::select_all(self.tasks).await;
        for task in rest {
            task.abort();
        }
        match result {
            Ok(()) => {
                warn!("listener stopped");
                Ok(())
            }
            Err(e) => Err(GatewayError::Other(format!("listener task failed: {e}"))),
        }
    }
}
