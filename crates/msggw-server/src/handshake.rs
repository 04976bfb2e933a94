//! WebSocket connection establishment.
//!
//! Each upgrade request goes through these steps, strictly in order:
//! 1. Read the HTTP request head.
//! 2. Reserve a slot in the [`ConnectionLimiter`].
//! 3. Parse the connection arguments (`token`, `sendID`, `platformID`,
//!    compression, `msgResp`). A limit or parse failure always gets a plain
//!    HTTP error, even when `msgResp` was requested.
//! 4. Build the [`ConnContext`], verify the token against the user and
//!    platform, then look the token up in the [`TokenStore`].
//! 5. On an auth failure without `msgResp`, answer with a plain HTTP error
//!    and stop. No upgrade is attempted.
//! 6. Upgrade to WebSocket. A request that is not a valid upgrade gets a
//!    plain HTTP 400, even when `msgResp` was requested.
//! 7. On an auth failure with `msgResp`, send the JSON error envelope as one
//!    text frame and close. Otherwise hand the [`WsConn`] to the client agent.
//!
//! The origin is never checked. Trust comes from the token check in step 4
//! alone; review it as such.

use crate::limit::{ConnectionGuard, ConnectionLimiter};
use crate::transport::WsConn;
use futures_util::SinkExt;
use msggw_core::token::check_token_status;
use msggw_core::{
    ApiResponse, ClientAgent, ConnContext, GatewayError, GatewayResult, LongConn, TokenStore,
    TokenVerifier,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::create_response;
use tokio_tungstenite::tungstenite::http::{Request, Response, StatusCode, Version};
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn, Instrument};

pub const TOKEN: &str = "token";
pub const WS_USER_ID: &str = "sendID";
pub const PLATFORM_ID: &str = "platformID";
pub const COMPRESSION: &str = "compression";
pub const MSG_RESP: &str = "msgResp";
pub const BACKGROUND_STATUS: &str = "isBackground";
pub const OPERATION_ID: &str = "operationID";
pub const GZIP_COMPRESSION_PROTOCOL: &str = "gzip";

const MAX_REQUEST_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// Arguments carried by an upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsArgs {
    pub token: String,
    pub user_id: String,
    pub platform_id: i32,
    pub compression: bool,
    pub msg_resp: bool,
    pub background: bool,
    pub operation_id: String,
}

/// Tunables for the upgrade handler.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Bound on reading the request head, and separately on the upgrade.
    pub handshake_timeout: Duration,
    /// WebSocket write buffer size; `0` keeps the tungstenite default.
    pub write_buffer_size: usize,
    /// Read limit applied to every new connection; `0` means unlimited.
    /// Also caps tungstenite's message and frame buffers, so a later
    /// `set_read_limit` can only lower it.
    pub max_message_size: i64,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            write_buffer_size: 0,
            max_message_size: 51200,
        }
    }
}

/// Authenticates WebSocket upgrade requests and hands accepted connections
/// to the client agent.
pub struct WsUpgradeHandler {
    options: HandshakeOptions,
    verifier: Arc<dyn TokenVerifier>,
    store: Arc<dyn TokenStore>,
    limiter: ConnectionLimiter,
    agent: Arc<dyn ClientAgent>,
}

struct RequestHead {
    request: Request<()>,
    /// Bytes read past the end of the head.
    leftover: Vec<u8>,
}

impl WsUpgradeHandler {
    pub fn new(
        options: HandshakeOptions,
        verifier: Arc<dyn TokenVerifier>,
        store: Arc<dyn TokenStore>,
        limiter: ConnectionLimiter,
        agent: Arc<dyn ClientAgent>,
    ) -> Self {
        Self {
            options,
            verifier,
            store,
            limiter,
            agent,
        }
    }

    /// Drive one accepted TCP connection through the upgrade protocol.
    pub async fn handle(&self, mut stream: TcpStream, remote_addr: SocketAddr) {
        let timeout = self.options.handshake_timeout;

        let head = match tokio::time::timeout(timeout, read_request_head(&mut stream)).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                debug!(remote = %remote_addr, error = %e, "invalid upgrade request");
                reject_http(&mut stream, &e).await;
                return;
            }
            Err(_) => {
                debug!(remote = %remote_addr, "no upgrade request within handshake timeout");
                return;
            }
        };

        let Some(slot) = self.limiter.try_acquire() else {
            warn!(remote = %remote_addr, online = self.limiter.active(), "connection limit reached");
            reject_http(&mut stream, &GatewayError::ConnOverMaxNumLimit).await;
            return;
        };

        let query = query_params(&head.request);
        let args = match self.parse_ws_args(&head.request, &query) {
            Ok(args) => args,
            Err(e) => {
                warn!(remote = %remote_addr, error = %e, "invalid connection arguments");
                reject_http(&mut stream, &e).await;
                return;
            }
        };

        let ctx = ConnContext::new(remote_addr.to_string(), args.user_id.as_str())
            .with_platform_id(args.platform_id)
            .with_token(args.token.as_str())
            .with_compression(args.compression)
            .with_background(args.background)
            .with_operation_id(args.operation_id.as_str());
        let span = ctx.span();

        let auth = self.authenticate(&args).await;
        if let Err(e) = &auth {
            if !args.msg_resp {
                warn!(parent: &span, error = %e, "connection rejected");
                reject_http(&mut stream, e).await;
                return;
            }
        }

        let ws = match tokio::time::timeout(timeout, self.upgrade(stream, head)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!(parent: &span, error = %e, "WebSocket upgrade failed");
                return;
            }
            Err(_) => {
                warn!(parent: &span, "WebSocket upgrade timed out");
                return;
            }
        };

        match auth {
            Err(e) => {
                drop(slot);
                warn!(parent: &span, error = %e, "connection rejected in-band");
                self.deliver_error(ws, &e).instrument(span).await;
            }
            Ok(()) => self.hand_off(ctx, ws, slot).instrument(span).await,
        }
    }

    /// Parse the connection arguments of an upgrade request.
    ///
    /// Failures here are always answered with a plain HTTP error, whatever
    /// `msgResp` says.
    pub fn parse_ws_args(
        &self,
        request: &Request<()>,
        query: &HashMap<String, String>,
    ) -> GatewayResult<WsArgs> {
        let token = required(query, TOKEN)?;
        let user_id = required(query, WS_USER_ID)?;
        let platform_id = required(query, PLATFORM_ID)?
            .parse::<i32>()
            .map_err(|_| GatewayError::ConnArgs("platformID is not int".into()))?;

        let header_compression = request
            .headers()
            .get(COMPRESSION)
            .and_then(|v| v.to_str().ok())
            == Some(GZIP_COMPRESSION_PROTOCOL);
        let compression = query.get(COMPRESSION).map(String::as_str)
            == Some(GZIP_COMPRESSION_PROTOCOL)
            || header_compression;

        Ok(WsArgs {
            token,
            user_id,
            platform_id,
            compression,
            msg_resp: flag(query, MSG_RESP),
            background: flag(query, BACKGROUND_STATUS),
            operation_id: query.get(OPERATION_ID).cloned().unwrap_or_default(),
        })
    }

    /// Verify the token against the user and platform, then check its status
    /// in the token store. The store is only consulted for a valid token.
    pub async fn authenticate(&self, args: &WsArgs) -> GatewayResult<()> {
        self.verifier
            .verify(&args.token, &args.user_id, args.platform_id)?;
        let tokens = self
            .store
            .get_tokens(&args.user_id, args.platform_id)
            .await?;
        check_token_status(&tokens, &args.token)
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        if self.options.write_buffer_size > 0 {
            config.write_buffer_size = self.options.write_buffer_size;
        }
        if let Ok(limit) = usize::try_from(self.options.max_message_size) {
            if limit > 0 {
                config.max_message_size = Some(limit);
                config.max_frame_size = Some(limit);
            }
        }
        config
    }

    /// Validate the upgrade headers, answer 101 and wrap the socket.
    async fn upgrade(
        &self,
        mut stream: TcpStream,
        head: RequestHead,
    ) -> GatewayResult<WebSocketStream<TcpStream>> {
        let response = match create_response(&head.request) {
            Ok(response) => response,
            Err(e) => {
                let err = GatewayError::Transport(format!("not a WebSocket upgrade: {e}"));
                if let Err(we) =
                    write_http_response(&mut stream, StatusCode::BAD_REQUEST, &err.to_string())
                        .await
                {
                    debug!(error = %we, "failed to write HTTP error");
                }
                return Err(err);
            }
        };

        stream.write_all(&encode_response_head(&response)).await?;
        stream.flush().await?;

        Ok(WebSocketStream::from_partially_read(
            stream,
            head.leftover,
            Role::Server,
            Some(self.ws_config()),
        )
        .await)
    }

    async fn deliver_error(&self, mut ws: WebSocketStream<TcpStream>, err: &GatewayError) {
        let timeout = self.options.handshake_timeout;
        match serde_json::to_string(&ApiResponse::from_error(err)) {
            Ok(data) => match tokio::time::timeout(timeout, ws.send(Message::Text(data))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "failed to send error response"),
                Err(_) => debug!("timed out sending error response"),
            },
            Err(e) => warn!(error = %e, "failed to encode error response"),
        }
        if let Ok(Err(e)) = tokio::time::timeout(timeout, ws.close(None)).await {
            debug!(error = %e, "close after error response failed");
        }
    }

    async fn hand_off(
        &self,
        ctx: ConnContext,
        ws: WebSocketStream<TcpStream>,
        _slot: ConnectionGuard,
    ) {
        let conn = WsConn::new(ws, ctx.remote_addr());
        if self.options.max_message_size > 0 {
            conn.set_read_limit(self.options.max_message_size);
        }

        info!(
            online = self.limiter.active(),
            compression = ctx.compression(),
            background = ctx.background(),
            "connection established"
        );
        self.agent.handle_conn(ctx, Box::new(conn)).await;
        debug!("client agent released connection");
    }
}

/// A required, non-empty query parameter.
fn required(query: &HashMap<String, String>, name: &str) -> GatewayResult<String> {
    match query.get(name) {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(GatewayError::ConnArgs(format!("{name} is empty"))),
    }
}

/// A boolean query flag; absent or unparseable values are `false`.
fn flag(query: &HashMap<String, String>, name: &str) -> bool {
    query.get(name).and_then(|v| parse_bool(v)).unwrap_or(false)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Decoded query parameters; the first occurrence of a name wins.
fn query_params(request: &Request<()>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = request.uri().query() {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(name.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }
    params
}

async fn read_request_head<S>(stream: &mut S) -> GatewayResult<RequestHead>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(GatewayError::Transport(
                "connection closed before request head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(head) = parse_request_head(&buf)? {
            return Ok(head);
        }
        if buf.len() > MAX_REQUEST_HEAD_SIZE {
            return Err(GatewayError::Args("request head too large".into()));
        }
    }
}

/// `Ok(None)` while the head is still incomplete.
fn parse_request_head(buf: &[u8]) -> GatewayResult<Option<RequestHead>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(GatewayError::Args(format!("malformed HTTP request: {e}"))),
    };

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(req.method.unwrap_or("GET"))
        .uri(req.path.unwrap_or("/"))
        .version(version);
    for header in req.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let request = builder
        .body(())
        .map_err(|e| GatewayError::Args(format!("invalid HTTP request: {e}")))?;

    Ok(Some(RequestHead {
        request,
        leftover: buf[len..].to_vec(),
    }))
}

fn encode_response_head(response: &Response<()>) -> Vec<u8> {
    let mut out = format!("{:?} {}\r\n", response.version(), response.status()).into_bytes();
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

async fn reject_http<S>(stream: &mut S, err: &GatewayError)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = write_http_error(stream, err).await {
        debug!(error = %e, "failed to write HTTP error");
    }
}

async fn write_http_error<S>(stream: &mut S, err: &GatewayError) -> GatewayResult<()>
where
    S: AsyncWrite + Unpin,
{
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    write_http_response(stream, status, &err.to_string()).await
}

/// Write a plain-text HTTP error and shut the stream down. The message is
/// also carried in the `ws_err_msg` header for clients that only see headers.
async fn write_http_response<S>(stream: &mut S, status: StatusCode, message: &str) -> GatewayResult<()>
where
    S: AsyncWrite + Unpin,
{
    let message: String = message.chars().filter(|c| !c.is_control()).collect();
    let body = format!("{message}\n");
    let head = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Sec-Websocket-Version: 13\r\n\
         Ws_err_msg: {message}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
