//! Per-connection identity and metadata.
//!
//! A [`ConnContext`] is built once per accepted connection, before it is
//! handed to the client agent, and travels with the connection until it
//! closes. Its `conn_id` is the correlation key for every log line tied to
//! the socket.

use crate::platform::platform_name;
use std::time::{SystemTime, UNIX_EPOCH};

/// Keys understood by [`ContextValues::value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    OpUserId,
    OperationId,
    ConnId,
    /// Resolves to the platform *name*, not the numeric id.
    OpUserPlatform,
    RemoteAddr,
}

/// Lookup of correlation values by key.
///
/// Lets downstream layers pull user id, operation id and friends out of a
/// context without depending on [`ConnContext`] itself.
pub trait ContextValues {
    fn value(&self, key: ContextKey) -> String;
}

/// Identity and metadata of a single logical connection.
#[derive(Debug, Clone, Default)]
pub struct ConnContext {
    platform_id: i32,
    operation_id: String,
    user_id: String,
    token: String,
    remote_addr: String,
    conn_id: String,
    is_background: bool,
    is_compress: bool,
}

impl ConnContext {
    /// Create a context for a connection from `remote_addr`.
    ///
    /// The connection id is derived from the address and the current
    /// millisecond timestamp.
    pub fn new(remote_addr: impl Into<String>, user_id: impl Into<String>) -> Self {
        let remote_addr = remote_addr.into();
        let conn_id = derive_conn_id(&remote_addr, unix_millis());
        Self {
            user_id: user_id.into(),
            remote_addr,
            conn_id,
            ..Default::default()
        }
    }

    /// An empty context with no identity and no connection id.
    pub fn temp() -> Self {
        Self::default()
    }

    pub fn with_platform_id(mut self, platform_id: i32) -> Self {
        self.platform_id = platform_id;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.is_compress = compression;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_background(mut self, background: bool) -> Self {
        self.is_background = background;
        self
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = operation_id.into();
        self
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn platform_id(&self) -> i32 {
        self.platform_id
    }

    pub fn platform_name(&self) -> &'static str {
        platform_name(self.platform_id)
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn set_operation_id(&mut self, operation_id: impl Into<String>) {
        self.operation_id = operation_id.into();
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    pub fn background(&self) -> bool {
        self.is_background
    }

    pub fn set_background(&mut self, background: bool) {
        self.is_background = background;
    }

    pub fn compression(&self) -> bool {
        self.is_compress
    }

    /// A tracing span carrying the correlation fields of this connection.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "conn",
            conn_id = %self.conn_id,
            user_id = %self.user_id,
            platform = self.platform_name(),
            remote = %self.remote_addr,
        )
    }
}

impl ContextValues for ConnContext {
    fn value(&self, key: ContextKey) -> String {
        match key {
            ContextKey::OpUserId => self.user_id.clone(),
            ContextKey::OperationId => self.operation_id.clone(),
            ContextKey::ConnId => self.conn_id.clone(),
            ContextKey::OpUserPlatform => self.platform_name().to_string(),
            ContextKey::RemoteAddr => self.remote_addr.clone(),
        }
    }
}

/// Derive a connection id: `md5_hex(remote_addr + "_" + millis)`.
///
/// Two connections from the same address within the same millisecond get the
/// same id.
pub fn derive_conn_id(remote_addr: &str, millis: u64) -> String {
    format!("{:x}", md5::compute(format!("{remote_addr}_{millis}")))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
