//! msggw-core: shared library for the message gateway.
//!
//! Provides the per-connection context, the transport-agnostic long
//! connection contract, token verification and status lookup, the API
//! response envelope, stream framing, and the client agent contract.

pub mod agent;
pub mod codec;
pub mod context;
pub mod error;
pub mod long_conn;
pub mod platform;
pub mod resp;
pub mod token;

// Re-export commonly used items at crate root.
pub use agent::ClientAgent;
pub use context::{ConnContext, ContextKey, ContextValues};
pub use error::{GatewayError, GatewayResult};
pub use long_conn::{ConnFuture, ConnState, LongConn, MessageKind, PingPongHandler};
pub use resp::ApiResponse;
pub use token::{HmacTokenVerifier, MemoryTokenStore, TokenStatus, TokenStore, TokenVerifier};
