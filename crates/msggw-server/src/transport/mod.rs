//! Transport adapters implementing [`msggw_core::LongConn`] and their
//! accept loops.

pub mod tcp;
pub mod websocket;

pub use tcp::{TcpFraming, TcpServer};
pub use websocket::WsConn;
