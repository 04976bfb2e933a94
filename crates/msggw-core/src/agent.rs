//! Client agent contract.

use crate::context::ConnContext;
use crate::long_conn::{ConnFuture, LongConn};

/// Takes ownership of an established connection and drives its read/write
/// lifecycle. The returned future completes when the agent is done with the
/// connection; the agent is responsible for closing it.
pub trait ClientAgent: Send + Sync {
    fn handle_conn(&self, ctx: ConnContext, conn: Box<dyn LongConn>) -> ConnFuture<'_, ()>;
}
