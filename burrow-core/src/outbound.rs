//! Contract between modules and whatever sends their upstream queries.
//!
//! Modules hand an [`OutboundEntry`] to an adapter when they need a query on
//! the wire; the entry carries the originating state's key so the reply can
//! be routed back in through `Mesh::report_reply`. The mesh itself never
//! talks to the network.
use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use std::net::SocketAddr;

use crate::{
    mesh::{QueryInfo, QueryKey},
    server::msg::SerialMsg,
};

/// Back-pointer from an in-flight upstream query to the state that asked
/// for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEntry {
    /// key of the originating mesh state
    pub key: QueryKey,
}

impl OutboundEntry {
    /// New entry for the given originating state
    pub fn new(key: QueryKey) -> Self {
        Self { key }
    }
}

/// An upstream reply (or timeout) delivered back to the originating state
#[derive(Debug)]
pub struct OutboundReply {
    /// false means the query timed out and `msg` is empty
    pub ok: bool,
    /// the raw reply message, when one arrived
    pub msg: Option<SerialMsg>,
}

/// A query a module wants on the wire
#[derive(Debug)]
pub struct OutboundQuery {
    /// routing info back to the originating state
    pub entry: OutboundEntry,
    /// what to ask upstream
    pub qinfo: QueryInfo,
    /// whether to set RD on the upstream query
    pub rd: bool,
    /// upstream server to ask
    pub dest: SocketAddr,
}

/// How modules request upstream queries. Implementations must not block;
/// they queue the query and return.
pub trait OutboundAdapter: Send + Sync + 'static {
    /// queue one query for transmission
    fn send_query(&self, query: OutboundQuery) -> Result<()>;
}

/// Channel-backed adapter: queries are handed to whatever owns the receive
/// half (an upstream transport task, or a test harness).
#[derive(Debug, Clone)]
pub struct ChannelOutbound {
    tx: mpsc::UnboundedSender<OutboundQuery>,
}

impl ChannelOutbound {
    /// Create the adapter and the receive half
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundQuery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutboundAdapter for ChannelOutbound {
    fn send_query(&self, query: OutboundQuery) -> Result<()> {
        self.tx
            .send(query)
            .map_err(|_| anyhow!("outbound transport is gone"))
    }
}
