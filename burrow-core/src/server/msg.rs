//! Raw messages pulled off a comm point and the handle used to answer them
use bytes::Bytes;
use hickory_proto::{
    op::{Edns, Message, MessageType, OpCode},
    ProtoError,
};
use tokio::sync::mpsc;

use std::net::{IpAddr, SocketAddr};

use crate::mesh::QueryInfo;

/// A message pulled from TCP or UDP and serialized to bytes, stored with a
/// [`SocketAddr`]
///
/// [`SocketAddr`]: std::net::SocketAddr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialMsg {
    message: Bytes,
    addr: SocketAddr,
}

impl SerialMsg {
    /// Construct a new `SerialMsg` and the source or destination address
    pub fn new(message: Bytes, addr: SocketAddr) -> Self {
        SerialMsg { message, addr }
    }

    /// Get a reference to the bytes
    pub fn bytes(&self) -> &[u8] {
        &self.message
    }

    /// Clone underlying `Bytes` pointer
    pub fn msg(&self) -> Bytes {
        self.message.clone()
    }

    /// Get the source or destination address (context dependent)
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Deserializes the inner data into a `Message`
    pub fn to_msg(&self) -> Result<Message, ProtoError> {
        Message::from_vec(&self.message)
    }
}

/// An encoded response on its way out of the mesh
#[derive(Debug)]
pub struct Outgoing {
    /// the wire bytes (without any stream length prefix)
    pub bytes: Bytes,
    /// where to send
    pub dest: SocketAddr,
    /// source address to send from, when the receiving socket reported a
    /// packet destination address
    pub src_ip: Option<IpAddr>,
}

/// Where a client response gets written: a queue drained by the comm point
/// that owns the client's transport. Sending never blocks; a gone transport
/// surfaces as a send error which the mesh treats as a failed (but
/// delivered) write.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
    dest: SocketAddr,
    src_ip: Option<IpAddr>,
    stream: bool,
}

impl ReplyHandle {
    /// Reply over a datagram socket; `src_ip` carries the local destination
    /// address of the query packet when the socket reports it
    pub fn udp(tx: mpsc::UnboundedSender<Outgoing>, dest: SocketAddr, src_ip: Option<IpAddr>) -> Self {
        Self {
            tx,
            dest,
            src_ip,
            stream: false,
        }
    }

    /// Reply over an established TCP connection
    pub fn tcp(tx: mpsc::UnboundedSender<Outgoing>, dest: SocketAddr) -> Self {
        Self {
            tx,
            dest,
            src_ip: None,
            stream: true,
        }
    }

    /// Stream transports carry a length prefix and are never truncated
    pub fn is_stream(&self) -> bool {
        self.stream
    }

    /// The client address
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Queue the response for transmission
    pub fn send(&self, bytes: Bytes) -> Result<(), ()> {
        self.tx
            .send(Outgoing {
                bytes,
                dest: self.dest,
                src_ip: self.src_ip,
            })
            .map_err(|_| ())
    }
}

/// The parts of a client query the mesh needs
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    /// question section
    pub qinfo: QueryInfo,
    /// wire id
    pub qid: u16,
    /// opcode, echoed in the response
    pub opcode: OpCode,
    /// recursion desired
    pub rd: bool,
    /// checking disabled
    pub cd: bool,
    /// client edns, when present
    pub edns: Option<Edns>,
}

/// Parse a wire-format query into the parts the mesh keys and replies on.
/// Anything that is not a one-question query is rejected here; what to do
/// about other malformations is the first module's business.
pub fn parse_query(bytes: &[u8]) -> Result<ParsedQuery, ProtoError> {
    let msg = Message::from_vec(bytes)?;
    if msg.message_type() != MessageType::Query {
        return Err(ProtoError::from("message is not a query"));
    }
    let q = msg
        .queries()
        .first()
        .ok_or_else(|| ProtoError::from("query without question section"))?;
    Ok(ParsedQuery {
        qinfo: QueryInfo::new(q.name().clone(), q.query_type(), q.query_class()),
        qid: msg.id(),
        opcode: msg.op_code(),
        rd: msg.recursion_desired(),
        cd: msg.checking_disabled(),
        edns: msg.extensions().clone(),
    })
}
