//! Per-query resolution state and the key that identifies it
use hickory_proto::{
    op::{Edns, OpCode, ResponseCode},
    rr::{DNSClass, Name, Record, RecordType},
};

use std::{
    any::Any,
    cmp::Ordering,
    collections::BTreeSet,
    fmt,
    time::Instant,
};

use crate::{modules::ModuleEvent, outbound::OutboundReply, server::msg::ReplyHandle};

/// state has at least one client reply attached
pub(crate) const DEBUG_CLIENT: u32 = 0x1;
/// state was created as a subquery of another state
pub(crate) const DEBUG_SUB: u32 = 0x2;
/// state has received an outbound reply
pub(crate) const DEBUG_REPLY: u32 = 0x4;

/// What is being asked: name, type and class from the question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInfo {
    /// queried name
    pub qname: Name,
    /// queried record type
    pub qtype: RecordType,
    /// queried class
    pub qclass: DNSClass,
}

impl QueryInfo {
    /// New query info
    pub fn new(qname: Name, qtype: RecordType, qclass: DNSClass) -> Self {
        Self {
            qname,
            qtype,
            qclass,
        }
    }
}

impl fmt::Display for QueryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.qname, self.qclass, self.qtype)
    }
}

/// Identity of a [`MeshState`]. The qname is held in canonical lowercase so
/// two spellings of the same name share a state. RD/CD are part of the key
/// because a client may turn them off, and priming queries never share
/// identity with an otherwise-identical client query.
#[derive(Debug, Clone)]
pub struct QueryKey {
    qinfo: QueryInfo,
    rd: bool,
    cd: bool,
    prime: bool,
}

impl QueryKey {
    /// Build a key, lowercasing the name
    pub fn new(qinfo: QueryInfo, rd: bool, cd: bool, prime: bool) -> Self {
        let qinfo = QueryInfo {
            qname: qinfo.qname.to_lowercase(),
            ..qinfo
        };
        Self {
            qinfo,
            rd,
            cd,
            prime,
        }
    }

    /// The canonicalized query info
    pub fn qinfo(&self) -> &QueryInfo {
        &self.qinfo
    }

    /// RD flag of the originating query
    pub fn rd(&self) -> bool {
        self.rd
    }

    /// CD flag of the originating query
    pub fn cd(&self) -> bool {
        self.cd
    }

    /// whether this is a priming query
    pub fn is_priming(&self) -> bool {
        self.prime
    }

    fn ord_key(&self) -> (&Name, u16, u16, bool, bool, bool) {
        (
            &self.qinfo.qname,
            u16::from(self.qinfo.qtype),
            u16::from(self.qinfo.qclass),
            self.rd,
            self.cd,
            self.prime,
        )
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.ord_key() == other.ord_key()
    }
}

impl Eq for QueryKey {}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ord_key().cmp(&other.ord_key())
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rd={} cd={}{}",
            self.qinfo,
            self.rd as u8,
            self.cd as u8,
            if self.prime { " prime" } else { "" }
        )
    }
}

/// One pending response destination attached to a state
#[derive(Debug)]
pub struct ClientReply {
    /// where the encoded response is written
    pub(crate) handle: ReplyHandle,
    /// edns data from the client query
    pub(crate) edns: Option<Edns>,
    /// id of the query, echoed in the response
    pub(crate) qid: u16,
    /// opcode of the original query
    pub(crate) opcode: OpCode,
    /// RD flag of the original query
    pub(crate) rd: bool,
    /// CD flag of the original query
    pub(crate) cd: bool,
    /// when the request entered the mesh
    pub(crate) start: Instant,
}

impl ClientReply {
    /// New pending reply, stamped with the current time
    pub fn new(
        handle: ReplyHandle,
        edns: Option<Edns>,
        qid: u16,
        opcode: OpCode,
        rd: bool,
        cd: bool,
    ) -> Self {
        Self {
            handle,
            edns,
            qid,
            opcode,
            rd,
            cd,
            start: Instant::now(),
        }
    }
}

/// The final answer a state produced, used to encode responses for every
/// attached client
#[derive(Debug, Clone)]
pub struct ReplyInfo {
    /// response code
    pub rcode: ResponseCode,
    /// AA flag for the response
    pub authoritative: bool,
    /// answer section
    pub answers: Vec<Record>,
    /// authority section
    pub authorities: Vec<Record>,
    /// additional section
    pub additionals: Vec<Record>,
}

impl Default for ReplyInfo {
    fn default() -> Self {
        Self {
            rcode: ResponseCode::NoError,
            authoritative: false,
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }
}

impl ReplyInfo {
    /// An answerless reply carrying only an rcode
    pub fn with_rcode(rcode: ResponseCode) -> Self {
        Self {
            rcode,
            ..Self::default()
        }
    }

    /// A NOERROR reply with the given answer section
    pub fn answer(answers: Vec<Record>) -> Self {
        Self {
            answers,
            ..Self::default()
        }
    }
}

/// One active resolution. Owns everything local to the query: the attached
/// client replies, the dependency edge sets, and per-module scratch. Removing
/// the state from the mesh releases all of it in one step.
pub struct MeshState {
    pub(crate) key: QueryKey,
    /// position in the module pipeline
    pub(crate) module_index: usize,
    /// event to deliver on the next tick; `None` reads as PASS
    pub(crate) pending_event: Option<ModuleEvent>,
    /// outbound reply to deliver on the next tick
    pub(crate) pending_outbound: Option<OutboundReply>,
    /// which modules have had their one-shot init
    pub(crate) inited: Vec<bool>,
    /// module-private per-state data, one slot per module
    minfo: Vec<Option<Box<dyn Any + Send>>>,
    /// clients awaiting this state's result, in arrival order
    pub(crate) reply_list: Vec<ClientReply>,
    /// states that want this state's result
    pub(crate) super_set: BTreeSet<QueryKey>,
    /// states this one needs to continue
    pub(crate) sub_set: BTreeSet<QueryKey>,
    /// the final answer once a module produced it
    pub(crate) reply_info: Option<ReplyInfo>,
    pub(crate) debug_flags: u32,
}

impl MeshState {
    pub(crate) fn new(key: QueryKey, num_modules: usize) -> Self {
        Self {
            key,
            module_index: 0,
            pending_event: Some(ModuleEvent::New),
            pending_outbound: None,
            inited: vec![false; num_modules],
            minfo: (0..num_modules).map(|_| None).collect(),
            reply_list: Vec::new(),
            super_set: BTreeSet::new(),
            sub_set: BTreeSet::new(),
            reply_info: None,
            debug_flags: 0,
        }
    }

    /// The key this state resolves
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The query this state resolves
    pub fn qinfo(&self) -> &QueryInfo {
        self.key.qinfo()
    }

    /// Current module pipeline position
    pub fn module_index(&self) -> usize {
        self.module_index
    }

    /// Module-private data for module `id`, if set and of type `T`
    pub fn info<T: Any + Send>(&self, id: usize) -> Option<&T> {
        self.minfo.get(id)?.as_ref()?.downcast_ref()
    }

    /// Mutable module-private data for module `id`
    pub fn info_mut<T: Any + Send>(&mut self, id: usize) -> Option<&mut T> {
        self.minfo.get_mut(id)?.as_mut()?.downcast_mut()
    }

    /// Store module-private data in slot `id`, replacing previous contents
    pub fn set_info<T: Any + Send>(&mut self, id: usize, value: T) {
        if let Some(slot) = self.minfo.get_mut(id) {
            *slot = Some(Box::new(value));
        }
    }

    /// Drop module-private data in slot `id`
    pub fn clear_info(&mut self, id: usize) {
        if let Some(slot) = self.minfo.get_mut(id) {
            *slot = None;
        }
    }

    /// Install the final answer; the scheduler fans it out on FINISHED
    pub fn set_reply_info(&mut self, rep: ReplyInfo) {
        self.reply_info = Some(rep);
    }

    /// The final answer, once produced
    pub fn reply_info(&self) -> Option<&ReplyInfo> {
        self.reply_info.as_ref()
    }

    /// Number of clients awaiting this state
    pub fn num_replies(&self) -> usize {
        self.reply_list.len()
    }

    /// Whether any state depends on this one
    pub fn has_supers(&self) -> bool {
        !self.super_set.is_empty()
    }

    /// detached means no client replies and no super-states: a toplevel
    /// internal query nothing is waiting on
    pub(crate) fn is_detached(&self) -> bool {
        self.reply_list.is_empty() && self.super_set.is_empty()
    }

    /// rough accounting of state-local memory
    pub(crate) fn mem_usage(&self) -> usize {
        use std::mem::size_of;
        size_of::<Self>()
            + self.reply_list.len() * size_of::<ClientReply>()
            + (self.super_set.len() + self.sub_set.len()) * size_of::<QueryKey>()
            + self.minfo.iter().flatten().count() * size_of::<Box<dyn Any + Send>>()
    }
}

impl fmt::Debug for MeshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshState")
            .field("key", &self.key)
            .field("module_index", &self.module_index)
            .field("pending_event", &self.pending_event)
            .field("replies", &self.reply_list.len())
            .field("supers", &self.super_set.len())
            .field("subs", &self.sub_set.len())
            .field("debug_flags", &self.debug_flags)
            .finish()
    }
}
