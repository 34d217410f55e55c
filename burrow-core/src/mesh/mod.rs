//! # Mesh
//!
//! The per-worker graph of in-flight resolution states. States are unique
//! per [`QueryKey`] and connected by super/sub dependency edges; clients
//! attach to states as [`ClientReply`] entries. The mesh drives each state
//! through the module pipeline with a cooperative run queue and fans the
//! final answer out to every attached client.
//!
//! Everything here runs on the one worker thread that owns the comm points;
//! there is no locking on mesh data.
use bytes::Bytes;
use hickory_proto::{
    op::{Edns, Message, MessageType, Query, ResponseCode},
    serialize::binary::{BinEncodable, BinEncoder},
    ProtoError,
};
use tracing::{debug, trace, warn};

use std::{
    collections::{BTreeMap, BTreeSet},
    mem::size_of,
    sync::Arc,
    time::{Duration, Instant},
};

pub mod hist;
pub mod state;

pub use hist::Timehist;
pub use state::{ClientReply, MeshState, QueryInfo, QueryKey, ReplyInfo};

use crate::{
    mesh::state::{DEBUG_CLIENT, DEBUG_REPLY, DEBUG_SUB},
    metrics,
    modules::{Module, ModuleEvent, ModuleExt},
    outbound::{OutboundEntry, OutboundReply},
    server::msg::{ParsedQuery, ReplyHandle, SerialMsg},
};

/// Smallest datagram response size every client can take
const MIN_UDP_MSG: usize = 512;
/// Stream responses are bounded by the 16-bit length prefix
const MAX_STREAM_MSG: usize = u16::MAX as usize;

/// Errors the mesh reports to callers. Every one of these is recoverable:
/// the specific operation fails and the caller treats it as a failed
/// subquery or answers SERVFAIL.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MeshError {
    /// attaching the subquery would close a dependency cycle
    #[error("subquery attachment would create a dependency cycle")]
    CycleRefused,
    /// the mesh is at its configured state limit
    #[error("mesh is at capacity")]
    Capacity,
}

/// Result of [`Mesh::attach_sub`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// a new sub state was created and scheduled
    Created,
    /// an existing state was reused
    Existing,
}

/// Counters the mesh maintains at edge transitions. `num_reply_states` can
/// never exceed `num_reply_addrs` because a state may carry several reply
/// addresses.
#[derive(Debug, Default)]
pub struct MeshStats {
    /// total number of attached client replies
    pub num_reply_addrs: usize,
    /// number of states that have client replies
    pub num_reply_states: usize,
    /// number of states with no replies and no supers: toplevel internal
    /// queries nothing is waiting on
    pub num_detached_states: usize,
    /// replies written (or attempted) to clients
    pub replies_sent: usize,
    /// sum of client waiting times
    pub replies_sum_wait: Duration,
    /// distribution of client waiting times
    pub histogram: Timehist,
}

/// The mesh of query states for one worker
pub struct Mesh {
    /// the module pipeline, driven in order per state
    modules: Vec<Arc<dyn Module>>,
    /// all current states, the canonical owner
    all: BTreeMap<QueryKey, MeshState>,
    /// states ready to execute; lowest key runs first so scheduling is
    /// reproducible
    run: BTreeSet<QueryKey>,
    stats: MeshStats,
    /// shared response encode buffer
    scratch: Vec<u8>,
    /// upper bound for encoded responses and the advertised edns size
    bufsize: usize,
    /// admission bound on `all`
    max_states: usize,
}

impl Mesh {
    /// New empty mesh driving the given module pipeline. `bufsize` bounds
    /// the shared response buffer, `max_states` bounds `all`.
    pub fn new(modules: Vec<Arc<dyn Module>>, bufsize: usize, max_states: usize) -> Self {
        Self {
            modules,
            all: BTreeMap::new(),
            run: BTreeSet::new(),
            stats: MeshStats::default(),
            scratch: Vec::with_capacity(bufsize),
            bufsize,
            max_states,
        }
    }

    /// Number of states currently in the mesh
    pub fn num_states(&self) -> usize {
        self.all.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    /// New query incoming from a client. Joins the existing state for the
    /// key if there is one (without re-running it), otherwise creates and
    /// runs a new state. If no state can be created the client gets a
    /// synthesized SERVFAIL so it is never left hanging.
    pub fn new_client(&mut self, q: ParsedQuery, handle: ReplyHandle) {
        let key = QueryKey::new(q.qinfo, q.rd, q.cd, false);
        let reply = ClientReply::new(handle, q.edns, q.qid, q.opcode, q.rd, q.cd);
        if let Some(state) = self.all.get_mut(&key) {
            debug!(%key, "query joins existing state");
            if state.reply_list.is_empty() {
                self.stats.num_reply_states += 1;
                if state.super_set.is_empty() {
                    self.stats.num_detached_states -= 1;
                }
            }
            state.debug_flags |= DEBUG_CLIENT;
            state.reply_list.push(reply);
            self.stats.num_reply_addrs += 1;
            return;
        }
        if self.all.len() >= self.max_states {
            debug!(%key, max_states = self.max_states, "mesh full, answering SERVFAIL");
            self.send_servfail(&key, &reply);
            return;
        }
        debug!(%key, "new query state");
        let mut state = MeshState::new(key.clone(), self.modules.len());
        state.debug_flags |= DEBUG_CLIENT;
        state.reply_list.push(reply);
        self.stats.num_reply_addrs += 1;
        self.stats.num_reply_states += 1;
        self.all.insert(key.clone(), state);
        self.run.insert(key);
        self.run_mesh();
    }

    /// An upstream reply (or timeout) has come back for `entry`'s state.
    /// Makes the state runnable with a REPLY event and processes the mesh
    /// until quiescent.
    pub fn report_reply(&mut self, entry: OutboundEntry, ok: bool, reply: Option<SerialMsg>) {
        let Some(state) = self.all.get_mut(&entry.key) else {
            debug!(key = %entry.key, "upstream reply for a state that is gone, dropped");
            return;
        };
        state.debug_flags |= DEBUG_REPLY;
        state.pending_outbound = Some(OutboundReply { ok, msg: reply });
        state.pending_event = Some(ModuleEvent::Reply);
        self.run.insert(entry.key);
        self.run_mesh();
    }

    /// Attach a subquery to `parent`, creating the sub state if needed.
    /// Refuses attachments that would close a dependency cycle; callers
    /// treat that as an ordinary subquery failure. Duplicate attach
    /// requests are idempotent.
    ///
    /// `parent` is the state currently being operated, held outside `all`
    /// by the scheduler.
    pub fn attach_sub(
        &mut self,
        parent: &mut MeshState,
        qinfo: QueryInfo,
        rd: bool,
        cd: bool,
        prime: bool,
    ) -> Result<Attach, MeshError> {
        let sub_key = QueryKey::new(qinfo, rd, cd, prime);
        if sub_key == parent.key || self.cycle_exists(&parent.key, &sub_key) {
            debug!(parent = %parent.key, sub = %sub_key, "subquery refused, would create cycle");
            return Err(MeshError::CycleRefused);
        }
        let created = if self.all.contains_key(&sub_key) {
            false
        } else {
            if self.all.len() >= self.max_states {
                return Err(MeshError::Capacity);
            }
            trace!(parent = %parent.key, sub = %sub_key, "creating subquery state");
            let mut sub = MeshState::new(sub_key.clone(), self.modules.len());
            sub.debug_flags |= DEBUG_SUB;
            self.all.insert(sub_key.clone(), sub);
            // a fresh sub is a detached candidate root until the edge lands
            self.stats.num_detached_states += 1;
            self.run.insert(sub_key.clone());
            true
        };
        parent.sub_set.insert(sub_key.clone());
        if let Some(sub) = self.all.get_mut(&sub_key) {
            let was_detached = sub.is_detached();
            sub.super_set.insert(parent.key.clone());
            if was_detached {
                self.stats.num_detached_states -= 1;
            }
        }
        Ok(if created {
            Attach::Created
        } else {
            Attach::Existing
        })
    }

    /// Find a state by key, for example a sub just attached with
    /// [`attach_sub`]. The state currently being operated is held by the
    /// scheduler and will not be found.
    ///
    /// [`attach_sub`]: Mesh::attach_sub
    pub fn find(
        &mut self,
        qinfo: &QueryInfo,
        rd: bool,
        cd: bool,
        prime: bool,
    ) -> Option<&mut MeshState> {
        self.all.get_mut(&QueryKey::new(qinfo.clone(), rd, cd, prime))
    }

    /// Remove all sub-query references from `parent`, keeping the subs'
    /// super-references correct. Subs left with no supers and no replies
    /// become detached; they are not deleted here, their own pipelines
    /// collect them on completion.
    pub fn detach_subs(&mut self, parent: &mut MeshState) {
        let subs = std::mem::take(&mut parent.sub_set);
        for sub_key in subs {
            if let Some(sub) = self.all.get_mut(&sub_key) {
                sub.super_set.remove(&parent.key);
                if sub.is_detached() {
                    self.stats.num_detached_states += 1;
                }
            }
        }
    }

    /// Would making `state` depend on the given query close a cycle?
    pub fn detect_cycle(
        &self,
        state: &MeshState,
        qinfo: &QueryInfo,
        rd: bool,
        cd: bool,
        prime: bool,
    ) -> bool {
        let sub_key = QueryKey::new(qinfo.clone(), rd, cd, prime);
        sub_key == state.key || self.cycle_exists(&state.key, &sub_key)
    }

    /// DFS down sub edges from the prospective dependency; if `from` shows
    /// up the attachment would close a cycle. Bounded by the size of `all`.
    fn cycle_exists(&self, from: &QueryKey, sub: &QueryKey) -> bool {
        let mut visited = BTreeSet::new();
        let mut stack = vec![sub.clone()];
        while let Some(key) = stack.pop() {
            if key == *from {
                return true;
            }
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(state) = self.all.get(&key) {
                stack.extend(state.sub_set.iter().cloned());
            }
        }
        false
    }

    /// Invoke `cb` for every state waiting on `state`'s result, in key
    /// order of the super-set. The callback may record the result in the
    /// super's module-private data; the mesh does not interpret it.
    pub fn walk_supers(&mut self, state: &MeshState, mut cb: impl FnMut(&mut MeshState)) {
        for skey in state.super_set.iter() {
            if let Some(sup) = self.all.get_mut(skey) {
                cb(sup);
            }
        }
    }

    /// Encode and send the response to every client attached to `state`,
    /// draining the reply list. A nonzero `rcode` overrides `rep`. Write
    /// failures are logged and the reply still counts as delivered.
    pub fn query_done(&mut self, state: &mut MeshState, rcode: ResponseCode, rep: Option<&ReplyInfo>) {
        if state.reply_list.is_empty() {
            return;
        }
        let err_rep;
        let rep = if rcode != ResponseCode::NoError {
            err_rep = ReplyInfo::with_rcode(rcode);
            &err_rep
        } else {
            match rep {
                Some(r) => r,
                None => {
                    err_rep = ReplyInfo::with_rcode(ResponseCode::ServFail);
                    &err_rep
                }
            }
        };
        let now = Instant::now();
        let drained = state.reply_list.len();
        for reply in state.reply_list.drain(..) {
            let limit = if reply.handle.is_stream() {
                MAX_STREAM_MSG
            } else {
                reply
                    .edns
                    .as_ref()
                    .map(|e| (e.max_payload() as usize).max(MIN_UDP_MSG))
                    .unwrap_or(MIN_UDP_MSG)
                    .min(self.bufsize)
            };
            match encode_reply(&mut self.scratch, &state.key, rep, &reply, limit, self.bufsize) {
                Ok(bytes) => {
                    if reply.handle.send(bytes).is_err() {
                        debug!(dest = %reply.handle.dest(), "client transport gone, response dropped");
                    }
                }
                Err(err) => warn!(?err, key = %state.key, "failed to encode response"),
            }
            let wait = now.saturating_duration_since(reply.start);
            self.stats.replies_sent += 1;
            self.stats.replies_sum_wait += wait;
            self.stats.histogram.add(wait);
            metrics::REPLIES_SENT.inc();
            metrics::REPLY_DURATION.observe(wait.as_secs_f64());
        }
        self.stats.num_reply_addrs -= drained;
        self.stats.num_reply_states -= 1;
        if state.super_set.is_empty() {
            // drained of clients with nothing waiting on it: now detached
            self.stats.num_detached_states += 1;
        }
    }

    /// Delete a state outright: detach every super/sub edge, release module
    /// data, drop attached replies without answering. Supers are woken so
    /// they can notice the dependency is gone.
    pub fn state_delete(&mut self, key: &QueryKey) {
        let Some(mut state) = self.all.remove(key) else {
            return;
        };
        self.run.remove(key);
        debug!(%key, replies = state.reply_list.len(), "deleting mesh state");
        if !state.reply_list.is_empty() {
            self.stats.num_reply_addrs -= state.reply_list.len();
            self.stats.num_reply_states -= 1;
            state.reply_list.clear();
        } else if state.is_detached() {
            self.stats.num_detached_states -= 1;
        }
        let supers = state.super_set.iter().cloned().collect::<Vec<_>>();
        for skey in supers {
            if let Some(sup) = self.all.get_mut(&skey) {
                sup.sub_set.remove(key);
                sup.pending_event = Some(ModuleEvent::Pass);
                self.run.insert(skey);
            }
        }
        let subs = state.sub_set.iter().cloned().collect::<Vec<_>>();
        for bkey in subs {
            if let Some(sub) = self.all.get_mut(&bkey) {
                sub.super_set.remove(key);
                if sub.is_detached() {
                    self.stats.num_detached_states += 1;
                }
            }
        }
        let modules = self.modules.clone();
        for (id, module) in modules.iter().enumerate() {
            module.clear(&mut state, id);
        }
    }

    /// Run all runnable states until the queue is drained. Each pick takes
    /// the lowest key, ticks the state's current module once, and acts on
    /// the return code. New runnable states created along the way (subs,
    /// woken supers) are processed in the same drain.
    fn run_mesh(&mut self) {
        while let Some(key) = self.run.pop_first() {
            let Some(mut state) = self.all.remove(&key) else {
                continue;
            };
            let ev = state.pending_event.take().unwrap_or(ModuleEvent::Pass);
            let outbound = state.pending_outbound.take();
            let idx = state.module_index;
            let Some(module) = self.modules.get(idx).cloned() else {
                warn!(%key, idx, "state points past the module list, failing query");
                self.finish_state(state, ResponseCode::ServFail);
                continue;
            };
            if !state.inited[idx] {
                state.inited[idx] = true;
                module.init(&mut state, idx);
            }
            trace!(%key, module = module.name(), ?ev, "operate");
            let ext = module.operate(self, &mut state, idx, ev, outbound);
            trace!(%key, module = module.name(), ?ext, "operate returned");
            match ext {
                ModuleExt::Wait => {
                    self.all.insert(key, state);
                }
                ModuleExt::Next => {
                    if idx + 1 >= self.modules.len() {
                        warn!(%key, module = module.name(), "last module passed the query on, failing");
                        self.finish_state(state, ResponseCode::ServFail);
                    } else {
                        state.module_index = idx + 1;
                        state.pending_event = Some(ModuleEvent::Pass);
                        self.all.insert(key.clone(), state);
                        self.run.insert(key);
                    }
                }
                ModuleExt::Restart => {
                    if idx == 0 {
                        warn!(%key, module = module.name(), "first module restarted upstream, failing");
                        self.finish_state(state, ResponseCode::ServFail);
                    } else {
                        state.module_index = idx - 1;
                        state.pending_event = Some(ModuleEvent::Pass);
                        self.all.insert(key.clone(), state);
                        self.run.insert(key);
                    }
                }
                ModuleExt::Finished => self.finish_state(state, ResponseCode::NoError),
                ModuleExt::Error(rcode) => self.finish_state(state, rcode),
            }
        }
    }

    /// Completion: fan the answer out to clients, wake supers with MODDONE,
    /// drop all edges and destroy the state. Dropping the state releases
    /// every state-local allocation in one step.
    fn finish_state(&mut self, mut state: MeshState, rcode: ResponseCode) {
        let rcode = if rcode == ResponseCode::NoError && state.reply_info.is_none() {
            ResponseCode::ServFail
        } else {
            rcode
        };
        let rep = state.reply_info.take();
        self.query_done(&mut state, rcode, rep.as_ref());
        if state.is_detached() {
            self.stats.num_detached_states -= 1;
        }
        let supers = state.super_set.iter().cloned().collect::<Vec<_>>();
        for skey in supers {
            if let Some(sup) = self.all.get_mut(&skey) {
                sup.sub_set.remove(&state.key);
                sup.pending_event = Some(ModuleEvent::ModDone);
                self.run.insert(skey);
            }
        }
        state.super_set.clear();
        let subs = state.sub_set.iter().cloned().collect::<Vec<_>>();
        for bkey in subs {
            if let Some(sub) = self.all.get_mut(&bkey) {
                sub.super_set.remove(&state.key);
                if sub.is_detached() {
                    self.stats.num_detached_states += 1;
                }
            }
        }
        state.sub_set.clear();
        self.run.remove(&state.key);
        let modules = self.modules.clone();
        for (id, module) in modules.iter().enumerate() {
            module.clear(&mut state, id);
        }
    }

    /// The client could not get a state; answer SERVFAIL directly so it is
    /// not left waiting for a timeout.
    fn send_servfail(&mut self, key: &QueryKey, reply: &ClientReply) {
        let rep = ReplyInfo::with_rcode(ResponseCode::ServFail);
        let limit = if reply.handle.is_stream() {
            MAX_STREAM_MSG
        } else {
            MIN_UDP_MSG.min(self.bufsize)
        };
        match encode_reply(&mut self.scratch, key, &rep, reply, limit, self.bufsize) {
            Ok(bytes) => {
                if reply.handle.send(bytes).is_err() {
                    debug!(dest = %reply.handle.dest(), "client transport gone, SERVFAIL dropped");
                }
            }
            Err(err) => warn!(?err, %key, "failed to encode SERVFAIL"),
        }
    }

    /// Rough bytes in use by the mesh and all states inside it
    pub fn mem_usage(&self) -> usize {
        size_of::<Self>()
            + self.scratch.capacity()
            + self
                .all
                .values()
                .map(|s| size_of::<QueryKey>() + s.mem_usage())
                .sum::<usize>()
            + self.run.len() * size_of::<QueryKey>()
    }

    /// Log a stats line, tagged with `why`
    pub fn log_stats(&self, why: &str) {
        let s = &self.stats;
        let avg_ms = if s.replies_sent > 0 {
            (s.replies_sum_wait / s.replies_sent as u32).as_millis() as u64
        } else {
            0
        };
        tracing::info!(
            why,
            current = self.all.len(),
            reply_states = s.num_reply_states,
            detached = s.num_detached_states,
            replies_sent = s.replies_sent,
            avg_wait_ms = avg_ms,
            median_wait_ms = s.histogram.median_ms(),
            mem = self.mem_usage(),
            "mesh stats"
        );
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.log_stats("shutdown");
        // release module-held per-state data before the states go
        let modules = self.modules.clone();
        for state in self.all.values_mut() {
            for (id, module) in modules.iter().enumerate() {
                module.clear(state, id);
            }
        }
    }
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("states", &self.all.len())
            .field("runnable", &self.run.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Encode one response into the shared scratch buffer. Datagram responses
/// over `limit` are replaced by a truncated header-only response so the
/// client retries over TCP.
fn encode_reply(
    scratch: &mut Vec<u8>,
    key: &QueryKey,
    rep: &ReplyInfo,
    reply: &ClientReply,
    limit: usize,
    advertise: usize,
) -> Result<Bytes, ProtoError> {
    let msg = build_response(key, rep, reply, advertise, false);
    scratch.clear();
    {
        let mut enc = BinEncoder::new(scratch);
        msg.emit(&mut enc)?;
    }
    if !reply.handle.is_stream() && scratch.len() > limit {
        let empty = ReplyInfo::with_rcode(rep.rcode);
        let msg = build_response(key, &empty, reply, advertise, true);
        scratch.clear();
        let mut enc = BinEncoder::new(scratch);
        msg.emit(&mut enc)?;
    }
    Ok(Bytes::copy_from_slice(scratch))
}

fn build_response(
    key: &QueryKey,
    rep: &ReplyInfo,
    reply: &ClientReply,
    advertise: usize,
    truncated: bool,
) -> Message {
    let mut msg = Message::new();
    msg.set_id(reply.qid)
        .set_message_type(MessageType::Response)
        .set_op_code(reply.opcode)
        .set_recursion_desired(reply.rd)
        .set_recursion_available(true)
        .set_checking_disabled(reply.cd)
        .set_authoritative(rep.authoritative)
        .set_truncated(truncated)
        .set_response_code(rep.rcode);
    let mut q = Query::query(key.qinfo().qname.clone(), key.qinfo().qtype);
    q.set_query_class(key.qinfo().qclass);
    msg.add_query(q);
    for r in &rep.answers {
        msg.add_answer(r.clone());
    }
    for r in &rep.authorities {
        msg.add_name_server(r.clone());
    }
    for r in &rep.additionals {
        msg.add_additional(r.clone());
    }
    if reply.edns.is_some() {
        let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(advertise.min(MAX_STREAM_MSG) as u16);
        edns.set_version(0);
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        modules::refuse::Refuse,
        outbound::{ChannelOutbound, OutboundAdapter, OutboundQuery},
        server::msg::{Outgoing, ParsedQuery},
    };
    use hickory_proto::{
        op::OpCode,
        rr::{rdata::A, DNSClass, Name, RData, Record, RecordType},
    };
    use std::{net::Ipv4Addr, str::FromStr, sync::Mutex};
    use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};

    const BUFSIZE: usize = 65535;

    fn qinfo(name: &str) -> QueryInfo {
        QueryInfo::new(Name::from_str(name).unwrap(), RecordType::A, DNSClass::IN)
    }

    fn key(name: &str) -> QueryKey {
        QueryKey::new(qinfo(name), true, false, false)
    }

    fn parsed(name: &str, qid: u16) -> ParsedQuery {
        ParsedQuery {
            qinfo: qinfo(name),
            qid,
            opcode: OpCode::Query,
            rd: true,
            cd: false,
            edns: None,
        }
    }

    fn handle() -> (ReplyHandle, UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplyHandle::udp(tx, "127.0.0.1:5342".parse().unwrap(), None), rx)
    }

    fn a_record(name: &str, ip: [u8; 4]) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            60,
            RData::A(A(Ipv4Addr::from(ip))),
        )
    }

    fn recv_msg(rx: &mut UnboundedReceiver<Outgoing>) -> Message {
        let out = rx.try_recv().expect("expected a response");
        Message::from_vec(&out.bytes).expect("response parses")
    }

    /// parks every state; the test drives completion by hand
    struct Hold;

    impl Module for Hold {
        fn name(&self) -> &'static str {
            "hold"
        }

        fn operate(
            &self,
            _mesh: &mut Mesh,
            _state: &mut MeshState,
            _id: usize,
            _event: ModuleEvent,
            _outbound: Option<OutboundReply>,
        ) -> ModuleExt {
            ModuleExt::Wait
        }
    }

    /// sends one upstream query per state and answers when the reply comes
    struct Upstream {
        adapter: ChannelOutbound,
    }

    impl Module for Upstream {
        fn name(&self) -> &'static str {
            "upstream"
        }

        fn operate(
            &self,
            _mesh: &mut Mesh,
            state: &mut MeshState,
            _id: usize,
            event: ModuleEvent,
            outbound: Option<OutboundReply>,
        ) -> ModuleExt {
            match event {
                ModuleEvent::New => {
                    self.adapter
                        .send_query(OutboundQuery {
                            entry: OutboundEntry::new(state.key().clone()),
                            qinfo: state.qinfo().clone(),
                            rd: false,
                            dest: "192.0.2.53:53".parse().unwrap(),
                        })
                        .unwrap();
                    ModuleExt::Wait
                }
                ModuleEvent::Reply => match outbound {
                    Some(o) if o.ok => {
                        let name = state.qinfo().qname.to_string();
                        state.set_reply_info(ReplyInfo::answer(vec![a_record(&name, [192, 0, 2, 1])]));
                        ModuleExt::Finished
                    }
                    _ => ModuleExt::Error(ResponseCode::ServFail),
                },
                _ => ModuleExt::Wait,
            }
        }
    }

    /// the target query waits for an upstream reply; everything else
    /// attaches the target as a sub and finishes once it is done
    struct Fanout {
        target: QueryInfo,
        log: Arc<Mutex<Vec<(String, ModuleEvent)>>>,
    }

    impl Module for Fanout {
        fn name(&self) -> &'static str {
            "fanout"
        }

        fn operate(
            &self,
            mesh: &mut Mesh,
            state: &mut MeshState,
            _id: usize,
            event: ModuleEvent,
            _outbound: Option<OutboundReply>,
        ) -> ModuleExt {
            self.log
                .lock()
                .unwrap()
                .push((state.qinfo().qname.to_string(), event));
            if state.qinfo() == &self.target {
                match event {
                    ModuleEvent::Reply => {
                        state.set_reply_info(ReplyInfo::answer(vec![a_record(
                            "u.test.",
                            [192, 0, 2, 7],
                        )]));
                        ModuleExt::Finished
                    }
                    _ => ModuleExt::Wait,
                }
            } else {
                match event {
                    ModuleEvent::New => {
                        mesh.attach_sub(state, self.target.clone(), true, false, false)
                            .unwrap();
                        ModuleExt::Wait
                    }
                    ModuleEvent::ModDone => {
                        state.set_reply_info(ReplyInfo::answer(vec![]));
                        ModuleExt::Finished
                    }
                    _ => ModuleExt::Wait,
                }
            }
        }
    }

    #[test]
    fn dedup_two_clients_one_state() {
        let (adapter, mut outq) = ChannelOutbound::new();
        let mut mesh = Mesh::new(vec![Arc::new(Upstream { adapter })], BUFSIZE, 128);
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        mesh.new_client(parsed("example.com.", 1), h1);
        // different spelling, same canonical key
        mesh.new_client(parsed("EXAMPLE.com.", 2), h2);

        assert_eq!(mesh.num_states(), 1);
        assert_eq!(mesh.stats().num_reply_addrs, 2);
        assert_eq!(mesh.stats().num_reply_states, 1);

        // exactly one set of upstream queries for both clients
        let q = outq.try_recv().expect("one upstream query");
        assert!(matches!(outq.try_recv(), Err(TryRecvError::Empty)));

        mesh.report_reply(q.entry, true, None);
        let m1 = recv_msg(&mut rx1);
        let m2 = recv_msg(&mut rx2);
        assert_eq!(m1.id(), 1);
        assert_eq!(m2.id(), 2);
        assert_eq!(m1.response_code(), ResponseCode::NoError);
        assert_eq!(m1.answers(), m2.answers());

        assert_eq!(mesh.stats().replies_sent, 2);
        assert_eq!(mesh.num_states(), 0);
        assert_eq!(mesh.stats().num_reply_addrs, 0);
        assert_eq!(mesh.stats().num_reply_states, 0);
        assert_eq!(mesh.stats().num_detached_states, 0);
    }

    #[test]
    fn cycle_attachment_refused() {
        let mut mesh = Mesh::new(vec![Arc::new(Hold)], BUFSIZE, 128);
        let (h, _rx) = handle();
        mesh.new_client(parsed("a.test.", 1), h);

        let akey = key("a.test.");
        let mut a = mesh.all.remove(&akey).unwrap();
        assert_eq!(
            mesh.attach_sub(&mut a, qinfo("b.test."), true, false, false),
            Ok(Attach::Created)
        );
        mesh.all.insert(akey.clone(), a);

        // b depending back on a closes the loop
        let bkey = key("b.test.");
        let mut b = mesh.all.remove(&bkey).unwrap();
        assert!(mesh.detect_cycle(&b, &qinfo("a.test."), true, false, false));
        assert_eq!(
            mesh.attach_sub(&mut b, qinfo("a.test."), true, false, false),
            Err(MeshError::CycleRefused)
        );
        // self dependency is refused as well
        assert_eq!(
            mesh.attach_sub(&mut b, qinfo("b.test."), true, false, false),
            Err(MeshError::CycleRefused)
        );
        assert!(b.sub_set.is_empty());
        mesh.all.insert(bkey, b);

        let a = mesh.all.get(&akey).unwrap();
        assert_eq!(a.sub_set.len(), 1);
        assert!(a.super_set.is_empty());
    }

    #[test]
    fn attach_idempotent_detach_restores() {
        let mut mesh = Mesh::new(vec![Arc::new(Hold)], BUFSIZE, 128);
        let (h, _rx) = handle();
        mesh.new_client(parsed("p.test.", 1), h);

        let pkey = key("p.test.");
        let mut p = mesh.all.remove(&pkey).unwrap();
        assert_eq!(
            mesh.attach_sub(&mut p, qinfo("s.test."), true, false, false),
            Ok(Attach::Created)
        );
        assert_eq!(mesh.stats().num_detached_states, 0);
        // second attach is a no-op on edge counts
        assert_eq!(
            mesh.attach_sub(&mut p, qinfo("s.test."), true, false, false),
            Ok(Attach::Existing)
        );
        assert_eq!(p.sub_set.len(), 1);
        assert_eq!(mesh.all.get(&key("s.test.")).unwrap().super_set.len(), 1);

        mesh.detach_subs(&mut p);
        assert!(p.sub_set.is_empty());
        assert!(mesh.all.get(&key("s.test.")).unwrap().super_set.is_empty());
        assert_eq!(mesh.stats().num_detached_states, 1);
        mesh.all.insert(pkey, p);
    }

    #[test]
    fn super_fanout_in_key_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let target = qinfo("u.test.");
        let mut mesh = Mesh::new(
            vec![Arc::new(Fanout {
                target: target.clone(),
                log: Arc::clone(&log),
            })],
            BUFSIZE,
            128,
        );
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        mesh.new_client(parsed("a.test.", 11), h1);
        mesh.new_client(parsed("b.test.", 22), h2);
        // a, b and the shared sub u
        assert_eq!(mesh.num_states(), 3);
        assert_eq!(mesh.all.get(&key("u.test.")).unwrap().super_set.len(), 2);

        mesh.report_reply(OutboundEntry::new(key("u.test.")), true, None);

        // u is destroyed, both supers woke with MODDONE in key order
        assert_eq!(mesh.num_states(), 0);
        let moddone = log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, ev)| *ev == ModuleEvent::ModDone)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        assert_eq!(moddone, vec!["a.test.".to_string(), "b.test.".to_string()]);

        assert_eq!(recv_msg(&mut rx1).response_code(), ResponseCode::NoError);
        assert_eq!(recv_msg(&mut rx2).response_code(), ResponseCode::NoError);
        assert_eq!(mesh.stats().replies_sent, 2);
        assert_eq!(mesh.stats().num_detached_states, 0);
    }

    #[test]
    fn full_mesh_answers_servfail() {
        let mut mesh = Mesh::new(vec![Arc::new(Hold)], BUFSIZE, 1);
        let (h1, _rx1) = handle();
        let (h2, mut rx2) = handle();
        mesh.new_client(parsed("one.test.", 7), h1);
        mesh.new_client(parsed("two.test.", 9), h2);

        let m = recv_msg(&mut rx2);
        assert_eq!(m.id(), 9);
        assert_eq!(m.message_type(), MessageType::Response);
        assert_eq!(m.response_code(), ResponseCode::ServFail);
        // the full mesh is untouched
        assert_eq!(mesh.num_states(), 1);
        assert_eq!(mesh.stats().num_reply_addrs, 1);
    }

    #[test]
    fn pipeline_bounds_fail_the_query() {
        struct Bounce;
        impl Module for Bounce {
            fn name(&self) -> &'static str {
                "bounce"
            }
            fn operate(
                &self,
                _mesh: &mut Mesh,
                _state: &mut MeshState,
                _id: usize,
                _event: ModuleEvent,
                _outbound: Option<OutboundReply>,
            ) -> ModuleExt {
                ModuleExt::Restart
            }
        }
        struct Passer;
        impl Module for Passer {
            fn name(&self) -> &'static str {
                "passer"
            }
            fn operate(
                &self,
                _mesh: &mut Mesh,
                _state: &mut MeshState,
                _id: usize,
                _event: ModuleEvent,
                _outbound: Option<OutboundReply>,
            ) -> ModuleExt {
                ModuleExt::Next
            }
        }

        // restarting upstream of the first module fails the query
        let mut mesh = Mesh::new(vec![Arc::new(Bounce)], BUFSIZE, 128);
        let (h, mut rx) = handle();
        mesh.new_client(parsed("r.test.", 3), h);
        assert_eq!(recv_msg(&mut rx).response_code(), ResponseCode::ServFail);
        assert_eq!(mesh.num_states(), 0);

        // so does walking past the last module
        let mut mesh = Mesh::new(vec![Arc::new(Passer)], BUFSIZE, 128);
        let (h, mut rx) = handle();
        mesh.new_client(parsed("n.test.", 4), h);
        assert_eq!(recv_msg(&mut rx).response_code(), ResponseCode::ServFail);
        assert_eq!(mesh.num_states(), 0);
    }

    #[test]
    fn encode_roundtrip_and_truncation() {
        let k = key("big.test.");
        let answers = (0..40)
            .map(|i| a_record("big.test.", [10, 0, (i / 256) as u8, (i % 256) as u8]))
            .collect::<Vec<_>>();
        let rep = ReplyInfo::answer(answers.clone());
        let mut scratch = Vec::new();

        // stream handle: no truncation, full answer set round-trips
        let (tx, _rx) = mpsc::unbounded_channel();
        let tcp_reply = ClientReply::new(
            ReplyHandle::tcp(tx, "127.0.0.1:5342".parse().unwrap()),
            Some(Edns::new()),
            0x55,
            OpCode::Query,
            true,
            false,
        );
        let bytes = encode_reply(&mut scratch, &k, &rep, &tcp_reply, MAX_STREAM_MSG, BUFSIZE).unwrap();
        let m = Message::from_vec(&bytes).unwrap();
        assert_eq!(m.id(), 0x55);
        assert!(m.recursion_desired());
        assert!(m.recursion_available());
        assert!(!m.truncated());
        assert_eq!(m.message_type(), MessageType::Response);
        assert_eq!(m.answers(), answers.as_slice());
        assert!(m.extensions().is_some());

        // datagram handle with a 512 byte limit: TC bit, records stripped
        let (tx, _rx) = mpsc::unbounded_channel();
        let udp_reply = ClientReply::new(
            ReplyHandle::udp(tx, "127.0.0.1:5342".parse().unwrap(), None),
            Some(Edns::new()),
            0x55,
            OpCode::Query,
            true,
            false,
        );
        let bytes = encode_reply(&mut scratch, &k, &rep, &udp_reply, 512, BUFSIZE).unwrap();
        let m = Message::from_vec(&bytes).unwrap();
        assert!(m.truncated());
        assert!(m.answers().is_empty());
        assert_eq!(m.queries().len(), 1);
    }

    #[test]
    fn write_failure_still_counts_as_delivered() {
        let mut mesh = Mesh::new(vec![Arc::new(Refuse)], BUFSIZE, 128);
        let (h, rx) = handle();
        drop(rx);
        mesh.new_client(parsed("gone.test.", 1), h);
        assert_eq!(mesh.stats().replies_sent, 1);
        assert_eq!(mesh.num_states(), 0);
    }

    #[test]
    fn priming_never_shares_a_state() {
        let mut mesh = Mesh::new(vec![Arc::new(Hold)], BUFSIZE, 128);
        let (h, _rx) = handle();
        mesh.new_client(parsed("root.test.", 1), h);

        let pkey = key("root.test.");
        let mut p = mesh.all.remove(&pkey).unwrap();
        // identical qinfo but priming: a distinct state is created
        assert_eq!(
            mesh.attach_sub(&mut p, qinfo("root.test."), true, false, true),
            Ok(Attach::Created)
        );
        mesh.all.insert(pkey, p);
        assert_eq!(mesh.num_states(), 2);
    }

    #[test]
    fn walk_supers_mutates_super_state() {
        let mut mesh = Mesh::new(vec![Arc::new(Hold)], BUFSIZE, 128);
        let (h, _rx) = handle();
        mesh.new_client(parsed("p.test.", 1), h);

        let pkey = key("p.test.");
        let mut p = mesh.all.remove(&pkey).unwrap();
        mesh.attach_sub(&mut p, qinfo("s.test."), true, false, false)
            .unwrap();
        mesh.all.insert(pkey.clone(), p);
        assert!(mesh.find(&qinfo("s.test."), true, false, false).is_some());
        assert!(mesh.find(&qinfo("s.test."), true, false, true).is_none());

        let skey = key("s.test.");
        let s = mesh.all.remove(&skey).unwrap();
        let mut walked = 0;
        mesh.walk_supers(&s, |sup| {
            sup.set_info(0, 42u32);
            walked += 1;
        });
        mesh.all.insert(skey, s);

        assert_eq!(walked, 1);
        let p = mesh.all.get_mut(&pkey).unwrap();
        assert_eq!(p.info::<u32>(0), Some(&42));
        p.clear_info(0);
        assert_eq!(p.info::<u32>(0), None);
    }

    #[test]
    fn state_delete_detaches_both_ways() {
        let mut mesh = Mesh::new(vec![Arc::new(Hold)], BUFSIZE, 128);
        let (h, _rx) = handle();
        mesh.new_client(parsed("p.test.", 1), h);

        let pkey = key("p.test.");
        let mut p = mesh.all.remove(&pkey).unwrap();
        mesh.attach_sub(&mut p, qinfo("s.test."), true, false, false)
            .unwrap();
        mesh.all.insert(pkey.clone(), p);

        mesh.state_delete(&key("s.test."));
        assert_eq!(mesh.num_states(), 1);
        let p = mesh.all.get(&pkey).unwrap();
        assert!(p.sub_set.is_empty());
        // the super was woken to notice the missing dependency
        assert!(mesh.run.contains(&pkey));
    }

    #[test]
    fn serial_resolutions_release_all_memory() {
        let mut mesh = Mesh::new(vec![Arc::new(Refuse)], BUFSIZE, 4096);
        let baseline = mesh.mem_usage();
        for i in 0..1000u16 {
            let (h, mut rx) = handle();
            mesh.new_client(parsed(&format!("q{i}.test."), i), h);
            assert_eq!(recv_msg(&mut rx).response_code(), ResponseCode::Refused);
        }
        assert_eq!(mesh.num_states(), 0);
        assert_eq!(mesh.stats().replies_sent, 1000);
        assert_eq!(mesh.mem_usage(), baseline);
        assert_eq!(mesh.stats().num_reply_addrs, 0);
        assert_eq!(mesh.stats().num_reply_states, 0);
        assert_eq!(mesh.stats().num_detached_states, 0);
    }
}
