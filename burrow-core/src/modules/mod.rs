//! Resolution stages register with the mesh by implementing [`Module`].
//! The mesh drives the ordered module list per state and never interprets
//! module-private data.
use hickory_proto::op::ResponseCode;

use crate::{
    mesh::{Mesh, MeshState},
    outbound::OutboundReply,
};

pub mod refuse;

/// Why a state is being ticked
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ModuleEvent {
    /// first tick of a fresh state
    New,
    /// generic wakeup
    Pass,
    /// an outbound reply has been attached (or timed out)
    Reply,
    /// upstream capability probing failed
    CapsFail,
    /// a subquery of this state finished
    ModDone,
}

/// What the module wants the scheduler to do with the state next
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ModuleExt {
    /// suspend; awaiting subqueries or outbound replies
    Wait,
    /// advance to the next module downstream
    Next,
    /// re-enter the previous module upstream with a produced result
    Restart,
    /// the state has produced its final reply info
    Finished,
    /// the state has failed with an rcode
    Error(ResponseCode),
}

/// One stage of the resolution pipeline.
///
/// `operate` is the sole state-advancing call and MUST NOT block the thread;
/// any I/O goes through the outbound adapter and re-enters the mesh as a
/// REPLY event.
pub trait Module: Send + Sync + 'static {
    /// short name for logs
    fn name(&self) -> &'static str;

    /// one-shot setup when a state first enters this module
    fn init(&self, _state: &mut MeshState, _id: usize) {}

    /// advance the state. The mesh is available for subquery attachment,
    /// cycle checks and super walks; module-private data lives in the
    /// state's slot `id`.
    fn operate(
        &self,
        mesh: &mut Mesh,
        state: &mut MeshState,
        id: usize,
        event: ModuleEvent,
        outbound: Option<OutboundReply>,
    ) -> ModuleExt;

    /// release per-state module data
    fn clear(&self, _state: &mut MeshState, _id: usize) {}
}
