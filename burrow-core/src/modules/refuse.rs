//! Terminal module that refuses every query. Registered when no resolution
//! stages are configured, so the daemon still answers rather than leaving
//! clients to time out.
use hickory_proto::op::ResponseCode;
use tracing::debug;

use crate::{
    mesh::{Mesh, MeshState, ReplyInfo},
    modules::{Module, ModuleEvent, ModuleExt},
    outbound::OutboundReply,
};

/// Answers REFUSED to everything
#[derive(Debug, Default, Clone, Copy)]
pub struct Refuse;

impl Module for Refuse {
    fn name(&self) -> &'static str {
        "refuse"
    }

    fn operate(
        &self,
        _mesh: &mut Mesh,
        state: &mut MeshState,
        _id: usize,
        event: ModuleEvent,
        _outbound: Option<OutboundReply>,
    ) -> ModuleExt {
        debug!(key = %state.key(), ?event, "refusing query");
        state.set_reply_info(ReplyInfo::with_rcode(ResponseCode::Refused));
        ModuleExt::Finished
    }
}
