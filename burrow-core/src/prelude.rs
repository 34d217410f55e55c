//! burrow prelude

pub use crate::{
    anyhow::{self, Context, Result},
    hickory_proto,
    mesh::{Mesh, MeshState, QueryInfo, QueryKey, ReplyInfo},
    modules::{Module, ModuleEvent, ModuleExt},
    outbound::{OutboundAdapter, OutboundEntry, OutboundQuery, OutboundReply},
    server::msg::{ReplyHandle, SerialMsg},
    tokio,
    tracing::{self, debug, error, info, instrument, trace},
};

pub use std::{io, sync::Arc};
