//! # burrow
//!
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use bytes;
pub use hickory_proto;
pub use socket2;
pub use tokio;
pub use tracing;
pub use unix_udp_sock;

pub use crate::server::Server;

pub mod config;
pub mod mesh;
pub mod metrics;
pub mod modules;
pub mod outbound;
pub mod prelude;
pub mod server;
