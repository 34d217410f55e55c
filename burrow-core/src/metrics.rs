#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! contains statistics for server metrics
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum Transport {
        udp,
        udp_ancil,
        tcp,
    }
    pub struct RecvStats: IntCounter {
        "transport" => Transport
    }
}

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    pub static ref QUERIES_RECV_VEC: IntCounterVec = register_int_counter_vec!(
        "queries_recv",
        "queries received by transport",
        &["transport"]
    )
    .unwrap();

    /// aggregate count of received queries per comm point transport
    pub static ref QUERIES_RECV: RecvStats = RecvStats::from(&QUERIES_RECV_VEC);

    /// responses written to clients
    pub static ref REPLIES_SENT: IntCounter =
        register_int_counter!("replies_sent", "responses sent to clients").unwrap();

    /// histogram of client reply latency
    pub static ref REPLY_DURATION: Histogram = register_histogram!(
        "reply_duration",
        "time from query arrival to response (seconds)"
    )
    .unwrap();

    /// # of in-flight mesh states
    pub static ref MESH_STATES: IntGauge =
        register_int_gauge!("mesh_states", "count of in-flight mesh states").unwrap();

    /// # of detached mesh states
    pub static ref DETACHED_STATES: IntGauge = register_int_gauge!(
        "mesh_detached_states",
        "count of mesh states with no clients and no supers"
    )
    .unwrap();

    /// tcp connections accepted
    pub static ref TCP_ACCEPTED: IntCounter =
        register_int_counter!("tcp_accepted", "tcp connections accepted").unwrap();

    /// server uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{QUERIES_RECV, REPLY_DURATION};

    #[test]
    fn metrics_are_registered_and_exposed() {
        QUERIES_RECV.udp.inc();
        QUERIES_RECV.tcp.inc();
        REPLY_DURATION.observe(0.001);

        let families = gather();
        let names = families
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        assert!(
            names.contains("queries_recv"),
            "registered metric families: {names:?}"
        );
        assert!(
            names.contains("reply_duration"),
            "registered metric families: {names:?}"
        );
    }
}
