//! Comm points: adapters between the bound listening sockets and the worker
//! that owns the mesh.
//!
//! Each listening socket gets a read task that parses nothing, only copies
//! the datagram or frame into a [`SerialMsg`] and ships it to the worker,
//! plus a responder task that drains queued responses back onto the socket.
//! TCP accept points hold a bounded pool of per-connection comm points.
//!
//! Listening can be paused (`pushback`) and resumed; pause stops only the
//! `udp` and `tcp_accept` points, established TCP connections keep going so
//! in-flight responses can drain.
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    net,
    sync::{broadcast, mpsc, watch, Semaphore},
    time,
};
use tokio_util::codec::{BytesCodec, LengthDelimitedCodec};
use tracing::{debug, warn};
use unix_udp_sock::{framed::UdpFramed, Source, Transmit, UdpState};

use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::{
    metrics,
    server::{
        listen::{ListenPort, ListenType},
        msg::{Outgoing, ReplyHandle, SerialMsg},
        shutdown::Shutdown,
        WorkerEvent,
    },
};

/// an established connection with nothing to read or write gets closed
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// stream messages are bounded by their 16-bit length prefix
const MAX_TCP_MSG: usize = u16::MAX as usize;

/// Handle on the set of comm points: the bound addresses and the pushback
/// switch. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ListenFront {
    pause: Arc<watch::Sender<bool>>,
    addrs: Vec<(SocketAddr, ListenType)>,
}

impl ListenFront {
    /// Wrap every listening socket in comm point tasks feeding `events`.
    pub(crate) fn create(
        ports: Vec<ListenPort>,
        bufsize: usize,
        incoming_num_tcp: usize,
        events: &mpsc::Sender<WorkerEvent>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete: &mpsc::Sender<()>,
    ) -> Result<ListenFront> {
        let (pause, _) = watch::channel(false);
        let pause = Arc::new(pause);
        let mut addrs = Vec::new();
        for port in ports {
            addrs.push((port.addr, port.ftype));
            match port.ftype {
                ListenType::Udp => {
                    let soc: std::net::UdpSocket = port.socket.into();
                    let soc = Arc::new(
                        net::UdpSocket::from_std(soc).context("registering udp socket")?,
                    );
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    tokio::spawn(udp_sender(Arc::clone(&soc), out_rx));
                    let task = udp_loop(
                        soc,
                        out_tx,
                        events.clone(),
                        pause.subscribe(),
                        Shutdown::new(notify_shutdown.subscribe()),
                        bufsize,
                    );
                    let complete = shutdown_complete.clone();
                    tokio::spawn(async move {
                        let _complete = complete;
                        task.await;
                    });
                }
                ListenType::UdpAncil => {
                    let soc: std::net::UdpSocket = port.socket.into();
                    let soc = Arc::new(
                        unix_udp_sock::UdpSocket::from_std(soc)
                            .context("registering ancillary udp socket")?,
                    );
                    let udp_state = Arc::new(UdpState::new());
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    tokio::spawn(udp_ancil_sender(Arc::clone(&soc), udp_state, out_rx));
                    let task = udp_ancil_loop(
                        soc,
                        out_tx,
                        events.clone(),
                        pause.subscribe(),
                        Shutdown::new(notify_shutdown.subscribe()),
                    );
                    let complete = shutdown_complete.clone();
                    tokio::spawn(async move {
                        let _complete = complete;
                        task.await;
                    });
                }
                ListenType::TcpAccept => {
                    let listener: std::net::TcpListener = port.socket.into();
                    let listener = net::TcpListener::from_std(listener)
                        .context("registering tcp listener")?;
                    let accept_pool = Arc::new(Semaphore::new(incoming_num_tcp));
                    let task = tcp_accept_loop(
                        listener,
                        events.clone(),
                        pause.subscribe(),
                        notify_shutdown.clone(),
                        shutdown_complete.clone(),
                        accept_pool,
                    );
                    let complete = shutdown_complete.clone();
                    tokio::spawn(async move {
                        let _complete = complete;
                        task.await;
                    });
                }
            }
        }
        Ok(ListenFront { pause, addrs })
    }

    /// The bound addresses with their transport tags, in creation order
    pub fn addrs(&self) -> &[(SocketAddr, ListenType)] {
        &self.addrs
    }

    /// Stop reading queries on udp and tcp-accept points. Established TCP
    /// connections continue.
    pub fn pushback(&self) {
        debug!("pushing back udp and tcp-accept comm points");
        self.pause.send_replace(true);
    }

    /// Resume reading queries
    pub fn resume(&self) {
        debug!("resuming comm points");
        self.pause.send_replace(false);
    }

    /// whether intake is currently paused
    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }
}

/// park until the pause flag clears; true means keep running
async fn wait_resumed(pause: &mut watch::Receiver<bool>, shutdown: &mut Shutdown) -> bool {
    while *pause.borrow() {
        tokio::select! {
            _ = shutdown.recv() => return false,
            res = pause.changed() => if res.is_err() {
                return false;
            },
        }
    }
    true
}

async fn udp_loop(
    soc: Arc<net::UdpSocket>,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    events: mpsc::Sender<WorkerEvent>,
    mut pause: watch::Receiver<bool>,
    mut shutdown: Shutdown,
    bufsize: usize,
) {
    let mut buf = vec![0u8; bufsize];
    loop {
        if !wait_resumed(&mut pause, &mut shutdown).await {
            return;
        }
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = pause.changed() => {}
            res = soc.recv_from(&mut buf) => match res {
                Ok((len, addr)) => {
                    metrics::QUERIES_RECV.udp.inc();
                    let msg = SerialMsg::new(bytes::Bytes::copy_from_slice(&buf[..len]), addr);
                    let handle = ReplyHandle::udp(out_tx.clone(), addr, None);
                    if events.send(WorkerEvent::Recv { msg, handle }).await.is_err() {
                        return;
                    }
                }
                Err(err) => debug!(?err, "udp recv error"),
            }
        }
    }
}

async fn udp_sender(soc: Arc<net::UdpSocket>, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(out) = rx.recv().await {
        if let Err(err) = soc.send_to(&out.bytes, out.dest).await {
            debug!(?err, dest = %out.dest, "response send failed");
        }
    }
}

async fn udp_ancil_loop(
    soc: Arc<unix_udp_sock::UdpSocket>,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    events: mpsc::Sender<WorkerEvent>,
    mut pause: watch::Receiver<bool>,
    mut shutdown: Shutdown,
) {
    let stream = UdpFramed::new(soc, BytesCodec::new());
    tokio::pin!(stream);
    loop {
        if !wait_resumed(&mut pause, &mut shutdown).await {
            return;
        }
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = pause.changed() => {}
            next = stream.next() => match next {
                Some(Ok((buf, meta))) => {
                    metrics::QUERIES_RECV.udp_ancil.inc();
                    let msg = SerialMsg::new(buf.freeze(), meta.addr);
                    // the local destination address travels with the reply
                    // handle; one wildcard socket serves many interface ips
                    let handle = ReplyHandle::udp(out_tx.clone(), meta.addr, meta.dst_local_ip);
                    if events.send(WorkerEvent::Recv { msg, handle }).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => debug!(?err, "udp recv error"),
                None => return,
            }
        }
    }
}

async fn udp_ancil_sender(
    soc: Arc<unix_udp_sock::UdpSocket>,
    state: Arc<UdpState>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(out) = rx.recv().await {
        // source IP must be the address the query was sent to, or clients
        // behind multihomed hosts discard the response
        let mut transmit = Transmit::new(out.dest, out.bytes);
        if let Some(src) = out.src_ip {
            transmit = transmit.src_ip(Source::Ip(src));
        }
        if let Err(err) = soc.send_msg(&state, transmit).await {
            debug!(?err, dest = %out.dest, "response send failed");
        }
    }
}

async fn tcp_accept_loop(
    listener: net::TcpListener,
    events: mpsc::Sender<WorkerEvent>,
    mut pause: watch::Receiver<bool>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete: mpsc::Sender<()>,
    accept_pool: Arc<Semaphore>,
) {
    let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
    loop {
        if !wait_resumed(&mut pause, &mut shutdown).await {
            return;
        }
        // a permit bounds the per-listener connection pool; acquire before
        // accepting so the backlog holds excess clients
        let permit = tokio::select! {
            _ = shutdown.recv() => return,
            permit = Arc::clone(&accept_pool).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = pause.changed() => {}
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    metrics::TCP_ACCEPTED.inc();
                    debug!(%peer, "accepted tcp connection");
                    let conn_shutdown = Shutdown::new(notify_shutdown.subscribe());
                    let complete = shutdown_complete.clone();
                    let conn = tcp_conn(stream, peer, events.clone(), permit, conn_shutdown);
                    tokio::spawn(async move {
                        let _complete = complete;
                        conn.await;
                    });
                }
                Err(err) => warn!(?err, "tcp accept error"),
            }
        }
    }
}

/// One established connection: length-prefixed DNS messages in, queued
/// responses out. Not subject to pushback.
async fn tcp_conn(
    stream: net::TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<WorkerEvent>,
    _permit: tokio::sync::OwnedSemaphorePermit,
    mut shutdown: Shutdown,
) {
    let framed = LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(MAX_TCP_MSG)
        .new_framed(stream);
    let (mut sink, mut frames) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = time::sleep(TCP_IDLE_TIMEOUT) => {
                debug!(%peer, "closing idle tcp connection");
                break;
            }
            out = rx.recv() => match out {
                Some(out) => {
                    if let Err(err) = sink.send(out.bytes).await {
                        debug!(?err, %peer, "response send failed");
                        break;
                    }
                }
                None => break,
            },
            frame = frames.next() => match frame {
                Some(Ok(buf)) => {
                    metrics::QUERIES_RECV.tcp.inc();
                    let msg = SerialMsg::new(buf.freeze(), peer);
                    let handle = ReplyHandle::tcp(tx.clone(), peer);
                    if events.send(WorkerEvent::Recv { msg, handle }).await.is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(?err, %peer, "tcp read error");
                    break;
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Poll;

    #[test]
    fn pushback_parks_reads_until_resume() {
        let (pause, _) = watch::channel(false);
        let front = ListenFront {
            pause: Arc::new(pause),
            addrs: Vec::new(),
        };
        assert!(!front.is_paused());
        front.pushback();
        assert!(front.is_paused());

        let (notify, _keep) = broadcast::channel(1);
        let mut rx = front.pause.subscribe();
        let mut shutdown = Shutdown::new(notify.subscribe());
        let mut parked = tokio_test::task::spawn(wait_resumed(&mut rx, &mut shutdown));
        assert!(parked.poll().is_pending());

        front.resume();
        assert!(parked.is_woken());
        assert_eq!(parked.poll(), Poll::Ready(true));
    }

    #[test]
    fn shutdown_breaks_the_park() {
        let (pause, _keep_pause) = watch::channel(true);
        let mut rx = pause.subscribe();
        let (notify, _keep) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(notify.subscribe());
        let mut parked = tokio_test::task::spawn(wait_resumed(&mut rx, &mut shutdown));
        assert!(parked.poll().is_pending());

        notify.send(()).unwrap();
        assert!(parked.is_woken());
        assert_eq!(parked.poll(), Poll::Ready(false));
    }
}
