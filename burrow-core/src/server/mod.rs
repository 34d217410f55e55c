//! # Server
//!
//! Contains the main server code which wires the listening sockets to comm
//! points and drives the mesh from a single worker task. Comm points only
//! copy bytes; every mesh mutation happens on the worker, so the mesh needs
//! no locks.
use anyhow::{bail, Context, Result};
use tokio::{
    sync::{broadcast, mpsc},
    time,
};
use tracing::{debug, error, info, instrument, warn};

use std::{fmt, future::Future, sync::Arc, time::Duration};

pub mod comm;
pub mod listen;
pub mod msg;
pub(crate) mod shutdown;

use crate::{
    config::cli::Config,
    mesh::Mesh,
    metrics,
    modules::Module,
    outbound::OutboundEntry,
    server::{
        comm::ListenFront,
        listen::listening_ports_open,
        msg::{parse_query, ReplyHandle, SerialMsg},
    },
};

/// Events feeding the worker that owns the mesh
pub(crate) enum WorkerEvent {
    /// a query arrived on a comm point
    Recv {
        msg: SerialMsg,
        handle: ReplyHandle,
    },
    /// an upstream reply (or timeout) for an in-flight outbound query
    Outbound {
        entry: OutboundEntry,
        ok: bool,
        reply: Option<SerialMsg>,
    },
}

/// Routes upstream replies back into the mesh worker. An outbound
/// transport holds one of these and calls [`report`] when a reply arrives
/// or times out; the worker turns it into `Mesh::report_reply`.
///
/// [`report`]: OutboundSender::report
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<WorkerEvent>,
}

impl OutboundSender {
    /// Deliver one upstream reply (`ok = false` for a timeout, with no
    /// message) to the originating state.
    pub async fn report(
        &self,
        entry: OutboundEntry,
        ok: bool,
        reply: Option<SerialMsg>,
    ) -> Result<()> {
        self.tx
            .send(WorkerEvent::Outbound { entry, ok, reply })
            .await
            .map_err(|_| anyhow::anyhow!("mesh worker is gone"))
    }
}

/// Holds the module pipeline and config until the server is bound. Modules
/// are registered in pipeline order.
pub struct Server {
    /// the resolution stages, driven in registration order
    modules: Vec<Arc<dyn Module>>,
    /// server config
    config: Config,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("modules", &self.modules.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Server {
    /// Make a new instance of burrow
    pub fn new(config: Config) -> Result<Server> {
        Ok(Server {
            modules: Vec::new(),
            config,
        })
    }

    /// Append a module to the pipeline
    pub fn module<M, U>(&mut self, module: U) -> &mut Self
    where
        U: Into<Arc<M>>,
        M: Module,
    {
        let module: Arc<M> = module.into();
        self.modules.push(module);
        self
    }

    /// Open the listening sockets and spawn the comm points. Must run
    /// inside the runtime. The returned server exposes the bound addresses
    /// and the pushback handle, then [`RunningServer::run`] serves queries.
    pub async fn bind(self) -> Result<RunningServer> {
        if self.modules.is_empty() {
            bail!("no modules registered, the pipeline cannot answer queries");
        }
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_size);

        let ports = listening_ports_open(&self.config).context("opening listening ports")?;
        info!(ports = ports.len(), port = self.config.port, "listening");
        let front = ListenFront::create(
            ports,
            self.config.msg_buffer_size,
            self.config.incoming_num_tcp,
            &event_tx,
            &notify_shutdown,
            &shutdown_complete_tx,
        )?;
        Ok(RunningServer {
            front,
            event_tx,
            event_rx,
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
            modules: self.modules,
            config: self.config,
        })
    }

    /// Bind and serve until the shutdown future resolves
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        self.bind().await?.run(shutdown).await
    }
}

/// A bound server: sockets are open, comm points are running, the mesh
/// worker starts with [`run`].
///
/// [`run`]: RunningServer::run
pub struct RunningServer {
    front: ListenFront,
    event_tx: mpsc::Sender<WorkerEvent>,
    event_rx: mpsc::Receiver<WorkerEvent>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    modules: Vec<Arc<dyn Module>>,
    config: Config,
}

impl fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningServer")
            .field("front", &self.front)
            .finish()
    }
}

impl RunningServer {
    /// Handle on the comm points: bound addresses plus pushback/resume
    pub fn front(&self) -> ListenFront {
        self.front.clone()
    }

    /// Handle for routing upstream replies back into the mesh
    pub fn outbound_sender(&self) -> OutboundSender {
        OutboundSender {
            tx: self.event_tx.clone(),
        }
    }

    /// Serve queries until the shutdown future resolves, then stop the
    /// comm points and wait for them to drain.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        tokio::select! {
            res = self.serve() => {
                if let Err(err) = res {
                    error!(?err, "error occurred serving queries");
                }
            }
            res = shutdown => {
                info!("caught shutdown signal handler");
                if let Err(err) = res {
                    error!(?err);
                }
            }
        }

        info!("notifying comm points of shutdown...");
        let RunningServer {
            mut shutdown_complete_rx,
            shutdown_complete_tx,
            notify_shutdown,
            ..
        } = self;
        // dropping the broadcast sender wakes every subscribed task; when
        // the last task drops its completion sender the recv below ends
        drop(notify_shutdown);
        drop(shutdown_complete_tx);
        if time::timeout(Duration::from_secs(3), shutdown_complete_rx.recv())
            .await
            .is_err()
        {
            error!("comm points did not finish within 3 seconds-- exiting anyway");
        } else {
            info!("all comm points finished cleanly");
        }
        Ok(())
    }

    /// The worker: single consumer of comm point events, sole owner of the
    /// mesh.
    #[instrument(level = "debug", skip_all)]
    async fn serve(&mut self) -> Result<()> {
        let mut mesh = Mesh::new(
            self.modules.clone(),
            self.config.msg_buffer_size,
            self.config.max_states,
        );
        while let Some(ev) = self.event_rx.recv().await {
            match ev {
                WorkerEvent::Recv { msg, handle } => match parse_query(msg.bytes()) {
                    Ok(q) => mesh.new_client(q, handle),
                    Err(err) => debug!(?err, src = %msg.addr(), "dropping malformed query"),
                },
                WorkerEvent::Outbound { entry, ok, reply } => mesh.report_reply(entry, ok, reply),
            }
            let states = mesh.num_states();
            metrics::MESH_STATES.set(states as i64);
            metrics::DETACHED_STATES.set(mesh.stats().num_detached_states as i64);
            // admission control: a full mesh pushes back on the listeners
            // until enough states drain
            if states >= self.config.max_states && !self.front.is_paused() {
                warn!(states, "mesh full, pushing back on listeners");
                self.front.pushback();
            } else if self.front.is_paused() && states <= self.config.max_states / 2 {
                info!(states, "mesh drained, resuming listeners");
                self.front.resume();
            }
        }
        Ok(())
    }
}
