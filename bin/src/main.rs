#![allow(clippy::cognitive_complexity)]
use anyhow::{anyhow, Result};

use burrow_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    modules::refuse::Refuse,
    tokio::{runtime::Builder, signal},
    tracing::*,
    Server,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.burrow_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match burrow_core::tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start server"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let mut server = Server::new(config)?;
    server.module(Refuse);
    server.start(shutdown_signal()).await
}

async fn shutdown_signal() -> Result<()> {
    signal::ctrl_c().await.map_err(|err| anyhow!(err))
}
