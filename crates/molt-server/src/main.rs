use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use molt_ecdysis::process::snapshot_from_env;
use molt_ecdysis::transport::UnixTransport;
use molt_ecdysis::{
    Collaborators, Inbox, ListenerSnapshot, LoopExit, ProcessRole, ReexecSpawner, Runtime,
    RuntimeConfig, ServiceRegistry,
};
use tracing::info;

mod config;
mod http;
mod telemetry;

use config::{Cli, ServerConfig};
use http::HttpHost;
use telemetry::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init(LogFormat::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    let config = ServerConfig::load(Cli::parse());
    let role = ProcessRole::from_env().context("Invalid process group environment")?;
    let pid = std::process::id();

    info!(%role, pid, version = env!("CARGO_PKG_VERSION"), "Molt server starting");
    if role.is_main() {
        config.log_config();
    }

    let transport = UnixTransport::bind_current(&config.group.runtime_dir).with_context(|| {
        format!(
            "Failed to bind control socket in {}",
            config.group.runtime_dir.display()
        )
    })?;
    let (inbox, local) = Inbox::new(Arc::new(transport));

    let (collaborators, snapshot) = match role {
        ProcessRole::Main => {
            let spawner = ReexecSpawner::current(pid)?.with_death_notices(local.clone());
            (Collaborators::new(Arc::new(spawner)), ListenerSnapshot::new())
        }
        ProcessRole::Child { parent } => {
            let services = Arc::new(ServiceRegistry::new());
            let host = HttpHost::new(
                config.listeners.clone(),
                config.group.drain_timeout,
                Arc::clone(&services),
            );
            let snapshot = snapshot_from_env().context("Invalid inherited listener snapshot")?;
            let collaborators = Collaborators::new(Arc::new(ReexecSpawner::current(parent)?))
                .with_host(Arc::new(host), services);
            (collaborators, snapshot)
        }
    };

    let runtime = Runtime::new(
        role,
        inbox,
        local,
        collaborators,
        RuntimeConfig::from(&config.group),
    )?;
    runtime.start(&snapshot)?;

    let exit = runtime.run().await;
    info!(%role, pid, ?exit, "Molt server exiting");

    match exit {
        LoopExit::Shutdown | LoopExit::AllChildrenGone => Ok(()),
        LoopExit::ParentLost => bail!("Lost contact with the main process"),
        LoopExit::TransportClosed => bail!("Control transport closed"),
    }
}
