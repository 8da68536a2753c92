//! Server configuration from the command line and the environment.
//!
//! The command line names the listeners to serve; process group timing comes
//! from [`GroupConfig::from_env`]. Children are re-executed with the same
//! arguments, so every member of a group sees the same configuration.
//!
//! # Examples
//!
//! ```bash
//! molt-server --listen http=0.0.0.0:8080 --listen admin=127.0.0.1:9090
//! MOLT_HEARTBEAT_TIMEOUT_MS=10000 molt-server --runtime-dir /run/molt
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use molt_ecdysis::GroupConfig;
use tracing::info;

/// Molt server - HTTP served by a zero-downtime restartable process group
#[derive(Debug, Parser)]
#[command(name = "molt-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Listener to serve, as `name=address` (repeatable)
    #[arg(short, long = "listen", value_name = "NAME=ADDR", default_value = "http=127.0.0.1:8080")]
    pub listeners: Vec<ListenSpec>,

    /// Directory for control sockets (overrides MOLT_RUNTIME_DIR)
    #[arg(long, value_name = "DIR")]
    pub runtime_dir: Option<PathBuf>,
}

/// A named listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub name: String,
    pub addr: String,
}

impl FromStr for ListenSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, addr) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=ADDR, got '{s}'"))?;
        let (name, addr) = (name.trim(), addr.trim());
        if name.is_empty() || addr.is_empty() {
            return Err(format!("expected NAME=ADDR, got '{s}'"));
        }
        Ok(Self {
            name: name.to_string(),
            addr: addr.to_string(),
        })
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.addr)
    }
}

/// Everything the server process needs to run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listeners: Vec<ListenSpec>,
    pub group: GroupConfig,
}

impl ServerConfig {
    /// Merge parsed arguments with the group settings from the environment.
    pub fn load(cli: Cli) -> Self {
        Self::from_parts(cli, GroupConfig::from_env())
    }

    fn from_parts(cli: Cli, mut group: GroupConfig) -> Self {
        if let Some(dir) = cli.runtime_dir {
            group.runtime_dir = dir;
        }

        // Later duplicates win; a snapshot can only hold one listener per name.
        let mut listeners: Vec<ListenSpec> = Vec::new();
        for spec in cli.listeners {
            listeners.retain(|l| l.name != spec.name);
            listeners.push(spec);
        }

        Self { listeners, group }
    }

    pub fn log_config(&self) {
        for listener in &self.listeners {
            info!(listener = %listener.name, addr = %listener.addr, "Configured listener");
        }
        self.group.log_config();
    }
}
