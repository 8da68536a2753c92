//! # molt-ecdysis
//!
//! Zero-downtime restart coordination for a main/child process group, in the
//! spirit of the [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/).
//!
//! ## Overview
//!
//! A group consists of one supervising *main* process and one or more *child*
//! processes that hold the listening sockets and serve traffic:
//!
//! 1. The main spawns the first child, which binds its listeners and announces
//!    itself with `NewFork`.
//! 2. On restart a child snapshots its listeners, spawns a replacement that
//!    inherits the sockets, announces it to the main, then drains and exits.
//! 3. Main and children exchange heartbeats. A child that has not heard from
//!    its main for the heartbeat timeout closes its listeners and exits; the
//!    main evicts children it has not heard from.
//! 4. The main exits once every child has departed and no replacement is
//!    pending, or when it is told to shut down.
//!
//! ## Wire format
//!
//! Control messages are `operation (1 byte) | payload`, see [`protocol`].
//!
//! ## Signal Conventions
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGQUIT`: Graceful restart
//!
//! ## Environment Variables
//!
//! - `MOLT_ROLE` / `MOLT_MAIN_PID`: Written by the spawner for child processes
//! - `MOLT_SNAPSHOT`: JSON listener snapshot handed to a child at spawn time
//! - `MOLT_HEARTBEAT_INTERVAL_MS`: Heartbeat interval (default: 1000)
//! - `MOLT_HEARTBEAT_TIMEOUT_MS`: Heartbeat timeout (default: 30000)
//! - `MOLT_DRAIN_TIMEOUT_SECS`: Drain timeout in seconds (default: 30)
//! - `MOLT_RUNTIME_DIR`: Directory for the control sockets
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt-ecdysis requires a Unix platform (Linux or macOS)");

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod role;
pub mod runtime;
pub mod shutdown;
pub mod signals;
pub mod snapshot;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GroupConfig;
pub use dispatcher::{Dispatcher, Flow, LoopExit};
pub use error::{EcdysisError, Result};
pub use heartbeat::{HeartbeatPolicy, HeartbeatState, ParentContact};
pub use listener::{adopt_tcp_listener, ListenerGroup, ManagedListener};
pub use process::{ProcessRole, ReexecSpawner, Spawner};
pub use protocol::{ControlMessage, Operation, Pid};
pub use registry::{ChildRecord, ProcessRegistry};
pub use role::{ChildRole, MainRole, Role, RoleKind};
pub use runtime::{Collaborators, Runtime, RuntimeConfig};
pub use shutdown::{Listener, Service, ServiceHost, ServiceRegistry, ShutdownCoordinator};
pub use snapshot::{ListenerEntry, ListenerSnapshot};
pub use transport::{Envelope, Inbox, LocalSender, Transport};
