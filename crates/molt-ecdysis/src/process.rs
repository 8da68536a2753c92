//! Process roles and child spawning with listener inheritance.
//!
//! A child is the current binary re-executed with:
//! - `MOLT_ROLE=child` and `MOLT_MAIN_PID=<pid>` so it resolves its role
//! - `MOLT_SNAPSHOT` holding the listener snapshot, descriptors renumbered
//! - the snapshot's descriptors installed at 3..N without close-on-exec
//!
//! Descriptors are first duplicated to temporaries at or above 100 so the
//! final `dup2` into 3..N cannot clobber a source that already sits there.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{EcdysisError, Result};
use crate::protocol::{self, Operation, Pid};
use crate::snapshot::ListenerSnapshot;
use crate::transport::LocalSender;

/// Set to `child` in spawned processes.
pub const ENV_ROLE: &str = "MOLT_ROLE";
/// Pid of the group's main process.
pub const ENV_MAIN_PID: &str = "MOLT_MAIN_PID";
/// JSON listener snapshot for a spawned child.
pub const ENV_SNAPSHOT: &str = "MOLT_SNAPSHOT";

/// First descriptor number handed to a child.
pub const FIRST_INHERITED_FD: RawFd = 3;

const TEMP_FD_BASE: RawFd = 100;

/// Which side of the group this process is on. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Main,
    Child { parent: Pid },
}

impl ProcessRole {
    /// Resolve the role from the environment written by the spawner.
    ///
    /// No `MOLT_ROLE` means this is the main process.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            std::env::var(ENV_ROLE).ok().as_deref(),
            std::env::var(ENV_MAIN_PID).ok().as_deref(),
        )
    }

    fn from_vars(role: Option<&str>, main_pid: Option<&str>) -> Result<Self> {
        match role {
            None | Some("") | Some("main") => Ok(Self::Main),
            Some("child") => {
                let raw = main_pid.ok_or_else(|| {
                    EcdysisError::config(format!("{ENV_ROLE}=child but {ENV_MAIN_PID} is missing"))
                })?;
                let parent = raw.parse().map_err(|_| {
                    EcdysisError::config(format!("{ENV_MAIN_PID} is not a pid: {raw:?}"))
                })?;
                Ok(Self::Child { parent })
            }
            Some(other) => Err(EcdysisError::config(format!(
                "unknown {ENV_ROLE} value: {other:?}"
            ))),
        }
    }

    pub fn is_main(&self) -> bool {
        matches!(self, Self::Main)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => f.write_str("main"),
            Self::Child { .. } => f.write_str("child"),
        }
    }
}

/// Read the listener snapshot handed over by the spawner.
///
/// An absent variable is a cold start.
pub fn snapshot_from_env() -> Result<ListenerSnapshot> {
    match std::env::var(ENV_SNAPSHOT) {
        Ok(json) => ListenerSnapshot::from_bytes(json.as_bytes()),
        Err(std::env::VarError::NotPresent) => Ok(ListenerSnapshot::new()),
        Err(e) => Err(EcdysisError::config(format!("{ENV_SNAPSHOT}: {e}"))),
    }
}

/// Starts new child processes.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Start a child that inherits the listeners in `snapshot`. Returns its pid.
    async fn spawn(&self, snapshot: &ListenerSnapshot) -> Result<Pid>;
}

/// Spawns children by re-executing a binary.
#[derive(Debug, Clone)]
pub struct ReexecSpawner {
    exe: PathBuf,
    args: Vec<OsString>,
    main_pid: Pid,
    death_notices: Option<LocalSender>,
}

impl ReexecSpawner {
    pub fn new(exe: impl Into<PathBuf>, args: Vec<OsString>, main_pid: Pid) -> Self {
        Self {
            exe: exe.into(),
            args,
            main_pid,
            death_notices: None,
        }
    }

    /// Re-execute the current binary with its current arguments.
    pub fn current(main_pid: Pid) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| EcdysisError::spawn(format!("cannot locate current executable: {e}")))?;
        Ok(Self::new(exe, std::env::args_os().skip(1).collect(), main_pid))
    }

    /// Inject `RemoveChild(pid)` into `local` whenever a spawned child exits.
    pub fn with_death_notices(mut self, local: LocalSender) -> Self {
        self.death_notices = Some(local);
        self
    }
}

#[async_trait]
impl Spawner for ReexecSpawner {
    async fn spawn(&self, snapshot: &ListenerSnapshot) -> Result<Pid> {
        let (remapped, sources) = snapshot.remapped(FIRST_INHERITED_FD);
        if sources.len() >= (TEMP_FD_BASE - FIRST_INHERITED_FD) as usize {
            return Err(EcdysisError::spawn(format!(
                "too many inherited listeners: {}",
                sources.len()
            )));
        }
        let staged = stage_fds(&sources)?;
        let staged_raw: Vec<RawFd> = staged.iter().map(AsRawFd::as_raw_fd).collect();

        let mut command = Command::new(&self.exe);
        command
            .args(&self.args)
            .env(ENV_ROLE, "child")
            .env(ENV_MAIN_PID, self.main_pid.to_string())
            .env(ENV_SNAPSHOT, serde_json::to_string(&remapped)?);

        // SAFETY: only async-signal-safe calls (dup2) run between fork and exec.
        unsafe {
            command.pre_exec(move || install_fds(&staged_raw));
        }

        let mut child = command.spawn().map_err(|e| {
            EcdysisError::spawn(format!("failed to spawn {}: {e}", self.exe.display()))
        })?;
        drop(staged);

        let pid = child
            .id()
            .ok_or_else(|| EcdysisError::spawn("child exited before its pid was read"))?;
        info!(
            child = pid,
            inherited = sources.len(),
            exe = %self.exe.display(),
            "Spawned child process"
        );

        let notices = self.death_notices.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(child = pid, %status, "Child process exited"),
                Err(e) => warn!(child = pid, error = %e, "Failed to reap child process"),
            }
            if let Some(local) = notices {
                local.inject(Operation::RemoveChild, protocol::encode_pid(pid));
            }
        });

        Ok(pid)
    }
}

/// Duplicate every source descriptor to `TEMP_FD_BASE` or above, close-on-exec.
fn stage_fds(sources: &[RawFd]) -> Result<Vec<OwnedFd>> {
    sources
        .iter()
        .map(|&fd| {
            let temp = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, TEMP_FD_BASE) };
            if temp < 0 {
                let err = io::Error::last_os_error();
                return Err(EcdysisError::spawn(format!("cannot duplicate fd {fd}: {err}")));
            }
            debug!(fd, temp, "Staged listener descriptor");
            // SAFETY: fcntl just returned this descriptor and nothing else owns it.
            Ok(unsafe { OwnedFd::from_raw_fd(temp) })
        })
        .collect()
}

/// Runs in the forked child: move staged descriptors to 3..N.
///
/// `dup2` leaves the target without close-on-exec, so it survives the exec.
fn install_fds(staged: &[RawFd]) -> io::Result<()> {
    for (i, &temp) in staged.iter().enumerate() {
        let target = FIRST_INHERITED_FD + i as RawFd;
        if unsafe { libc::dup2(temp, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Inbox, MemoryNetwork};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::assert_err;

    #[test]
    fn test_role_defaults_to_main() {
        assert_eq!(ProcessRole::from_vars(None, None).unwrap(), ProcessRole::Main);
        assert_eq!(
            ProcessRole::from_vars(Some("main"), Some("12")).unwrap(),
            ProcessRole::Main
        );
    }

    #[test]
    fn test_child_role_needs_main_pid() {
        assert_eq!(
            ProcessRole::from_vars(Some("child"), Some("4242")).unwrap(),
            ProcessRole::Child { parent: 4242 }
        );
        assert_err!(ProcessRole::from_vars(Some("child"), None));
        assert_err!(ProcessRole::from_vars(Some("child"), Some("nope")));
        assert_err!(ProcessRole::from_vars(Some("worker"), None));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(ProcessRole::Main.to_string(), "main");
        assert_eq!(ProcessRole::Child { parent: 1 }.to_string(), "child");
    }

    /// Staged descriptors land at 100 or above with close-on-exec set.
    #[test]
    fn test_stage_fds_to_high_range() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let staged = stage_fds(&[listener.as_raw_fd()]).unwrap();
        assert_eq!(staged.len(), 1);

        let fd = staged[0].as_raw_fd();
        assert!(fd >= TEMP_FD_BASE);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_stage_invalid_fd_fails() {
        assert!(matches!(stage_fds(&[9999]), Err(EcdysisError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_spawn_reports_child_exit() {
        let network = MemoryNetwork::new();
        let (mut inbox, local) = Inbox::new(Arc::new(network.endpoint(1)));
        let spawner = ReexecSpawner::new(
            "/bin/sh",
            vec!["-c".into(), "exit 0".into()],
            1,
        )
        .with_death_notices(local);

        let pid = spawner.spawn(&ListenerSnapshot::new()).await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            notice.bytes,
            protocol::encode(Operation::RemoveChild, &protocol::encode_pid(pid))
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let spawner = ReexecSpawner::new("/nonexistent/molt", Vec::new(), 1);
        let err = spawner.spawn(&ListenerSnapshot::new()).await.unwrap_err();
        assert!(matches!(err, EcdysisError::Spawn(_)));
    }
}
