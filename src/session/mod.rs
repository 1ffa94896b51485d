//! Session multiplexing for Kherimoya.
//!
//! A session is one live, named terminal running exactly one long-lived
//! server process. The [`SessionMultiplexer`] trait is the only way the rest
//! of the crate touches processes; the supervisor holds nothing but session
//! names.
//!
//! # Components
//!
//! * `tmux` - detached tmux sessions that outlive the management process
//! * `process` - raw child processes with piped, captured stdio
//! * `readiness` - probes deciding when a freshly spawned server is ready
//!
//! # Examples
//!
//! ```no_run
//! use kherimoya::session::{LaunchCommand, ProcessMultiplexer, SessionMultiplexer, SessionName, StopSettings};
//! use std::path::Path;
//!
//! # async fn demo() -> kherimoya::Result<()> {
//! let mux = ProcessMultiplexer::new(StopSettings::default());
//! let name = SessionName::new("demo");
//! let command = LaunchCommand::new("bedrock_server");
//!
//! mux.spawn(&name, &command, Path::new("/srv/bedrock/server")).await?;
//! mux.send_input(&name, "say hello").await?;
//! mux.kill(&name, true).await?;
//! # Ok(())
//! # }
//! ```
mod process;
pub mod readiness;
mod signal;
mod tmux;

pub use process::ProcessMultiplexer;
pub use readiness::{AliveProbe, OutputProbe, ReadinessProbe};
pub use tmux::TmuxMultiplexer;

use crate::error::{Error, Result};
use crate::registry::ServerId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of a multiplexed session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionName(String);

impl SessionName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Deterministic session name of an instance: the prefix followed by the id.
    pub fn for_instance(prefix: &str, id: &ServerId) -> Self {
        Self(format!("{}{}", prefix, id))
    }

    /// The instance id encoded in this name, if it carries `prefix`.
    pub fn instance_id(&self, prefix: &str) -> Option<ServerId> {
        self.0
            .strip_prefix(prefix)
            .and_then(|rest| ServerId::parse(rest).ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process to run inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Runtime handle of a live session. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub name: SessionName,
    /// Process id of the hosted process, when the backend can tell.
    pub pid: Option<u32>,
}

/// How a graceful kill asks for, and waits on, a voluntary shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSettings {
    /// Console line sent to request shutdown.
    pub stop_command: String,
    /// Wait before termination is forced.
    pub timeout: Duration,
}

impl Default for StopSettings {
    fn default() -> Self {
        Self {
            stop_command: "stop".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Contract every session backend satisfies.
#[async_trait]
pub trait SessionMultiplexer: Send + Sync {
    /// Start `command` in a new detached session called `name`.
    ///
    /// # Errors
    ///
    /// * [`Error::SessionAlreadyExists`] when a live session has that name
    /// * [`Error::SpawnFailed`] when the process cannot be created
    async fn spawn(
        &self,
        name: &SessionName,
        command: &LaunchCommand,
        working_dir: &Path,
    ) -> Result<Session>;

    /// Whether a live session has this name. Nonexistence means not alive.
    async fn is_alive(&self, name: &SessionName) -> bool;

    /// Deliver `text` as one console line. No acknowledgement of processing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] when no live session has that name.
    async fn send_input(&self, name: &SessionName, text: &str) -> Result<()>;

    /// Terminate a session and return once its process is confirmed dead.
    ///
    /// When `graceful`, the stop command is sent first and the session gets
    /// the configured timeout to end on its own before it is forced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] when no live session has that name.
    async fn kill(&self, name: &SessionName, graceful: bool) -> Result<()>;

    /// Ground truth: names of all sessions alive right now.
    async fn list_live_sessions(&self) -> Result<HashSet<SessionName>>;

    /// The last `lines` lines of the session's console output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] when no live session has that name.
    async fn capture_output(&self, name: &SessionName, lines: usize) -> Result<Vec<String>>;

    /// Process id hosted by the session, if alive and known.
    async fn pid(&self, name: &SessionName) -> Option<u32>;
}

/// Check a launch before handing it to a backend.
///
/// Returns the program path as it should be executed.
pub(crate) fn check_spawnable(command: &LaunchCommand, working_dir: &Path) -> Result<PathBuf> {
    if !working_dir.is_dir() {
        return Err(Error::SpawnFailed(format!(
            "working directory {} does not exist",
            working_dir.display()
        )));
    }
    resolve_program(&command.program).ok_or_else(|| {
        Error::SpawnFailed(format!("executable '{}' not found", command.program))
    })
}

/// Locate `program` the way a shell would.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return is_executable(direct).then(|| direct.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
