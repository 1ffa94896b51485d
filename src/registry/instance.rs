use crate::registry::ServerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// What the operator wants an instance to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DesiredState {
    Stopped,
    Running,
}

/// Last known reality of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservedState {
    /// No process, by request.
    Stopped,
    /// A start is in flight.
    Starting,
    /// A live session hosts the process.
    Running,
    /// The process went away without being asked to.
    Crashed,
    /// Liveness has not been established since the manager came up.
    Unknown,
}

impl ObservedState {
    /// States that claim a live session and must be checked against one.
    pub fn claims_session(self) -> bool {
        matches!(
            self,
            ObservedState::Running | ObservedState::Starting | ObservedState::Unknown
        )
    }
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A managed game-server configuration and its runtime record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInstance {
    /// Immutable identifier.
    pub id: ServerId,
    /// Unique human-readable label.
    pub name: String,
    /// Directory exclusively owned by this instance.
    pub base_path: PathBuf,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
    /// Name of the session hosting the process, if any. Never ownership.
    #[serde(default)]
    pub session_handle: Option<String>,
}

impl ServerInstance {
    /// A freshly created, stopped instance.
    pub fn new(id: ServerId, name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            base_path: base_path.into(),
            desired_state: DesiredState::Stopped,
            observed_state: ObservedState::Stopped,
            session_handle: None,
        }
    }

    /// Directory holding the game server's own files.
    pub fn server_dir(&self) -> PathBuf {
        self.base_path.join("server")
    }

    /// Metadata file written at creation and on rename.
    pub fn metadata_file(&self) -> PathBuf {
        self.base_path.join("server.json")
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
