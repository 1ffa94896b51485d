use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File names probed, in order, when a management root is opened.
pub const CONFIG_FILE_NAMES: [&str; 3] = ["kherimoya.json", "kherimoya.yaml", "kherimoya.yml"];

/// Which terminal-multiplexing backend hosts server processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MultiplexerBackend {
    /// Detached tmux sessions; survive the management process.
    #[default]
    Tmux,
    /// Raw child processes with piped stdio, owned by the management process.
    Process,
}

/// Session naming and backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Backend used to host server processes.
    pub backend: MultiplexerBackend,
    /// Prefix of every session name; the instance id follows it.
    pub prefix: String,
    /// Optional tmux socket name (`tmux -L`), isolating this fleet's sessions.
    pub tmux_socket: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: MultiplexerBackend::Tmux,
            prefix: "kherimoya-".to_string(),
            tmux_socket: None,
        }
    }
}

/// How a server process is launched and asked to shut down.
///
/// `args` may reference `{server_dir}`, `{base_dir}`, `{id}` and `{name}`;
/// they are substituted per instance at start time.
///
/// # Examples
///
/// ```
/// use kherimoya::config::LaunchConfig;
/// use std::collections::HashMap;
///
/// let launch = LaunchConfig {
///     command: "endstone".to_string(),
///     args: vec!["-y".to_string(), "-s".to_string(), "{server_dir}".to_string()],
///     env: HashMap::new(),
///     stop_command: "stop".to_string(),
///     ready_pattern: None,
/// };
/// assert_eq!(launch, LaunchConfig::default());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    /// Command to execute when starting a server.
    /// This can be an absolute path or a command available in the PATH.
    pub command: String,

    /// Command-line arguments to pass to the server.
    pub args: Vec<String>,

    /// Environment variables to set when launching the server.
    /// These will be combined with the current environment.
    pub env: HashMap<String, String>,

    /// Console line that asks the server to shut down on its own.
    pub stop_command: String,

    /// Output line fragment signalling the server is ready.
    /// When unset, a successful liveness check counts as ready.
    pub ready_pattern: Option<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            command: "endstone".to_string(),
            args: vec!["-y".to_string(), "-s".to_string(), "{server_dir}".to_string()],
            env: HashMap::new(),
            stop_command: "stop".to_string(),
            ready_pattern: None,
        }
    }
}

/// Bounded waits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    /// How long a graceful stop may take before termination is forced.
    pub graceful_stop_secs: u64,
    /// Ceiling on spawn plus readiness.
    pub spawn_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            graceful_stop_secs: 30,
            spawn_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn graceful_stop(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_secs)
    }

    pub fn spawn(&self) -> Duration {
        Duration::from_secs(self.spawn_secs)
    }
}

/// Background health monitoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    /// Liveness polling interval; this is the crash detection latency.
    pub interval_secs: u64,
    /// When set, a full reconciliation pass also runs on this interval.
    pub reconcile_interval_secs: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            reconcile_interval_secs: None,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval_secs.map(Duration::from_secs)
    }
}

/// What happens to an instance detected as crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CrashPolicy {
    /// Mark Crashed and wait for the operator.
    #[default]
    Flag,
    /// Mark Crashed, then start again if the operator wants it running.
    Restart,
}

/// What happens to a live session no Running instance accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Report it and leave it alone.
    #[default]
    Flag,
    /// If it belongs to a known instance, record that instance as Running.
    Adopt,
}

/// Recovery policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub crash: CrashPolicy,
    /// Consecutive automatic restarts allowed before giving up.
    pub max_restart_attempts: u32,
    pub orphan: OrphanPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            crash: CrashPolicy::Flag,
            max_restart_attempts: 3,
            orphan: OrphanPolicy::Flag,
        }
    }
}

/// Main configuration for Kherimoya.
///
/// Relative paths are resolved against the management root by
/// [`Config::resolve`].
///
/// # JSON Schema
///
/// ```json
/// {
///   "serversDir": "servers",
///   "registryFile": "registry.json",
///   "session": { "backend": "tmux", "prefix": "kherimoya-", "tmuxSocket": null },
///   "launch": {
///     "command": "endstone",
///     "args": ["-y", "-s", "{server_dir}"],
///     "env": {},
///     "stopCommand": "stop",
///     "readyPattern": null
///   },
///   "timeouts": { "gracefulStopSecs": 30, "spawnSecs": 60 },
///   "monitor": { "intervalSecs": 5, "reconcileIntervalSecs": null },
///   "policy": { "crash": "flag", "maxRestartAttempts": 3, "orphan": "flag" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Directory holding one sub-directory per instance.
    pub servers_dir: PathBuf,
    /// Durable registry file.
    pub registry_file: PathBuf,
    pub session: SessionConfig,
    pub launch: LaunchConfig,
    pub timeouts: TimeoutConfig,
    pub monitor: MonitorConfig,
    pub policy: PolicyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers_dir: PathBuf::from("servers"),
            registry_file: PathBuf::from("registry.json"),
            session: SessionConfig::default(),
            launch: LaunchConfig::default(),
            timeouts: TimeoutConfig::default(),
            monitor: MonitorConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else
    /// as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON/YAML
    /// * The document does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::parse_from_yaml_str(&content),
            _ => Self::parse_from_str(&content),
        }
    }

    /// Loads the first configuration file found in `root`, or the defaults
    /// when there is none.
    pub fn discover(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        for name in CONFIG_FILE_NAMES {
            let candidate = root.join(name);
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "Loading configuration file");
                return Self::from_file(candidate);
            }
        }
        tracing::debug!(root = %root.display(), "No configuration file, using defaults");
        Ok(Self::default())
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }

    /// Resolves relative paths against the management root.
    pub fn resolve(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        if self.servers_dir.is_relative() {
            self.servers_dir = root.join(&self.servers_dir);
        }
        if self.registry_file.is_relative() {
            self.registry_file = root.join(&self.registry_file);
        }
        self
    }
}
