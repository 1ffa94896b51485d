/*!
 # Kherimoya

 A Rust library for running a fleet of Minecraft Bedrock servers on one host.

 ## Overview

 Kherimoya provides functionality to:
 - Create server instances with their own identity and directory
 - Start and stop each server inside a named, reattachable session
 - Send console commands to a server and read its recent output
 - Detect crashed servers and repair recorded state after a restart of the
   management process itself

 ## Basic Usage

 ```no_run
 use kherimoya::Kherimoya;

 #[tokio::main]
 async fn main() -> Result<(), Box<dyn std::error::Error>> {
     // Open a management root; reconciles recorded state with live sessions
     let manager = Kherimoya::open("/srv/kherimoya").await?;

     // Create and start a server
     let alpha = manager.create("alpha").await?;
     let alpha = manager.start(alpha.id.as_str()).await?;
     println!("{} is {}", alpha.name, alpha.observed_state);

     // Talk to its console
     manager.send_input(alpha.id.as_str(), "say hello").await?;
     for line in manager.console(alpha.id.as_str(), 20).await? {
         println!("{}", line);
     }

     // Stop it again
     manager.stop(alpha.id.as_str()).await?;
     Ok(())
 }
 ```

 ## Features

 - **Session Backends**: tmux sessions that outlive the manager, or plain
   child processes with captured output
 - **Durable Registry**: every state change is written atomically before a
   call returns
 - **Reconciliation**: crashed servers are flagged, orphaned sessions are
   never killed
 - **Per-instance Locking**: calls on one server are serialized, calls on
   different servers run concurrently
 - **Stable Errors**: every failure carries a stable kind, the server id and
   its last known state
*/

pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;

pub use config::Config;
pub use error::{CommandError, CommandResult, Error, ErrorKind, Result};
pub use registry::{DesiredState, ObservedState, ServerId, ServerInstance};

use config::{MultiplexerBackend, validate_config};
use registry::{FileRegistry, Registry};
use serde::Serialize;
use server::{ReconcileReport, Reconciler, ServerEvent, ServerMonitor, Supervisor, SupervisorSettings};
use session::readiness::probe_for;
use session::{ProcessMultiplexer, ReadinessProbe, SessionMultiplexer, StopSettings, TmuxMultiplexer};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a successful command reports about an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub id: ServerId,
    pub name: String,
    pub observed_state: ObservedState,
    pub desired_state: DesiredState,
    pub base_path: PathBuf,
    pub session: Option<String>,
}

impl From<ServerInstance> for InstanceSnapshot {
    fn from(instance: ServerInstance) -> Self {
        Self {
            id: instance.id,
            name: instance.name,
            observed_state: instance.observed_state,
            desired_state: instance.desired_state,
            base_path: instance.base_path,
            session: instance.session_handle,
        }
    }
}

/// Build the session backend a configuration asks for.
pub fn multiplexer_for(config: &Config) -> Arc<dyn SessionMultiplexer> {
    let stop = StopSettings {
        stop_command: config.launch.stop_command.clone(),
        timeout: config.timeouts.graceful_stop(),
    };
    match config.session.backend {
        MultiplexerBackend::Tmux => {
            Arc::new(TmuxMultiplexer::new(config.session.tmux_socket.clone(), stop))
        }
        MultiplexerBackend::Process => Arc::new(ProcessMultiplexer::new(stop)),
    }
}

/// Command façade over the supervisor, registry and reconciler.
///
/// This struct is the entry point for front ends. It validates input shape,
/// delegates to the [`Supervisor`], and turns every failure into a
/// [`CommandError`] carrying the instance id and last known observed state.
/// All public methods are instrumented with `tracing` spans.
pub struct Kherimoya {
    config: Config,
    supervisor: Arc<Supervisor>,
    reconciler: Arc<Reconciler>,
}

impl Kherimoya {
    /// Create a façade from explicit dependencies.
    ///
    /// `config` must already be resolved against the management root.
    pub fn new(
        config: Config,
        registry: Arc<dyn Registry>,
        multiplexer: Arc<dyn SessionMultiplexer>,
    ) -> Self {
        let probe = probe_for(&config.launch);
        Self::with_probe(config, registry, multiplexer, probe)
    }

    /// Like [`Kherimoya::new`], with a caller-supplied readiness probe.
    pub fn with_probe(
        config: Config,
        registry: Arc<dyn Registry>,
        multiplexer: Arc<dyn SessionMultiplexer>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        let supervisor = Arc::new(Supervisor::new(
            registry,
            multiplexer,
            probe,
            SupervisorSettings::from_config(&config),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&supervisor),
            config.policy.clone(),
        ));
        Self {
            config,
            supervisor,
            reconciler,
        }
    }

    /// Open a management root: load its configuration and registry, then
    /// reconcile recorded state with the live sessions.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(root), fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let config = Config::discover(root)?.resolve(root);
        validate_config(&config)?;

        let registry = FileRegistry::open(&config.registry_file).await?;
        let multiplexer = multiplexer_for(&config);
        let manager = Self::new(config, Arc::new(registry), multiplexer);

        match manager.reconciler.reconcile().await {
            Ok(report) => tracing::debug!(?report, "Boot reconciliation finished"),
            Err(e) => tracing::warn!(error = %e, "Boot reconciliation failed"),
        }
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    async fn fail(&self, server_id: Option<&ServerId>, error: Error) -> CommandError {
        let observed_state = match server_id {
            Some(id) => self
                .supervisor
                .registry()
                .get(id)
                .await
                .ok()
                .map(|instance| instance.observed_state),
            None => None,
        };
        tracing::debug!(server_id = ?server_id, kind = %error.kind(), "Command failed");
        CommandError::new(error, server_id.cloned(), observed_state)
    }

    fn parse_id(server_id: &str) -> CommandResult<ServerId> {
        ServerId::parse(server_id).map_err(|e| CommandError::new(e, None, None))
    }

    /// Register a new, stopped server.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, name: &str) -> CommandResult<InstanceSnapshot> {
        match self.supervisor.create(name).await {
            Ok(instance) => Ok(instance.into()),
            Err(e) => Err(self.fail(None, e).await),
        }
    }

    /// Start a server and wait until it is ready.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, server_id: &str) -> CommandResult<InstanceSnapshot> {
        let id = Self::parse_id(server_id)?;
        match self.supervisor.start(&id).await {
            Ok(instance) => Ok(instance.into()),
            Err(e) => Err(self.fail(Some(&id), e).await),
        }
    }

    /// Stop a server gracefully, or acknowledge its crash.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, server_id: &str) -> CommandResult<InstanceSnapshot> {
        let id = Self::parse_id(server_id)?;
        match self.supervisor.stop(&id).await {
            Ok(instance) => Ok(instance.into()),
            Err(e) => Err(self.fail(Some(&id), e).await),
        }
    }

    /// Remove a stopped server. Its files are deleted only when `confirm` is set.
    #[tracing::instrument(skip(self))]
    pub async fn destroy(&self, server_id: &str, confirm: bool) -> CommandResult<InstanceSnapshot> {
        let id = Self::parse_id(server_id)?;
        match self.supervisor.destroy(&id, confirm).await {
            Ok(instance) => Ok(instance.into()),
            Err(e) => Err(self.fail(Some(&id), e).await),
        }
    }

    /// One server, with its liveness confirmed.
    #[tracing::instrument(skip(self))]
    pub async fn status(&self, server_id: &str) -> CommandResult<InstanceSnapshot> {
        let id = Self::parse_id(server_id)?;
        match self.supervisor.status(&id).await {
            Ok(instance) => Ok(instance.into()),
            Err(e) => Err(self.fail(Some(&id), e).await),
        }
    }

    /// Every server, ordered by name.
    #[tracing::instrument(skip(self))]
    pub async fn list(&self) -> CommandResult<Vec<InstanceSnapshot>> {
        match self.supervisor.list().await {
            Ok(instances) => Ok(instances.into_iter().map(Into::into).collect()),
            Err(e) => Err(self.fail(None, e).await),
        }
    }

    /// Deliver one console line to a running server.
    #[tracing::instrument(skip(self, text))]
    pub async fn send_input(&self, server_id: &str, text: &str) -> CommandResult<InstanceSnapshot> {
        let id = Self::parse_id(server_id)?;
        match self.supervisor.send_input(&id, text).await {
            Ok(instance) => Ok(instance.into()),
            Err(e) => Err(self.fail(Some(&id), e).await),
        }
    }

    /// Give a server a new unique name.
    #[tracing::instrument(skip(self))]
    pub async fn rename(&self, server_id: &str, name: &str) -> CommandResult<InstanceSnapshot> {
        let id = Self::parse_id(server_id)?;
        match self.supervisor.rename(&id, name).await {
            Ok(instance) => Ok(instance.into()),
            Err(e) => Err(self.fail(Some(&id), e).await),
        }
    }

    /// The last `lines` lines of a running server's console.
    #[tracing::instrument(skip(self))]
    pub async fn console(&self, server_id: &str, lines: usize) -> CommandResult<Vec<String>> {
        let id = Self::parse_id(server_id)?;
        match self.supervisor.console(&id, lines).await {
            Ok(output) => Ok(output),
            Err(e) => Err(self.fail(Some(&id), e).await),
        }
    }

    /// Lifecycle history of a server, newest first.
    ///
    /// The history is kept in memory and covers this manager's lifetime only.
    #[tracing::instrument(skip(self))]
    pub async fn events(
        &self,
        server_id: &str,
        limit: Option<usize>,
    ) -> CommandResult<Vec<ServerEvent>> {
        let id = Self::parse_id(server_id)?;
        let result = match self.supervisor.registry().get(&id).await {
            Ok(_) => self.supervisor.events(&id, limit),
            Err(e) => Err(e),
        };
        match result {
            Ok(events) => Ok(events),
            Err(e) => Err(self.fail(Some(&id), e).await),
        }
    }

    /// Lifecycle history of every server, newest first.
    pub async fn all_events(&self, limit: Option<usize>) -> CommandResult<Vec<ServerEvent>> {
        match self.supervisor.all_events(limit) {
            Ok(events) => Ok(events),
            Err(e) => Err(self.fail(None, e).await),
        }
    }

    /// Align recorded state with the live sessions now.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> CommandResult<ReconcileReport> {
        match self.reconciler.reconcile().await {
            Ok(report) => Ok(report),
            Err(e) => Err(self.fail(None, e).await),
        }
    }

    /// A health monitor configured from this root, not yet started.
    pub fn monitor(&self) -> ServerMonitor {
        ServerMonitor::new(
            Arc::clone(&self.reconciler),
            (&self.config.monitor).into(),
        )
    }
}
