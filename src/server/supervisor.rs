use crate::config::{Config, LaunchConfig};
use crate::error::{Error, Result};
use crate::registry::{
    DesiredState, ObservedState, Registry, ServerId, ServerInstance, validate_name,
};
use crate::server::lifecycle::{ServerEvent, ServerLifecycleEvent, ServerLifecycleManager};
use crate::server::locks::InstanceLocks;
use crate::session::{LaunchCommand, ReadinessProbe, SessionMultiplexer, SessionName};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Sub-directories scaffolded beneath every instance's base path.
const INSTANCE_DIRS: [&str; 4] = ["server", "config", "state", "extra"];

/// What the supervisor needs from the configuration.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Directory holding one base path per instance.
    pub servers_dir: PathBuf,
    /// Session names are this prefix followed by the instance id.
    pub session_prefix: String,
    pub launch: LaunchConfig,
    /// Ceiling on spawn plus readiness.
    pub spawn_timeout: Duration,
}

impl SupervisorSettings {
    /// Settings of an already resolved configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            servers_dir: config.servers_dir.clone(),
            session_prefix: config.session.prefix.clone(),
            launch: config.launch.clone(),
            spawn_timeout: config.timeouts.spawn(),
        }
    }
}

#[derive(Serialize)]
struct InstanceMetadata<'a> {
    id: &'a ServerId,
    name: &'a str,
}

/// Owner of every instance's lifecycle.
///
/// Each operation takes the instance's lock before reading its record and
/// writes the resulting observed state to the registry before returning.
pub struct Supervisor {
    registry: Arc<dyn Registry>,
    mux: Arc<dyn SessionMultiplexer>,
    probe: Arc<dyn ReadinessProbe>,
    settings: SupervisorSettings,
    locks: InstanceLocks,
    /// Serializes id allocation.
    create_lock: Mutex<()>,
    lifecycle: ServerLifecycleManager,
}

impl Supervisor {
    pub fn new(
        registry: Arc<dyn Registry>,
        mux: Arc<dyn SessionMultiplexer>,
        probe: Arc<dyn ReadinessProbe>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            mux,
            probe,
            settings,
            locks: InstanceLocks::new(),
            create_lock: Mutex::new(()),
            lifecycle: ServerLifecycleManager::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn multiplexer(&self) -> &Arc<dyn SessionMultiplexer> {
        &self.mux
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn lifecycle(&self) -> &ServerLifecycleManager {
        &self.lifecycle
    }

    /// Session name of an instance, derived from its id alone.
    pub fn session_name(&self, id: &ServerId) -> SessionName {
        SessionName::for_instance(&self.settings.session_prefix, id)
    }

    fn session_of(&self, instance: &ServerInstance) -> SessionName {
        instance
            .session_handle
            .as_deref()
            .map(SessionName::new)
            .unwrap_or_else(|| self.session_name(&instance.id))
    }

    pub(crate) fn record(
        &self,
        instance: &ServerInstance,
        event: ServerLifecycleEvent,
        details: Option<String>,
    ) {
        if let Err(e) = self
            .lifecycle
            .record_event(&instance.id, &instance.name, event, details)
        {
            tracing::warn!(server_id = %instance.id, error = %e, "Failed to record lifecycle event");
        }
    }

    /// Register a new, stopped instance and scaffold its directories.
    #[tracing::instrument(skip(self, name), fields(server_name = %name))]
    pub async fn create(&self, name: &str) -> Result<ServerInstance> {
        validate_name(name)?;
        let _guard = self.create_lock.lock().await;

        if self.registry.find_by_name(name).await?.is_some() {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let mut taken: HashSet<ServerId> = self
            .registry
            .list()
            .await?
            .into_iter()
            .map(|instance| instance.id)
            .collect();
        tokio::fs::create_dir_all(&self.settings.servers_dir)
            .await
            .map_err(|e| Error::persistence("Failed to create servers directory", e))?;
        let (id, base_path) = loop {
            let id = ServerId::allocate(&taken);
            let base_path = self.settings.servers_dir.join(id.as_str());
            // Creating the directory claims the id, also against other managers.
            match tokio::fs::create_dir(&base_path).await {
                Ok(()) => break (id, base_path),
                // Claimed elsewhere, or leftover files of a dropped record.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    taken.insert(id);
                }
                Err(e) => return Err(Error::persistence("Failed to create server directory", e)),
            }
        };

        let instance = ServerInstance::new(id, name, base_path);
        scaffold(&instance).await?;

        if let Err(e) = self.registry.put(&instance).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(instance.base_path()).await {
                tracing::warn!(error = %cleanup, "Failed to remove scaffolding");
            }
            return Err(e);
        }

        tracing::info!(server_id = %instance.id, "Server created");
        self.record(&instance, ServerLifecycleEvent::Created, None);
        Ok(instance)
    }

    /// Start an instance and wait until it is ready.
    #[tracing::instrument(skip(self, id), fields(server_id = %id))]
    pub async fn start(&self, id: &ServerId) -> Result<ServerInstance> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.registry.get(id).await?;
        let instance = self.refresh_locked(instance).await?;
        self.start_locked(instance).await
    }

    async fn start_locked(&self, instance: ServerInstance) -> Result<ServerInstance> {
        if matches!(
            instance.observed_state,
            ObservedState::Running | ObservedState::Starting
        ) {
            return Err(Error::AlreadyRunning(instance.id.to_string()));
        }

        let previous = instance.clone();
        let session = self.session_name(&instance.id);
        let mut instance = instance;
        instance.desired_state = DesiredState::Running;
        instance.observed_state = ObservedState::Starting;
        instance.session_handle = Some(session.to_string());
        self.registry.put(&instance).await?;
        self.record(&instance, ServerLifecycleEvent::Starting, None);

        let command = self.launch_command(&instance);
        let working_dir = instance.server_dir();
        tracing::info!(session = %session, program = %command.program, "Starting server");

        let deadline = tokio::time::Instant::now() + self.settings.spawn_timeout;
        // The spawn itself always runs to completion, so a session it creates
        // is never left behind untracked; only readiness is cut off.
        let launched = match self.mux.spawn(&session, &command, &working_dir).await {
            Ok(handle) => self.wait_ready(&session, deadline).await.map(|()| handle),
            Err(e) => Err(e),
        };

        match launched {
            Ok(handle) => {
                instance.observed_state = ObservedState::Running;
                self.registry.put(&instance).await?;
                tracing::info!(pid = ?handle.pid, "Server running");
                self.record(
                    &instance,
                    ServerLifecycleEvent::Started,
                    handle.pid.map(|pid| format!("pid {}", pid)),
                );
                Ok(instance)
            }
            Err(Error::SessionAlreadyExists(name)) => {
                tracing::warn!(session = %name, "A live session already holds this name");
                self.registry.put(&previous).await?;
                Err(Error::SessionAlreadyExists(name))
            }
            Err(e) => {
                if matches!(e, Error::SpawnTimeout(_)) {
                    tracing::error!(timeout = ?self.settings.spawn_timeout, "Server did not become ready in time");
                } else {
                    tracing::error!(error = %e, "Server failed to start");
                }
                self.discard_session(&session).await;
                self.mark_crashed(&mut instance, e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Run the readiness probe until `deadline`.
    async fn wait_ready(&self, session: &SessionName, deadline: tokio::time::Instant) -> Result<()> {
        let probed =
            tokio::time::timeout_at(deadline, self.probe.wait_ready(self.mux.as_ref(), session))
                .await;
        match probed {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::SpawnTimeout(format!(
                    "{} not ready after {:?}",
                    session, self.settings.spawn_timeout
                )));
            }
        }
        if !self.mux.is_alive(session).await {
            return Err(Error::SpawnFailed(format!(
                "{} exited before it was ready",
                session
            )));
        }
        Ok(())
    }

    /// Force a half-started session away so no untracked process remains.
    async fn discard_session(&self, session: &SessionName) {
        match self.mux.kill(session, false).await {
            Ok(()) => tracing::debug!(session = %session, "Discarded half-started session"),
            Err(Error::SessionNotFound(_)) => {}
            Err(e) => tracing::warn!(session = %session, error = %e, "Failed to discard session"),
        }
    }

    async fn mark_crashed(&self, instance: &mut ServerInstance, reason: String) -> Result<()> {
        instance.observed_state = ObservedState::Crashed;
        instance.session_handle = None;
        self.registry.put(instance).await?;
        self.record(instance, ServerLifecycleEvent::Crashed, Some(reason));
        Ok(())
    }

    fn launch_command(&self, instance: &ServerInstance) -> LaunchCommand {
        let launch = &self.settings.launch;
        let server_dir = instance.server_dir();
        let substitute = |arg: &String| {
            arg.replace("{server_dir}", &server_dir.to_string_lossy())
                .replace("{base_dir}", &instance.base_path().to_string_lossy())
                .replace("{id}", instance.id.as_str())
                .replace("{name}", &instance.name)
        };

        let mut command = LaunchCommand::new(launch.command.clone())
            .args(launch.args.iter().map(substitute));
        command.env = launch.env.clone();
        command
    }

    /// Stop an instance, gracefully.
    ///
    /// On a crashed instance this acknowledges the crash: any lingering
    /// session is killed and the instance becomes Stopped.
    #[tracing::instrument(skip(self, id), fields(server_id = %id))]
    pub async fn stop(&self, id: &ServerId) -> Result<ServerInstance> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.registry.get(id).await?;
        let mut instance = self.refresh_locked(instance).await?;

        let details = match instance.observed_state {
            ObservedState::Stopped => {
                return Err(Error::InvalidState(format!(
                    "{} is already stopped",
                    instance.id
                )));
            }
            ObservedState::Crashed => {
                // Whatever the crashed process left behind goes too.
                let session = self.session_of(&instance);
                self.kill_session(&session).await?;
                Some("crash acknowledged".to_string())
            }
            _ => {
                let session = self.session_of(&instance);
                self.kill_session(&session).await?;
                None
            }
        };

        instance.desired_state = DesiredState::Stopped;
        instance.observed_state = ObservedState::Stopped;
        instance.session_handle = None;
        self.registry.put(&instance).await?;

        tracing::info!("Server stopped");
        self.record(&instance, ServerLifecycleEvent::Stopped, details);
        Ok(instance)
    }

    async fn kill_session(&self, session: &SessionName) -> Result<()> {
        match self.mux.kill(session, true).await {
            // Gone between the liveness check and the kill.
            Ok(()) | Err(Error::SessionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove a stopped instance; with `delete_files` its base path goes too.
    #[tracing::instrument(skip(self, id), fields(server_id = %id))]
    pub async fn destroy(&self, id: &ServerId, delete_files: bool) -> Result<ServerInstance> {
        let guard = self.locks.acquire(id).await;
        let instance = self.registry.get(id).await?;
        let instance = self.refresh_locked(instance).await?;

        if instance.observed_state != ObservedState::Stopped
            || instance.desired_state != DesiredState::Stopped
        {
            return Err(Error::InvalidState(format!(
                "{} is {}; stop it before destroying",
                instance.id, instance.observed_state
            )));
        }

        let removed = self.registry.remove(id).await?;
        self.record(&removed, ServerLifecycleEvent::Destroyed, None);
        self.locks.forget(id);
        drop(guard);

        if delete_files {
            match tokio::fs::remove_dir_all(removed.base_path()).await {
                Ok(()) => tracing::info!(path = %removed.base_path().display(), "Server files deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::persistence("Failed to delete server files", e)),
            }
        } else {
            tracing::info!(path = %removed.base_path().display(), "Server record removed, files kept");
        }
        Ok(removed)
    }

    /// Give an instance a new unique name.
    #[tracing::instrument(skip(self, id, new_name), fields(server_id = %id, new_name = %new_name))]
    pub async fn rename(&self, id: &ServerId, new_name: &str) -> Result<ServerInstance> {
        validate_name(new_name)?;
        let _guard = self.locks.acquire(id).await;
        let mut instance = self.registry.get(id).await?;
        if instance.name == new_name {
            return Ok(instance);
        }

        let old_name = std::mem::replace(&mut instance.name, new_name.to_string());
        self.registry.put(&instance).await?;
        if let Err(e) = write_metadata(&instance).await {
            tracing::warn!(error = %e, "Failed to rewrite server metadata");
        }

        self.record(
            &instance,
            ServerLifecycleEvent::Renamed,
            Some(format!("was {}", old_name)),
        );
        Ok(instance)
    }

    /// Deliver one console line to a running instance.
    #[tracing::instrument(skip(self, id, text), fields(server_id = %id))]
    pub async fn send_input(&self, id: &ServerId, text: &str) -> Result<ServerInstance> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.running_instance(id).await?;
        self.mux.send_input(&self.session_of(&instance), text).await?;
        Ok(instance)
    }

    /// The last `lines` lines of a running instance's console.
    #[tracing::instrument(skip(self, id), fields(server_id = %id))]
    pub async fn console(&self, id: &ServerId, lines: usize) -> Result<Vec<String>> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.running_instance(id).await?;
        self.mux
            .capture_output(&self.session_of(&instance), lines)
            .await
    }

    async fn running_instance(&self, id: &ServerId) -> Result<ServerInstance> {
        let instance = self.registry.get(id).await?;
        let instance = self.refresh_locked(instance).await?;
        if instance.observed_state != ObservedState::Running {
            return Err(Error::SessionNotFound(format!(
                "{} is {}",
                instance.id, instance.observed_state
            )));
        }
        Ok(instance)
    }

    /// Current record of an instance with its liveness confirmed.
    #[tracing::instrument(skip(self, id), fields(server_id = %id))]
    pub async fn status(&self, id: &ServerId) -> Result<ServerInstance> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.registry.get(id).await?;
        self.refresh_locked(instance).await
    }

    /// Every instance, with liveness confirmed where a session is claimed.
    pub async fn list(&self) -> Result<Vec<ServerInstance>> {
        let mut instances = Vec::new();
        for instance in self.registry.list().await? {
            if instance.observed_state.claims_session() {
                match self.status(&instance.id).await {
                    Ok(refreshed) => instances.push(refreshed),
                    // Destroyed meanwhile.
                    Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            } else {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    /// One liveness check of one instance, as the monitor runs it.
    pub async fn check_health(&self, id: &ServerId) -> Result<ServerInstance> {
        self.status(id).await
    }

    /// Start a crashed instance again on behalf of the crash policy.
    #[tracing::instrument(skip(self, id), fields(server_id = %id))]
    pub async fn restart_crashed(&self, id: &ServerId, attempt: u32) -> Result<ServerInstance> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.registry.get(id).await?;
        let instance = self.refresh_locked(instance).await?;
        if instance.observed_state != ObservedState::Crashed
            || instance.desired_state != DesiredState::Running
        {
            return Ok(instance);
        }

        let instance = self.start_locked(instance).await?;
        self.record(
            &instance,
            ServerLifecycleEvent::Restarted,
            Some(format!("attempt {}", attempt)),
        );
        Ok(instance)
    }

    /// Take over a live session left behind by an earlier manager.
    #[tracing::instrument(skip(self, id, session), fields(server_id = %id, session = %session))]
    pub async fn adopt(&self, id: &ServerId, session: &SessionName) -> Result<Option<ServerInstance>> {
        let _guard = self.locks.acquire(id).await;
        let mut instance = self.registry.get(id).await?;
        if instance.observed_state == ObservedState::Running || !self.mux.is_alive(session).await {
            return Ok(None);
        }

        instance.desired_state = DesiredState::Running;
        instance.observed_state = ObservedState::Running;
        instance.session_handle = Some(session.to_string());
        self.registry.put(&instance).await?;

        tracing::info!("Orphaned session adopted");
        self.record(&instance, ServerLifecycleEvent::Adopted, None);
        Ok(Some(instance))
    }

    /// Align one record with a known set of live sessions.
    ///
    /// Returns the record and whether it changed.
    pub(crate) async fn reconcile_instance(
        &self,
        id: &ServerId,
        live: &HashSet<SessionName>,
    ) -> Result<(ServerInstance, Option<ObservedState>)> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.registry.get(id).await?;
        let alive = live.contains(&self.session_of(&instance));
        let before = instance.observed_state;
        let instance = self.apply_liveness(instance, alive).await?;
        let changed = (instance.observed_state != before).then_some(before);
        Ok((instance, changed))
    }

    /// Correct a record whose claimed session may be gone. Caller holds the lock.
    async fn refresh_locked(&self, instance: ServerInstance) -> Result<ServerInstance> {
        if !instance.observed_state.claims_session() {
            return Ok(instance);
        }
        let alive = self.mux.is_alive(&self.session_of(&instance)).await;
        self.apply_liveness(instance, alive).await
    }

    async fn apply_liveness(
        &self,
        mut instance: ServerInstance,
        alive: bool,
    ) -> Result<ServerInstance> {
        match (instance.observed_state, alive) {
            (ObservedState::Running, false) => {
                tracing::warn!(server_id = %instance.id, "Session is gone, marking crashed");
                self.mark_crashed(&mut instance, "session no longer alive".to_string())
                    .await?;
            }
            (ObservedState::Unknown | ObservedState::Starting, true) => {
                tracing::info!(server_id = %instance.id, "Session is alive, marking running");
                instance.observed_state = ObservedState::Running;
                if instance.session_handle.is_none() {
                    instance.session_handle = Some(self.session_name(&instance.id).to_string());
                }
                self.registry.put(&instance).await?;
            }
            (ObservedState::Unknown | ObservedState::Starting, false) => {
                if instance.desired_state == DesiredState::Running {
                    self.mark_crashed(&mut instance, "session not found after restart".to_string())
                        .await?;
                } else {
                    instance.observed_state = ObservedState::Stopped;
                    instance.session_handle = None;
                    self.registry.put(&instance).await?;
                }
            }
            _ => {}
        }
        Ok(instance)
    }

    /// Lifecycle history of one instance, newest first.
    pub fn events(&self, id: &ServerId, limit: Option<usize>) -> Result<Vec<ServerEvent>> {
        self.lifecycle.get_server_events(id, limit)
    }

    /// Lifecycle history of every instance, newest first.
    pub fn all_events(&self, limit: Option<usize>) -> Result<Vec<ServerEvent>> {
        self.lifecycle.get_all_events(limit)
    }
}

async fn scaffold(instance: &ServerInstance) -> Result<()> {
    let base = instance.base_path();
    let result = async {
        for dir in INSTANCE_DIRS {
            tokio::fs::create_dir_all(base.join(dir))
                .await
                .map_err(|e| Error::persistence("Failed to create server directory", e))?;
        }
        write_metadata(instance).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_dir_all(base).await;
    }
    result
}

async fn write_metadata(instance: &ServerInstance) -> Result<()> {
    let metadata = InstanceMetadata {
        id: &instance.id,
        name: &instance.name,
    };
    let bytes = serde_json::to_vec_pretty(&metadata)
        .map_err(|e| Error::persistence("Failed to serialize server metadata", e))?;
    tokio::fs::write(instance.metadata_file(), bytes)
        .await
        .map_err(|e| Error::persistence("Failed to write server metadata", e))
}
