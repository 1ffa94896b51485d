use crate::config::{CrashPolicy, OrphanPolicy, PolicyConfig};
use crate::error::{Error, Result};
use crate::registry::{DesiredState, ObservedState, ServerId, ServerInstance};
use crate::server::lifecycle::ServerLifecycleEvent;
use crate::server::supervisor::Supervisor;
use crate::session::SessionName;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// A live session that no running instance accounts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Orphan {
    pub session: String,
    /// Instance the session name points at, when it is a known one.
    pub server_id: Option<ServerId>,
}

/// Outcome of a reconciliation or health pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Instances found dead without a stop.
    pub crashed: Vec<ServerId>,
    /// Instances of unknown state whose session turned out alive.
    pub recovered: Vec<ServerId>,
    /// Instances restarted by the crash policy.
    pub restarted: Vec<ServerId>,
    /// Instances that took over their orphaned session.
    pub adopted: Vec<ServerId>,
    pub orphans: Vec<Orphan>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.crashed.is_empty()
            && self.recovered.is_empty()
            && self.restarted.is_empty()
            && self.adopted.is_empty()
            && self.orphans.is_empty()
    }
}

/// Repairs drift between the registry and the live sessions.
///
/// Quick to mark crashed, conservative about killing: an orphaned session is
/// flagged (or adopted) but never terminated.
pub struct Reconciler {
    supervisor: Arc<Supervisor>,
    policy: PolicyConfig,
    /// Consecutive restart attempts per instance.
    restart_attempts: Mutex<HashMap<ServerId, u32>>,
}

impl Reconciler {
    pub fn new(supervisor: Arc<Supervisor>, policy: PolicyConfig) -> Self {
        Self {
            supervisor,
            policy,
            restart_attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Full pass against the multiplexer's ground truth.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let live = self.supervisor.multiplexer().list_live_sessions().await?;
        let mut report = ReconcileReport::default();
        let mut accounted: HashSet<SessionName> = HashSet::new();

        let instances = self.supervisor.registry().list().await?;
        let prefix = &self.supervisor.settings().session_prefix;
        for instance in &instances {
            let (current, previous) = match self
                .supervisor
                .reconcile_instance(&instance.id, &live)
                .await
            {
                Ok(result) => result,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            match (previous, current.observed_state) {
                (Some(_), ObservedState::Crashed) => report.crashed.push(current.id.clone()),
                (Some(_), ObservedState::Running) => report.recovered.push(current.id.clone()),
                _ => {}
            }
            if current.observed_state == ObservedState::Running {
                self.reset_attempts(&current.id);
                if let Some(handle) = &current.session_handle {
                    accounted.insert(SessionName::new(handle.as_str()));
                }
            }
        }

        let known: HashMap<&ServerId, &ServerInstance> =
            instances.iter().map(|instance| (&instance.id, instance)).collect();
        let mut orphans: Vec<&SessionName> = live.difference(&accounted).collect();
        orphans.sort();

        for session in orphans {
            let server_id = session
                .instance_id(prefix)
                .filter(|id| known.contains_key(id));

            if let (Some(id), OrphanPolicy::Adopt) = (&server_id, self.policy.orphan) {
                match self.supervisor.adopt(id, session).await {
                    Ok(Some(_)) => {
                        report.adopted.push(id.clone());
                        continue;
                    }
                    Ok(None) | Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            tracing::warn!(session = %session, server_id = ?server_id, "Orphaned session left untouched");
            if let Some(instance) = server_id.as_ref().and_then(|id| known.get(id)) {
                self.supervisor.record(
                    instance,
                    ServerLifecycleEvent::OrphanDetected,
                    Some(session.to_string()),
                );
            }
            report.orphans.push(Orphan {
                session: session.to_string(),
                server_id,
            });
        }

        self.apply_crash_policy(&mut report).await?;
        if !report.is_clean() {
            tracing::info!(?report, "Reconciliation repaired drift");
        }
        Ok(report)
    }

    /// Liveness poll of every instance that claims a session.
    pub async fn check_health(&self) -> Result<ReconcileReport> {
        let instances = self.supervisor.registry().list().await?;
        let checks = instances
            .iter()
            .filter(|instance| instance.observed_state.claims_session())
            .map(|instance| async move {
                let before = instance.observed_state;
                (before, self.supervisor.check_health(&instance.id).await)
            });

        let mut report = ReconcileReport::default();
        for (before, result) in join_all(checks).await {
            match result {
                Ok(current) if current.observed_state == ObservedState::Running => {
                    if before != ObservedState::Running {
                        report.recovered.push(current.id.clone());
                    }
                    self.reset_attempts(&current.id);
                }
                Ok(current) if current.observed_state == ObservedState::Crashed => {
                    report.crashed.push(current.id);
                }
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Health check failed");
                }
            }
        }

        self.apply_crash_policy(&mut report).await?;
        Ok(report)
    }

    /// Forget the consecutive restarts of an instance seen healthy.
    fn reset_attempts(&self, id: &ServerId) {
        self.restart_attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Next attempt number, or `None` once the budget is spent.
    fn next_attempt(&self, id: &ServerId) -> Option<u32> {
        let mut attempts = self
            .restart_attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = attempts.entry(id.clone()).or_insert(0);
        if *count >= self.policy.max_restart_attempts {
            return None;
        }
        *count += 1;
        Some(*count)
    }

    async fn apply_crash_policy(&self, report: &mut ReconcileReport) -> Result<()> {
        if self.policy.crash != CrashPolicy::Restart {
            return Ok(());
        }

        for instance in self.supervisor.registry().list().await? {
            if instance.observed_state != ObservedState::Crashed
                || instance.desired_state != DesiredState::Running
            {
                continue;
            }
            let Some(attempt) = self.next_attempt(&instance.id) else {
                tracing::debug!(server_id = %instance.id, "Restart budget spent, leaving crashed");
                continue;
            };

            tracing::info!(server_id = %instance.id, attempt, "Restarting crashed server");
            match self.supervisor.restart_crashed(&instance.id, attempt).await {
                Ok(restarted) if restarted.observed_state == ObservedState::Running => {
                    report.restarted.push(restarted.id);
                }
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(server_id = %instance.id, attempt, error = %e, "Restart failed");
                }
            }
        }
        Ok(())
    }
}
