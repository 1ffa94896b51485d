/// Server management module for Kherimoya.
///
/// This module owns the lifecycle of managed server instances: creating and
/// scaffolding them, starting and stopping their sessions, detecting crashes,
/// and repairing drift between the registry and the live sessions.
/// All public operations are instrumented with `tracing` spans.
///
/// # Components
///
/// * `supervisor` - Per-instance state machine, serialized by instance id
/// * `reconciler` - Aligns recorded state with live sessions, applies policies
/// * `monitor` - Background polling loop driving the reconciler
/// * `lifecycle` - Bounded history of lifecycle events
///
/// # Examples
///
/// ```no_run
/// use kherimoya::config::{Config, PolicyConfig};
/// use kherimoya::registry::InMemoryRegistry;
/// use kherimoya::server::{Reconciler, ServerMonitor, ServerMonitorConfig, Supervisor, SupervisorSettings};
/// use kherimoya::session::{AliveProbe, ProcessMultiplexer, StopSettings};
/// use std::sync::Arc;
///
/// # async fn demo() -> kherimoya::Result<()> {
/// let config = Config::default().resolve("/srv/kherimoya");
/// let supervisor = Arc::new(Supervisor::new(
///     Arc::new(InMemoryRegistry::new()),
///     Arc::new(ProcessMultiplexer::new(StopSettings::default())),
///     Arc::new(AliveProbe::default()),
///     SupervisorSettings::from_config(&config),
/// ));
///
/// let alpha = supervisor.create("alpha").await?;
/// supervisor.start(&alpha.id).await?;
///
/// let reconciler = Arc::new(Reconciler::new(Arc::clone(&supervisor), PolicyConfig::default()));
/// let mut monitor = ServerMonitor::new(reconciler, ServerMonitorConfig::default());
/// monitor.start();
/// # Ok(())
/// # }
/// ```
pub mod lifecycle;
mod locks;
pub mod monitor;
pub mod reconciler;
pub mod supervisor;

pub use lifecycle::{ServerEvent, ServerLifecycleEvent, ServerLifecycleManager};
pub use monitor::{ServerMonitor, ServerMonitorConfig};
pub use reconciler::{Orphan, ReconcileReport, Reconciler};
pub use supervisor::{Supervisor, SupervisorSettings};
