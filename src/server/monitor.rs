use crate::config::MonitorConfig;
use crate::server::reconciler::{ReconcileReport, Reconciler};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Server monitor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMonitorConfig {
    /// Liveness poll interval; also the crash detection latency
    pub check_interval: Duration,
    /// Full reconciliation interval, if any
    pub reconcile_interval: Option<Duration>,
}

impl Default for ServerMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            reconcile_interval: None,
        }
    }
}

impl From<&MonitorConfig> for ServerMonitorConfig {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            check_interval: config.interval(),
            reconcile_interval: config.reconcile_interval(),
        }
    }
}

/// Background liveness loop.
///
/// Polls every instance that claims a session and, when configured, runs a
/// full reconciliation on its own interval. Crash policy is applied by the
/// [`Reconciler`] on each pass.
pub struct ServerMonitor {
    reconciler: Arc<Reconciler>,
    config: ServerMonitorConfig,
    monitor_task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
    last_report: Arc<Mutex<Option<ReconcileReport>>>,
}

impl ServerMonitor {
    /// Create a new server monitor
    pub fn new(reconciler: Arc<Reconciler>, config: ServerMonitorConfig) -> Self {
        Self {
            reconciler,
            config,
            monitor_task: None,
            shutdown: None,
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.monitor_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start the monitor. Does nothing if it is already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let reconciler = Arc::clone(&self.reconciler);
        let last_report = Arc::clone(&self.last_report);
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            let mut checks = time::interval(config.check_interval);
            checks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reconciles = config.reconcile_interval.map(|period| {
                let mut interval = time::interval_at(time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });
            tracing::info!(interval = ?config.check_interval, reconcile = ?config.reconcile_interval, "Monitor started");

            loop {
                let result = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = checks.tick() => reconciler.check_health().await,
                    _ = async {
                        match reconciles.as_mut() {
                            Some(interval) => interval.tick().await,
                            None => std::future::pending::<time::Instant>().await,
                        }
                    } => reconciler.reconcile().await,
                };

                match result {
                    Ok(report) => {
                        if !report.is_clean() {
                            tracing::info!(?report, "Monitor pass changed state");
                        }
                        *last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
                    }
                    Err(e) => tracing::warn!(error = %e, "Monitor pass failed"),
                }
            }
            tracing::info!("Monitor stopped");
        });

        self.shutdown = Some(shutdown_tx);
        self.monitor_task = Some(task);
    }

    /// Stop the monitor and wait for the current pass to finish.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.monitor_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Monitor task ended abnormally");
            }
        }
    }

    /// Report of the most recent pass.
    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for ServerMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
    }
}
