//! Deciding when a freshly spawned server counts as ready.
//!
//! Probes run without a deadline of their own; the supervisor bounds the
//! whole spawn and readiness phase with the configured spawn timeout.
use crate::config::LaunchConfig;
use crate::error::{Error, Result};
use crate::session::{SessionMultiplexer, SessionName};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Collaborator callback deciding readiness.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Resolve once the session is ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpawnFailed`] when the process dies first.
    async fn wait_ready(&self, mux: &dyn SessionMultiplexer, name: &SessionName) -> Result<()>;
}

/// Ready once the process is still alive after a short settle delay.
#[derive(Debug, Clone)]
pub struct AliveProbe {
    settle: Duration,
}

impl AliveProbe {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }
}

impl Default for AliveProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl ReadinessProbe for AliveProbe {
    async fn wait_ready(&self, mux: &dyn SessionMultiplexer, name: &SessionName) -> Result<()> {
        tokio::time::sleep(self.settle).await;
        if mux.is_alive(name).await {
            Ok(())
        } else {
            Err(Error::SpawnFailed(format!(
                "{} exited right after launch",
                name
            )))
        }
    }
}

/// Ready once a line of console output contains a sentinel.
#[derive(Debug, Clone)]
pub struct OutputProbe {
    pattern: String,
    poll_interval: Duration,
    scan_lines: usize,
}

impl OutputProbe {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            poll_interval: Duration::from_millis(250),
            scan_lines: 200,
        }
    }
}

#[async_trait]
impl ReadinessProbe for OutputProbe {
    async fn wait_ready(&self, mux: &dyn SessionMultiplexer, name: &SessionName) -> Result<()> {
        loop {
            match mux.capture_output(name, self.scan_lines).await {
                Ok(lines) if lines.iter().any(|line| line.contains(&self.pattern)) => {
                    tracing::debug!(session = %name, pattern = %self.pattern, "Ready line seen");
                    return Ok(());
                }
                Ok(_) => {}
                Err(Error::SessionNotFound(_)) => {
                    return Err(Error::SpawnFailed(format!(
                        "{} exited before printing '{}'",
                        name, self.pattern
                    )));
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// The probe a launch configuration asks for.
pub fn probe_for(launch: &LaunchConfig) -> Arc<dyn ReadinessProbe> {
    match &launch.ready_pattern {
        Some(pattern) => Arc::new(OutputProbe::new(pattern.clone())),
        None => Arc::new(AliveProbe::default()),
    }
}
