// Shared fixtures for the integration test crates.
#![allow(dead_code)]

use assert_fs::TempDir;
use kherimoya::config::{Config, MultiplexerBackend};
use kherimoya::registry::{FileRegistry, InMemoryRegistry, Registry};
use kherimoya::session::{
    AliveProbe, ProcessMultiplexer, SessionMultiplexer, SessionName, StopSettings,
};
use kherimoya::Kherimoya;
use std::sync::Arc;
use std::time::Duration;

/// Console loop standing in for a game server: prints a ready line, echoes
/// input, and exits on `stop`.
pub const FAKE_SERVER: &str = r#"echo "Server started."; while read line; do case "$line" in stop) echo "Quit correctly"; exit 0;; *) echo "got $line";; esac; done"#;

/// Like `FAKE_SERVER`, but ignores `stop`.
pub const STUBBORN_SERVER: &str = r#"echo "Server started."; while true; do sleep 1; done"#;

/// Exits right away.
pub const FAILING_SERVER: &str = "exit 3";

pub const PREFIX: &str = "test-";

pub fn config_for(root: &TempDir, script: &str) -> Config {
    let mut config = Config::default().resolve(root.path());
    config.session.backend = MultiplexerBackend::Process;
    config.session.prefix = PREFIX.to_string();
    config.launch.command = "sh".to_string();
    config.launch.args = vec!["-c".to_string(), script.to_string()];
    config.timeouts.graceful_stop_secs = 5;
    config.timeouts.spawn_secs = 10;
    config
}

pub fn process_mux() -> Arc<ProcessMultiplexer> {
    Arc::new(ProcessMultiplexer::new(StopSettings {
        stop_command: "stop".to_string(),
        timeout: Duration::from_secs(5),
    }))
}

pub fn fast_probe() -> Arc<AliveProbe> {
    Arc::new(AliveProbe::new(Duration::from_millis(100)))
}

/// A façade over an in-memory registry and the process backend.
pub fn manager(root: &TempDir, script: &str) -> (Kherimoya, Arc<ProcessMultiplexer>) {
    let mux = process_mux();
    let manager = Kherimoya::with_probe(
        config_for(root, script),
        Arc::new(InMemoryRegistry::new()),
        mux.clone(),
        fast_probe(),
    );
    (manager, mux)
}

/// A façade over the configured file registry, sharing `mux` with earlier
/// façades the way tmux sessions outlive a manager process.
pub async fn file_manager(
    config: Config,
    mux: Arc<dyn SessionMultiplexer>,
) -> kherimoya::Result<Kherimoya> {
    let registry: Arc<dyn Registry> = Arc::new(FileRegistry::open(&config.registry_file).await?);
    Ok(Kherimoya::with_probe(config, registry, mux, fast_probe()))
}

pub fn session_of(id: &str) -> SessionName {
    SessionName::new(format!("{}{}", PREFIX, id))
}

/// Kill the process behind a session from outside, like a crash would.
pub async fn kill_out_of_band(mux: &dyn SessionMultiplexer, session: &SessionName) {
    let pid = mux.pid(session).await.expect("session has a pid");
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("kill runs");
    assert!(status.success());
    wait_until_dead(mux, session).await;
}

pub async fn wait_until_dead(mux: &dyn SessionMultiplexer, session: &SessionName) {
    for _ in 0..100 {
        if !mux.is_alive(session).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} still alive", session);
}

pub fn tmux_available() -> bool {
    kherimoya::session::resolve_program("tmux").is_some()
}
