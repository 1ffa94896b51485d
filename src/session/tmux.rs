use crate::error::{Error, Result};
use crate::session::signal;
use crate::session::{
    LaunchCommand, Session, SessionMultiplexer, SessionName, StopSettings, check_spawnable,
};
use async_process::{Command, Output, Stdio};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Session backend driving a tmux server.
///
/// Sessions are created detached, so the hosted process keeps running when
/// the management process exits and can be found again by name.
#[derive(Debug, Clone)]
pub struct TmuxMultiplexer {
    socket: Option<String>,
    stop: StopSettings,
}

impl TmuxMultiplexer {
    /// `socket` selects a dedicated tmux server (`tmux -L`).
    pub fn new(socket: Option<String>, stop: StopSettings) -> Self {
        Self { socket, stop }
    }

    fn command(&self) -> Command {
        let mut command = Command::new("tmux");
        if let Some(socket) = &self.socket {
            command.arg("-L").arg(socket);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        self.command()
            .args(args)
            .output()
            .await
            .map_err(|e| Error::SpawnFailed(format!("Failed to run tmux: {}", e)))
    }

    /// Exact-match target for a session.
    fn target(name: &SessionName) -> String {
        format!("={}", name)
    }

    /// Exact-match target for the active pane of a session.
    fn pane_target(name: &SessionName) -> String {
        format!("={}:", name)
    }

    /// Wait until the session and, when known, its process group are gone.
    async fn wait_until_gone(&self, name: &SessionName, pgid: Option<u32>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive(name).await && !pgid.is_some_and(signal::group_exists) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_no_server(stderr: &str) -> bool {
    stderr.contains("no server running") || stderr.contains("error connecting")
}

#[async_trait]
impl SessionMultiplexer for TmuxMultiplexer {
    #[tracing::instrument(skip(self, command), fields(session = %name, program = %command.program))]
    async fn spawn(
        &self,
        name: &SessionName,
        command: &LaunchCommand,
        working_dir: &Path,
    ) -> Result<Session> {
        if self.is_alive(name).await {
            return Err(Error::SessionAlreadyExists(name.to_string()));
        }
        let program = check_spawnable(command, working_dir)?;

        let mut tmux = self.command();
        tmux.args(["new-session", "-d", "-s", name.as_str(), "-c"])
            .arg(working_dir);
        let mut env: Vec<_> = command.env.iter().collect();
        env.sort();
        for (key, value) in env {
            tmux.arg("-e").arg(format!("{}={}", key, value));
        }
        tmux.arg("--").arg(&program).args(&command.args);

        let output = tmux
            .output()
            .await
            .map_err(|e| Error::SpawnFailed(format!("Failed to run tmux: {}", e)))?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if stderr.contains("duplicate session") {
                return Err(Error::SessionAlreadyExists(name.to_string()));
            }
            return Err(Error::SpawnFailed(format!(
                "tmux new-session failed: {}",
                stderr
            )));
        }

        let pid = self.pid(name).await;
        tracing::info!(?pid, "Tmux session spawned");
        Ok(Session {
            name: name.clone(),
            pid,
        })
    }

    async fn is_alive(&self, name: &SessionName) -> bool {
        match self.run(&["has-session", "-t", &Self::target(name)]).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                tracing::debug!(session = %name, error = %e, "Liveness query failed");
                false
            }
        }
    }

    async fn send_input(&self, name: &SessionName, text: &str) -> Result<()> {
        if !self.is_alive(name).await {
            return Err(Error::SessionNotFound(name.to_string()));
        }
        let target = Self::pane_target(name);

        // Literal text first, then Enter as a key, so the line is never
        // interpreted as tmux key names.
        let output = self
            .run(&["send-keys", "-t", &target, "-l", "--", text])
            .await?;
        if !output.status.success() {
            return Err(Error::SessionNotFound(format!(
                "{}: {}",
                name,
                stderr_of(&output)
            )));
        }
        let output = self.run(&["send-keys", "-t", &target, "Enter"]).await?;
        if !output.status.success() {
            return Err(Error::SessionNotFound(format!(
                "{}: {}",
                name,
                stderr_of(&output)
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(session = %name))]
    async fn kill(&self, name: &SessionName, graceful: bool) -> Result<()> {
        if !self.is_alive(name).await {
            return Err(Error::SessionNotFound(name.to_string()));
        }
        // The pane process leads its own process group.
        let pgid = self.pid(name).await;

        if graceful {
            match self.send_input(name, &self.stop.stop_command).await {
                Ok(()) => {
                    if self.wait_until_gone(name, pgid, self.stop.timeout).await {
                        tracing::info!("Session ended on request");
                        return Ok(());
                    }
                    tracing::warn!(timeout = ?self.stop.timeout, "Graceful stop timed out, forcing");
                }
                // Ended on its own; leftovers of its group are handled below.
                Err(Error::SessionNotFound(_)) => {}
                Err(e) => tracing::warn!(error = %e, "Could not deliver stop command"),
            }
        }

        let output = self
            .run(&["kill-session", "-t", &Self::target(name)])
            .await?;
        if !output.status.success() && self.is_alive(name).await {
            return Err(Error::SpawnFailed(format!(
                "tmux kill-session failed: {}",
                stderr_of(&output)
            )));
        }

        // kill-session only hangs up on the pane; children may ignore that.
        if let Some(pgid) = pgid {
            signal::kill_group_and_wait(pgid).await?;
        }
        tracing::info!("Session killed");
        Ok(())
    }

    async fn list_live_sessions(&self) -> Result<HashSet<SessionName>> {
        let output = self
            .run(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_no_server(&stderr) {
                return Ok(HashSet::new());
            }
            return Err(Error::SpawnFailed(format!(
                "tmux list-sessions failed: {}",
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(SessionName::new)
            .collect())
    }

    async fn capture_output(&self, name: &SessionName, lines: usize) -> Result<Vec<String>> {
        if !self.is_alive(name).await {
            return Err(Error::SessionNotFound(name.to_string()));
        }
        let start = format!("-{}", lines);
        let output = self
            .run(&["capture-pane", "-p", "-t", &Self::pane_target(name), "-S", &start])
            .await?;
        if !output.status.success() {
            return Err(Error::SessionNotFound(format!(
                "{}: {}",
                name,
                stderr_of(&output)
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut captured: Vec<String> = text.lines().map(str::to_string).collect();
        // The pane is padded with blank rows below the cursor.
        while captured.last().is_some_and(|line| line.trim().is_empty()) {
            captured.pop();
        }
        let skip = captured.len().saturating_sub(lines);
        Ok(captured.split_off(skip))
    }

    async fn pid(&self, name: &SessionName) -> Option<u32> {
        let output = self
            .run(&[
                "display-message",
                "-p",
                "-t",
                &Self::pane_target(name),
                "#{pane_pid}",
            ])
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_match_exactly() {
        let name = SessionName::new("kherimoya-abcd");
        assert_eq!(TmuxMultiplexer::target(&name), "=kherimoya-abcd");
        assert_eq!(TmuxMultiplexer::pane_target(&name), "=kherimoya-abcd:");
    }

    #[test]
    fn test_no_server_is_recognized() {
        assert!(is_no_server("no server running on /tmp/tmux-0/default"));
        assert!(is_no_server("error connecting to /tmp/tmux-0/x (No such file or directory)"));
        assert!(!is_no_server("unknown option -- q"));
    }
}
