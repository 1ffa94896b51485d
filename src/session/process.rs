// src/session/process.rs
use crate::error::{Error, Result};
use crate::session::signal::{self, GROUP_EXIT_TIMEOUT};
use crate::session::{
    LaunchCommand, Session, SessionMultiplexer, SessionName, StopSettings, check_spawnable,
};
use async_process::{Child, ChildStdin, Command, Stdio};
use async_trait::async_trait;
use futures_lite::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use futures_lite::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const OUTPUT_MAX_LINES: usize = 1000;

/// Ceiling on delivering one console line to a process.
const INPUT_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bounded console history of one session.
#[derive(Debug, Default)]
struct OutputBuffer {
    lines: VecDeque<String>,
}

impl OutputBuffer {
    fn push(&mut self, line: String) {
        if self.lines.len() == OUTPUT_MAX_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self, count: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

type SharedStdin = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

/// A raw child process standing in for a terminal session.
struct ProcessSession {
    child: Child,
    /// Process group led by the child.
    pgid: u32,
    /// Locked per session, never under the table lock.
    stdin: SharedStdin,
    output: Arc<Mutex<OutputBuffer>>,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessSession {
    /// Whether the group leader is still running.
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_status(), Ok(None))
    }

    /// Leader exited and nothing else of its group is left.
    fn is_gone(&mut self) -> bool {
        !self.is_alive() && !signal::group_exists(self.pgid)
    }

    fn abort_readers(&self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// The entry for `name` if its leader is alive.
///
/// Entries whose whole group is gone are dropped on the way.
fn live_session<'a>(
    sessions: &'a mut HashMap<SessionName, ProcessSession>,
    name: &SessionName,
) -> Option<&'a mut ProcessSession> {
    let alive = sessions.get_mut(name).map(ProcessSession::is_alive)?;
    if !alive {
        let leftovers = sessions
            .get(name)
            .is_some_and(|session| signal::group_exists(session.pgid));
        if !leftovers {
            if let Some(session) = sessions.remove(name) {
                session.abort_readers();
            }
        }
        return None;
    }
    sessions.get_mut(name)
}

/// Session backend built on plain child processes.
///
/// Each session is a child started in its own process group with piped stdin
/// and captured stdout/stderr. The handle table lives in this value, so
/// sessions are only reachable while the owning manager process is up; the
/// children themselves are not killed when it goes away.
pub struct ProcessMultiplexer {
    sessions: tokio::sync::Mutex<HashMap<SessionName, ProcessSession>>,
    stop: StopSettings,
}

impl ProcessMultiplexer {
    pub fn new(stop: StopSettings) -> Self {
        Self {
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            stop,
        }
    }

    fn capture<R>(reader: R, output: Arc<Mutex<OutputBuffer>>) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => output
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(line),
                    Err(_) => break,
                }
            }
        })
    }

    /// Poll until the session's whole group is gone, up to `timeout`.
    async fn wait_gone(session: &mut ProcessSession, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if session.is_gone() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    async fn request_stop(&self, name: &SessionName, session: &ProcessSession) {
        // A console stuck in another write is not waited on.
        let stdin = match session.stdin.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut stdin) = stdin else {
            tracing::debug!(session = %name, "Console unavailable, stop command not sent");
            return;
        };

        let line = format!("{}\n", self.stop.stop_command);
        let delivered = tokio::time::timeout(INPUT_TIMEOUT, async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        })
        .await;
        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(session = %name, error = %e, "Could not deliver stop command"),
            Err(_) => tracing::debug!(session = %name, "Stop command not accepted in time"),
        }
        // Dropping stdin gives the child EOF as well.
    }

    async fn terminate(&self, name: &SessionName, mut session: ProcessSession, graceful: bool) -> Result<()> {
        if graceful {
            self.request_stop(name, &session).await;
            if Self::wait_gone(&mut session, self.stop.timeout).await {
                tracing::debug!(session = %name, "Process group exited on request");
                session.abort_readers();
                return Ok(());
            }
            tracing::warn!(session = %name, timeout = ?self.stop.timeout, "Graceful stop timed out, forcing");
        }

        let _ = session.child.kill();
        let killed = signal::kill_group(session.pgid);
        let _ = session.child.status().await;

        let gone = match killed {
            Ok(()) => Self::wait_gone(&mut session, GROUP_EXIT_TIMEOUT).await,
            Err(e) => {
                tracing::warn!(session = %name, error = %e, "Failed to signal process group");
                false
            }
        };
        if !gone {
            let pgid = session.pgid;
            self.sessions.lock().await.insert(name.clone(), session);
            return Err(Error::SpawnFailed(format!(
                "process group {} of {} survived SIGKILL",
                pgid, name
            )));
        }
        session.abort_readers();
        Ok(())
    }
}

impl Default for ProcessMultiplexer {
    fn default() -> Self {
        Self::new(StopSettings::default())
    }
}

#[async_trait]
impl SessionMultiplexer for ProcessMultiplexer {
    #[tracing::instrument(skip(self, command), fields(session = %name, program = %command.program))]
    async fn spawn(
        &self,
        name: &SessionName,
        command: &LaunchCommand,
        working_dir: &Path,
    ) -> Result<Session> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get_mut(name) {
            // Leftovers of an exited leader still count as the session.
            if !existing.is_gone() {
                return Err(Error::SessionAlreadyExists(name.to_string()));
            }
            existing.abort_readers();
            sessions.remove(name);
        }

        let program = check_spawnable(command, working_dir)?;

        let mut std_command = std::process::Command::new(&program);
        std_command
            .args(&command.args)
            .envs(&command.env)
            .current_dir(working_dir);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }

        let mut child = Command::from(std_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("Failed to start process: {}", e)))?;

        let output = Arc::new(Mutex::new(OutputBuffer::default()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(Self::capture(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(Self::capture(stderr, Arc::clone(&output)));
        }

        let pid = child.id();
        let stdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take()));
        sessions.insert(
            name.clone(),
            ProcessSession {
                child,
                pgid: pid,
                stdin,
                output,
                readers,
            },
        );

        tracing::info!(pid, "Process session spawned");
        Ok(Session {
            name: name.clone(),
            pid: Some(pid),
        })
    }

    async fn is_alive(&self, name: &SessionName) -> bool {
        let mut sessions = self.sessions.lock().await;
        live_session(&mut sessions, name).is_some()
    }

    async fn send_input(&self, name: &SessionName, text: &str) -> Result<()> {
        let stdin = {
            let mut sessions = self.sessions.lock().await;
            let session = live_session(&mut sessions, name)
                .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;
            Arc::clone(&session.stdin)
        };

        let line = format!("{}\n", text);
        let delivered = tokio::time::timeout(INPUT_TIMEOUT, async {
            let mut stdin = stdin.lock().await;
            let Some(pipe) = stdin.as_mut() else {
                return Err(Error::SessionNotFound(format!("{} (input closed)", name)));
            };
            pipe.write_all(line.as_bytes())
                .await
                .map_err(|e| Error::SessionNotFound(format!("{}: {}", name, e)))?;
            pipe.flush()
                .await
                .map_err(|e| Error::SessionNotFound(format!("{}: {}", name, e)))
        })
        .await;

        match delivered {
            Ok(result) => result,
            Err(_) => Err(Error::InvalidState(format!(
                "{} did not accept console input within {:?}",
                name, INPUT_TIMEOUT
            ))),
        }
    }

    #[tracing::instrument(skip(self), fields(session = %name))]
    async fn kill(&self, name: &SessionName, graceful: bool) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let mut session = sessions
                .remove(name)
                .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;
            if session.is_gone() {
                session.abort_readers();
                return Err(Error::SessionNotFound(name.to_string()));
            }
            session
        };

        self.terminate(name, session, graceful).await?;
        tracing::info!("Process session terminated");
        Ok(())
    }

    async fn list_live_sessions(&self) -> Result<HashSet<SessionName>> {
        let mut sessions = self.sessions.lock().await;
        let names: Vec<SessionName> = sessions.keys().cloned().collect();
        Ok(names
            .into_iter()
            .filter(|name| live_session(&mut sessions, name).is_some())
            .collect())
    }

    async fn capture_output(&self, name: &SessionName, lines: usize) -> Result<Vec<String>> {
        let mut sessions = self.sessions.lock().await;
        let session = live_session(&mut sessions, name)
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;
        let tail = session
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tail(lines);
        Ok(tail)
    }

    async fn pid(&self, name: &SessionName) -> Option<u32> {
        let mut sessions = self.sessions.lock().await;
        live_session(&mut sessions, name).map(|session| session.child.id())
    }
}
