mod common;

use assert_fs::TempDir;
use common::{FAKE_SERVER, STUBBORN_SERVER, tmux_available, wait_until_dead};
use kherimoya::error::{Error, Result};
use kherimoya::session::{
    LaunchCommand, ProcessMultiplexer, SessionMultiplexer, SessionName, StopSettings,
    TmuxMultiplexer,
};
use std::time::Duration;

fn script(body: &str) -> LaunchCommand {
    LaunchCommand::new("sh").args(["-c", body])
}

fn quick_stop() -> StopSettings {
    StopSettings {
        stop_command: "stop".to_string(),
        timeout: Duration::from_secs(1),
    }
}

async fn output_containing(
    mux: &dyn SessionMultiplexer,
    name: &SessionName,
    needle: &str,
) -> Result<Vec<String>> {
    for _ in 0..50 {
        let lines = mux.capture_output(name, 50).await?;
        if lines.iter().any(|line| line.contains(needle)) {
            return Ok(lines);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    mux.capture_output(name, 50).await
}

#[tokio::test]
async fn test_process_session_lifecycle() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mux = ProcessMultiplexer::new(quick_stop());
    let name = SessionName::new("kh-lifecycle");

    let session = mux.spawn(&name, &script(FAKE_SERVER), dir.path()).await?;
    assert_eq!(session.name, name);
    assert!(session.pid.is_some());
    assert!(mux.is_alive(&name).await);
    assert!(mux.list_live_sessions().await?.contains(&name));
    assert_eq!(mux.pid(&name).await, session.pid);

    let err = mux.spawn(&name, &script(FAKE_SERVER), dir.path()).await.unwrap_err();
    assert!(matches!(err, Error::SessionAlreadyExists(_)));

    mux.send_input(&name, "list").await?;
    let lines = output_containing(&mux, &name, "got list").await?;
    assert!(lines.iter().any(|line| line == "Server started."));
    assert!(lines.iter().any(|line| line == "got list"));

    mux.kill(&name, true).await?;
    assert!(!mux.is_alive(&name).await);
    assert!(mux.list_live_sessions().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_process_missing_session_errors() {
    let mux = ProcessMultiplexer::default();
    let name = SessionName::new("kh-missing");

    assert!(!mux.is_alive(&name).await);
    assert_eq!(mux.pid(&name).await, None);
    assert!(matches!(
        mux.send_input(&name, "stop").await,
        Err(Error::SessionNotFound(_))
    ));
    assert!(matches!(
        mux.kill(&name, true).await,
        Err(Error::SessionNotFound(_))
    ));
    assert!(matches!(
        mux.capture_output(&name, 10).await,
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_process_spawn_preconditions() {
    let dir = TempDir::new().unwrap();
    let mux = ProcessMultiplexer::default();
    let name = SessionName::new("kh-precondition");

    let err = mux
        .spawn(&name, &script(FAKE_SERVER), &dir.path().join("absent"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpawnFailed(_)));

    let err = mux
        .spawn(&name, &LaunchCommand::new("kherimoya-no-such-binary"), dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpawnFailed(_)));
    assert!(!mux.is_alive(&name).await);
}

#[tokio::test]
async fn test_process_forced_after_graceful_timeout() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mux = ProcessMultiplexer::new(quick_stop());
    let name = SessionName::new("kh-stubborn");

    mux.spawn(&name, &script(STUBBORN_SERVER), dir.path()).await?;
    mux.kill(&name, true).await?;
    assert!(!mux.is_alive(&name).await);
    Ok(())
}

#[tokio::test]
async fn test_process_dead_session_can_be_respawned() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mux = ProcessMultiplexer::new(quick_stop());
    let name = SessionName::new("kh-respawn");

    mux.spawn(&name, &script("exit 0"), dir.path()).await?;
    wait_until_dead(&mux, &name).await;

    mux.spawn(&name, &script(FAKE_SERVER), dir.path()).await?;
    assert!(mux.is_alive(&name).await);
    mux.kill(&name, false).await?;
    Ok(())
}

/// Pid a script wrote into `file`, once it is there.
async fn pid_from(file: &std::path::Path) -> u32 {
    for _ in 0..50 {
        if let Some(pid) = std::fs::read_to_string(file)
            .ok()
            .and_then(|text| text.trim().parse().ok())
        {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{} never written", file.display());
}

/// Whether `pid` exists and is not a zombie.
#[cfg(target_os = "linux")]
fn process_running(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| stat.get(stat.rfind(')')? + 1..)?.trim_start().chars().next())
        .is_some_and(|state| state != 'Z')
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_process_kill_takes_the_whole_group() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mux = ProcessMultiplexer::new(quick_stop());
    let name = SessionName::new("kh-group");

    mux.spawn(
        &name,
        &script("sleep 300 & echo $! > child.pid; while true; do sleep 1; done"),
        dir.path(),
    )
    .await?;
    let child = pid_from(&dir.path().join("child.pid")).await;
    assert!(process_running(child));

    mux.kill(&name, true).await?;
    assert!(!mux.is_alive(&name).await);
    assert!(!process_running(child), "background child {} survived", child);
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_process_session_lives_while_its_group_does() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mux = ProcessMultiplexer::new(quick_stop());
    let name = SessionName::new("kh-launcher");

    // A launcher that hands off to a background server and exits.
    mux.spawn(&name, &script("sleep 300 & echo $! > child.pid; exit 0"), dir.path())
        .await?;
    let child = pid_from(&dir.path().join("child.pid")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(mux.is_alive(&name).await);
    assert!(mux.list_live_sessions().await?.contains(&name));
    assert!(matches!(
        mux.spawn(&name, &script(FAKE_SERVER), dir.path()).await,
        Err(Error::SessionAlreadyExists(_))
    ));

    mux.kill(&name, false).await?;
    assert!(!process_running(child));
    assert!(!mux.is_alive(&name).await);
    Ok(())
}

#[tokio::test]
async fn test_tmux_session_lifecycle() -> Result<()> {
    if !tmux_available() {
        eprintln!("tmux not installed, skipping");
        return Ok(());
    }
    let socket = format!("kherimoya-test-{}", std::process::id());
    let dir = TempDir::new().unwrap();
    let mux = TmuxMultiplexer::new(Some(socket.clone()), quick_stop());
    let name = SessionName::new("kh-tmux");

    assert!(mux.list_live_sessions().await?.is_empty());

    mux.spawn(&name, &script(FAKE_SERVER), dir.path()).await?;
    assert!(mux.is_alive(&name).await);
    assert!(mux.pid(&name).await.is_some());
    assert!(matches!(
        mux.spawn(&name, &script(FAKE_SERVER), dir.path()).await,
        Err(Error::SessionAlreadyExists(_))
    ));

    mux.send_input(&name, "list").await?;
    let lines = output_containing(&mux, &name, "got list").await?;
    assert!(lines.iter().any(|line| line.contains("got list")));

    mux.kill(&name, true).await?;
    assert!(!mux.is_alive(&name).await);

    let _ = std::process::Command::new("tmux")
        .args(["-L", &socket, "kill-server"])
        .status();
    Ok(())
}
