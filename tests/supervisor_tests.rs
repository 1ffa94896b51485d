mod common;

use assert_fs::TempDir;
use common::{FAILING_SERVER, FAKE_SERVER, STUBBORN_SERVER, kill_out_of_band, manager, session_of};
use kherimoya::session::SessionMultiplexer;
use kherimoya::{CommandError, ErrorKind, ObservedState};
use std::collections::HashSet;
use std::time::Duration;

type TestResult = std::result::Result<(), CommandError>;

#[tokio::test]
async fn test_creates_are_listed_stopped() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, _mux) = manager(&root, FAKE_SERVER);

    let mut ids = HashSet::new();
    for name in ["alpha", "beta", "gamma"] {
        let created = manager.create(name).await?;
        assert_eq!(created.observed_state, ObservedState::Stopped);
        assert!(created.base_path.join("server").is_dir());
        ids.insert(created.id);
    }

    let listed = manager.list().await?;
    assert_eq!(listed.len(), 3);
    assert!(listed.iter().all(|i| i.observed_state == ObservedState::Stopped));
    let listed_ids: HashSet<_> = listed.into_iter().map(|i| i.id).collect();
    assert_eq!(listed_ids, ids);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_name_leaves_registry_unchanged() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, _mux) = manager(&root, FAKE_SERVER);
    manager.create("alpha").await?;

    let err = manager.create("alpha").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DuplicateName);

    let listed = manager.list().await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(std::fs::read_dir(root.path().join("servers")).unwrap().count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_malformed_input_is_rejected() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, _mux) = manager(&root, FAKE_SERVER);

    let err = manager.create("bad-name").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    let err = manager.create("   ").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);

    let err = manager.start("not an id!").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);

    let err = manager.status("zzzz").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.server_id.as_ref().map(|id| id.as_str()), Some("zzzz"));
    assert_eq!(err.observed_state, None);
    Ok(())
}

#[tokio::test]
async fn test_start_twice_is_already_running() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, mux) = manager(&root, FAKE_SERVER);
    let alpha = manager.create("alpha").await?;
    let id = alpha.id.as_str();

    let running = manager.start(id).await?;
    assert_eq!(running.observed_state, ObservedState::Running);

    let err = manager.start(id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyRunning);
    assert_eq!(err.observed_state, Some(ObservedState::Running));
    assert_eq!(mux.list_live_sessions().await.unwrap().len(), 1);

    manager.stop(id).await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_kills_session() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, mux) = manager(&root, FAKE_SERVER);
    let alpha = manager.create("alpha").await?;
    let id = alpha.id.as_str();
    manager.start(id).await?;

    let stopped = manager.stop(id).await?;
    assert_eq!(stopped.observed_state, ObservedState::Stopped);
    assert!(!mux.is_alive(&session_of(id)).await);
    assert_eq!(manager.status(id).await?.observed_state, ObservedState::Stopped);

    let err = manager.stop(id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    Ok(())
}

#[tokio::test]
async fn test_graceful_stop_is_forced_after_timeout() -> TestResult {
    let root = TempDir::new().unwrap();
    let mut config = common::config_for(&root, STUBBORN_SERVER);
    config.timeouts.graceful_stop_secs = 1;
    let mux = std::sync::Arc::new(kherimoya::session::ProcessMultiplexer::new(
        kherimoya::session::StopSettings {
            stop_command: "stop".to_string(),
            timeout: Duration::from_secs(1),
        },
    ));
    let manager = kherimoya::Kherimoya::with_probe(
        config,
        std::sync::Arc::new(kherimoya::registry::InMemoryRegistry::new()),
        mux.clone(),
        common::fast_probe(),
    );

    let alpha = manager.create("alpha").await?;
    let id = alpha.id.as_str();
    manager.start(id).await?;

    let started = std::time::Instant::now();
    manager.stop(id).await?;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(!mux.is_alive(&session_of(id)).await);
    Ok(())
}

#[tokio::test]
async fn test_destroy_requires_stopped() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, _mux) = manager(&root, FAKE_SERVER);
    let alpha = manager.create("alpha").await?;
    let id = alpha.id.as_str();
    manager.start(id).await?;

    let err = manager.destroy(id, true).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert_eq!(err.observed_state, Some(ObservedState::Running));

    manager.stop(id).await?;
    let destroyed = manager.destroy(id, true).await?;
    assert!(!destroyed.base_path.exists());
    assert!(manager.list().await?.is_empty());

    let err = manager.destroy(id, true).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_destroy_without_confirmation_keeps_files() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, _mux) = manager(&root, FAKE_SERVER);
    let alpha = manager.create("alpha").await?;

    let destroyed = manager.destroy(alpha.id.as_str(), false).await?;
    assert!(destroyed.base_path.join("server").is_dir());
    assert!(manager.list().await?.is_empty());

    // The files of a dropped record never collide with a new instance.
    let again = manager.create("alpha").await?;
    assert_ne!(again.id, alpha.id);
    Ok(())
}

#[tokio::test]
async fn test_console_round_trip() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, _mux) = manager(&root, FAKE_SERVER);
    let alpha = manager.create("alpha").await?;
    let id = alpha.id.as_str();

    let err = manager.send_input(id, "list").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionNotFound);

    manager.start(id).await?;
    manager.send_input(id, "list").await?;

    let mut seen = false;
    for _ in 0..50 {
        let lines = manager.console(id, 10).await?;
        if lines.iter().any(|line| line == "got list") {
            assert_eq!(lines.first().map(String::as_str), Some("Server started."));
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(seen, "console never echoed the input");

    manager.stop(id).await?;
    Ok(())
}

#[tokio::test]
async fn test_spawn_failure_marks_crashed() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, mux) = manager(&root, FAILING_SERVER);
    let alpha = manager.create("alpha").await?;
    let id = alpha.id.as_str();

    let err = manager.start(id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SpawnFailed);
    assert_eq!(err.observed_state, Some(ObservedState::Crashed));
    assert!(mux.list_live_sessions().await.unwrap().is_empty());

    // Acknowledging the crash brings the instance back to Stopped.
    let stopped = manager.stop(id).await?;
    assert_eq!(stopped.observed_state, ObservedState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_missing_executable_is_spawn_failed() -> TestResult {
    let root = TempDir::new().unwrap();
    let mut config = common::config_for(&root, FAKE_SERVER);
    config.launch.command = "definitely-not-installed-4711".to_string();
    let manager = kherimoya::Kherimoya::with_probe(
        config,
        std::sync::Arc::new(kherimoya::registry::InMemoryRegistry::new()),
        common::process_mux(),
        common::fast_probe(),
    );
    let alpha = manager.create("alpha").await?;

    let err = manager.start(alpha.id.as_str()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SpawnFailed);
    assert_eq!(err.observed_state, Some(ObservedState::Crashed));
    Ok(())
}

#[tokio::test]
async fn test_ready_pattern_gates_start() -> TestResult {
    let root = TempDir::new().unwrap();
    let mut config = common::config_for(&root, FAKE_SERVER);
    config.launch.ready_pattern = Some("Server started.".to_string());
    let manager = kherimoya::Kherimoya::new(
        config,
        std::sync::Arc::new(kherimoya::registry::InMemoryRegistry::new()),
        common::process_mux(),
    );
    let alpha = manager.create("alpha").await?;
    let id = alpha.id.as_str();

    assert_eq!(manager.start(id).await?.observed_state, ObservedState::Running);
    manager.stop(id).await?;

    let mut config = common::config_for(&root, "sleep 30");
    config.launch.ready_pattern = Some("Server started.".to_string());
    config.timeouts.spawn_secs = 1;
    let mux = common::process_mux();
    let manager = kherimoya::Kherimoya::new(
        config,
        std::sync::Arc::new(kherimoya::registry::InMemoryRegistry::new()),
        mux.clone(),
    );
    let beta = manager.create("beta").await?;

    let err = manager.start(beta.id.as_str()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SpawnTimeout);
    assert_eq!(err.observed_state, Some(ObservedState::Crashed));
    assert!(mux.list_live_sessions().await.unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_crash_then_reconcile_then_restart() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, mux) = manager(&root, FAKE_SERVER);

    let alpha = manager.create("alpha").await?;
    let id = alpha.id.as_str();
    manager.start(id).await?;

    kill_out_of_band(mux.as_ref(), &session_of(id)).await;

    let report = manager.reconcile().await?;
    assert_eq!(report.crashed, vec![alpha.id.clone()]);
    assert_eq!(manager.status(id).await?.observed_state, ObservedState::Crashed);

    let events = manager.events(id, Some(1)).await?;
    assert_eq!(events[0].event, kherimoya::server::ServerLifecycleEvent::Crashed);

    let restarted = manager.start(id).await?;
    assert_eq!(restarted.observed_state, ObservedState::Running);
    manager.stop(id).await?;
    Ok(())
}

#[tokio::test]
async fn test_status_notices_crash_without_reconcile() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, mux) = manager(&root, FAKE_SERVER);
    let alpha = manager.create("alpha").await?;
    let id = alpha.id.as_str();
    manager.start(id).await?;

    kill_out_of_band(mux.as_ref(), &session_of(id)).await;

    assert_eq!(manager.status(id).await?.observed_state, ObservedState::Crashed);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_on_one_instance_serialize() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, mux) = manager(&root, FAKE_SERVER);
    let manager = std::sync::Arc::new(manager);
    let alpha = manager.create("alpha").await?;
    let id = alpha.id.to_string();

    let starts: Vec<_> = (0..4)
        .map(|_| {
            let manager = std::sync::Arc::clone(&manager);
            let id = id.clone();
            tokio::spawn(async move { manager.start(&id).await })
        })
        .collect();

    let mut succeeded = 0;
    for start in starts {
        match start.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) => assert_eq!(e.kind, ErrorKind::AlreadyRunning),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(mux.list_live_sessions().await.unwrap().len(), 1);

    manager.stop(&id).await?;
    Ok(())
}

#[tokio::test]
async fn test_rename_keeps_identity() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, _mux) = manager(&root, FAKE_SERVER);
    let alpha = manager.create("alpha").await?;
    manager.create("beta").await?;

    let renamed = manager.rename(alpha.id.as_str(), "omega").await?;
    assert_eq!(renamed.id, alpha.id);
    assert_eq!(renamed.name, "omega");

    let err = manager.rename(alpha.id.as_str(), "beta").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DuplicateName);

    manager.create("alpha").await?;
    let names: Vec<_> = manager.list().await?.into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["alpha", "beta", "omega"]);
    Ok(())
}

#[tokio::test]
async fn test_all_events_span_every_server() -> TestResult {
    let root = TempDir::new().unwrap();
    let (manager, _mux) = manager(&root, FAKE_SERVER);
    let alpha = manager.create("alpha").await?;
    let beta = manager.create("beta").await?;
    manager.start(alpha.id.as_str()).await?;

    let events = manager.all_events(None).await?;
    let ids: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
    assert_eq!(ids.first(), Some(&alpha.id.as_str()));
    assert!(ids.contains(&beta.id.as_str()));
    assert_eq!(manager.all_events(Some(2)).await?.len(), 2);

    manager.stop(alpha.id.as_str()).await?;
    Ok(())
}
