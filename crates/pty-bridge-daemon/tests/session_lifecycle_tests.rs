//! Session manager lifecycle against real child processes.

mod common;

use std::sync::Arc;

use common::wait_until;
use pty_bridge_daemon::{BridgeConfig, CreateSpec, SessionError, SessionManager, SessionRegistry};
use pty_bridge_terminal::ReadEvent;

fn manager() -> Arc<SessionManager> {
    let config = BridgeConfig::default()
        .with_command(["cat"])
        .with_max_sessions(8);
    Arc::new(SessionManager::new(Arc::new(SessionRegistry::new()), &config))
}

#[tokio::test]
async fn exited_child_is_removed_from_registry() {
    let manager = manager();
    let created = manager
        .create(CreateSpec::new(24, 80).command(["sh", "-c", "exit 3"]))
        .await
        .unwrap();

    wait_until("session removal", || {
        let manager = Arc::clone(&manager);
        let id = created.id.clone();
        async move { !manager.registry().contains(&id) }
    })
    .await;

    assert!(matches!(
        manager.resize(&created.id, 30, 100),
        Err(SessionError::NotFound(_))
    ));
}

#[tokio::test]
async fn resize_changes_reported_pty_size() {
    let manager = manager();
    let created = manager.create(CreateSpec::new(24, 80)).await.unwrap();

    manager.resize(&created.id, 50, 132).unwrap();
    let session = manager.get(&created.id).unwrap();
    assert_eq!(session.pty_size().unwrap(), (50, 132));
    assert_eq!(session.size(), (50, 132));

    assert!(matches!(
        manager.resize(&created.id, 0, 132),
        Err(SessionError::InvalidSize { .. })
    ));
    manager.close_all();
}

#[tokio::test]
async fn output_written_before_exit_is_delivered() {
    let manager = manager();
    let created = manager
        .create(CreateSpec::new(24, 80).command(["sh", "-c", "printf last-words"]))
        .await
        .unwrap();
    let session = manager.get(&created.id).unwrap();
    let mut lease = session.lease().unwrap();

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(common::WAIT_TIMEOUT, lease.recv())
            .await
            .unwrap();
        match event {
            Some(ReadEvent::Data(data)) => seen.extend(data),
            Some(ReadEvent::Eof) | None => break,
            Some(ReadEvent::Error(err)) => panic!("read error: {err}"),
        }
    }
    assert!(String::from_utf8_lossy(&seen).contains("last-words"));
}

#[tokio::test]
async fn child_sees_session_environment() {
    let manager = manager();
    let created = manager
        .create(CreateSpec::new(24, 80).command([
            "sh",
            "-c",
            "printf '%s|%s|%s' \"$TERM\" \"$TERM_PROGRAM\" \"$PTY_BRIDGE_SESSION_ID\"",
        ]))
        .await
        .unwrap();
    let session = manager.get(&created.id).unwrap();
    let mut lease = session.lease().unwrap();

    let mut seen = Vec::new();
    while let Ok(Some(ReadEvent::Data(data))) =
        tokio::time::timeout(common::WAIT_TIMEOUT, lease.recv()).await
    {
        seen.extend(data);
    }
    let expected = format!("xterm-256color|pty-bridge|{}", created.id);
    assert!(
        String::from_utf8_lossy(&seen).contains(&expected),
        "{}",
        String::from_utf8_lossy(&seen)
    );
}

#[tokio::test]
async fn close_wakes_attached_stream() {
    let manager = manager();
    let created = manager.create(CreateSpec::new(24, 80)).await.unwrap();
    let session = manager.get(&created.id).unwrap();
    let mut lease = session.lease().unwrap();

    assert!(manager.close(&created.id));
    loop {
        let event = tokio::time::timeout(common::WAIT_TIMEOUT, lease.recv())
            .await
            .unwrap();
        if !matches!(event, Some(ReadEvent::Data(_))) {
            break;
        }
    }
    assert!(session.is_closed());
    assert!(manager.is_empty());
}
