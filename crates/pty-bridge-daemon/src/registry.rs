//! Live sessions and the lease that lends a session's output to one stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use pty_bridge_common::mutex_lock_or_recover;
use pty_bridge_terminal::{PtyError, PtyHandle, ReadEvent};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

pub struct Session {
    id: String,
    pty: PtyHandle,
    command: String,
    profile: Option<String>,
    created_at: DateTime<Utc>,
    size: Mutex<(u16, u16)>,
    output: Mutex<Option<mpsc::Receiver<ReadEvent>>>,
    closed: watch::Sender<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub profile: Option<String>,
    pub rows: u16,
    pub cols: u16,
    pub created_at: DateTime<Utc>,
    pub attached: bool,
}

impl Session {
    pub fn new(
        id: String,
        pty: PtyHandle,
        output: mpsc::Receiver<ReadEvent>,
        command: String,
        profile: Option<String>,
        rows: u16,
        cols: u16,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            pty,
            command,
            profile,
            created_at: Utc::now(),
            size: Mutex::new((rows, cols)),
            output: Mutex::new(Some(output)),
            closed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last size applied through [`Session::resize`], `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        *mutex_lock_or_recover(&self.size)
    }

    pub fn pty_size(&self) -> Result<(u16, u16), PtyError> {
        self.pty.size()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let mut size = mutex_lock_or_recover(&self.size);
        self.pty.resize(rows, cols)?;
        *size = (rows, cols);
        Ok(())
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<(), PtyError> {
        self.pty.write(data).await
    }

    /// Takes the output stream for one connection. `None` while another lease is live.
    pub fn lease(self: &Arc<Self>) -> Option<PtyLease> {
        let output = mutex_lock_or_recover(&self.output).take()?;
        debug!(session_id = %self.id, "PTY output leased");
        Some(PtyLease {
            session: Arc::clone(self),
            output: Some(output),
        })
    }

    pub fn is_attached(&self) -> bool {
        mutex_lock_or_recover(&self.output).is_none()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session has been torn down.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Kills the child and wakes anything waiting on [`Session::closed`]. Idempotent.
    pub fn shutdown(&self) {
        self.closed.send_replace(true);
        if let Err(err) = self.pty.kill() {
            debug!(session_id = %self.id, error = %err, "Kill after shutdown failed");
        }
    }

    pub fn info(&self) -> SessionInfo {
        let (rows, cols) = self.size();
        SessionInfo {
            id: self.id.clone(),
            pid: self.pid(),
            command: self.command.clone(),
            profile: self.profile.clone(),
            rows,
            cols,
            created_at: self.created_at,
            attached: self.is_attached(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// Exclusive borrow of a session's output. Dropping it hands the stream back.
pub struct PtyLease {
    session: Arc<Session>,
    output: Option<mpsc::Receiver<ReadEvent>>,
}

impl PtyLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Next output event; `None` once the session's pump has stopped.
    pub async fn recv(&mut self) -> Option<ReadEvent> {
        match self.output.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for PtyLease {
    fn drop(&mut self) {
        if let Some(output) = self.output.take() {
            *mutex_lock_or_recover(&self.session.output) = Some(output);
            debug!(session_id = %self.session.id, "PTY output lease released");
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, session: Arc<Session>) {
        mutex_lock_or_recover(&self.sessions).insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        mutex_lock_or_recover(&self.sessions).get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        mutex_lock_or_recover(&self.sessions).remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        mutex_lock_or_recover(&self.sessions).contains_key(id)
    }

    pub fn len(&self) -> usize {
        mutex_lock_or_recover(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        mutex_lock_or_recover(&self.sessions)
            .values()
            .cloned()
            .collect()
    }

    pub fn drain(&self) -> Vec<Arc<Session>> {
        mutex_lock_or_recover(&self.sessions)
            .drain()
            .map(|(_, session)| session)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pty_bridge_terminal::SpawnSpec;

    fn cat_session(id: &str) -> Arc<Session> {
        let spawned = PtyHandle::spawn(SpawnSpec::new("cat")).unwrap();
        Arc::new(Session::new(
            id.to_string(),
            spawned.handle,
            spawned.output,
            "cat".to_string(),
            Some("default".to_string()),
            24,
            80,
        ))
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let registry = SessionRegistry::new();
        registry.put(cat_session("a"));
        registry.put(cat_session("b"));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(!registry.contains("a"));
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_and_returned_on_drop() {
        let session = cat_session("a");
        let lease = session.lease().unwrap();
        assert!(session.is_attached());
        assert!(session.lease().is_none());
        drop(lease);
        assert!(!session.is_attached());
        assert!(session.lease().is_some());
    }

    #[tokio::test]
    async fn test_lease_reads_output() {
        let session = cat_session("a");
        let mut lease = session.lease().unwrap();
        session.write(b"lease-echo\n".to_vec()).await.unwrap();

        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !String::from_utf8_lossy(&seen).contains("lease-echo") {
            let event = tokio::time::timeout_at(deadline, lease.recv())
                .await
                .unwrap();
            match event {
                Some(ReadEvent::Data(data)) => seen.extend(data),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_resize_updates_recorded_and_pty_size() {
        let session = cat_session("a");
        session.resize(50, 132).unwrap();
        assert_eq!(session.size(), (50, 132));
        assert_eq!(session.pty_size().unwrap(), (50, 132));
        let info = session.info();
        assert_eq!((info.rows, info.cols), (50, 132));
        assert_eq!(info.profile.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_shutdown_signals_closed() {
        let session = cat_session("a");
        let mut closed = session.closed();
        session.shutdown();
        session.shutdown();
        assert!(session.is_closed());
        assert!(*closed.borrow_and_update());
    }
}
