//! Pumps bytes between one WebSocket and one leased PTY session.
//!
//! Three loops run side by side: socket to PTY, PTY to socket, and a keepalive
//! that pings the client and gives up on it once pongs stop arriving. Whichever
//! loop finishes first stops the other two.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pty_bridge_common::mutex_lock_or_recover;
use pty_bridge_terminal::ReadEvent;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, warn};

use crate::config::{BridgeConfig, DEFAULT_KEEPALIVE_TIMEOUT_SECS};
use crate::registry::{PtyLease, Session};

const KEEPALIVE_PAYLOAD: &[u8] = b"keepalive";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type SharedSink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Longest silence tolerated from the client before the stream is dropped.
    pub keepalive_timeout: Duration,
    /// Consecutive failed sends tolerated before giving up.
    pub error_limit: usize,
    pub send_timeout: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        let keepalive_timeout = if config.keepalive_timeout.is_zero() {
            Duration::from_secs(DEFAULT_KEEPALIVE_TIMEOUT_SECS)
        } else {
            config.keepalive_timeout
        };
        Self {
            keepalive_timeout,
            error_limit: config.error_limit,
            send_timeout: keepalive_timeout / 2,
        }
    }
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    ClientClosed,
    PtyClosed,
    SendErrors,
    KeepaliveExpired,
    Stopped,
    TaskFailed,
}

/// Drives `socket` against the session behind `lease` until either side goes away.
///
/// The lease is dropped before this returns, so the session's output is free for
/// the next stream.
pub async fn run_bridge(socket: WebSocket, lease: PtyLease, settings: StreamSettings) -> StreamEnd {
    let session = Arc::clone(lease.session());
    let span = tracing::info_span!("stream", session_id = %session.id());
    bridge(socket, lease, session, settings).instrument(span).await
}

async fn bridge(
    socket: WebSocket,
    lease: PtyLease,
    session: Arc<Session>,
    settings: StreamSettings,
) -> StreamEnd {
    let (sink, stream) = socket.split();
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
    let (stop_tx, stop_rx) = watch::channel(false);
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    info!("Stream attached");
    let mut tasks = JoinSet::new();
    tasks.spawn(
        inbound(
            stream,
            Arc::clone(&session),
            Arc::clone(&last_pong),
            stop_rx.clone(),
        )
        .in_current_span(),
    );
    tasks.spawn(outbound(lease, Arc::clone(&sink), settings, stop_rx.clone()).in_current_span());
    tasks.spawn(keepalive(Arc::clone(&sink), last_pong, settings, stop_rx).in_current_span());

    let end = match tasks.join_next().await {
        Some(Ok(end)) => end,
        Some(Err(err)) => {
            warn!(error = %err, "Stream task failed");
            StreamEnd::TaskFailed
        }
        None => StreamEnd::Stopped,
    };
    stop_tx.send_replace(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "Stream task failed during shutdown");
        }
    }

    let mut sink = sink.lock().await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    info!(reason = ?end, "Stream detached");
    end
}

async fn inbound(
    mut stream: SplitStream<WebSocket>,
    session: Arc<Session>,
    last_pong: Arc<Mutex<Instant>>,
    mut stop: watch::Receiver<bool>,
) -> StreamEnd {
    loop {
        let frame = tokio::select! {
            _ = stopped(&mut stop) => return StreamEnd::Stopped,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Binary(data))) => write_input(&session, &data).await,
            Some(Ok(Message::Text(text))) => write_input(&session, text.as_str().as_bytes()).await,
            Some(Ok(Message::Pong(_))) => *mutex_lock_or_recover(&last_pong) = Instant::now(),
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(_))) | None => return StreamEnd::ClientClosed,
            Some(Err(err)) => {
                debug!(error = %err, "WebSocket read failed");
                return StreamEnd::ClientClosed;
            }
        }
    }
}

async fn write_input(session: &Session, data: &[u8]) {
    let data = trim_nul(data);
    if data.is_empty() {
        return;
    }
    if let Err(err) = session.write(data.to_vec()).await {
        warn!(error = %err, bytes = data.len(), "PTY write failed");
    }
}

async fn outbound(
    mut lease: PtyLease,
    sink: SharedSink,
    settings: StreamSettings,
    mut stop: watch::Receiver<bool>,
) -> StreamEnd {
    let mut failures = 0usize;
    loop {
        let event = tokio::select! {
            _ = stopped(&mut stop) => return StreamEnd::Stopped,
            event = lease.recv() => event,
        };
        let data = match event {
            Some(ReadEvent::Data(data)) => data,
            Some(ReadEvent::Eof) | None => return StreamEnd::PtyClosed,
            Some(ReadEvent::Error(err)) => {
                warn!(error = %err, "PTY read failed");
                return StreamEnd::PtyClosed;
            }
        };

        let sent = {
            let mut sink = sink.lock().await;
            tokio::time::timeout(
                settings.send_timeout,
                sink.send(Message::Binary(Bytes::from(data))),
            )
            .await
        };
        match sent {
            Ok(Ok(())) => failures = 0,
            Ok(Err(err)) => {
                failures += 1;
                debug!(error = %err, failures, "WebSocket send failed");
            }
            Err(_) => {
                failures += 1;
                debug!(failures, "WebSocket send timed out");
            }
        }
        if failures > settings.error_limit {
            warn!(failures, "Too many consecutive send failures");
            return StreamEnd::SendErrors;
        }
    }
}

async fn keepalive(
    sink: SharedSink,
    last_pong: Arc<Mutex<Instant>>,
    settings: StreamSettings,
    mut stop: watch::Receiver<bool>,
) -> StreamEnd {
    let interval = settings.keepalive_timeout / 2;
    loop {
        let pinged = {
            let mut sink = sink.lock().await;
            tokio::time::timeout(
                interval,
                sink.send(Message::Ping(Bytes::from_static(KEEPALIVE_PAYLOAD))),
            )
            .await
        };
        if !matches!(pinged, Ok(Ok(()))) {
            debug!("Keepalive ping not sent");
        }

        tokio::select! {
            _ = stopped(&mut stop) => return StreamEnd::Stopped,
            _ = tokio::time::sleep(interval) => {}
        }

        let silent_for = mutex_lock_or_recover(&last_pong).elapsed();
        if silent_for > settings.keepalive_timeout {
            warn!(
                silent_ms = silent_for.as_millis(),
                "Client stopped answering pings, closing stream"
            );
            return StreamEnd::KeepaliveExpired;
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Strips NUL padding from both ends of an inbound frame.
fn trim_nul(data: &[u8]) -> &[u8] {
    let Some(start) = data.iter().position(|b| *b != 0) else {
        return &[];
    };
    let end = data.iter().rposition(|b| *b != 0).map_or(start, |end| end + 1);
    &data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_nul() {
        assert_eq!(trim_nul(b"\0\0ls\n\0"), b"ls\n");
        assert_eq!(trim_nul(b"a\0b"), b"a\0b");
        assert_eq!(trim_nul(b"\0\0\0"), b"");
        assert_eq!(trim_nul(b""), b"");
        assert_eq!(trim_nul(b"plain"), b"plain");
    }

    #[test]
    fn test_settings_from_config() {
        let config = BridgeConfig::default()
            .with_keepalive_timeout(Duration::from_secs(20))
            .with_error_limit(3);
        let settings = StreamSettings::from_config(&config);
        assert_eq!(settings.keepalive_timeout, Duration::from_secs(20));
        assert_eq!(settings.send_timeout, Duration::from_secs(10));
        assert_eq!(settings.error_limit, 3);
    }

    #[test]
    fn test_zero_keepalive_uses_default() {
        let config = BridgeConfig::default().with_keepalive_timeout(Duration::ZERO);
        let settings = StreamSettings::from_config(&config);
        assert_eq!(
            settings.keepalive_timeout,
            Duration::from_secs(DEFAULT_KEEPALIVE_TIMEOUT_SECS)
        );
        assert_eq!(settings.send_timeout, settings.keepalive_timeout / 2);
    }
}
