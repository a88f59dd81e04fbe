#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use pty_bridge_ipc::{FrameReader, FrameWriter, Message};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// The browser's end of a native-messaging pipe.
pub struct Peer {
    pub reader: FrameReader<ReadHalf<DuplexStream>>,
    pub writer: FrameWriter,
}

impl Peer {
    pub async fn send(&self, message: impl Into<Message>) {
        self.writer.write_message(&message.into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        let frame = tokio::time::timeout(WAIT_TIMEOUT, self.reader.next_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("pipe closed");
        Message::from_slice(&frame).unwrap()
    }
}

/// Returns the daemon-side reader and writer plus the peer that talks to them.
pub fn native_pipe() -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>, Peer) {
    let (daemon_side, peer_side) = tokio::io::duplex(1 << 20);
    let (daemon_read, daemon_write) = tokio::io::split(daemon_side);
    let (peer_read, peer_write) = tokio::io::split(peer_side);
    let peer = Peer {
        reader: FrameReader::new(peer_read),
        writer: FrameWriter::new(peer_write),
    };
    (daemon_read, daemon_write, peer)
}

/// Polls `check` until it holds or the wait times out.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
