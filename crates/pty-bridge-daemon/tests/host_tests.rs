//! RPC host tests over an in-memory native-messaging pipe.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Peer, native_pipe};
use pty_bridge_daemon::{CallError, RpcHost};
use pty_bridge_ipc::frame::encode_payload;
use pty_bridge_ipc::{
    FrameError, FrameWriter, Message, Notification, Request, Response, RpcError, error_codes,
};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn spawn_host(
    configure: impl FnOnce(pty_bridge_daemon::RpcHostBuilder) -> pty_bridge_daemon::RpcHostBuilder,
) -> (Arc<RpcHost>, Peer, JoinHandle<Result<(), FrameError>>) {
    let (reader, writer, peer) = native_pipe();
    let host = configure(RpcHost::builder(FrameWriter::new(writer))).build();
    let listener = Arc::clone(&host);
    let join = tokio::spawn(async move { listener.listen(reader).await });
    (host, peer, join)
}

// =============================================================================
// Outbound calls
// =============================================================================

#[tokio::test]
async fn concurrent_calls_answered_out_of_order_are_routed_by_id() {
    let (host, mut peer, _join) = spawn_host(|b| b);

    let calls: Vec<_> = (0..8)
        .map(|n| {
            let host = Arc::clone(&host);
            tokio::spawn(async move {
                let response = host
                    .send("list-tabs", Some(json!({ "n": n })))
                    .await
                    .unwrap();
                (n, response.into_result().unwrap())
            })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..8 {
        match peer.recv().await {
            Message::Request(request) => requests.push(request),
            other => panic!("expected request, got {other:?}"),
        }
    }
    for request in requests.into_iter().rev() {
        let n = request.params.as_ref().unwrap()["n"].clone();
        peer.send(Response::success(request.id, json!({ "echo": n })))
            .await;
    }

    for call in calls {
        let (n, result) = call.await.unwrap();
        assert_eq!(result, json!({ "echo": n }));
    }
    assert_eq!(host.pending_calls(), 0);
}

#[tokio::test]
async fn unanswered_call_times_out_and_leaves_nothing_pending() {
    let (host, mut peer, _join) = spawn_host(|b| b.call_timeout(Duration::from_secs(1)));

    let started = std::time::Instant::now();
    let err = host.send("list-tabs", None).await.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(host.pending_calls(), 0);

    // The request still reached the extension.
    assert_eq!(peer.recv().await.method(), Some("list-tabs"));
}

#[tokio::test]
async fn duplicate_pending_id_is_rejected() {
    let (host, _peer, _join) = spawn_host(|b| b.call_timeout(Duration::from_secs(2)));

    let first = {
        let host = Arc::clone(&host);
        tokio::spawn(async move { host.send_request(Request::new("same", "a", None)).await })
    };
    common::wait_until("first call to register", || {
        let host = Arc::clone(&host);
        async move { host.pending_calls() == 1 }
    })
    .await;

    let second = host.send_request(Request::new("same", "b", None)).await;
    assert!(matches!(second, Err(CallError::DuplicateId(id)) if id == "same"));
    assert!(first.await.unwrap().unwrap_err().is_timeout());
}

#[tokio::test]
async fn response_for_unknown_id_is_ignored() {
    let (host, peer, _join) = spawn_host(|b| b.request_fn("ping", |_| async { Ok(json!({"pong": true})) }));
    peer.send(Response::success("nobody-asked", json!(1))).await;
    assert_eq!(
        host.dispatch_local(Request::new("1", "ping", None))
            .await
            .into_result()
            .unwrap(),
        json!({"pong": true})
    );
}

// =============================================================================
// Inbound dispatch
// =============================================================================

#[tokio::test]
async fn unknown_method_gets_method_not_found_and_loop_continues() {
    let (_host, mut peer, join) =
        spawn_host(|b| b.request_fn("ping", |_| async { Ok(json!({"pong": true})) }));

    peer.send(Request::new("1", "nope", None)).await;
    peer.send(Request::new("2", "ping", None)).await;

    let mut responses = Vec::new();
    for _ in 0..2 {
        match peer.recv().await {
            Message::Response(response) => responses.push(response),
            other => panic!("expected response, got {other:?}"),
        }
    }
    responses.sort_by(|a, b| a.id.cmp(&b.id));

    let pong = responses.pop().unwrap().into_result().unwrap();
    let err = responses.pop().unwrap().into_result().unwrap_err();
    assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    assert_eq!(err.message, "Method not found: nope");
    assert_eq!(pong, json!({"pong": true}));
    assert!(!join.is_finished());
}

async fn explode(_params: Option<serde_json::Value>) -> Result<serde_json::Value, RpcError> {
    panic!("handler exploded")
}

#[tokio::test]
async fn panicking_handler_still_answers_the_caller() {
    let (_host, mut peer, join) = spawn_host(|b| {
        b.request_fn("boom", explode)
            .request_fn("ping", |_| async { Ok(json!({"pong": true})) })
    });

    peer.send(Request::new("1", "boom", None)).await;
    let response = match peer.recv().await {
        Message::Response(response) => response,
        other => panic!("expected response, got {other:?}"),
    };
    assert_eq!(response.id, "1");
    let err = response.into_result().unwrap_err();
    assert_eq!(err.code, error_codes::INTERNAL_ERROR);

    peer.send(Request::new("2", "ping", None)).await;
    match peer.recv().await {
        Message::Response(response) => {
            assert_eq!(response.into_result().unwrap(), json!({"pong": true}))
        }
        other => panic!("expected response, got {other:?}"),
    }
    assert!(!join.is_finished());
}

#[tokio::test]
async fn notifications_reach_their_handler() {
    let (tx, mut rx) = mpsc::channel(1);
    let (_host, peer, _join) = spawn_host(move |b| {
        b.notification_fn("resize-session", move |params| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(params).await;
                Ok(())
            }
        })
    });

    peer.send(Notification::new("unhandled", None)).await;
    peer.send(Notification::new("resize-session", Some(json!({"rows": 5}))))
        .await;

    let params = tokio::time::timeout(common::WAIT_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(params, Some(json!({"rows": 5})));
}

// =============================================================================
// Channel shutdown
// =============================================================================

#[tokio::test]
async fn clean_eof_ends_listen_ok() {
    let (host_read, mut browser_write) = tokio::io::duplex(1024);
    let host = RpcHost::builder(FrameWriter::new(tokio::io::sink())).build();

    browser_write
        .write_all(&encode_payload(b"{\"jsonrpc\":\"2.0\",\"method\":\"noop\"}").unwrap())
        .await
        .unwrap();
    browser_write.write_all(&[1, 0]).await.unwrap();
    drop(browser_write);

    assert!(host.listen(host_read).await.is_ok());
}

#[tokio::test]
async fn truncated_payload_is_fatal() {
    let (host_read, mut browser_write) = tokio::io::duplex(1024);
    let host = RpcHost::builder(FrameWriter::new(tokio::io::sink())).build();

    browser_write.write_all(&10u32.to_le_bytes()).await.unwrap();
    browser_write.write_all(b"{\"a\"").await.unwrap();
    drop(browser_write);

    assert!(matches!(
        host.listen(host_read).await,
        Err(FrameError::Truncated { expected: 10, received: 4 })
    ));
}

#[tokio::test]
async fn garbage_frame_does_not_stop_listen() {
    let (host_read, mut browser_write) = tokio::io::duplex(4096);
    let (out_read, out_write) = tokio::io::duplex(4096);
    let host = RpcHost::builder(FrameWriter::new(out_write))
        .request_fn("ping", |_| async { Ok(json!({"pong": true})) })
        .build();
    let listener = Arc::clone(&host);
    let join = tokio::spawn(async move { listener.listen(host_read).await });

    browser_write
        .write_all(&encode_payload(b"{not json").unwrap())
        .await
        .unwrap();
    let ping = pty_bridge_ipc::frame::encode(&Request::new("9", "ping", None).into()).unwrap();
    browser_write.write_all(&ping).await.unwrap();

    let mut reader = pty_bridge_ipc::FrameReader::new(out_read);
    let frame = tokio::time::timeout(common::WAIT_TIMEOUT, reader.next_frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match Message::from_slice(&frame).unwrap() {
        Message::Response(response) => assert_eq!(response.id, "9"),
        other => panic!("expected response, got {other:?}"),
    }

    drop(browser_write);
    assert!(join.await.unwrap().is_ok());
}
