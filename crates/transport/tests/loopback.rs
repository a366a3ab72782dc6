//! End-to-end tests over pipe pairs standing in for the process streams.
//!
//! Two transports are cross-wired through two pipes so one side can act as
//! the peer; some tests instead hold a raw pipe end and speak the framing
//! by hand.

#![cfg(unix)]

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::json;

use mcp_stdio_transport::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, INTERNAL_ERROR,
};
use mcp_stdio_transport::{encode, StdioTransport};

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe(2) failed");
    (fds[0], fds[1])
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn write_all(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        assert!(n > 0, "raw write failed");
        bytes = &bytes[n as usize..];
    }
}

/// Two transports wired head-to-tail: what `a` sends, `b` receives, and
/// vice versa.
fn linked_pair() -> (StdioTransport, StdioTransport) {
    let (a_read, a_write) = pipe_pair();
    let (b_read, b_write) = pipe_pair();
    let a = StdioTransport::over_fds(a_read, b_write);
    let b = StdioTransport::over_fds(b_read, a_write);
    (a, b)
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn echo_round_trip() -> Result<()> {
    let (host, peer) = linked_pair();
    peer.set_request_handler(|req| {
        let id = req.id.clone().context("request without id")?;
        Ok(JsonRpcResponse::success(id, json!("pong")))
    });
    host.start()?;
    peer.start()?;

    let future = host.send_request(JsonRpcRequest::new("ping", Some(json!({}))));
    let id = future.request_id().clone();
    let response = tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .context("echo response")?;
    assert_eq!(response.id, id);
    assert_eq!(response.result, Some(json!("pong")));
    assert!(!response.is_error());

    host.close();
    peer.close();
    Ok(())
}

#[tokio::test]
async fn caller_supplied_id_is_preserved() -> Result<()> {
    let (host, peer) = linked_pair();
    peer.set_request_handler(|req| {
        let id = req.id.clone().context("request without id")?;
        Ok(JsonRpcResponse::success(id, json!(null)))
    });
    host.start()?;
    peer.start()?;

    let future = host.send_request(JsonRpcRequest::new("ping", None).with_id(77i64));
    assert_eq!(future.request_id(), &RequestId::Number(77));
    let response = tokio::time::timeout(Duration::from_secs(2), future).await?;
    assert_eq!(response.id, RequestId::Number(77));

    host.close();
    peer.close();
    Ok(())
}

#[tokio::test]
async fn request_times_out_when_peer_stays_silent() -> Result<()> {
    let (host, peer) = linked_pair();
    host.apply_config("timeout_ms=50");
    host.start()?;
    peer.start()?; // no request handler: incoming requests are dropped

    let started = Instant::now();
    let response = tokio::time::timeout(
        Duration::from_secs(2),
        host.send_request(JsonRpcRequest::new("ping", None)),
    )
    .await
    .context("timeout response")?;
    let error = response.error.context("expected error response")?;
    assert_eq!(error.code, INTERNAL_ERROR);
    assert_eq!(error.message, "Request timeout");
    assert!(started.elapsed() >= Duration::from_millis(50));

    host.close();
    peer.close();
    Ok(())
}

#[tokio::test]
async fn handler_failure_becomes_internal_error_response() -> Result<()> {
    let (host, peer) = linked_pair();
    peer.set_request_handler(|_req| anyhow::bail!("backend exploded"));
    host.start()?;
    peer.start()?;

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        host.send_request(JsonRpcRequest::new("boom", None).with_id("r-1")),
    )
    .await?;
    assert_eq!(response.id, RequestId::String("r-1".into()));
    let error = response.error.context("expected error response")?;
    assert_eq!(error.code, INTERNAL_ERROR);
    assert_eq!(error.message, "backend exploded");

    host.close();
    peer.close();
    Ok(())
}

#[tokio::test]
async fn overflow_disconnects_and_fails_pending() -> Result<()> {
    let (host, peer) = linked_pair();
    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    {
        let errors = errors.clone();
        host.set_error_handler(move |message| {
            errors.lock().expect("errors lock").push(message.to_string());
        });
    }
    host.set_write_queue_max_bytes(1024);
    host.start()?;
    // The peer is never started: nothing consumes, but the OS pipe buffer
    // would hide small frames anyway, so overflow with one frame over cap.
    let pending = host.send_request(JsonRpcRequest::new("slow", None));
    host.send_notification(JsonRpcNotification::new(
        "burst",
        Some(json!("x".repeat(2000))),
    ));

    assert!(!host.is_connected());
    let seen = errors.lock().expect("errors lock").clone();
    assert!(
        seen.iter().any(|m| m.contains("write queue overflow")),
        "expected overflow report, got {seen:?}"
    );
    let response = tokio::time::timeout(Duration::from_secs(2), pending).await?;
    assert_eq!(
        response.error.context("expected error")?.message,
        "Transport closed"
    );

    host.close();
    drop(peer);
    Ok(())
}

#[tokio::test]
async fn partial_frame_reassembles_across_writes() -> Result<()> {
    let (in_read, in_write) = pipe_pair();
    let (_out_read, out_write) = pipe_pair();
    let host = StdioTransport::over_fds(in_read, out_write);

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    {
        let seen = seen.clone();
        host.set_notification_handler(move |note| {
            seen.lock().expect("seen lock").push(note.method);
        });
    }
    host.start()?;

    let body = br#"{"jsonrpc":"2.0","method":"hello"}"#;
    let frame = encode(body);
    let split = frame.len() - 12; // cut inside the body
    write_all(in_write, &frame[..split]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    write_all(in_write, &frame[split..]);

    wait_for("reassembled notification", || {
        !seen.lock().expect("seen lock").is_empty()
    })
    .await;
    assert_eq!(seen.lock().expect("seen lock").as_slice(), ["hello"]);

    host.close();
    close_fd(in_write);
    Ok(())
}

#[tokio::test]
async fn close_under_load_is_bounded() -> Result<()> {
    let (host, peer) = linked_pair();
    host.start()?;

    for n in 0..100 {
        host.send_notification(JsonRpcNotification::new("tick", Some(json!(n))));
    }
    let started = Instant::now();
    host.close();
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "close took {:?}",
        started.elapsed()
    );
    assert!(!host.is_connected());

    drop(peer);
    Ok(())
}

#[tokio::test]
async fn peer_eof_after_traffic() -> Result<()> {
    let (in_read, in_write) = pipe_pair();
    let (_out_read, out_write) = pipe_pair();
    let host = StdioTransport::over_fds(in_read, out_write);

    let notes = Arc::new(AtomicUsize::new(0));
    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    {
        let notes = notes.clone();
        host.set_notification_handler(move |_| {
            notes.fetch_add(1, Ordering::SeqCst);
        });
        let errors = errors.clone();
        host.set_error_handler(move |message| {
            errors.lock().expect("errors lock").push(message.to_string());
        });
    }
    host.start()?;

    for n in 0..3 {
        let body = serde_json::to_vec(&JsonRpcNotification::new("evt", Some(json!(n))))?;
        write_all(in_write, &encode(&body));
    }
    close_fd(in_write);

    wait_for("all three notifications", || {
        notes.load(Ordering::SeqCst) == 3
    })
    .await;
    wait_for("EOF report", || {
        errors
            .lock()
            .expect("errors lock")
            .iter()
            .any(|m| m == "EOF on stdin")
    })
    .await;
    assert!(!host.is_connected());

    host.close();
    Ok(())
}

#[tokio::test]
async fn send_request_after_close_resolves_immediately() -> Result<()> {
    let (host, peer) = linked_pair();
    host.start()?;
    host.close();

    let started = Instant::now();
    let response = host.send_request(JsonRpcRequest::new("late", None)).await;
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(
        response.error.context("expected error")?.message,
        "Transport not connected"
    );

    drop(peer);
    Ok(())
}

#[tokio::test]
async fn send_request_before_start_resolves_immediately() -> Result<()> {
    let (host, _peer) = linked_pair();
    let response = host.send_request(JsonRpcRequest::new("early", None)).await;
    assert_eq!(
        response.error.context("expected error")?.message,
        "Transport not connected"
    );
    Ok(())
}

#[tokio::test]
async fn notification_handler_may_close_the_transport() -> Result<()> {
    let (host, peer) = linked_pair();
    {
        // The handler runs on the reader thread; close() must skip joining
        // the thread it is called from.
        let peer_handle = peer.clone();
        peer.set_notification_handler(move |_| {
            peer_handle.close();
        });
    }
    host.start()?;
    peer.start()?;

    host.send_notification(JsonRpcNotification::new("shutdown", None));
    wait_for("peer disconnect", || !peer.is_connected()).await;

    host.close();
    Ok(())
}

#[tokio::test]
async fn requests_keep_flowing_while_a_handler_is_busy() -> Result<()> {
    let (host, peer) = linked_pair();
    peer.set_request_handler(|req| {
        let id = req.id.clone().context("request without id")?;
        if req.method == "slow" {
            std::thread::sleep(Duration::from_millis(300));
        }
        Ok(JsonRpcResponse::success(id, json!(req.method)))
    });
    host.start()?;
    peer.start()?;

    let slow = host.send_request(JsonRpcRequest::new("slow", None));
    let quick = host.send_request(JsonRpcRequest::new("quick", None));

    // The quick response arrives while the slow handler still sleeps.
    let started = Instant::now();
    let response = tokio::time::timeout(Duration::from_secs(2), quick).await?;
    assert_eq!(response.result, Some(json!("quick")));
    assert!(started.elapsed() < Duration::from_millis(300));

    let response = tokio::time::timeout(Duration::from_secs(2), slow).await?;
    assert_eq!(response.result, Some(json!("slow")));

    host.close();
    peer.close();
    Ok(())
}
