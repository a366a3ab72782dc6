//! Reader worker: waits on stdin plus the wakeup primitive, reassembles
//! frames from the byte stream, and dispatches each message.
//!
//! Request handlers run on short-lived per-request threads so the reader can
//! keep delivering notifications (e.g. cancellations) while a handler is
//! busy. Notification handlers run inline on the reader thread and must not
//! block.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp_stdio_protocol::{classify, Incoming, JsonRpcRequest, JsonRpcResponse};

use crate::framing::{self, Extracted};
use crate::sys;
use crate::transport::RunState;

const WAIT_SLICE: Duration = Duration::from_millis(100);
const SCRATCH_BYTES: usize = 4096;

pub(crate) fn run(run: &Arc<RunState>) {
    if let Err(err) = sys::set_nonblocking(run.io_in) {
        run.fail_fatal(&format!("failed to set stdin non-blocking: {err}"));
    } else {
        read_loop(run);
    }
    run.disconnect_only();
    run.mark_reader_exited();
    log::debug!("[{}] reader worker exited", run.session_id);
}

fn read_loop(run: &Arc<RunState>) {
    let mut waiter = match sys::Waiter::new(run.io_in, run.wakeup.wait_source()) {
        Ok(waiter) => waiter,
        Err(err) => {
            run.fail_fatal(&format!("readiness setup failed: {err}"));
            return;
        }
    };

    let mut buf: Vec<u8> = Vec::new();
    let mut scratch = [0u8; SCRATCH_BYTES];
    let mut last_read = Instant::now();

    while run.connected.load(Ordering::Acquire) {
        let readiness = match waiter.wait(WAIT_SLICE) {
            Ok(readiness) => readiness,
            Err(err) => {
                run.fail_fatal(&format!("wait on stdin failed: {err}"));
                return;
            }
        };

        if readiness.woke {
            run.wakeup.drain();
            if !run.connected.load(Ordering::Acquire) {
                return;
            }
        }

        let mut got_data = false;
        let mut eof = false;
        if readiness.stdin_ready {
            // Drain whatever is available right now.
            loop {
                match sys::read_input(run.io_in, &mut scratch) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&scratch[..n]);
                        got_data = true;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        run.fail_fatal(&format!("stdin read failed: {err}"));
                        return;
                    }
                }
            }
        } else if readiness.stdin_closed {
            run.fail_fatal("stdin closed");
            return;
        }

        if got_data {
            last_read = Instant::now();
            drain_frames(run, &mut buf);
        }

        // Frames that arrived ahead of the hangup were delivered above.
        if eof {
            run.fail_fatal("EOF on stdin");
            return;
        }

        if let Some(idle) = run.cfg.idle_read_timeout() {
            if last_read.elapsed() >= idle {
                run.fail_fatal("idle read timeout");
                return;
            }
        }
    }
}

fn drain_frames(run: &Arc<RunState>, buf: &mut Vec<u8>) {
    loop {
        match framing::extract(buf) {
            Extracted::Frame(payload) => dispatch(run, payload),
            Extracted::NeedMore => break,
            // Framing errors stay local: report, skip the bad header region,
            // keep going.
            Extracted::Malformed(err) => run.report_error(&err.to_string()),
        }
    }
}

fn dispatch(run: &Arc<RunState>, payload: Vec<u8>) {
    match classify(&payload) {
        Some(Incoming::Request(request)) => spawn_request_handler(run.clone(), request),
        Some(Incoming::Response(response)) => {
            let key = response.id.key();
            if !run.pending.complete(&key, response) {
                log::debug!("[{}] response for unknown request id {key}, dropping", run.session_id);
            }
        }
        Some(Incoming::Notification(notification)) => {
            if let Some(handler) = &run.handlers.notification {
                handler(notification);
            } else {
                log::debug!(
                    "[{}] notification {} with no handler registered, dropping",
                    run.session_id,
                    notification.method
                );
            }
        }
        None => {
            log::warn!(
                "[{}] unclassifiable message ({} bytes), dropping",
                run.session_id,
                payload.len()
            );
        }
    }
}

fn spawn_request_handler(run: Arc<RunState>, request: JsonRpcRequest) {
    let Some(handler) = run.handlers.request.clone() else {
        log::warn!(
            "[{}] request {} with no handler registered, dropping",
            run.session_id,
            request.method
        );
        return;
    };
    let Some(id) = request.id.clone() else {
        // classify() only yields requests with an id; nothing to correlate
        // a reply to otherwise.
        return;
    };

    let spawned = std::thread::Builder::new()
        .name(format!("{}-handler", run.session_id))
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(request)));
            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => JsonRpcResponse::internal_error(id, err.to_string()),
                Err(panic) => JsonRpcResponse::internal_error(id, panic_message(&panic)),
            };
            match serde_json::to_vec(&response) {
                Ok(payload) => {
                    let _ = run.enqueue_payload(&payload);
                }
                Err(err) => run.report_error(&format!("response serialize failure: {err}")),
            }
        });
    if let Err(err) = spawned {
        log::error!("failed to spawn request handler thread: {err}");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("request handler panicked")
    }
}
