//! Writer worker: drains the bounded queue and writes each frame in full,
//! with non-blocking I/O and an optional per-frame write deadline.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::sys;
use crate::transport::RunState;

/// Bound on a single writability wait, so shutdown is always noticed.
const POLL_SLICE: Duration = Duration::from_millis(50);

pub(crate) fn run(run: &Arc<RunState>) {
    match sys::OutputWriter::new(run.io_out) {
        Ok(out) => drive(run, &out),
        Err(err) => run.fail_fatal(&format!("stdout setup failed: {err}")),
    }
    run.mark_writer_exited();
    log::debug!("[{}] writer worker exited", run.session_id);
}

fn drive(run: &Arc<RunState>, out: &sys::OutputWriter) {
    while let Some(frame) = run.queue.pop_blocking(&run.connected) {
        let started = Instant::now();
        let mut total = 0usize;
        let mut bail = false;

        while total < frame.len() {
            let mut budget = POLL_SLICE;
            if let Some(limit) = run.cfg.write_timeout() {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    out.abort_pending();
                    run.fail_fatal("write timeout");
                    bail = true;
                    break;
                }
                budget = budget.min(limit - elapsed);
            }

            match out.write_chunk(&frame[total..], budget) {
                Ok(0) => {
                    // No progress; abandon the frame tail if shutdown began
                    // while the stream was unwritable.
                    if !run.connected.load(Ordering::Acquire) {
                        bail = true;
                        break;
                    }
                }
                Ok(n) => total += n,
                Err(err) => {
                    run.fail_fatal(&format!("stdout write failed: {err}"));
                    bail = true;
                    break;
                }
            }
        }

        run.queue.account_written(frame.len());
        if bail {
            return;
        }
    }
}
