//! Request correlation and the deadline timer worker.
//!
//! Every in-flight request owns a one-shot completion slot. The slot is
//! fulfilled exactly once: by the matching response, by deadline expiry, or
//! by transport shutdown; fulfillment removes the entry from both maps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;

use mcp_stdio_protocol::{JsonRpcResponse, RequestId};
use tokio::sync::oneshot;

use crate::transport::RunState;

pub(crate) struct PendingEntry {
    pub id: RequestId,
    pub slot: oneshot::Sender<JsonRpcResponse>,
}

pub(crate) struct PendingTable {
    state: Mutex<PendingState>,
    cond: Condvar,
}

struct PendingState {
    pending: HashMap<String, PendingEntry>,
    deadlines: HashMap<String, Instant>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                pending: HashMap::new(),
                deadlines: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Register an in-flight request. `deadline` is `None` when per-request
    /// timeouts are disabled; such entries resolve only via response or
    /// shutdown. Wakes the timer so it recomputes its next deadline.
    pub fn insert(&self, key: String, entry: PendingEntry, deadline: Option<Instant>) {
        let mut state = self.lock();
        if let Some(deadline) = deadline {
            state.deadlines.insert(key.clone(), deadline);
        }
        state.pending.insert(key, entry);
        self.cond.notify_all();
    }

    /// Fulfill the slot for `key` with `response`. Returns `false` when no
    /// such request is pending (late or unsolicited response).
    pub fn complete(&self, key: &str, response: JsonRpcResponse) -> bool {
        let mut state = self.lock();
        state.deadlines.remove(key);
        match state.pending.remove(key) {
            Some(entry) => {
                let _ = entry.slot.send(response);
                true
            }
            None => false,
        }
    }

    /// Fulfill every remaining slot with an InternalError response carrying
    /// `message` and clear both maps.
    pub fn fail_all(&self, message: &str) {
        let mut state = self.lock();
        state.deadlines.clear();
        for (_, entry) in state.pending.drain() {
            let _ = entry.slot.send(JsonRpcResponse::internal_error(entry.id, message));
        }
        self.cond.notify_all();
    }

    pub fn notify_all(&self) {
        let _guard = self.lock();
        self.cond.notify_all();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Timer loop: sleep until the earliest deadline (or until woken by an
    /// insert or shutdown), expire everything due, repeat until disconnect.
    ///
    /// `report` runs with the table unlocked; it may re-enter the transport.
    fn timer_loop(&self, connected: &AtomicBool, report: &dyn Fn(&str)) {
        let mut state = self.lock();
        while connected.load(Ordering::Acquire) {
            let next = state.deadlines.values().min().copied();
            let Some(next) = next else {
                state = self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let now = Instant::now();
            if next > now {
                let (guard, _) = self
                    .cond
                    .wait_timeout(state, next - now)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                continue;
            }

            let due: Vec<String> = state
                .deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            let mut expired = Vec::with_capacity(due.len());
            for key in due {
                state.deadlines.remove(&key);
                if let Some(entry) = state.pending.remove(&key) {
                    expired.push((key, entry));
                }
            }
            drop(state);
            for (key, entry) in expired {
                report(&format!("Request timeout: {key}"));
                let _ = entry
                    .slot
                    .send(JsonRpcResponse::internal_error(entry.id, "Request timeout"));
            }
            state = self.lock();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entry point for the timeout worker thread.
pub(crate) fn timer_main(run: &Arc<RunState>) {
    run.pending
        .timer_loop(&run.connected, &|message| run.report_error(message));
    run.mark_timer_exited();
    log::debug!("[{}] timer worker exited", run.session_id);
}
