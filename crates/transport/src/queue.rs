//! Bounded FIFO of encoded frames between producers and the writer worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

pub(crate) struct WriteQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

struct QueueState {
    frames: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    max_bytes: usize,
}

impl WriteQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                queued_bytes: 0,
                max_bytes: max_bytes.max(1),
            }),
            cond: Condvar::new(),
        }
    }

    /// Append a frame. Returns `false` when the byte budget would be
    /// exceeded; the caller treats that as a fatal backpressure error.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        let mut state = self.lock();
        if state.queued_bytes + frame.len() > state.max_bytes {
            log::error!(
                "write queue overflow: {} queued + {} frame > {} cap",
                state.queued_bytes,
                frame.len(),
                state.max_bytes
            );
            return false;
        }
        state.queued_bytes += frame.len();
        state.frames.push_back(frame);
        self.cond.notify_one();
        true
    }

    /// Wait for work. Returns `None` only once the transport is disconnected
    /// and the queue is empty; frames queued before disconnect are still
    /// handed out.
    pub fn pop_blocking(&self, connected: &AtomicBool) -> Option<Vec<u8>> {
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            if !connected.load(Ordering::Acquire) {
                return None;
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Release budget once a frame has been written (or abandoned).
    pub fn account_written(&self, len: usize) {
        let mut state = self.lock();
        state.queued_bytes = state.queued_bytes.saturating_sub(len);
    }

    pub fn notify_all(&self) {
        let _guard = self.lock();
        self.cond.notify_all();
    }

    #[cfg(test)]
    pub fn queued_bytes(&self) -> usize {
        self.lock().queued_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
