//! Public transport facade and the shared run-state behind the workers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use mcp_stdio_protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use once_cell::sync::OnceCell;
use rand::Rng;
use tokio::sync::oneshot;

use crate::config::Settings;
use crate::error::{Result, TransportError};
use crate::framing;
use crate::pending::{self, PendingEntry, PendingTable};
use crate::queue::WriteQueue;
use crate::sys;
use crate::wakeup::Wakeup;
use crate::{reader, writer};

/// Bounded wait for each worker to acknowledge shutdown before detaching.
const WORKER_EXIT_WAIT: Duration = Duration::from_millis(500);

pub type RequestHandler =
    Arc<dyn Fn(JsonRpcRequest) -> anyhow::Result<JsonRpcResponse> + Send + Sync>;
pub type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct HandlerSet {
    pub request: Option<RequestHandler>,
    pub notification: Option<NotificationHandler>,
    pub error: Option<ErrorHandler>,
}

/// Everything the three workers share. Frozen at `start`; handlers and
/// settings are snapshots of whatever was configured before then.
pub(crate) struct RunState {
    pub session_id: String,
    pub cfg: Settings,
    pub handlers: HandlerSet,
    pub io_in: sys::RawIo,
    pub io_out: sys::RawIo,
    pub connected: AtomicBool,
    pub reader_exited: AtomicBool,
    pub writer_exited: AtomicBool,
    pub timer_exited: AtomicBool,
    exit_lock: Mutex<()>,
    exit_cond: Condvar,
    pub queue: WriteQueue,
    pub pending: PendingTable,
    pub wakeup: Wakeup,
}

impl RunState {
    /// Surface an error to the handler and the log.
    pub fn report_error(&self, message: &str) {
        log::error!("[{}] {message}", self.session_id);
        if let Some(handler) = &self.handlers.error {
            handler(message);
        }
    }

    /// Fatal transition: report, disconnect, and resolve every pending slot.
    pub fn fail_fatal(&self, message: &str) {
        self.report_error(message);
        self.disconnect_only();
        self.fail_pending_closed();
    }

    /// Flip `connected` and wake every blocked worker. Terminal; safe to
    /// call repeatedly.
    pub fn disconnect_only(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.wakeup.signal();
            self.queue.notify_all();
            self.pending.notify_all();
        }
    }

    pub fn fail_pending_closed(&self) {
        self.pending.fail_all("Transport closed");
    }

    /// Frame `payload` and queue it for the writer. Queue overflow is a
    /// fatal backpressure error.
    pub fn enqueue_payload(&self, payload: &[u8]) -> bool {
        let frame = framing::encode(payload);
        if self.queue.push(frame) {
            true
        } else {
            self.fail_fatal("write queue overflow");
            false
        }
    }

    pub fn mark_reader_exited(&self) {
        self.mark_exited(&self.reader_exited);
    }

    pub fn mark_writer_exited(&self) {
        self.mark_exited(&self.writer_exited);
    }

    pub fn mark_timer_exited(&self) {
        self.mark_exited(&self.timer_exited);
    }

    fn mark_exited(&self, flag: &AtomicBool) {
        flag.store(true, Ordering::Release);
        let _guard = self
            .exit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.exit_cond.notify_all();
    }

    /// Wait up to `deadline` for `flag`; returns whether the worker
    /// acknowledged exit in time.
    fn wait_exited(&self, flag: &AtomicBool, deadline: Instant) -> bool {
        let mut guard = self
            .exit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !flag.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .exit_cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
        true
    }
}

struct WorkerSet {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    session_id: String,
    io_in: sys::RawIo,
    io_out: sys::RawIo,
    settings: Mutex<Settings>,
    handlers: Mutex<HandlerSet>,
    run: OnceCell<Arc<RunState>>,
    workers: Mutex<WorkerSet>,
    next_id: AtomicU64,
}

/// Bidirectional, message-framed JSON-RPC transport over standard I/O.
///
/// Configure handlers and settings, `start`, then exchange traffic;
/// `close` is terminal. Cloning yields another handle to the same
/// transport, which is how a handler can close it from inside.
#[derive(Clone)]
pub struct StdioTransport {
    inner: Arc<Inner>,
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioTransport {
    /// Transport over the process's own standard streams.
    pub fn new() -> Self {
        Self::with_io(sys::stdin_io(), sys::stdout_io())
    }

    /// Transport over arbitrary descriptors; used by the loopback tests.
    /// The transport never closes the descriptors it is handed.
    #[cfg(unix)]
    pub fn over_fds(read: std::os::unix::io::RawFd, write: std::os::unix::io::RawFd) -> Self {
        Self::with_io(read, write)
    }

    /// Transport over arbitrary handles; the Windows twin of `over_fds`.
    #[cfg(windows)]
    pub fn over_handles(read: isize, write: isize) -> Self {
        Self::with_io(read, write)
    }

    fn with_io(io_in: sys::RawIo, io_out: sys::RawIo) -> Self {
        let tag: u32 = rand::rng().random_range(0..10_000);
        Self {
            inner: Arc::new(Inner {
                session_id: format!("stdio-{tag:04}"),
                io_in,
                io_out,
                settings: Mutex::new(Settings::from_env()),
                handlers: Mutex::new(HandlerSet::default()),
                run: OnceCell::new(),
                workers: Mutex::new(WorkerSet {
                    reader: None,
                    writer: None,
                    timer: None,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .run
            .get()
            .is_some_and(|run| run.connected.load(Ordering::Acquire))
    }

    /// Handler for incoming requests; runs on a per-request thread.
    /// Must be set before `start`; later calls have no effect on a running
    /// transport.
    pub fn set_request_handler<F>(&self, handler: F)
    where
        F: Fn(JsonRpcRequest) -> anyhow::Result<JsonRpcResponse> + Send + Sync + 'static,
    {
        self.lock_handlers().request = Some(Arc::new(handler));
    }

    /// Handler for incoming notifications; runs on the reader thread and
    /// must not block.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) + Send + Sync + 'static,
    {
        self.lock_handlers().notification = Some(Arc::new(handler));
    }

    /// Receiver for transport error strings; every error is also logged.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.lock_handlers().error = Some(Arc::new(handler));
    }

    /// Per-request deadline in milliseconds; 0 disables request timeouts.
    pub fn set_request_timeout_ms(&self, ms: u64) {
        self.lock_settings().request_timeout_ms = ms;
    }

    /// Abort the transport when no bytes arrive for this long; 0 disables.
    pub fn set_idle_read_timeout_ms(&self, ms: u64) {
        self.lock_settings().idle_read_timeout_ms = ms;
    }

    /// Per-frame write deadline; 0 disables.
    pub fn set_write_timeout_ms(&self, ms: u64) {
        self.lock_settings().write_timeout_ms = ms;
    }

    /// Write-queue byte budget; clamped to at least 1.
    pub fn set_write_queue_max_bytes(&self, bytes: usize) {
        self.lock_settings().write_queue_max_bytes = bytes.max(1);
    }

    /// Apply a flat `key=value` configuration string (`;` or whitespace
    /// separated).
    pub fn apply_config(&self, text: &str) {
        self.lock_settings().apply_str(text);
    }

    /// Mark the transport connected and spawn the reader, writer, and
    /// timeout workers. Starting twice is not supported.
    pub fn start(&self) -> Result<()> {
        let cfg = self.lock_settings().clone();
        let handlers = self.lock_handlers().clone();
        let wakeup = Wakeup::new()?;

        let run = Arc::new(RunState {
            session_id: self.inner.session_id.clone(),
            queue: WriteQueue::new(cfg.write_queue_max_bytes),
            cfg,
            handlers,
            io_in: self.inner.io_in,
            io_out: self.inner.io_out,
            connected: AtomicBool::new(true),
            reader_exited: AtomicBool::new(false),
            writer_exited: AtomicBool::new(false),
            timer_exited: AtomicBool::new(false),
            exit_lock: Mutex::new(()),
            exit_cond: Condvar::new(),
            pending: PendingTable::new(),
            wakeup,
        });
        if self.inner.run.set(run.clone()).is_err() {
            return Err(TransportError::AlreadyStarted);
        }

        let spawned = self.spawn_workers(&run);
        if let Err(err) = spawned {
            run.disconnect_only();
            return Err(err);
        }
        log::info!("[{}] transport started", run.session_id);
        Ok(())
    }

    fn spawn_workers(&self, run: &Arc<RunState>) -> Result<()> {
        let mut workers = self.lock_workers();

        let reader = {
            let run = run.clone();
            std::thread::Builder::new()
                .name(format!("{}-reader", run.session_id))
                .spawn(move || reader::run(&run))?
        };
        workers.reader = Some(reader);

        let writer = {
            let run = run.clone();
            std::thread::Builder::new()
                .name(format!("{}-writer", run.session_id))
                .spawn(move || writer::run(&run))?
        };
        workers.writer = Some(writer);

        let timer = {
            let run = run.clone();
            std::thread::Builder::new()
                .name(format!("{}-timeout", run.session_id))
                .spawn(move || pending::timer_main(&run))?
        };
        workers.timer = Some(timer);
        Ok(())
    }

    /// Send a request and return a future for its response.
    ///
    /// The future always resolves: with the peer's response, a
    /// `"Request timeout"` error, or a `"Transport closed"` /
    /// `"Transport not connected"` error.
    pub fn send_request(&self, mut request: JsonRpcRequest) -> ResponseFuture {
        let id = match request.id.take() {
            Some(RequestId::String(s)) if !s.is_empty() => RequestId::String(s),
            Some(RequestId::Number(n)) => RequestId::Number(n),
            _ => {
                let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                RequestId::String(format!("req-{seq}"))
            }
        };
        request.id = Some(id.clone());

        let Some(run) = self.connected_run() else {
            return ResponseFuture::ready(JsonRpcResponse::internal_error(
                id,
                "Transport not connected",
            ));
        };

        let (slot, receiver) = oneshot::channel();
        let key = id.key();
        let deadline = run.cfg.request_timeout().map(|t| Instant::now() + t);
        run.pending.insert(
            key.clone(),
            PendingEntry {
                id: id.clone(),
                slot,
            },
            deadline,
        );
        // A fatal shutdown may have failed the table between the connected
        // check and the insert; make sure this slot cannot be left behind.
        if !run.connected.load(Ordering::Acquire) {
            run.pending.complete(
                &key,
                JsonRpcResponse::internal_error(id.clone(), "Transport closed"),
            );
            return ResponseFuture::waiting(id, receiver);
        }

        match serde_json::to_vec(&request) {
            Ok(payload) => {
                // Overflow fails the transport, which resolves the slot we
                // just inserted; nothing extra to do on failure here.
                let _ = run.enqueue_payload(&payload);
            }
            Err(err) => {
                let message = format!("request serialize failure: {err}");
                run.report_error(&message);
                run.pending
                    .complete(&key, JsonRpcResponse::internal_error(id.clone(), message));
            }
        }
        ResponseFuture::waiting(id, receiver)
    }

    /// Fire-and-forget notification. Dropped silently when not connected;
    /// enqueue failures are reported to the error handler only.
    pub fn send_notification(&self, notification: JsonRpcNotification) {
        let Some(run) = self.connected_run() else {
            log::debug!(
                "[{}] dropping notification {} while not connected",
                self.inner.session_id,
                notification.method
            );
            return;
        };
        match serde_json::to_vec(&notification) {
            Ok(payload) => {
                let _ = run.enqueue_payload(&payload);
            }
            Err(err) => run.report_error(&format!("notification serialize failure: {err}")),
        }
    }

    /// Disconnect and shut the workers down, waiting up to 500 ms per worker
    /// before detaching it; then fail whatever is still pending. Never
    /// closes the underlying descriptors. Safe to call from a handler
    /// thread; a worker closing the transport skips waiting on itself.
    pub fn close(&self) {
        let Some(run) = self.inner.run.get() else {
            return;
        };
        log::info!("[{}] closing transport", run.session_id);
        run.disconnect_only();

        let (reader, writer, timer) = {
            let mut workers = self.lock_workers();
            (
                workers.reader.take(),
                workers.writer.take(),
                workers.timer.take(),
            )
        };
        let caller = std::thread::current().id();
        Self::reap_worker(run, reader, &run.reader_exited, caller, "reader");
        Self::reap_worker(run, writer, &run.writer_exited, caller, "writer");
        Self::reap_worker(run, timer, &run.timer_exited, caller, "timeout");

        run.fail_pending_closed();
        log::info!("[{}] transport closed", run.session_id);
    }

    fn reap_worker(
        run: &Arc<RunState>,
        handle: Option<JoinHandle<()>>,
        exited: &AtomicBool,
        caller: ThreadId,
        name: &str,
    ) {
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == caller {
            // close() invoked from inside this worker (e.g. a notification
            // handler); it finishes its own exit after close returns.
            log::debug!("[{}] close called from {name} worker, detaching self", run.session_id);
            return;
        }
        if run.wait_exited(exited, Instant::now() + WORKER_EXIT_WAIT) {
            let _ = handle.join();
        } else {
            // Stuck in a blocking primitive; leave it behind rather than
            // hang the caller. It exits on its next wakeup.
            log::warn!(
                "[{}] {name} worker did not exit within {WORKER_EXIT_WAIT:?}, detaching",
                run.session_id
            );
        }
    }

    fn connected_run(&self) -> Option<&Arc<RunState>> {
        self.inner
            .run
            .get()
            .filter(|run| run.connected.load(Ordering::Acquire))
    }

    fn lock_settings(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.inner
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, HandlerSet> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, WorkerSet> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Future for an in-flight request. Always resolves to a response; a torn
/// down engine yields an InternalError (`"Transport closed"`).
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    id: RequestId,
    state: FutureState,
}

enum FutureState {
    Ready(Option<JsonRpcResponse>),
    Waiting(oneshot::Receiver<JsonRpcResponse>),
}

impl ResponseFuture {
    fn ready(response: JsonRpcResponse) -> Self {
        Self {
            id: response.id.clone(),
            state: FutureState::Ready(Some(response)),
        }
    }

    fn waiting(id: RequestId, receiver: oneshot::Receiver<JsonRpcResponse>) -> Self {
        Self {
            id,
            state: FutureState::Waiting(receiver),
        }
    }

    /// Id the transport assigned to (or preserved on) the request.
    pub fn request_id(&self) -> &RequestId {
        &self.id
    }
}

impl Future for ResponseFuture {
    type Output = JsonRpcResponse;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            FutureState::Ready(slot) => match slot.take() {
                Some(response) => Poll::Ready(response),
                None => Poll::Pending,
            },
            FutureState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(response)) => Poll::Ready(response),
                Poll::Ready(Err(_)) => Poll::Ready(JsonRpcResponse::internal_error(
                    this.id.clone(),
                    "Transport closed",
                )),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
