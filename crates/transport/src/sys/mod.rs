//! Platform layer: non-blocking standard-stream I/O and readiness waits.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::Waiter;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;

/// What the reader's platform wait reported.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Readiness {
    pub stdin_ready: bool,
    pub stdin_closed: bool,
    pub woke: bool,
}
