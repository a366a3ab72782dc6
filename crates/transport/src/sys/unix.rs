use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(not(target_os = "linux"))]
use super::Readiness;

/// Raw endpoint the engine reads from / writes to. Never closed by us.
pub(crate) type RawIo = RawFd;

pub(crate) fn stdin_io() -> RawIo {
    libc::STDIN_FILENO
}

pub(crate) fn stdout_io() -> RawIo {
    libc::STDOUT_FILENO
}

pub(crate) fn set_nonblocking(fd: RawIo) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn read_input(fd: RawIo, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: RawIo, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn wait_writable(fd: RawIo, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n >= 0 {
            return Ok(n > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Outbound endpoint for the writer worker. Puts the descriptor in
/// non-blocking mode at construction and leaves it that way.
pub(crate) struct OutputWriter {
    fd: RawIo,
}

impl OutputWriter {
    pub fn new(fd: RawIo) -> io::Result<Self> {
        set_nonblocking(fd)?;
        Ok(Self { fd })
    }

    /// Try to make progress on `buf` within roughly `budget`. `Ok(0)` means
    /// no progress yet (not writable, or interrupted); the caller re-checks
    /// its frame deadline and retries.
    pub fn write_chunk(&self, buf: &[u8], budget: Duration) -> io::Result<usize> {
        match write_fd(self.fd, buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(self.fd, budget)?;
                Ok(0)
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Cancel an in-flight platform write. Nothing to do on POSIX; the
    /// abandoned frame tail is simply never written.
    pub fn abort_pending(&self) {}
}

/// Readiness wait over `poll(2)` for POSIX systems without epoll.
#[cfg(not(target_os = "linux"))]
pub(crate) struct Waiter {
    stdin_fd: RawFd,
    wakeup_fd: RawFd,
}

#[cfg(not(target_os = "linux"))]
impl Waiter {
    pub fn new(stdin_fd: RawFd, wakeup_fd: RawFd) -> io::Result<Self> {
        Ok(Self { stdin_fd, wakeup_fd })
    }

    pub fn wait(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let mut fds = [
            libc::pollfd {
                fd: self.stdin_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wakeup_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = loop {
            let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if n >= 0 {
                break n;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut readiness = Readiness::default();
        if n > 0 {
            let hangup = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
            readiness.stdin_ready = fds[0].revents & libc::POLLIN != 0;
            readiness.stdin_closed = fds[0].revents & hangup != 0;
            readiness.woke = fds[1].revents & libc::POLLIN != 0;
        }
        Ok(readiness)
    }
}
