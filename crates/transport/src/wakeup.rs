//! OS-level wakeup primitive for interrupting the reader's blocking wait.
//!
//! The reader waits on standard input and on this object in the same platform
//! wait call; `signal` makes that wait return without any stdin traffic.
//! Variants: Linux `eventfd`, other POSIX a non-blocking self-pipe, Windows a
//! manual-reset event. `signal` is idempotent and never blocks; `drain`
//! discards pending wakeup state (level-triggered on the POSIX variants).

use std::io;

#[cfg(unix)]
use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
pub struct Wakeup {
    fd: RawFd,
}

#[cfg(target_os = "linux")]
impl Wakeup {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn signal(&self) {
        let one: u64 = 1;
        // EAGAIN means the counter is saturated; a wakeup is already pending.
        let _ = unsafe { libc::write(self.fd, (&one as *const u64).cast(), 8) };
    }

    pub fn drain(&self) {
        let mut scratch = [0u8; 8];
        loop {
            let n = unsafe { libc::read(self.fd, scratch.as_mut_ptr().cast(), scratch.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Descriptor the reader registers in its wait set.
    pub fn wait_source(&self) -> RawFd {
        self.fd
    }
}

#[cfg(target_os = "linux")]
impl Drop for Wakeup {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub struct Wakeup {
    read_fd: RawFd,
    write_fd: RawFd,
}

#[cfg(all(unix, not(target_os = "linux")))]
impl Wakeup {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn signal(&self) {
        // EAGAIN means the pipe is full; a wakeup is already pending.
        let _ = unsafe { libc::write(self.write_fd, b"w".as_ptr().cast(), 1) };
    }

    pub fn drain(&self) {
        let mut scratch = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, scratch.as_mut_ptr().cast(), scratch.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    pub fn wait_source(&self) -> RawFd {
        self.read_fd
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
impl Drop for Wakeup {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(windows)]
pub struct Wakeup {
    // Stored as isize so the state stays Send + Sync.
    event: isize,
}

#[cfg(windows)]
impl Wakeup {
    pub fn new() -> io::Result<Self> {
        use windows_sys::Win32::System::Threading::CreateEventW;

        let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if event.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            event: event as isize,
        })
    }

    pub fn signal(&self) {
        use windows_sys::Win32::System::Threading::SetEvent;

        unsafe {
            SetEvent(self.event as _);
        }
    }

    pub fn drain(&self) {
        use windows_sys::Win32::System::Threading::ResetEvent;

        unsafe {
            ResetEvent(self.event as _);
        }
    }

    /// Handle the reader passes to `WaitForMultipleObjects`.
    pub fn wait_source(&self) -> isize {
        self.event
    }
}

#[cfg(windows)]
impl Drop for Wakeup {
    fn drop(&mut self) {
        use windows_sys::Win32::Foundation::CloseHandle;

        unsafe {
            CloseHandle(self.event as _);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        n == 1 && pfd.revents & libc::POLLIN != 0
    }

    #[test]
    fn signal_makes_wait_source_readable() {
        let wakeup = Wakeup::new().expect("wakeup");
        assert!(!readable(wakeup.wait_source()));
        wakeup.signal();
        assert!(readable(wakeup.wait_source()));
    }

    #[test]
    fn drain_clears_pending_signals() {
        let wakeup = Wakeup::new().expect("wakeup");
        wakeup.signal();
        wakeup.signal();
        wakeup.drain();
        assert!(!readable(wakeup.wait_source()));
        // Still usable afterwards.
        wakeup.signal();
        assert!(readable(wakeup.wait_source()));
    }
}
