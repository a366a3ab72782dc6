use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::Readiness;

/// Readiness wait over epoll. Stdin and the wakeup eventfd are registered
/// once; the instance lives for the reader's whole run.
pub(crate) struct Waiter {
    epfd: RawFd,
    stdin_fd: RawFd,
    wakeup_fd: RawFd,
}

fn epoll_add(epfd: RawFd, fd: RawFd) -> io::Result<()> {
    let mut event = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: fd as u64,
    };
    if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Waiter {
    pub fn new(stdin_fd: RawFd, wakeup_fd: RawFd) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let waiter = Self {
            epfd,
            stdin_fd,
            wakeup_fd,
        };
        // Registration failure drops `waiter`, closing epfd.
        epoll_add(epfd, stdin_fd)?;
        epoll_add(epfd, wakeup_fd)?;
        Ok(waiter)
    }

    pub fn wait(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut readiness = Readiness::default();
        for event in &events[..n] {
            let flags = event.events;
            let fd = event.u64 as RawFd;
            if fd == self.wakeup_fd {
                readiness.woke |= flags & libc::EPOLLIN as u32 != 0;
            } else if fd == self.stdin_fd {
                readiness.stdin_ready |= flags & libc::EPOLLIN as u32 != 0;
                let hangup = (libc::EPOLLHUP | libc::EPOLLERR) as u32;
                readiness.stdin_closed |= flags & hangup != 0;
            }
        }
        Ok(readiness)
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
