use std::io;
use std::time::Duration;

use once_cell::sync::OnceCell;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_BROKEN_PIPE, ERROR_INVALID_FUNCTION, ERROR_INVALID_HANDLE,
    ERROR_INVALID_PARAMETER, ERROR_IO_PENDING, ERROR_NOT_SUPPORTED, HANDLE, WAIT_FAILED,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::Console::{GetStdHandle, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE};
use windows_sys::Win32::System::Pipes::PeekNamedPipe;
use windows_sys::Win32::System::Threading::{
    CreateEventW, WaitForMultipleObjects, WaitForSingleObject,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use super::Readiness;

/// Raw endpoint the engine reads from / writes to, stored as `isize` so the
/// shared state stays `Send + Sync`. Never closed by us.
pub(crate) type RawIo = isize;

pub(crate) fn stdin_io() -> RawIo {
    unsafe { GetStdHandle(STD_INPUT_HANDLE) as RawIo }
}

pub(crate) fn stdout_io() -> RawIo {
    unsafe { GetStdHandle(STD_OUTPUT_HANDLE) as RawIo }
}

/// Standard handles have no O_NONBLOCK equivalent; the read path polls with
/// `PeekNamedPipe` and the write path uses overlapped I/O instead.
pub(crate) fn set_nonblocking(_io: RawIo) -> io::Result<()> {
    Ok(())
}

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

/// Read without blocking: peek first, then take what is available.
/// `Ok(0)` is end of stream (peer closed its end).
pub(crate) fn read_input(io: RawIo, buf: &mut [u8]) -> io::Result<usize> {
    let handle = io as HANDLE;
    unsafe {
        let mut available: u32 = 0;
        let ok = PeekNamedPipe(
            handle,
            std::ptr::null_mut(),
            0,
            std::ptr::null_mut(),
            &mut available,
            std::ptr::null_mut(),
        );
        if ok == 0 {
            match GetLastError() {
                ERROR_BROKEN_PIPE => return Ok(0),
                // Console input handles reject the pipe probe; read directly,
                // the wait already told us input is pending.
                ERROR_INVALID_FUNCTION => available = buf.len() as u32,
                _ => return Err(last_error()),
            }
        } else if available == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        let want = buf.len().min(available as usize) as u32;
        let mut got: u32 = 0;
        let ok = ReadFile(
            handle,
            buf.as_mut_ptr(),
            want,
            &mut got,
            std::ptr::null_mut(),
        );
        if ok == 0 {
            if GetLastError() == ERROR_BROKEN_PIPE {
                return Ok(0);
            }
            return Err(last_error());
        }
        Ok(got as usize)
    }
}

/// Outbound endpoint for the writer worker. Prefers overlapped writes; the
/// first `INVALID_PARAMETER`/`INVALID_HANDLE`/`NOT_SUPPORTED` failure latches
/// the writer to plain synchronous writes for the rest of the process.
pub(crate) struct OutputWriter {
    handle: RawIo,
    event: RawIo,
    overlapped_disabled: OnceCell<()>,
}

impl OutputWriter {
    pub fn new(handle: RawIo) -> io::Result<Self> {
        let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if event.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            handle,
            event: event as RawIo,
            overlapped_disabled: OnceCell::new(),
        })
    }

    pub fn write_chunk(&self, buf: &[u8], budget: Duration) -> io::Result<usize> {
        if self.overlapped_disabled.get().is_some() {
            return self.write_sync(buf);
        }

        unsafe {
            windows_sys::Win32::System::Threading::ResetEvent(self.event as HANDLE);
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            overlapped.hEvent = self.event as HANDLE;
            let mut written: u32 = 0;
            let ok = WriteFile(
                self.handle as HANDLE,
                buf.as_ptr(),
                buf.len() as u32,
                &mut written,
                &mut overlapped,
            );
            if ok != 0 {
                return Ok(written as usize);
            }
            match GetLastError() {
                ERROR_IO_PENDING => {}
                err @ (ERROR_INVALID_PARAMETER | ERROR_INVALID_HANDLE | ERROR_NOT_SUPPORTED) => {
                    log::warn!("overlapped stdout write unavailable (error {err}); using synchronous writes");
                    let _ = self.overlapped_disabled.set(());
                    return self.write_sync(buf);
                }
                _ => return Err(last_error()),
            }

            // The buffer must stay untouched until the operation settles, so
            // always wait it out (or cancel and wait) before returning.
            let timeout_ms = budget.as_millis().min(u32::MAX as u128) as u32;
            let wait = WaitForSingleObject(self.event as HANDLE, timeout_ms);
            if wait != WAIT_OBJECT_0 {
                CancelIoEx(self.handle as HANDLE, &overlapped);
            }
            let mut transferred: u32 = 0;
            let ok = GetOverlappedResult(self.handle as HANDLE, &overlapped, &mut transferred, 1);
            if ok == 0 && wait == WAIT_OBJECT_0 {
                return Err(last_error());
            }
            Ok(transferred as usize)
        }
    }

    fn write_sync(&self, buf: &[u8]) -> io::Result<usize> {
        unsafe {
            let mut written: u32 = 0;
            let ok = WriteFile(
                self.handle as HANDLE,
                buf.as_ptr(),
                buf.len() as u32,
                &mut written,
                std::ptr::null_mut(),
            );
            if ok == 0 {
                return Err(last_error());
            }
            Ok(written as usize)
        }
    }

    pub fn abort_pending(&self) {
        unsafe {
            CancelIoEx(self.handle as HANDLE, std::ptr::null());
        }
    }
}

impl Drop for OutputWriter {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.event as HANDLE);
        }
    }
}

/// Readiness wait over `WaitForMultipleObjects` on the wakeup event and the
/// stdin handle.
pub(crate) struct Waiter {
    handles: [HANDLE; 2],
}

impl Waiter {
    pub fn new(stdin: RawIo, wakeup: RawIo) -> io::Result<Self> {
        Ok(Self {
            handles: [wakeup as HANDLE, stdin as HANDLE],
        })
    }

    pub fn wait(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let result = unsafe {
            WaitForMultipleObjects(
                self.handles.len() as u32,
                self.handles.as_ptr(),
                0,
                timeout_ms,
            )
        };

        let mut readiness = Readiness::default();
        match result {
            WAIT_TIMEOUT => {}
            WAIT_FAILED => return Err(io::Error::last_os_error()),
            r if r == WAIT_OBJECT_0 => readiness.woke = true,
            r if r == WAIT_OBJECT_0 + 1 => readiness.stdin_ready = true,
            _ => {}
        }
        Ok(readiness)
    }
}
