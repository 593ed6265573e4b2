//! Cross-process synchronization: a shared-memory counting semaphore and a
//! close-on-exec pipe, plus the framed error channel codec used by the
//! handshake.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::unistd::pipe2;

use crate::error::{Error, Result};

/// A counting semaphore in a `MAP_SHARED | MAP_ANONYMOUS` mapping, usable
/// across the parent/child side of a `clone`. Supports a timed wait so the
/// parent can bound how long it waits for the child to signal readiness.
pub struct Semaphore {
    inner: ptr::NonNull<libc::sem_t>,
}

// The semaphore lives in shared memory and is designed to be used from both
// sides of a fork; nothing here is thread-local.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(initial: u32) -> Result<Self> {
        let size = std::mem::size_of::<libc::sem_t>();
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::syscall("mmap", Errno::last()));
        }
        let sem = addr as *mut libc::sem_t;
        // pshared = 1: the semaphore is shared between processes.
        let rc = unsafe { libc::sem_init(sem, 1, initial) };
        if rc != 0 {
            let err = Errno::last();
            unsafe {
                libc::munmap(addr, size);
            }
            return Err(Error::syscall("sem_init", err));
        }
        Ok(Self {
            inner: ptr::NonNull::new(sem).expect("mmap returned null on success"),
        })
    }

    fn as_ptr(&self) -> *mut libc::sem_t {
        self.inner.as_ptr()
    }

    pub fn post(&self) -> Result<()> {
        let rc = unsafe { libc::sem_post(self.as_ptr()) };
        if rc != 0 {
            return Err(Error::syscall("sem_post", Errno::last()));
        }
        Ok(())
    }

    pub fn wait(&self) -> Result<()> {
        loop {
            let rc = unsafe { libc::sem_wait(self.as_ptr()) };
            if rc == 0 {
                return Ok(());
            }
            let err = Errno::last();
            if err == Errno::EINTR {
                continue;
            }
            return Err(Error::syscall("sem_wait", err));
        }
    }

    pub fn try_wait(&self) -> Result<bool> {
        let rc = unsafe { libc::sem_trywait(self.as_ptr()) };
        if rc == 0 {
            return Ok(true);
        }
        let err = Errno::last();
        if err == Errno::EAGAIN {
            return Ok(false);
        }
        Err(Error::syscall("sem_trywait", err))
    }

    /// Returns `false` on timeout, propagates any other error.
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
            return Err(Error::syscall("clock_gettime", Errno::last()));
        }
        let add_nanos = ts.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        ts.tv_sec += timeout.as_secs() as libc::time_t + add_nanos / 1_000_000_000;
        ts.tv_nsec = add_nanos % 1_000_000_000;

        loop {
            let rc = unsafe { libc::sem_timedwait(self.as_ptr(), &ts) };
            if rc == 0 {
                return Ok(true);
            }
            let err = Errno::last();
            match err {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => return Ok(false),
                _ => return Err(Error::syscall("sem_timedwait", err)),
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // Must not throw/panic: best-effort unmap and destroy.
        unsafe {
            let _ = libc::sem_destroy(self.as_ptr());
            let _ = libc::munmap(
                self.as_ptr() as *mut libc::c_void,
                std::mem::size_of::<libc::sem_t>(),
            );
        }
    }
}

/// A non-owning handle to a `Semaphore`'s underlying mapping.
///
/// `MAP_SHARED | MAP_ANONYMOUS` memory stays mapped at the same address in
/// a child produced by `clone` without `CLONE_VM`, so the pointer is valid
/// in both processes without any cross-process handoff. This handle carries
/// that pointer into the child side without taking over the `sem_destroy` /
/// `munmap` responsibility, which stays with the original `Semaphore` (and
/// whichever process keeps it past the handshake).
#[derive(Clone, Copy)]
pub struct SemaphoreRef(ptr::NonNull<libc::sem_t>);

unsafe impl Send for SemaphoreRef {}
unsafe impl Sync for SemaphoreRef {}

impl Semaphore {
    pub fn share(&self) -> SemaphoreRef {
        SemaphoreRef(self.inner)
    }
}

impl SemaphoreRef {
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.0.as_ptr()) } != 0 {
            return Err(Error::syscall("sem_post", Errno::last()));
        }
        Ok(())
    }

    pub fn wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.0.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = Errno::last();
            if err == Errno::EINTR {
                continue;
            }
            return Err(Error::syscall("sem_wait", err));
        }
    }
}

/// A unidirectional, close-on-exec, non-blocking byte pipe.
pub struct PipeReader(OwnedFd);
pub struct PipeWriter(OwnedFd);

/// Allocates a pipe with `O_CLOEXEC | O_NONBLOCK` on both ends.
pub fn new_pipe() -> Result<(PipeReader, PipeWriter)> {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    Ok((PipeReader(rx), PipeWriter(tx)))
}

impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsRawFd for PipeWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(self.0.as_raw_fd(), buf).map_err(io::Error::from)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        nix::unistd::write(&self.0, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocks (busy-polls on `EWOULDBLOCK`) until exactly `buf.len()` bytes have
/// been read, or returns `Ok(0)` if the writer closed before any bytes
/// arrived (EOF). Used for the handshake's error-channel reads, where the
/// pipe is non-blocking but we still need an exact-size read.
fn read_exact_or_eof(rx: &mut PipeReader, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match rx.read(&mut buf[read..]) {
            Ok(0) => return Ok(read),
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(read)
}

/// Wire format: `[i32 length little-endian][utf8 bytes]`, sentinel `-1`
/// meaning "no error, proceed".
pub fn write_ok(tx: &mut PipeWriter) -> Result<()> {
    tx.write_all(&(-1i32).to_le_bytes())?;
    Ok(())
}

pub fn write_error(tx: &mut PipeWriter, message: &str) -> Result<()> {
    let bytes = message.as_bytes();
    tx.write_all(&(bytes.len() as i32).to_le_bytes())?;
    tx.write_all(bytes)?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the sentinel ("no error") was read.
/// `Ok(Some(msg))` is a child-reported error message. An `Ok(None)` is also
/// returned if the pipe was closed without anything written (nothing to
/// report yet, e.g. the late-read in `Launcher::wait`).
pub fn read_frame(rx: &mut PipeReader) -> Result<Option<String>> {
    let mut len_buf = [0u8; 4];
    let n = read_exact_or_eof(rx, &mut len_buf)?;
    if n < 4 {
        return Ok(None);
    }
    let len = i32::from_le_bytes(len_buf);
    if len < 0 {
        return Ok(None);
    }
    let mut buf = vec![0u8; len as usize];
    let n = read_exact_or_eof(rx, &mut buf)?;
    buf.truncate(n);
    Ok(Some(String::from_utf8(buf).unwrap_or_else(|e| {
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    })))
}
