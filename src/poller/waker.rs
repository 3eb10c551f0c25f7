//! Per-thread poller wakeups.
//!
//! Each dispatch thread owns a wakeup descriptor that its poller
//! backend keeps registered under a reserved token. Writing to it makes
//! a blocking wait return immediately, which is how ready-cache
//! admissions reach threads parked in the kernel.
//!
//! An `eventfd` is used on Linux, a non-blocking pipe elsewhere.

use std::io;
use std::os::unix::io::RawFd;

use once_cell::sync::OnceCell;

/// A single thread's wakeup descriptor pair. On Linux both ends are
/// the same eventfd.
pub(crate) struct Waker {
    rfd: RawFd,
    wfd: RawFd,
}

impl Waker {
    #[cfg(target_os = "linux")]
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { rfd: fd, wfd: fd })
    }

    #[cfg(not(target_os = "linux"))]
    fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self {
            rfd: fds[0],
            wfd: fds[1],
        })
    }

    /// The end a poller backend should watch for readability.
    pub(crate) fn read_fd(&self) -> RawFd {
        self.rfd
    }

    /// Interrupts the owning thread's poller wait. Short writes and
    /// full pipes are fine; the wakeup is already pending then.
    pub(crate) fn wake(&self) {
        #[cfg(target_os = "linux")]
        let (buf, len): (u64, usize) = (1, 8);
        #[cfg(not(target_os = "linux"))]
        let (buf, len): (u8, usize) = (1, 1);

        unsafe {
            libc::write(self.wfd, &buf as *const _ as *const _, len);
        }
    }

    /// Consumes pending wakeups so a level-triggered poller stops
    /// reporting the descriptor.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.rfd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.rfd);
            if self.wfd != self.rfd {
                libc::close(self.wfd);
            }
        }
    }
}

static WAKERS: OnceCell<Box<[Waker]>> = OnceCell::new();

/// Allocates one waker per dispatch thread. Idempotent.
pub(crate) fn init(threads: usize) -> io::Result<()> {
    if WAKERS.get().is_some() {
        return Ok(());
    }
    let wakers = (0..threads).map(|_| Waker::new()).collect::<io::Result<Vec<_>>>()?;
    let _ = WAKERS.set(wakers.into_boxed_slice());
    Ok(())
}

pub(crate) fn get(t: usize) -> Option<&'static Waker> {
    WAKERS.get().and_then(|w| w.get(t))
}

/// Wakes every thread whose bit is set in `mask`.
pub(crate) fn wake_mask(mask: u64) {
    let Some(wakers) = WAKERS.get() else {
        return;
    };

    let mut m = mask;
    while m != 0 {
        let t = m.trailing_zeros() as usize;
        m &= m - 1;
        if let Some(w) = wakers.get(t) {
            w.wake();
        }
    }
}
