//! macOS/BSD `kqueue` backend.
//!
//! Mirrors the epoll backend: one kqueue per dispatch thread, the
//! thread's wakeup descriptor permanently registered for read. Filters
//! are added and deleted per direction; `EV_ADD` on an existing filter
//! updates it, so no per-filter bookkeeping is needed.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use libc::{EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_EOF, EV_ERROR};

use super::Poller;
use crate::fd::{self, update, PollEvents};
use crate::{thread, Config};

const MAX_EVENTS: usize = 256;

thread_local! {
    static EVENTS: RefCell<Vec<libc::kevent>> = RefCell::new(Vec::with_capacity(MAX_EVENTS));
}

pub(super) fn build(cfg: &Config) -> io::Result<Box<dyn Poller>> {
    Ok(Box::new(KqueuePoller::new(cfg.threads)?))
}

struct KqueuePoller {
    /// One kqueue descriptor per dispatch thread, -1 once terminated.
    kq: Box<[AtomicI32]>,
}

fn change(kq: RawFd, fd: RawFd, filter: i16, flags: u16) -> i32 {
    let mut kev: libc::kevent = unsafe { mem::zeroed() };
    kev.ident = fd as libc::uintptr_t;
    kev.filter = filter;
    kev.flags = flags;

    unsafe {
        libc::kevent(
            kq,
            &kev,
            1,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        )
    }
}

/// Creates one kqueue and registers the thread's waker in it.
fn open_instance(t: usize) -> io::Result<RawFd> {
    let kq = unsafe { libc::kqueue() };
    if kq < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Some(w) = super::waker::get(t) {
        if change(kq, w.read_fd(), EVFILT_READ, EV_ADD) != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(kq) };
            return Err(err);
        }
    }

    Ok(kq)
}

impl KqueuePoller {
    fn new(threads: usize) -> io::Result<Self> {
        let mut kq = Vec::with_capacity(threads);
        for t in 0..threads {
            kq.push(AtomicI32::new(open_instance(t)?));
        }

        Ok(Self {
            kq: kq.into_boxed_slice(),
        })
    }

    fn update_fd(&self, kq: RawFd, fd: RawFd) {
        let e = fd::entry(fd);
        let bit = thread::tid_bit();

        if fd::reg_cloned(fd).is_none() {
            if e.polled_mask.load(Ordering::SeqCst) & bit != 0 {
                change(kq, fd, EVFILT_READ, EV_DELETE);
                change(kq, fd, EVFILT_WRITE, EV_DELETE);
                e.polled_mask.fetch_and(!bit, Ordering::SeqCst);
            }
            return;
        }

        let st = e.state.load(Ordering::SeqCst);
        let mine = e.thread_mask.load(Ordering::SeqCst) & bit != 0;
        let want_r = mine && st & fd::POLLED_R != 0;
        let want_w = mine && st & fd::POLLED_W != 0;

        if want_r {
            if change(kq, fd, EVFILT_READ, EV_ADD) != 0 {
                log::warn!(
                    "kqueue: cannot register fd {fd} for read: {}",
                    io::Error::last_os_error()
                );
                super::mark_error(fd);
            }
        } else {
            // deleting an absent filter is harmless
            change(kq, fd, EVFILT_READ, EV_DELETE);
        }

        if want_w {
            if change(kq, fd, EVFILT_WRITE, EV_ADD) != 0 {
                log::warn!(
                    "kqueue: cannot register fd {fd} for write: {}",
                    io::Error::last_os_error()
                );
                super::mark_error(fd);
            }
        } else {
            change(kq, fd, EVFILT_WRITE, EV_DELETE);
        }

        if want_r || want_w {
            e.polled_mask.fetch_or(bit, Ordering::SeqCst);
        } else {
            e.polled_mask.fetch_and(!bit, Ordering::SeqCst);
        }
    }
}

impl Poller for KqueuePoller {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn wait(&self, expire: Option<Instant>, busy: bool) {
        let tid = thread::tid();
        let kq = self.kq[tid].load(Ordering::SeqCst);
        if kq < 0 {
            return;
        }

        update::drain(|fd| self.update_fd(kq, fd));

        let timeout_ms = super::wait_timeout_ms(expire, busy);
        let ts = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: (timeout_ms % 1000) as libc::c_long * 1_000_000,
        };

        EVENTS.with(|events| {
            let mut events = events.borrow_mut();
            let cap = events.capacity();

            let n = unsafe {
                libc::kevent(
                    kq,
                    std::ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    cap as i32,
                    &ts,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    log::error!("kqueue: wait failed: {err}");
                }
                return;
            }

            unsafe {
                events.set_len(n as usize);
            }

            let wake_fd = super::waker::get(tid).map(|w| w.read_fd());

            for kev in events.iter() {
                let fd = kev.ident as RawFd;

                if Some(fd) == wake_fd {
                    if let Some(w) = super::waker::get(tid) {
                        w.drain();
                    }
                    continue;
                }

                if fd::owner(fd).is_none() {
                    continue;
                }

                let mut evts = PollEvents::empty();
                match kev.filter {
                    EVFILT_READ => {
                        evts |= PollEvents::IN;
                        if kev.flags & EV_EOF != 0 {
                            evts |= PollEvents::HUP;
                        }
                    }
                    EVFILT_WRITE => {
                        evts |= PollEvents::OUT;
                        if kev.flags & EV_EOF != 0 {
                            evts |= PollEvents::HUP;
                        }
                    }
                    _ => {}
                }
                if kev.flags & EV_ERROR != 0 {
                    evts |= PollEvents::ERR;
                }

                if !evts.is_empty() {
                    fd::update_events(fd, evts);
                }
            }
        });
    }

    fn fork_recover(&self) -> bool {
        // kqueue descriptors are not inherited across fork; rebuild.
        for (t, slot) in self.kq.iter().enumerate() {
            let old = slot.load(Ordering::SeqCst);
            if old >= 0 {
                unsafe { libc::close(old) };
            }
            match open_instance(t) {
                Ok(kq) => slot.store(kq, Ordering::SeqCst),
                Err(e) => {
                    log::warn!("kqueue: fork recovery failed: {e}");
                    slot.store(-1, Ordering::SeqCst);
                    return false;
                }
            }
        }
        true
    }

    fn term(&self) {
        for slot in self.kq.iter() {
            let kq = slot.swap(-1, Ordering::SeqCst);
            if kq >= 0 {
                unsafe { libc::close(kq) };
            }
        }
    }
}
