//! Linux `epoll` backend.
//!
//! One level-triggered epoll instance per dispatch thread, so kernel
//! registrations stay thread-local and the polled mask maps one bit to
//! one instance. Each instance permanently watches its thread's wakeup
//! descriptor under a reserved token.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLLPRI, EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

use super::Poller;
use crate::fd::{self, update, PollEvents};
use crate::{thread, Config};

/// Reserved token for the per-thread wakeup descriptor. Regular tokens
/// are FD numbers, which never reach this value.
const WAKE_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 256;

thread_local! {
    static EVENTS: RefCell<Vec<epoll_event>> = RefCell::new(Vec::with_capacity(MAX_EVENTS));
}

pub(super) fn build(cfg: &Config) -> io::Result<Box<dyn Poller>> {
    Ok(Box::new(EpollPoller::new(cfg.threads)?))
}

struct EpollPoller {
    /// One epoll descriptor per dispatch thread, -1 once terminated.
    epfd: Box<[AtomicI32]>,
}

impl EpollPoller {
    fn new(threads: usize) -> io::Result<Self> {
        let mut epfd = Vec::with_capacity(threads);
        for t in 0..threads {
            epfd.push(AtomicI32::new(open_instance(t)?));
        }

        Ok(Self {
            epfd: epfd.into_boxed_slice(),
        })
    }

    /// Reconciles one update-list entry with this thread's epoll set.
    fn update_fd(&self, ep: RawFd, fd: RawFd) {
        let e = fd::entry(fd);
        let bit = thread::tid_bit();

        let cloned = match fd::reg_cloned(fd) {
            Some(c) => c,
            None => {
                // Slot was unbound. Drop any leftover registration so a
                // still-open descriptor cannot keep reporting.
                if e.polled_mask.load(Ordering::SeqCst) & bit != 0 {
                    unsafe { epoll_ctl(ep, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
                    e.polled_mask.fetch_and(!bit, Ordering::SeqCst);
                }
                return;
            }
        };

        let st = e.state.load(Ordering::SeqCst);
        let registered = e.polled_mask.load(Ordering::SeqCst) & bit != 0;
        let wanted = st & fd::POLLED_RW != 0 && e.thread_mask.load(Ordering::SeqCst) & bit != 0;

        match (registered, wanted) {
            (true, false) => {
                unsafe { epoll_ctl(ep, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
                e.polled_mask.fetch_and(!bit, Ordering::SeqCst);
            }
            (true, true) => {
                let mut ev = event_for(fd, st);
                // A duplicated descriptor may carry a registration that
                // belongs to another copy; rebuild instead of modifying.
                let rc = if cloned {
                    unsafe { epoll_ctl(ep, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
                    unsafe { epoll_ctl(ep, EPOLL_CTL_ADD, fd, &mut ev) }
                } else {
                    unsafe { epoll_ctl(ep, EPOLL_CTL_MOD, fd, &mut ev) }
                };
                if rc != 0 {
                    let err = io::Error::last_os_error();
                    // The registration may have vanished with a close
                    // of another copy of the descriptor.
                    if err.raw_os_error() == Some(libc::ENOENT)
                        && unsafe { epoll_ctl(ep, EPOLL_CTL_ADD, fd, &mut ev) } == 0
                    {
                        return;
                    }
                    log::warn!("epoll: cannot update fd {fd}: {err}");
                    e.polled_mask.fetch_and(!bit, Ordering::SeqCst);
                    super::mark_error(fd);
                }
            }
            (false, true) => {
                let mut ev = event_for(fd, st);
                if unsafe { epoll_ctl(ep, EPOLL_CTL_ADD, fd, &mut ev) } == 0 {
                    e.polled_mask.fetch_or(bit, Ordering::SeqCst);
                } else {
                    let err = io::Error::last_os_error();
                    log::warn!("epoll: cannot register fd {fd}: {err}");
                    super::mark_error(fd);
                }
            }
            (false, false) => {}
        }
    }
}

fn event_for(fd: RawFd, st: u8) -> epoll_event {
    let mut events = 0;
    if st & fd::POLLED_R != 0 {
        events |= EPOLLIN | EPOLLRDHUP;
    }
    if st & fd::POLLED_W != 0 {
        events |= EPOLLOUT;
    }

    epoll_event {
        events: events as u32,
        u64: fd as u64,
    }
}

/// Creates one epoll instance and registers the thread's waker in it.
fn open_instance(t: usize) -> io::Result<RawFd> {
    let ep = unsafe { epoll_create1(EPOLL_CLOEXEC) };
    if ep < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Some(w) = super::waker::get(t) {
        let mut ev = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { epoll_ctl(ep, EPOLL_CTL_ADD, w.read_fd(), &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(ep) };
            return Err(err);
        }
    }

    Ok(ep)
}

impl Poller for EpollPoller {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn wait(&self, expire: Option<Instant>, busy: bool) {
        let tid = thread::tid();
        let ep = self.epfd[tid].load(Ordering::SeqCst);
        if ep < 0 {
            return;
        }

        update::drain(|fd| self.update_fd(ep, fd));

        let timeout = super::wait_timeout_ms(expire, busy);

        EVENTS.with(|events| {
            let mut events = events.borrow_mut();
            let cap = events.capacity();

            let n = unsafe { epoll_wait(ep, events.as_mut_ptr(), cap as i32, timeout) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    log::error!("epoll: wait failed: {err}");
                }
                return;
            }

            unsafe {
                events.set_len(n as usize);
            }

            for ev in events.iter() {
                if ev.u64 == WAKE_TOKEN {
                    if let Some(w) = super::waker::get(tid) {
                        w.drain();
                    }
                    continue;
                }

                let fd = ev.u64 as RawFd;
                if fd::owner(fd).is_none() {
                    // stale report from a registration being torn down
                    continue;
                }

                let mut evts = PollEvents::empty();
                if ev.events & EPOLLIN as u32 != 0 {
                    evts |= PollEvents::IN;
                }
                if ev.events & EPOLLPRI as u32 != 0 {
                    evts |= PollEvents::PRI;
                }
                if ev.events & EPOLLOUT as u32 != 0 {
                    evts |= PollEvents::OUT;
                }
                if ev.events & EPOLLERR as u32 != 0 {
                    evts |= PollEvents::ERR;
                }
                if ev.events & (EPOLLHUP | EPOLLRDHUP) as u32 != 0 {
                    evts |= PollEvents::HUP;
                }

                fd::update_events(fd, evts);
            }
        });
    }

    fn fork_recover(&self) -> bool {
        for (t, slot) in self.epfd.iter().enumerate() {
            let old = slot.load(Ordering::SeqCst);
            if old >= 0 {
                unsafe { libc::close(old) };
            }
            match open_instance(t) {
                Ok(ep) => slot.store(ep, Ordering::SeqCst),
                Err(e) => {
                    log::warn!("epoll: fork recovery failed: {e}");
                    slot.store(-1, Ordering::SeqCst);
                    return false;
                }
            }
        }
        true
    }

    fn term(&self) {
        for slot in self.epfd.iter() {
            let ep = slot.swap(-1, Ordering::SeqCst);
            if ep >= 0 {
                unsafe { libc::close(ep) };
            }
        }
    }
}
