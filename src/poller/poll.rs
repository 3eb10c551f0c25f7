//! Portable `poll(2)` backend.
//!
//! The fallback when no scalable notifier is available, and the safety
//! net after a failed fork recovery: `poll` keeps no kernel object, so
//! recovery is trivial. Interest lives in two process-wide atomic
//! bitmaps (read and write, one bit per FD); every wait rebuilds the
//! `pollfd` array from the bitmaps, restricted to the calling thread's
//! descriptors.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use libc::{POLLERR, POLLHUP, POLLIN, POLLOUT, POLLPRI};

use super::Poller;
use crate::fd::{self, update, PollEvents};
use crate::{thread, Config};

thread_local! {
    static POLLFDS: RefCell<Vec<libc::pollfd>> = const { RefCell::new(Vec::new()) };
}

pub(super) fn build(cfg: &Config) -> io::Result<Box<dyn Poller>> {
    let words = cfg.max_fds.div_ceil(32);

    Ok(Box::new(PollPoller {
        rd: (0..words).map(|_| AtomicU32::new(0)).collect(),
        wr: (0..words).map(|_| AtomicU32::new(0)).collect(),
    }))
}

struct PollPoller {
    rd: Box<[AtomicU32]>,
    wr: Box<[AtomicU32]>,
}

fn bit_set(map: &[AtomicU32], fd: RawFd) {
    map[fd as usize / 32].fetch_or(1 << (fd as usize & 31), Ordering::SeqCst);
}

fn bit_clr(map: &[AtomicU32], fd: RawFd) {
    map[fd as usize / 32].fetch_and(!(1 << (fd as usize & 31)), Ordering::SeqCst);
}

fn bit_isset(map: &[AtomicU32], fd: RawFd) -> bool {
    map[fd as usize / 32].load(Ordering::SeqCst) & (1 << (fd as usize & 31)) != 0
}

impl PollPoller {
    fn update_fd(&self, fd: RawFd) {
        let e = fd::entry(fd);
        let bit = thread::tid_bit();

        if fd::reg_cloned(fd).is_none() {
            bit_clr(&self.rd, fd);
            bit_clr(&self.wr, fd);
            e.polled_mask.fetch_and(!bit, Ordering::SeqCst);
            return;
        }

        let st = e.state.load(Ordering::SeqCst);

        if st & fd::POLLED_R != 0 {
            bit_set(&self.rd, fd);
        } else {
            bit_clr(&self.rd, fd);
        }
        if st & fd::POLLED_W != 0 {
            bit_set(&self.wr, fd);
        } else {
            bit_clr(&self.wr, fd);
        }

        // Interest bitmaps are the authority here; the polled mask only
        // records which thread last reconciled this FD.
        if st & fd::POLLED_RW != 0 {
            e.polled_mask.fetch_or(bit, Ordering::SeqCst);
        } else {
            e.polled_mask.fetch_and(!bit, Ordering::SeqCst);
        }
    }
}

impl Poller for PollPoller {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn wait(&self, expire: Option<Instant>, busy: bool) {
        let tid = thread::tid();
        let bit = thread::tid_bit();

        update::drain(|fd| self.update_fd(fd));

        let timeout = super::wait_timeout_ms(expire, busy);
        let wake_fd = super::waker::get(tid).map(|w| w.read_fd());

        POLLFDS.with(|pollfds| {
            let mut pollfds = pollfds.borrow_mut();
            pollfds.clear();

            if let Some(wfd) = wake_fd {
                pollfds.push(libc::pollfd {
                    fd: wfd,
                    events: POLLIN,
                    revents: 0,
                });
            }

            for word in 0..self.rd.len() {
                let mut bits = self.rd[word].load(Ordering::SeqCst)
                    | self.wr[word].load(Ordering::SeqCst);
                while bits != 0 {
                    let fd = (word * 32 + bits.trailing_zeros() as usize) as RawFd;
                    bits &= bits - 1;

                    let e = fd::entry(fd);
                    if e.thread_mask.load(Ordering::SeqCst) & bit == 0 {
                        continue;
                    }

                    let mut events = 0;
                    if bit_isset(&self.rd, fd) {
                        events |= POLLIN;
                        #[cfg(target_os = "linux")]
                        {
                            events |= libc::POLLRDHUP;
                        }
                    }
                    if bit_isset(&self.wr, fd) {
                        events |= POLLOUT;
                    }

                    pollfds.push(libc::pollfd {
                        fd,
                        events,
                        revents: 0,
                    });
                }
            }

            let n = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    log::error!("poll: wait failed: {err}");
                }
                return;
            }

            for pfd in pollfds.iter() {
                if pfd.revents == 0 {
                    continue;
                }

                if Some(pfd.fd) == wake_fd {
                    if let Some(w) = super::waker::get(tid) {
                        w.drain();
                    }
                    continue;
                }

                if fd::owner(pfd.fd).is_none() {
                    continue;
                }

                let mut evts = PollEvents::empty();
                if pfd.revents & POLLIN != 0 {
                    evts |= PollEvents::IN;
                }
                if pfd.revents & POLLPRI != 0 {
                    evts |= PollEvents::PRI;
                }
                if pfd.revents & POLLOUT != 0 {
                    evts |= PollEvents::OUT;
                }
                if pfd.revents & POLLERR != 0 {
                    evts |= PollEvents::ERR;
                }
                if pfd.revents & POLLHUP != 0 {
                    evts |= PollEvents::HUP;
                }
                #[cfg(target_os = "linux")]
                if pfd.revents & libc::POLLRDHUP != 0 {
                    evts |= PollEvents::HUP;
                }

                fd::update_events(pfd.fd, evts);
            }
        });
    }

    fn fork_recover(&self) -> bool {
        // no kernel object to lose
        true
    }

    fn term(&self) {}
}
