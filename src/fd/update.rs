//! Per-thread update list.
//!
//! Whenever a transition flips a polled bit, the descriptor is recorded
//! here so the poller backend can reconcile its kernel registration
//! before the next wait. Membership is at-most-once per thread until
//! the list is drained, enforced by an atomic bit-test-and-set on the
//! entry's `update_mask`.

use std::cell::RefCell;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;

use crate::fd::{self, FdEntry};
use crate::thread;

thread_local! {
    static FD_UPDT: RefCell<Vec<RawFd>> = const { RefCell::new(Vec::new()) };
}

/// Queues `fd` on the calling thread's update list unless it is already
/// there. Safe to call from any state-transition path.
pub(crate) fn push(fd: RawFd, e: &FdEntry) {
    let bit = thread::tid_bit();
    if e.update_mask.fetch_or(bit, Ordering::SeqCst) & bit != 0 {
        return;
    }

    FD_UPDT.with(|l| {
        let mut list = l.borrow_mut();
        if list.capacity() == 0 {
            // An FD appears at most once per drain, so the table size
            // bounds the list and a single reservation suffices.
            list.reserve(fd::max_fds());
        }
        list.push(fd);
    });
}

/// Drains the calling thread's update list, clearing each entry's
/// update-mask bit before handing the FD to `apply`. Entries queued
/// while draining (by `apply` itself) are kept for the next drain.
pub(crate) fn drain(mut apply: impl FnMut(RawFd)) {
    let mut list = FD_UPDT.with(|l| mem::take(&mut *l.borrow_mut()));
    if list.is_empty() {
        FD_UPDT.with(|l| *l.borrow_mut() = list);
        return;
    }

    let bit = thread::tid_bit();
    for &fd in &list {
        fd::entry(fd).update_mask.fetch_and(!bit, Ordering::SeqCst);
        apply(fd);
    }
    list.clear();

    FD_UPDT.with(|l| {
        let mut cur = l.borrow_mut();
        for fd in cur.drain(..) {
            list.push(fd);
        }
        *cur = list;
    });
}

/// Number of queued updates on the calling thread.
pub(crate) fn pending() -> usize {
    FD_UPDT.with(|l| l.borrow().len())
}
