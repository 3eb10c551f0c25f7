//! One iteration of the dispatch loop.
//!
//! A tick flushes the thread's update list into the poller, waits for
//! readiness (with a zero timeout when cached work is already pending),
//! then serves the ready caches: the thread's own list first, then the
//! global list for shared descriptors.
//!
//! Cache processing is single-pass: the lists are snapshotted at the
//! start of the pass and descriptors admitted while callbacks run are
//! served on the next tick, so the poller can never be starved.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::fd::{self, cache};
use crate::{poller, thread};

thread_local! {
    static SNAPSHOT: RefCell<Vec<RawFd>> = const { RefCell::new(Vec::new()) };
}

/// Runs one dispatch iteration on the calling thread: poller wait plus
/// one pass over the ready caches. `expire` is the next timer deadline
/// of the embedding application, if any.
pub fn run_once(expire: Option<Instant>) {
    let tid = thread::tid();

    if let Some(p) = poller::current() {
        let busy = cache::has_work(tid);
        p.wait(expire, busy);
    }

    process_cached_events(tid);
}

/// Serves the ready caches of thread `tid` once.
fn process_cached_events(tid: usize) {
    // The bit comes back at the end of the pass if entries remain.
    cache::clear_thread(tid);

    // The buffer is taken out of the thread-local slot for the whole
    // pass so callbacks are free to re-enter the dispatcher.
    let mut snap = SNAPSHOT.with(|s| std::mem::take(&mut *s.borrow_mut()));

    snap.clear();
    cache::snapshot_local(tid, &mut snap);
    for &fd in &snap {
        service(fd);
    }

    snap.clear();
    if cache::snapshot_global(&mut snap) {
        let bit = 1u64 << tid;
        for &fd in &snap {
            if fd::entry(fd).thread_mask.load(Ordering::SeqCst) & bit != 0 {
                service(fd);
            }
        }
    }

    snap.clear();
    SNAPSHOT.with(|s| *s.borrow_mut() = snap);

    if cache::local_nonempty(tid) || cache::global_has_eligible(tid) {
        cache::set_thread(tid);
    }
}

/// Invokes the I/O callback of one snapshotted descriptor, unless it
/// was evicted or torn down since the snapshot. The callback runs with
/// no lock held and may transition the FD, which re-queues or evicts it
/// as a side effect.
fn service(fd: RawFd) {
    if let Some(iocb) = fd::cached_callback(fd) {
        iocb(fd);
    }
}
