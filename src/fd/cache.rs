//! The ready cache.
//!
//! Descriptors that are both active and ready in some direction do not
//! need the kernel at all: they sit in one of these lists and the
//! dispatch loop serves them with a zero-timeout poll. Two tiers:
//!
//! - one list per dispatch thread, fed and drained only by that
//!   thread, so it needs no lock: a descriptor lands here when the
//!   admitting thread is the single thread serving it,
//! - one global list for everything else, guarded by a reader-writer
//!   lock (readers scan at dispatch, writers splice). Shared
//!   descriptors always go here, and so does a single-threaded
//!   descriptor whose readiness is reported by some other thread.
//!
//! Lists are intrusive: the prev/next links live inside the FD entries,
//! making insertion and removal O(1) with no allocation. A descriptor
//! that is in no list carries the [`NONE`] sentinel in its next link;
//! a linked descriptor carries a tag naming the list that holds it, so
//! eviction never re-derives the list from a mask that may have
//! changed meanwhile.
//!
//! All membership changes for a given FD run under that FD's spinlock,
//! which makes admission and eviction idempotent.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::fd::{self, state, FdEntry};
use crate::poller::waker;
use crate::thread::{self, MAX_THREADS};

/// Link value of an FD that is in no list.
pub(crate) const NONE: i32 = -2;
/// Link value terminating a list.
const END: i32 = -1;
/// Tag of an FD linked into the global list; per-thread lists are
/// tagged with the thread id.
pub(crate) const TAG_GLOBAL: i32 = -1;

pub(crate) struct ReadyList {
    first: AtomicI32,
    last: AtomicI32,
}

impl ReadyList {
    const fn new() -> Self {
        Self {
            first: AtomicI32::new(END),
            last: AtomicI32::new(END),
        }
    }

    fn is_empty(&self) -> bool {
        self.first.load(Ordering::SeqCst) == END
    }
}

static GLOBAL: ReadyList = ReadyList::new();
static GLOBAL_LOCK: RwLock<()> = RwLock::new(());
static LOCAL: [ReadyList; MAX_THREADS] = [const { ReadyList::new() }; MAX_THREADS];

/// Threads with pending cache work, used by the dispatch loop to poll
/// with a zero timeout instead of blocking.
static CACHE_MASK: AtomicU64 = AtomicU64::new(0);

/// Re-evaluates cache membership of `fd` after a state change. Must be
/// called with the FD's spinlock held.
pub(crate) fn update(fd: RawFd, e: &FdEntry) {
    let st = e.state.load(Ordering::SeqCst);

    let wanted = (st & (state::ACTIVE_R | state::READY_R)) == (state::ACTIVE_R | state::READY_R)
        || (st & (state::ACTIVE_W | state::READY_W)) == (state::ACTIVE_W | state::READY_W);

    if wanted {
        alloc_entry(fd, e);
    } else {
        release_entry(fd, e);
    }
}

/// Admits `fd` to a ready list. Idempotent. The calling thread's own
/// list is used only when that thread is the single thread serving the
/// FD; every other admission goes through the locked global list, so
/// no thread ever touches another thread's list.
fn alloc_entry(fd: RawFd, e: &FdEntry) {
    if e.cache_next.load(Ordering::Relaxed) != NONE {
        return;
    }

    let mask = e.thread_mask.load(Ordering::SeqCst);
    if mask == 0 {
        return;
    }

    if mask == thread::tid_bit() {
        let t = thread::tid();
        push(&LOCAL[t], fd, e);
        e.cache_tag.store(t as i32, Ordering::SeqCst);
    } else {
        let _guard = GLOBAL_LOCK.write();
        push(&GLOBAL, fd, e);
        e.cache_tag.store(TAG_GLOBAL, Ordering::SeqCst);
    }

    CACHE_MASK.fetch_or(mask, Ordering::SeqCst);
    waker::wake_mask(mask & !thread::tid_bit());
}

/// Evicts `fd` from the list its tag names. Idempotent. Entries tagged
/// with a thread id are only ever released on that thread, where both
/// servicing and the transitions of a single-threaded FD run.
pub(crate) fn release_entry(fd: RawFd, e: &FdEntry) {
    if e.cache_next.load(Ordering::Relaxed) == NONE {
        return;
    }

    match e.cache_tag.load(Ordering::SeqCst) {
        TAG_GLOBAL => {
            let _guard = GLOBAL_LOCK.write();
            remove(&GLOBAL, fd, e);
        }
        t => remove(&LOCAL[t as usize], fd, e),
    }
}

fn push(list: &ReadyList, fd: RawFd, e: &FdEntry) {
    let tail = list.last.load(Ordering::SeqCst);

    e.cache_prev.store(tail, Ordering::SeqCst);
    e.cache_next.store(END, Ordering::SeqCst);

    if tail == END {
        list.first.store(fd, Ordering::SeqCst);
    } else {
        fd::entry(tail).cache_next.store(fd, Ordering::SeqCst);
    }
    list.last.store(fd, Ordering::SeqCst);
}

fn remove(list: &ReadyList, fd: RawFd, e: &FdEntry) {
    let next = e.cache_next.load(Ordering::SeqCst);
    if next == NONE {
        return;
    }
    let prev = e.cache_prev.load(Ordering::SeqCst);

    if prev == END {
        list.first.store(next, Ordering::SeqCst);
    } else {
        fd::entry(prev).cache_next.store(next, Ordering::SeqCst);
    }

    if next == END {
        list.last.store(prev, Ordering::SeqCst);
    } else {
        fd::entry(next).cache_prev.store(prev, Ordering::SeqCst);
    }

    e.cache_next.store(NONE, Ordering::SeqCst);
    e.cache_prev.store(NONE, Ordering::SeqCst);
}

/// True if `fd` currently sits in a ready list.
pub(crate) fn contains(e: &FdEntry) -> bool {
    e.cache_next.load(Ordering::Relaxed) != NONE
}

/// Copies the calling thread's list into `out`.
pub(crate) fn snapshot_local(t: usize, out: &mut Vec<RawFd>) {
    walk(&LOCAL[t], out);
}

/// Copies the global list into `out` under the read lock. Returns
/// `false` without touching `out` when the lock is contended; the next
/// tick retries.
pub(crate) fn snapshot_global(out: &mut Vec<RawFd>) -> bool {
    match GLOBAL_LOCK.try_read() {
        Some(_guard) => {
            walk(&GLOBAL, out);
            true
        }
        None => false,
    }
}

fn walk(list: &ReadyList, out: &mut Vec<RawFd>) {
    let mut cur = list.first.load(Ordering::SeqCst);
    while cur >= 0 {
        out.push(cur);
        cur = fd::entry(cur).cache_next.load(Ordering::SeqCst);
    }
}

pub(crate) fn local_nonempty(t: usize) -> bool {
    !LOCAL[t].is_empty()
}

/// True if the global list holds an entry thread `t` may service.
/// Errs on the side of "yes" when the lock is contended; the next tick
/// settles it.
pub(crate) fn global_has_eligible(t: usize) -> bool {
    let Some(_guard) = GLOBAL_LOCK.try_read() else {
        return true;
    };

    let bit = 1u64 << t;
    let mut cur = GLOBAL.first.load(Ordering::SeqCst);
    while cur >= 0 {
        let e = fd::entry(cur);
        if e.thread_mask.load(Ordering::SeqCst) & bit != 0 {
            return true;
        }
        cur = e.cache_next.load(Ordering::SeqCst);
    }
    false
}

/// True if the dispatch loop of thread `t` has cache work to do.
pub(crate) fn has_work(t: usize) -> bool {
    CACHE_MASK.load(Ordering::SeqCst) & (1u64 << t) != 0 || local_nonempty(t)
}

/// Mask of threads with (or responsible for) pending cache work.
pub(crate) fn mask() -> u64 {
    CACHE_MASK.load(Ordering::SeqCst)
}

pub(crate) fn clear_thread(t: usize) {
    CACHE_MASK.fetch_and(!(1u64 << t), Ordering::SeqCst);
}

pub(crate) fn set_thread(t: usize) {
    CACHE_MASK.fetch_or(1u64 << t, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::{self, state};
    use std::os::unix::io::RawFd;
    use std::sync::atomic::Ordering;

    fn force_state(fd: RawFd, st: u8) {
        fd::entry(fd).state.store(st, Ordering::SeqCst);
    }

    fn force_mask(fd: RawFd, mask: u64) {
        fd::entry(fd).thread_mask.store(mask, Ordering::SeqCst);
    }

    fn sync_cache(fd: RawFd) {
        let e = fd::entry(fd);
        let _g = e.inner.lock();
        update(fd, e);
    }

    fn local_fds(t: usize) -> Vec<RawFd> {
        let mut v = Vec::new();
        snapshot_local(t, &mut v);
        v
    }

    fn global_fds() -> Vec<RawFd> {
        let mut v = Vec::new();
        assert!(snapshot_global(&mut v));
        v
    }

    #[test]
    fn own_single_thread_fd_goes_to_local_list() {
        crate::test_init();
        let _serial = crate::TEST_SERIAL.lock();

        // this test thread runs as thread 0 and owns the FD
        let fd = 510;
        force_mask(fd, 0b1);
        force_state(fd, state::ACTIVE_R | state::READY_R);
        sync_cache(fd);

        assert!(local_fds(0).contains(&fd));
        assert!(!global_fds().contains(&fd));
        assert!(mask() & 0b1 != 0);

        force_state(fd, state::ACTIVE_R);
        sync_cache(fd);
        assert!(!local_fds(0).contains(&fd));
        clear_thread(0);
    }

    #[test]
    fn foreign_single_thread_admission_routes_to_global_list() {
        crate::test_init();
        let _serial = crate::TEST_SERIAL.lock();

        // owned by thread 2, admitted from this thread (thread 0):
        // thread 2's unlocked list must not be touched
        let fd = 515;
        force_mask(fd, 1 << 2);
        force_state(fd, state::ACTIVE_R | state::READY_R);
        sync_cache(fd);

        assert!(global_fds().contains(&fd));
        assert!(local_fds(2).is_empty());
        assert!(mask() & (1 << 2) != 0);

        force_state(fd, 0);
        sync_cache(fd);
        assert!(!global_fds().contains(&fd));
        clear_thread(2);
    }

    #[test]
    fn shared_fd_goes_to_global_list() {
        crate::test_init();
        let _serial = crate::TEST_SERIAL.lock();

        let fd = 511;
        force_mask(fd, 0b11);
        force_state(fd, state::ACTIVE_W | state::READY_W);
        sync_cache(fd);

        assert!(global_fds().contains(&fd));
        assert!(!local_fds(0).contains(&fd));
        assert!(!local_fds(1).contains(&fd));

        force_state(fd, 0);
        sync_cache(fd);
        assert!(!global_fds().contains(&fd));
        clear_thread(0);
        clear_thread(1);
    }

    #[test]
    fn admission_is_idempotent_and_fifo() {
        crate::test_init();
        let _serial = crate::TEST_SERIAL.lock();

        for fd in [512, 513, 514] {
            force_mask(fd, 0b1);
            force_state(fd, state::ACTIVE_R | state::READY_R);
            sync_cache(fd);
            sync_cache(fd);
        }

        assert_eq!(local_fds(0), vec![512, 513, 514]);

        // removing from the middle keeps the neighbours linked
        force_state(513, 0);
        sync_cache(513);
        assert_eq!(local_fds(0), vec![512, 514]);

        for fd in [512, 514] {
            force_state(fd, 0);
            sync_cache(fd);
        }
        assert!(local_fds(0).is_empty());
        clear_thread(0);
    }
}
