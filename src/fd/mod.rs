//! The FD table and descriptor lifecycle.
//!
//! One [`FdEntry`] per possible descriptor, indexed directly by FD
//! number. The entry owns the atomic state word, the owner handle and
//! I/O callback, the thread affinity and bookkeeping masks, the
//! intrusive ready-cache links and the per-FD spinlock.
//!
//! The state word is the only field written without the lock; see
//! [`state`] for its encoding and transitions. Everything else in the
//! entry is mutated under the spinlock.

pub(crate) mod cache;
pub(crate) mod lock;
mod state;
pub(crate) mod update;

pub use state::{
    active, cant_recv, cant_send, done_recv, done_send, may_recv, may_send, recv_active,
    recv_polled, recv_ready, recv_state, send_active, send_polled, send_ready, send_state,
    stop_both, stop_recv, stop_send, want_recv, want_send, ACTIVE_R, ACTIVE_RW, ACTIVE_W,
    POLLED_R, POLLED_RW, POLLED_W, READY_R, READY_RW, READY_W, STATUS,
};

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};

use once_cell::sync::OnceCell;

use crate::thread;
use lock::SpinLock;

bitflags::bitflags! {
    /// Snapshot of the events last reported by the poller for an FD.
    ///
    /// `ERR` and `HUP` are sticky: once observed they survive later
    /// reports until the descriptor is torn down, so the owner cannot
    /// miss a hangup that raced with its own I/O.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PollEvents: u8 {
        const IN  = 0x01;
        const PRI = 0x02;
        const OUT = 0x04;
        const ERR = 0x08;
        const HUP = 0x10;

        const STICKY = Self::ERR.bits() | Self::HUP.bits();
    }
}

/// Callback invoked by the dispatch loop when an FD is serviceable.
/// The callback locates its context through the owner handle and
/// performs the actual I/O, reporting `EAGAIN` back through
/// [`cant_recv`]/[`cant_send`].
pub type IoCallback = fn(RawFd);

/// Fields guarded by the per-FD spinlock.
struct FdInner {
    /// Last events reported by the poller, sticky bits preserved.
    ev: PollEvents,
    /// Opaque handle to the registrant. Not an owning reference; the
    /// registrant also knows the FD number.
    owner: Option<usize>,
    /// I/O callback. Doubles as the "slot is bound" flag.
    iocb: Option<IoCallback>,
    /// Close must break lingering so an unreachable peer cannot pin
    /// the socket in the kernel.
    linger_risk: bool,
    /// The descriptor was duplicated; kernel registrations may refer
    /// to another copy and must be rebuilt rather than modified.
    cloned: bool,
}

/// One slot of the FD table.
pub(crate) struct FdEntry {
    /// The 8-bit state word. CAS-mutated only, never under the lock.
    pub(crate) state: AtomicU8,

    /// Threads allowed to service this FD.
    pub(crate) thread_mask: AtomicU64,

    /// Threads that queued this FD on their update list since the last
    /// poller sync.
    pub(crate) update_mask: AtomicU64,

    /// Threads whose poller backend currently holds a kernel
    /// registration for this FD. Survives insert; reconciled by the
    /// next update-list drain.
    pub(crate) polled_mask: AtomicU64,

    /// Intrusive ready-cache links, plus the tag of the list currently
    /// holding the FD (a thread id, or the global marker). The tag is
    /// meaningful only while the FD is linked.
    pub(crate) cache_next: AtomicI32,
    pub(crate) cache_prev: AtomicI32,
    pub(crate) cache_tag: AtomicI32,

    pub(crate) inner: SpinLock<FdInner>,
}

impl FdEntry {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            thread_mask: AtomicU64::new(0),
            update_mask: AtomicU64::new(0),
            polled_mask: AtomicU64::new(0),
            cache_next: AtomicI32::new(cache::NONE),
            cache_prev: AtomicI32::new(cache::NONE),
            cache_tag: AtomicI32::new(cache::TAG_GLOBAL),
            inner: SpinLock::new(FdInner {
                ev: PollEvents::empty(),
                owner: None,
                iocb: None,
                linger_risk: false,
                cloned: false,
            }),
        }
    }
}

pub(crate) struct FdTable {
    entries: Box<[FdEntry]>,
}

static TABLE: OnceCell<FdTable> = OnceCell::new();

/// Allocates the process-wide FD table. Keeps an existing table if one
/// is already in place.
pub(crate) fn init_table(max_fds: usize) {
    let _ = TABLE.get_or_init(|| FdTable {
        entries: (0..max_fds).map(|_| FdEntry::new()).collect(),
    });
}

fn table() -> &'static FdTable {
    TABLE.get().expect("fdcore::init() must be called first")
}

/// Number of slots in the FD table.
pub fn max_fds() -> usize {
    table().entries.len()
}

#[inline]
pub(crate) fn entry(fd: RawFd) -> &'static FdEntry {
    &table().entries[fd as usize]
}

/// Binds `fd` to an owner, an I/O callback and a set of serving
/// threads. The slot must be unused.
///
/// The polled mask is deliberately left alone: a previous incarnation
/// of this descriptor may still be registered in the poller, and the
/// next update-list drain reconciles it.
pub fn insert(fd: RawFd, owner: usize, iocb: IoCallback, thread_mask: u64) {
    let e = entry(fd);
    let mut inner = e.inner.lock();

    debug_assert!(inner.iocb.is_none(), "double insert of fd {fd}");

    inner.owner = Some(owner);
    inner.iocb = Some(iocb);
    inner.ev = PollEvents::empty();
    inner.linger_risk = false;
    inner.cloned = false;

    e.update_mask.fetch_and(!thread::tid_bit(), Ordering::SeqCst);
    e.thread_mask.store(thread_mask, Ordering::SeqCst);
}

/// Unbinds `fd` and closes the descriptor.
pub fn delete(fd: RawFd) {
    dodelete(fd, true);
}

/// Unbinds `fd` but leaves the descriptor open, for hand-off to
/// another subsystem.
pub fn remove(fd: RawFd) {
    dodelete(fd, false);
}

fn dodelete(fd: RawFd, do_close: bool) {
    let e = entry(fd);

    // Zero the state first: a dispatcher that still sees this FD in a
    // cache snapshot will find a dead state and skip it.
    e.state.store(0, Ordering::SeqCst);

    {
        let mut inner = e.inner.lock();

        // Evict before the slot is unbound; the entry's tag names the
        // list that holds it.
        cache::release_entry(fd, e);

        if do_close && inner.linger_risk {
            set_nolinger(fd);
        }

        inner.owner = None;
        inner.iocb = None;
        inner.ev = PollEvents::empty();
        inner.linger_risk = false;
        inner.cloned = false;

        e.thread_mask.store(0, Ordering::SeqCst);
    }

    // Let the backend drop its kernel registration on the next drain.
    update::push(fd, e);

    if do_close {
        unsafe { libc::close(fd) };
    }
}

/// Forces an immediate reset on close so the kernel does not keep the
/// socket around on behalf of a connection that is already dead.
fn set_nolinger(fd: RawFd) {
    let l = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };

    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &l as *const _ as *const _,
            mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
}

/// Merges events reported by the poller into the FD's snapshot,
/// preserving sticky bits, then propagates readiness into the state
/// word. Readable covers hangups and errors so the owner always gets a
/// chance to observe them; errors wake the write side too.
pub fn update_events(fd: RawFd, evts: PollEvents) {
    let e = entry(fd);

    let ev = {
        let mut inner = e.inner.lock();
        inner.ev = (inner.ev & PollEvents::STICKY) | evts;
        inner.ev
    };

    if ev.intersects(PollEvents::IN | PollEvents::HUP | PollEvents::ERR) {
        may_recv(fd);
    }
    if ev.intersects(PollEvents::OUT | PollEvents::ERR) {
        may_send(fd);
    }
}

/// Returns the owner handle of `fd`, or `None` when the slot is
/// unbound.
pub fn owner(fd: RawFd) -> Option<usize> {
    let inner = entry(fd).inner.lock();
    if inner.iocb.is_some() {
        inner.owner
    } else {
        None
    }
}

/// Returns the current event snapshot of `fd`.
pub fn events(fd: RawFd) -> PollEvents {
    entry(fd).inner.lock().ev
}

/// Mask of threads with pending ready-cache work.
pub fn cache_mask() -> u64 {
    cache::mask()
}

/// Flags `fd` as at risk of lingering in the kernel after close.
pub fn set_linger_risk(fd: RawFd, risk: bool) {
    entry(fd).inner.lock().linger_risk = risk;
}

/// Flags `fd` as a duplicated descriptor.
pub fn set_cloned(fd: RawFd, cloned: bool) {
    entry(fd).inner.lock().cloned = cloned;
}

/// Registration probe for the poller backends: `None` when the slot is
/// unbound, otherwise whether the descriptor was duplicated.
pub(crate) fn reg_cloned(fd: RawFd) -> Option<bool> {
    let inner = entry(fd).inner.lock();
    if inner.iocb.is_some() {
        Some(inner.cloned)
    } else {
        None
    }
}

/// Callback of a cached FD, with the deliverable events re-derived
/// from the live state under the per-FD lock. Evicts the FD and
/// returns `None` when it no longer qualifies. A contended lock is not
/// waited for: the FD stays cached and the next tick retries.
pub(crate) fn cached_callback(fd: RawFd) -> Option<IoCallback> {
    let e = entry(fd);
    let mut inner = e.inner.try_lock()?;

    if !cache::contains(e) {
        return None;
    }

    let st = e.state.load(Ordering::SeqCst);
    if st == 0 {
        // torn down while snapshotted
        cache::release_entry(fd, e);
        return None;
    }

    let mut ev = inner.ev & PollEvents::STICKY;
    if (st & (ACTIVE_R | READY_R)) == (ACTIVE_R | READY_R) {
        ev |= PollEvents::IN;
    }
    if (st & (ACTIVE_W | READY_W)) == (ACTIVE_W | READY_W) {
        ev |= PollEvents::OUT;
    }
    inner.ev = ev;

    match (inner.iocb, inner.owner) {
        (Some(cb), Some(_)) if !ev.is_empty() => Some(cb),
        _ => {
            cache::release_entry(fd, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_fd: RawFd) {}

    #[test]
    fn insert_preserves_polled_mask_until_drain() {
        crate::test_init();
        let _serial = crate::TEST_SERIAL.lock();

        let fd = 600;
        insert(fd, 1, nop, 0b1);
        want_recv(fd);
        // as if a backend had armed this descriptor for thread 0
        entry(fd).polled_mask.store(0b1, Ordering::SeqCst);

        remove(fd);
        assert_eq!(entry(fd).polled_mask.load(Ordering::SeqCst), 0b1);

        // the new incarnation may still be known to the backend from
        // the previous round, so insert must not touch the mask
        insert(fd, 2, nop, 0b1);
        assert_eq!(entry(fd).polled_mask.load(Ordering::SeqCst), 0b1);
        assert_eq!(owner(fd), Some(2));

        // the next drain hands the FD to the backend, which sees no
        // polled bit and drops the stale registration
        update::drain(|fd| {
            let e = entry(fd);
            if e.state.load(Ordering::SeqCst) & POLLED_RW == 0 {
                e.polled_mask.store(0, Ordering::SeqCst);
            }
        });
        assert_eq!(entry(fd).polled_mask.load(Ordering::SeqCst), 0);

        remove(fd);
        update::drain(|_| {});
    }

    #[test]
    fn update_mask_bit_of_the_inserting_thread_is_cleared() {
        crate::test_init();
        let _serial = crate::TEST_SERIAL.lock();

        let fd = 601;
        insert(fd, 1, nop, 0b1);
        want_recv(fd); // queues the FD, sets this thread's update bit
        remove(fd);
        assert_ne!(entry(fd).update_mask.load(Ordering::SeqCst) & 0b1, 0);

        insert(fd, 2, nop, 0b1);
        assert_eq!(entry(fd).update_mask.load(Ordering::SeqCst) & 0b1, 0);

        remove(fd);
        update::drain(|_| {});
    }
}
