//! The per-FD state word and its transitions.
//!
//! Each descriptor carries an 8-bit atomic word made of two nibbles,
//! read direction in the low one, write direction in the high one.
//! Three bits per direction:
//!
//! - `ACTIVE`: the application wants data in this direction,
//! - `READY`: the kernel recently signalled readiness,
//! - `POLLED`: the descriptor is armed in the kernel notifier.
//!
//! Transitions are lock-free compare-and-swap loops. `POLLED` is only
//! set while `ACTIVE` is set and `READY` is not: when both `ACTIVE` and
//! `READY` hold, the dispatch loop serves the descriptor straight from
//! the ready cache and no kernel registration is needed. Whenever a
//! transition flips a `POLLED` bit, the descriptor is queued on the
//! calling thread's update list so the poller reconciles its
//! registration before the next wait.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;

use crate::fd::{self, cache, update, FdEntry};

/// Application wants to read.
pub const ACTIVE_R: u8 = 0x01;
/// Kernel reported read readiness.
pub const READY_R: u8 = 0x02;
/// Read side is armed in the kernel notifier.
pub const POLLED_R: u8 = 0x04;
/// Mask of the three per-direction bits.
pub const STATUS: u8 = 0x07;

/// Application wants to write.
pub const ACTIVE_W: u8 = ACTIVE_R << 4;
/// Kernel reported write readiness.
pub const READY_W: u8 = READY_R << 4;
/// Write side is armed in the kernel notifier.
pub const POLLED_W: u8 = POLLED_R << 4;

pub const ACTIVE_RW: u8 = ACTIVE_R | ACTIVE_W;
pub const READY_RW: u8 = READY_R | READY_W;
pub const POLLED_RW: u8 = POLLED_R | POLLED_W;

const DIR_RD: u8 = 0;
const DIR_WR: u8 = 4;

/// Declares read interest. Arms the poller unless the descriptor is
/// already known to be ready.
pub fn want_recv(fd: RawFd) {
    want(fd, DIR_RD);
}

/// Declares write interest. Arms the poller unless the descriptor is
/// already known to be ready.
pub fn want_send(fd: RawFd) {
    want(fd, DIR_WR);
}

/// Withdraws read interest and disarms the read side.
pub fn stop_recv(fd: RawFd) {
    stop(fd, DIR_RD);
}

/// Withdraws write interest and disarms the write side.
pub fn stop_send(fd: RawFd) {
    stop(fd, DIR_WR);
}

/// Withdraws interest in both directions atomically.
pub fn stop_both(fd: RawFd) {
    let e = fd::entry(fd);
    let mut old = e.state.load(Ordering::Relaxed);
    let new = loop {
        if old & ACTIVE_RW == 0 {
            return;
        }
        let new = old & !(ACTIVE_RW | POLLED_RW);
        match e
            .state
            .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => break new,
            Err(cur) => old = cur,
        }
    };
    finish(fd, e, old, new);
}

/// Reports that a read attempt hit `EAGAIN`. Clears readiness and
/// re-arms the poller if the application still wants to read.
pub fn cant_recv(fd: RawFd) {
    cant(fd, DIR_RD);
}

/// Reports that a write attempt hit `EAGAIN`. Clears readiness and
/// re-arms the poller if the application still wants to write.
pub fn cant_send(fd: RawFd) {
    cant(fd, DIR_WR);
}

/// Marks the descriptor readable. Never touches the polled bit; the
/// path that observed readiness is in charge of its registration.
pub fn may_recv(fd: RawFd) {
    may(fd, DIR_RD);
}

/// Marks the descriptor writable.
pub fn may_send(fd: RawFd) {
    may(fd, DIR_WR);
}

/// Drops readiness after a short read suggested the end of available
/// data. Only meaningful while the descriptor is both polled and ready;
/// the level-triggered poller will report again if more data arrives.
pub fn done_recv(fd: RawFd) {
    done(fd, DIR_RD);
}

/// Write-side counterpart of [`done_recv`].
pub fn done_send(fd: RawFd) {
    done(fd, DIR_WR);
}

fn want(fd: RawFd, shift: u8) {
    let e = fd::entry(fd);
    let active = ACTIVE_R << shift;
    let ready = READY_R << shift;
    let polled = POLLED_R << shift;

    let mut old = e.state.load(Ordering::Relaxed);
    let new = loop {
        if old & active != 0 {
            return;
        }
        let mut new = old | active;
        if new & ready == 0 {
            new |= polled;
        }
        match e
            .state
            .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => break new,
            Err(cur) => old = cur,
        }
    };
    finish(fd, e, old, new);
}

fn stop(fd: RawFd, shift: u8) {
    let e = fd::entry(fd);
    let active = ACTIVE_R << shift;
    let polled = POLLED_R << shift;

    let mut old = e.state.load(Ordering::Relaxed);
    let new = loop {
        if old & active == 0 {
            return;
        }
        let new = old & !(active | polled);
        match e
            .state
            .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => break new,
            Err(cur) => old = cur,
        }
    };
    finish(fd, e, old, new);
}

fn cant(fd: RawFd, shift: u8) {
    let e = fd::entry(fd);
    let active = ACTIVE_R << shift;
    let ready = READY_R << shift;
    let polled = POLLED_R << shift;

    let mut old = e.state.load(Ordering::Relaxed);
    let new = loop {
        if old & ready == 0 {
            return;
        }
        let mut new = old & !ready;
        if new & active != 0 {
            new |= polled;
        }
        match e
            .state
            .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => break new,
            Err(cur) => old = cur,
        }
    };
    finish(fd, e, old, new);
}

fn may(fd: RawFd, shift: u8) {
    let e = fd::entry(fd);
    e.state.fetch_or(READY_R << shift, Ordering::SeqCst);

    let _guard = e.inner.lock();
    cache::update(fd, e);
}

fn done(fd: RawFd, shift: u8) {
    let e = fd::entry(fd);
    let active = ACTIVE_R << shift;
    let ready = READY_R << shift;
    let polled = POLLED_R << shift;

    let mut old = e.state.load(Ordering::Relaxed);
    let new = loop {
        if (old & (polled | ready)) != (polled | ready) {
            return;
        }
        let mut new = old & !ready;
        if new & active != 0 {
            new |= polled;
        }
        match e
            .state
            .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => break new,
            Err(cur) => old = cur,
        }
    };
    finish(fd, e, old, new);
}

/// Common tail of every successful transition: queue the descriptor for
/// the poller if a polled bit flipped, then re-evaluate ready-cache
/// membership under the per-FD lock.
fn finish(fd: RawFd, e: &FdEntry, old: u8, new: u8) {
    if (old ^ new) & POLLED_RW != 0 {
        update::push(fd, e);
    }

    let _guard = e.inner.lock();
    cache::update(fd, e);
}

/// Returns the read-direction status bits.
pub fn recv_state(fd: RawFd) -> u8 {
    fd::entry(fd).state.load(Ordering::SeqCst) & STATUS
}

/// Returns the write-direction status bits, shifted down into the low
/// nibble so the `ACTIVE_R`/`READY_R`/`POLLED_R` masks apply.
pub fn send_state(fd: RawFd) -> u8 {
    (fd::entry(fd).state.load(Ordering::SeqCst) >> DIR_WR) & STATUS
}

/// True if the application wants to read from `fd`.
pub fn recv_active(fd: RawFd) -> bool {
    fd::entry(fd).state.load(Ordering::SeqCst) & ACTIVE_R != 0
}

/// True if `fd` is believed readable.
pub fn recv_ready(fd: RawFd) -> bool {
    fd::entry(fd).state.load(Ordering::SeqCst) & READY_R != 0
}

/// True if the read side of `fd` is armed in the kernel notifier.
pub fn recv_polled(fd: RawFd) -> bool {
    fd::entry(fd).state.load(Ordering::SeqCst) & POLLED_R != 0
}

/// True if the application wants to write to `fd`.
pub fn send_active(fd: RawFd) -> bool {
    fd::entry(fd).state.load(Ordering::SeqCst) & ACTIVE_W != 0
}

/// True if `fd` is believed writable.
pub fn send_ready(fd: RawFd) -> bool {
    fd::entry(fd).state.load(Ordering::SeqCst) & READY_W != 0
}

/// True if the write side of `fd` is armed in the kernel notifier.
pub fn send_polled(fd: RawFd) -> bool {
    fd::entry(fd).state.load(Ordering::SeqCst) & POLLED_W != 0
}

/// True if the application wants to transfer data in either direction.
pub fn active(fd: RawFd) -> bool {
    fd::entry(fd).state.load(Ordering::SeqCst) & ACTIVE_RW != 0
}
