//! # fdcore
//!
//! **fdcore** is the file-descriptor event core of a multi-threaded
//! network proxy: the layer that tracks what every open endpoint wants
//! to do, what the kernel says it can do, and which thread should act
//! on it.
//!
//! The design centres on a per-FD 8-bit state word holding three bits
//! per direction (application intent, kernel readiness, kernel
//! registration), mutated only through lock-free compare-and-swap
//! transitions. Descriptors that are both active and ready bypass the
//! kernel entirely through a two-tier ready cache, and kernel
//! registrations are batched on per-thread update lists so the poller
//! is touched at most once per loop iteration.
//!
//! - [`fd`] — the FD table, state transitions and lifecycle
//! - [`poller`] — backend contract and registry (epoll, kqueue, poll)
//! - [`dispatch`] — the worker threads and the per-tick event loop
//!
//! ## Quick start
//!
//! ```rust,ignore
//! fn echo_ready(fd: i32) {
//!     // read until EAGAIN, then: fdcore::fd::cant_recv(fd);
//! }
//!
//! fdcore::init(fdcore::Config::new().threads(4))?;
//! assert!(fdcore::poller::init_pollers());
//!
//! fdcore::fd::insert(sock, session_id, echo_ready, 0b1);
//! fdcore::fd::want_recv(sock);
//!
//! let pool = fdcore::dispatch::DispatchPool::start(None)?;
//! ```

mod config;
mod thread;

pub mod dispatch;
pub mod fd;
pub mod poller;

pub use config::Config;
pub use thread::{tid, MAX_THREADS};

use std::io;

/// Initialises the process-wide state: the FD table and the per-thread
/// wakeup descriptors. Must run before any insert, poller
/// initialisation or dispatch. Idempotent; the first configuration
/// wins.
pub fn init(config: Config) -> io::Result<()> {
    config::set_global(config);

    let cfg = config::global();
    fd::init_table(cfg.max_fds);
    poller::waker::init(cfg.threads)?;

    Ok(())
}

#[cfg(test)]
pub(crate) static TEST_SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Shared initialisation for unit tests. Keeps the table small and the
/// worker count fixed so the tests agree on thread masks.
#[cfg(test)]
pub(crate) fn test_init() {
    let _ = init(Config::new().max_fds(1024).threads(4));
}
