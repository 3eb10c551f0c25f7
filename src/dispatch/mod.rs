//! Dispatch threads.
//!
//! A [`DispatchPool`] owns the worker threads that run the event loop.
//! Each worker binds a thread id at startup and then iterates: flush
//! updates, wait in the poller, serve the ready caches. Timer deadlines
//! come from an optional [`ExpirySource`] supplied by the embedding
//! application; the core itself has no timers.

mod worker;

pub use worker::run_once;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::poller::waker;
use crate::{config, thread};

/// Supplies the next timer deadline bounding each poller wait.
pub trait ExpirySource: Send + Sync {
    /// Absolute deadline of the nearest timer, or `None` when idle.
    fn next_expiry(&self) -> Option<Instant>;
}

/// A set of dispatch threads running the event loop.
///
/// The pool must be created after [`crate::init`] and the poller
/// initialisation; descriptors are then driven entirely from their
/// callbacks. Dropping the pool shuts it down and joins the workers.
pub struct DispatchPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    threads: usize,
}

impl DispatchPool {
    /// Spawns one dispatch thread per configured worker.
    pub fn start(expiry: Option<Arc<dyn ExpirySource>>) -> io::Result<Self> {
        let threads = config::global().threads;
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(threads);
        for tid in 0..threads {
            let sd = shutdown.clone();
            let expiry = expiry.clone();

            let handle = std::thread::Builder::new()
                .name(format!("fdcore-{tid}"))
                .spawn(move || {
                    thread::set_tid(tid);

                    while !sd.load(Ordering::Acquire) {
                        let expire = expiry.as_ref().and_then(|e| e.next_expiry());
                        worker::run_once(expire);
                    }
                })?;

            handles.push(handle);
        }

        Ok(Self {
            handles,
            shutdown,
            threads,
        })
    }

    /// Signals every worker to stop and interrupts their poller waits.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        waker::wake_mask(thread::all_threads_mask(self.threads));
    }

    /// Waits for all workers to terminate.
    pub fn join(&mut self) {
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}
