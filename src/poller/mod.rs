//! Poller backends.
//!
//! A backend adapts one kernel readiness notifier to a narrow contract:
//! drain the calling thread's update list into kernel registrations,
//! block until readiness, a timer deadline or a wakeup, and report what
//! the kernel saw through [`crate::fd::update_events`]. The core only
//! assumes level-triggered semantics.
//!
//! Backends register with a preference; [`init_pollers`] keeps the
//! first one that comes up. A backend that cannot survive a fork is
//! torn down by [`fork_poller`] and the next-best one takes over.

pub(crate) mod waker;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
mod kqueue;
mod poll;

use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::fd::{self, PollEvents};
use crate::{config, Config};

/// Contract implemented by every poller backend.
///
/// One instance serves all dispatch threads; implementations keep one
/// kernel object per thread so registrations stay thread-local. All
/// methods except `term` may be called concurrently from dispatch
/// threads. `term` runs after the dispatchers have joined.
pub trait Poller: Send + Sync {
    /// Backend name, as listed by [`list_pollers`].
    fn name(&self) -> &'static str;

    /// Drains the calling thread's update list into kernel
    /// registrations, then waits for readiness up to `expire` (bounded
    /// by the configured maximum wait). With `busy` set the wait
    /// degenerates to a non-blocking check because cached work is
    /// already pending.
    fn wait(&self, expire: Option<Instant>, busy: bool);

    /// Rebuilds kernel state after a fork. Returns `false` when the
    /// backend cannot recover, in which case it is disabled and the
    /// next registered backend is initialised instead.
    fn fork_recover(&self) -> bool;

    /// Releases kernel objects. Called once, after dispatch stops.
    fn term(&self);
}

/// Constructor signature for backend registration.
pub type PollerBuild = fn(&Config) -> io::Result<Box<dyn Poller>>;

struct Backend {
    name: &'static str,
    pref: u32,
    build: PollerBuild,
    disabled: bool,
}

static REGISTRY: Mutex<Vec<Backend>> = Mutex::new(Vec::new());
static CURRENT: RwLock<Option<Arc<dyn Poller>>> = RwLock::new(None);

/// Registers a poller backend. Higher preference wins. Built-in
/// backends register themselves on the first call to [`init_pollers`]
/// with preferences 300 (epoll/kqueue) and 200 (poll).
pub fn register_poller(name: &'static str, pref: u32, build: PollerBuild) {
    REGISTRY.lock().push(Backend {
        name,
        pref,
        build,
        disabled: false,
    });
}

fn ensure_builtins(regs: &mut Vec<Backend>) {
    if regs.iter().any(|b| b.name == "poll") {
        return;
    }

    #[cfg(target_os = "linux")]
    regs.push(Backend {
        name: "epoll",
        pref: 300,
        build: epoll::build,
        disabled: false,
    });

    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
    regs.push(Backend {
        name: "kqueue",
        pref: 300,
        build: kqueue::build,
        disabled: false,
    });

    regs.push(Backend {
        name: "poll",
        pref: 200,
        build: poll::build,
        disabled: false,
    });
}

/// Initialises the best available poller. Backends are tried in
/// decreasing preference order; the first whose constructor succeeds
/// becomes the active one. Returns `false` when none works.
pub fn init_pollers() -> bool {
    let cfg = config::global();

    let mut regs = REGISTRY.lock();
    ensure_builtins(&mut regs);
    regs.sort_by(|a, b| b.pref.cmp(&a.pref));

    for b in regs.iter().filter(|b| !b.disabled) {
        match (b.build)(cfg) {
            Ok(p) => {
                log::debug!("poller: using {}", b.name);
                *CURRENT.write() = Some(Arc::from(p));
                return true;
            }
            Err(e) => {
                log::warn!("poller: {} failed to initialise: {}", b.name, e);
            }
        }
    }

    log::error!("poller: no working backend");
    false
}

/// Tears down the active poller.
pub fn deinit_pollers() {
    if let Some(p) = CURRENT.write().take() {
        p.term();
    }
}

/// Excludes a backend by name from future initialisation. The active
/// poller is not affected until it is re-initialised.
pub fn disable_poller(name: &str) {
    let mut regs = REGISTRY.lock();
    ensure_builtins(&mut regs);
    for b in regs.iter_mut() {
        if b.name == name {
            b.disabled = true;
        }
    }
}

/// Writes the registered backends to `out`, flagging the active one.
pub fn list_pollers(out: &mut dyn Write) -> io::Result<()> {
    let active = current().map(|p| p.name());

    let mut regs = REGISTRY.lock();
    ensure_builtins(&mut regs);

    for b in regs.iter() {
        writeln!(
            out,
            "{} {} (pref={}){}",
            if Some(b.name) == active { '*' } else { ' ' },
            b.name,
            b.pref,
            if b.disabled { " [disabled]" } else { "" },
        )?;
    }
    Ok(())
}

/// Recovers polling after a fork. Asks the active backend to rebuild
/// its kernel state; if it cannot, it is terminated and disabled and
/// the remaining backends are tried. On success every descriptor's
/// polled mask is wiped and active descriptors are queued on the
/// calling thread's update list so the fresh kernel objects are
/// repopulated.
pub fn fork_poller() -> bool {
    let recovered = match current() {
        Some(p) => {
            if p.fork_recover() {
                true
            } else {
                log::warn!("poller: {} cannot recover from fork, falling back", p.name());
                p.term();
                disable_poller(p.name());
                *CURRENT.write() = None;
                init_pollers()
            }
        }
        None => init_pollers(),
    };

    if recovered {
        reset_polling_state();
    }
    recovered
}

/// Forgets every kernel registration and schedules re-arming of all
/// active descriptors.
fn reset_polling_state() {
    for fd in 0..fd::max_fds() as i32 {
        let e = fd::entry(fd);
        e.polled_mask.store(0, Ordering::SeqCst);
        if e.state.load(Ordering::SeqCst) & fd::ACTIVE_RW != 0 {
            fd::update::push(fd, e);
        }
    }
}

pub(crate) fn current() -> Option<Arc<dyn Poller>> {
    CURRENT.read().clone()
}

/// Converts an absolute deadline into a millisecond timeout for the
/// kernel, clamped by the configured maximum wait. `busy` requests a
/// non-blocking check.
pub(crate) fn wait_timeout_ms(expire: Option<Instant>, busy: bool) -> i32 {
    if busy {
        return 0;
    }

    let max = config::global().max_wait;
    let d = match expire {
        Some(t) => t.saturating_duration_since(Instant::now()).min(max),
        None => max,
    };

    d.as_millis().min(i32::MAX as u128) as i32
}

/// Marks a descriptor errored after a failed kernel registration so
/// its owner observes the condition and tears it down.
pub(crate) fn mark_error(fd: i32) {
    fd::update_events(fd, PollEvents::ERR);
}
