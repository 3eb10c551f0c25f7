//! Runtime configuration.
//!
//! A [`Config`] is handed to [`crate::init`] once, before any FD is
//! inserted, and is immutable afterwards. Defaults are derived from the
//! process environment: the FD table is sized from `RLIMIT_NOFILE` and
//! the worker count from the available parallelism.

use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::thread::MAX_THREADS;

/// Upper bound applied to the `RLIMIT_NOFILE` derived table size so a
/// process running with an unlimited rlimit does not allocate a table
/// for four billion descriptors.
const MAX_TABLE_SIZE: usize = 1 << 20;

/// Configuration of the event core.
///
/// # Examples
///
/// ```rust,ignore
/// let cfg = Config::new()
///     .max_fds(16384)
///     .threads(4);
/// fdcore::init(cfg)?;
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of slots in the FD table. Descriptors are used as direct
    /// indices, so this must exceed the highest FD the process opens.
    pub max_fds: usize,

    /// Number of dispatch threads.
    pub threads: usize,

    /// Upper bound on a single poller wait. Keeps shutdown and
    /// cross-thread admissions responsive even if a wakeup is lost.
    pub max_wait: Duration,
}

impl Config {
    /// Creates a configuration with environment-derived defaults.
    pub fn new() -> Self {
        Self {
            max_fds: default_max_fds(),
            threads: thread::available_parallelism()
                .map(|n| n.get().min(MAX_THREADS))
                .unwrap_or(1),
            max_wait: Duration::from_secs(1),
        }
    }

    /// Sets the FD table size.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn max_fds(mut self, n: usize) -> Self {
        assert!(n > 0, "max_fds must be > 0");
        self.max_fds = n;
        self
    }

    /// Sets the number of dispatch threads.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero or exceeds [`MAX_THREADS`].
    pub fn threads(mut self, n: usize) -> Self {
        assert!(n > 0, "threads must be > 0");
        assert!(n <= MAX_THREADS, "threads must be <= MAX_THREADS");
        self.threads = n;
        self
    }

    /// Sets the maximum duration of a single poller wait.
    pub fn max_wait(mut self, d: Duration) -> Self {
        self.max_wait = d;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Sizes the FD table from the soft `RLIMIT_NOFILE`, clamped to a sane
/// range when the limit is unreadable or unlimited.
fn default_max_fds() -> usize {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) };
    if rc != 0 {
        return 4096;
    }

    (rl.rlim_cur as usize).clamp(1024, MAX_TABLE_SIZE)
}

static GLOBAL: OnceCell<Config> = OnceCell::new();

/// Installs the process-wide configuration. Returns `false` when one is
/// already installed, in which case the existing one stays in effect.
pub(crate) fn set_global(cfg: Config) -> bool {
    GLOBAL.set(cfg).is_ok()
}

/// Returns the installed configuration.
///
/// # Panics
///
/// Panics if [`crate::init`] has not run yet.
pub(crate) fn global() -> &'static Config {
    GLOBAL.get().expect("fdcore::init() must be called first")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::new();
        assert!(cfg.max_fds >= 1024);
        assert!(cfg.threads >= 1 && cfg.threads <= MAX_THREADS);
    }

    #[test]
    #[should_panic(expected = "threads must be > 0")]
    fn zero_threads_panics() {
        let _ = Config::new().threads(0);
    }
}
