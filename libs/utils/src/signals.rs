use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use signal_hook::consts::{SIGHUP, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;

/// A process-local wakeup flag.
///
/// `set` may be called from any thread; a waiter returns as soon as the
/// latch is set or the timeout elapses, and the flag stays set until
/// `reset`. Main loops follow the reset-check-wait pattern so that a wakeup
/// between the check and the wait is never lost.
#[derive(Default)]
pub struct Latch {
    is_set: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut is_set = self.is_set.lock().unwrap_or_else(|e| e.into_inner());
        *is_set = true;
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        *self.is_set.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    /// Returns true if the latch was set, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.is_set.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |is_set| !*is_set)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Signals a long-running loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Reload configuration.
    Reload,
    /// Finish the current unit of work and exit cleanly.
    Terminate,
    /// Exit at once without running destructors.
    Quit,
}

/// Pending-signal flags plus the latch that wakes the loop polling them.
///
/// The flags are only ever set by the signal thread and consumed by the
/// owning loop at points of its choosing.
#[derive(Default)]
pub struct SignalLatch {
    pub latch: Latch,
    got_reload: AtomicBool,
    got_terminate: AtomicBool,
    got_quit: AtomicBool,
}

impl SignalLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a signal and wake the loop.
    pub fn raise(&self, signal: Signal) {
        let flag = match signal {
            Signal::Reload => &self.got_reload,
            Signal::Terminate => &self.got_terminate,
            Signal::Quit => &self.got_quit,
        };
        flag.store(true, Ordering::SeqCst);
        self.latch.set();
    }

    /// Take the most urgent pending signal, clearing its flag.
    pub fn take_pending(&self) -> Option<Signal> {
        if self.got_quit.swap(false, Ordering::SeqCst) {
            Some(Signal::Quit)
        } else if self.got_terminate.swap(false, Ordering::SeqCst) {
            Some(Signal::Terminate)
        } else if self.got_reload.swap(false, Ordering::SeqCst) {
            Some(Signal::Reload)
        } else {
            None
        }
    }

    /// Install HUP/TERM/QUIT handlers feeding this latch.
    ///
    /// signal-hook's iterator does the async-signal-safe part; a small
    /// thread translates deliveries into flags.
    pub fn install_handlers(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut signals = Signals::new([SIGHUP, SIGTERM, SIGQUIT])?;
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("signal latch".into())
            .spawn(move || {
                for signo in signals.forever() {
                    let signal = match signo {
                        SIGHUP => Signal::Reload,
                        SIGTERM => Signal::Terminate,
                        SIGQUIT => Signal::Quit,
                        _ => continue,
                    };
                    info!("received signal {signo}, raising {signal:?}");
                    this.raise(signal);
                }
            })?;
        Ok(())
    }
}

/// Leave the process immediately, skipping destructors and atexit hooks.
pub fn exit_immediately(code: i32) -> ! {
    // SAFETY: `_exit` takes no pointers and never returns.
    unsafe { nix::libc::_exit(code) }
}
