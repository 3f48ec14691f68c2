//! Termination requests during a relay.
//!
//! While a [`TerminationWatcher`] is held, `SIGTERM`, `SIGHUP` and `SIGINT`
//! only record which signal arrived. The relay loop checks [`requested`]
//! every time it wakes and ends through the normal teardown, so the terminal
//! mode and descriptor flags are back in place before the process exits.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, warn};

use crate::error::Result;

const TRAPPED: [Signal; 3] = [Signal::SIGTERM, Signal::SIGHUP, Signal::SIGINT];

/// Number of the last trapped signal, or 0.
static REQUESTED: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_termination(signal: libc::c_int) {
    REQUESTED.store(signal, Ordering::Release);
}

/// The termination signal received since the watcher was installed, if any.
pub fn requested() -> Option<Signal> {
    Signal::try_from(REQUESTED.load(Ordering::Acquire)).ok()
}

/// Scoped trap for termination signals; the previous handlers come back on
/// drop.
#[derive(Debug)]
pub struct TerminationWatcher {
    previous: Vec<(Signal, SigAction)>,
}

impl TerminationWatcher {
    pub fn install() -> Result<Self> {
        REQUESTED.store(0, Ordering::Release);
        // No SA_RESTART: the readiness wait must return EINTR.
        let action = SigAction::new(
            SigHandler::Handler(on_termination),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let mut watcher = Self {
            previous: Vec::with_capacity(TRAPPED.len()),
        };
        for signal in TRAPPED {
            // SAFETY: the handler only stores to an atomic, which is
            // async-signal-safe.
            #[allow(unsafe_code)]
            let previous = unsafe { sigaction(signal, &action) }?;
            watcher.previous.push((signal, previous));
        }
        debug!("Installed termination handlers");
        Ok(watcher)
    }
}

impl Drop for TerminationWatcher {
    fn drop(&mut self) {
        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: `previous` is what sigaction(2) returned when our
            // handler replaced it.
            #[allow(unsafe_code)]
            let restored = unsafe { sigaction(signal, &previous) };
            if let Err(e) = restored {
                warn!(%signal, error = %e, "Failed to restore signal handler");
            }
        }
        REQUESTED.store(0, Ordering::Release);
        debug!("Restored termination handlers");
    }
}
