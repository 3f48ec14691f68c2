//! Window-change notifications for the local terminal.
//!
//! The `SIGWINCH` handler only raises a flag. The relay loop calls
//! [`ResizeWatcher::dispatch`] whenever it wakes (a signal interrupts the
//! readiness wait), so the resize callback always runs on the loop's own
//! thread between blocking operations.
//!
//! The handler that was installed before [`ResizeWatcher::start`] is saved
//! and put back by [`ResizeWatcher::stop`] (or on drop).

use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, warn};

use crate::daemon::WindowSize;
use crate::error::Result;
use crate::terminal;

static WINDOW_CHANGED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_window_change(_: libc::c_int) {
    WINDOW_CHANGED.store(true, Ordering::Release);
}

type ResizeCallback<'a> = Box<dyn FnMut(WindowSize) + 'a>;

/// Forwards local window-size changes to a callback.
pub struct ResizeWatcher<'a> {
    output: BorrowedFd<'a>,
    previous: Option<SigAction>,
    on_resize: Option<ResizeCallback<'a>>,
}

impl<'a> ResizeWatcher<'a> {
    /// Watch the window size of the terminal behind `output`.
    pub const fn new(output: BorrowedFd<'a>) -> Self {
        Self {
            output,
            previous: None,
            on_resize: None,
        }
    }

    pub const fn is_active(&self) -> bool {
        self.previous.is_some()
    }

    /// Install the window-change handler and immediately report the current
    /// size once, so the remote pty is sized before any output arrives.
    pub fn start(&mut self, on_resize: impl FnMut(WindowSize) + 'a) -> Result<()> {
        self.on_resize = Some(Box::new(on_resize));
        if self.previous.is_none() {
            WINDOW_CHANGED.store(false, Ordering::Release);
            let action = SigAction::new(
                SigHandler::Handler(on_window_change),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            // SAFETY: the handler only stores to an atomic, which is
            // async-signal-safe.
            #[allow(unsafe_code)]
            let previous = unsafe { sigaction(Signal::SIGWINCH, &action) }?;
            self.previous = Some(previous);
            debug!("Installed window-change handler");
        }
        self.fire();
        Ok(())
    }

    /// Run the callback if a window change arrived since the last call.
    /// Returns whether it ran.
    pub fn dispatch(&mut self) -> bool {
        if !self.is_active() || !WINDOW_CHANGED.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.fire();
        true
    }

    /// Put back the previously installed handler. Idempotent.
    pub fn stop(&mut self) {
        self.on_resize = None;
        let Some(previous) = self.previous.take() else {
            return;
        };
        // SAFETY: `previous` is exactly what sigaction(2) returned when we
        // installed our handler.
        #[allow(unsafe_code)]
        let restored = unsafe { sigaction(Signal::SIGWINCH, &previous) };
        match restored {
            Ok(_) => debug!("Restored previous window-change handler"),
            Err(e) => warn!(error = %e, "Failed to restore window-change handler"),
        }
    }

    fn fire(&mut self) {
        let Some(on_resize) = self.on_resize.as_mut() else {
            return;
        };
        match terminal::size(self.output) {
            Some(size) => on_resize(size),
            None => debug!("Local window size unavailable, skipping resize"),
        }
    }
}

impl fmt::Debug for ResizeWatcher<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResizeWatcher")
            .field("output", &self.output)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Drop for ResizeWatcher<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}
