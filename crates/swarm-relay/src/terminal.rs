//! Local terminal mode control.
//!
//! [`Terminal`] snapshots the descriptor's termios the first time raw mode
//! is entered and only ever restores that snapshot. [`RawMode`] is the scoped
//! form used by the session: dropping it restores the terminal on every exit
//! path, including unwinding.

use std::io::IsTerminal;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use tracing::{debug, warn};

use crate::daemon::WindowSize;
use crate::error::Result;

/// Mode controller for one terminal descriptor.
#[derive(Debug)]
pub struct Terminal<F: AsFd> {
    fd: F,
    original: Option<Termios>,
    raw: bool,
}

impl<F: AsFd> Terminal<F> {
    pub const fn new(fd: F) -> Self {
        Self {
            fd,
            original: None,
            raw: false,
        }
    }

    pub const fn is_raw(&self) -> bool {
        self.raw
    }

    /// Switch to raw mode: no line buffering, no echo, no signal keys.
    pub fn enter(&mut self) -> Result<()> {
        if self.raw {
            return Ok(());
        }
        let original = match &self.original {
            Some(saved) => saved.clone(),
            None => {
                let saved = tcgetattr(self.fd.as_fd())?;
                self.original = Some(saved.clone());
                saved
            }
        };
        let mut raw = original;
        cfmakeraw(&mut raw);
        tcsetattr(self.fd.as_fd(), SetArg::TCSADRAIN, &raw)?;
        self.raw = true;
        debug!(fd = self.fd.as_fd().as_raw_fd(), "Entered raw mode");
        Ok(())
    }

    /// Restore the mode captured by the first [`Terminal::enter`]. No-op if
    /// raw mode was never entered.
    pub fn exit(&mut self) -> Result<()> {
        let Some(original) = &self.original else {
            return Ok(());
        };
        tcsetattr(self.fd.as_fd(), SetArg::TCSADRAIN, original)?;
        if self.raw {
            debug!(fd = self.fd.as_fd().as_raw_fd(), "Restored terminal mode");
        }
        self.raw = false;
        Ok(())
    }

    /// Enter raw mode for the lifetime of the returned guard.
    pub fn raw_mode(&mut self) -> Result<RawMode<'_, F>> {
        self.enter()?;
        Ok(RawMode { terminal: self })
    }

    /// Window size of this terminal's descriptor.
    pub fn size(&self) -> Option<WindowSize> {
        size(self.fd.as_fd())
    }
}

/// Scoped raw mode; restores the original mode on drop.
#[derive(Debug)]
pub struct RawMode<'a, F: AsFd> {
    terminal: &'a mut Terminal<F>,
}

impl<F: AsFd> Drop for RawMode<'_, F> {
    fn drop(&mut self) {
        if let Err(e) = self.terminal.exit() {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Raw mode applies only when the remote side was given a pty and both local
/// descriptors are real terminals. Piped input keeps the canonical mode.
pub fn should_be_raw(
    local_input: BorrowedFd<'_>,
    local_output: BorrowedFd<'_>,
    remote_tty: bool,
) -> bool {
    remote_tty && local_input.is_terminal() && local_output.is_terminal()
}

/// Current window size of `fd`, or `None` if it is not a terminal (or
/// reports a zero-sized window).
pub fn size(fd: BorrowedFd<'_>) -> Option<WindowSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: fd is a live descriptor borrowed for the duration of the call and
    // TIOCGWINSZ writes exactly one `winsize` into the struct we own.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &raw mut ws) };
    if ret != 0 || ws.ws_row == 0 || ws.ws_col == 0 {
        return None;
    }
    Some(WindowSize {
        rows: ws.ws_row,
        cols: ws.ws_col,
    })
}
