//! Session orchestration.
//!
//! A [`Session`] acquires its resources in a fixed order (remote channel,
//! raw mode, window-change watcher), relays bytes until either side ends,
//! and releases them in reverse order on every exit path.

mod event_loop;

use std::fmt;
use std::io::{Read, Write};
use std::os::fd::AsFd;

use tracing::{debug, info, warn};

use crate::daemon::{Daemon, SessionTarget, WindowSize};
use crate::demux::Demuxer;
use crate::error::{DaemonError, Result};
use crate::resize::ResizeWatcher;
use crate::stream::{RelayStream, Stream};
use crate::terminal::{self, Terminal};
use crate::termination::TerminationWatcher;

use event_loop::EventLoop;

/// Lifecycle of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No resources acquired.
    Idle,
    /// Remote channel open; terminal mode not yet changed.
    Attached,
    /// Raw mode and resize forwarding active; bytes flowing.
    Relaying,
    /// One side ended or failed; releasing resources.
    Closing,
    /// Everything released.
    Closed,
}

impl SessionState {
    const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Attached | Self::Closed)
                | (Self::Attached, Self::Relaying | Self::Closing)
                | (Self::Relaying, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Attached => "attached",
            Self::Relaying => "relaying",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One relay of the local terminal to a remote session.
#[derive(Debug)]
pub struct Session<'d, D: Daemon> {
    daemon: &'d D,
    target: SessionTarget,
    state: SessionState,
}

impl<'d, D: Daemon> Session<'d, D> {
    pub const fn new(daemon: &'d D, target: SessionTarget) -> Self {
        Self {
            daemon,
            target,
            state: SessionState::Idle,
        }
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Relay `input` and `output` to the remote session until either side
    /// reaches end-of-stream. The session is `Closed` afterwards whether or
    /// not an error is returned.
    pub fn run<I, O>(&mut self, input: I, output: O) -> Result<()>
    where
        I: Read + AsFd,
        O: Write + AsFd,
    {
        let result = self.attach_and_relay(input, output);
        match self.state {
            SessionState::Closed => {}
            SessionState::Idle | SessionState::Closing => self.advance(SessionState::Closed),
            SessionState::Attached | SessionState::Relaying => {
                self.advance(SessionState::Closing);
                self.advance(SessionState::Closed);
            }
        }
        if let Err(e) = &result {
            warn!(session = %self.target, error = %e, "Relay ended with error");
        }
        result
    }

    fn attach_and_relay<I, O>(&mut self, input: I, output: O) -> Result<()>
    where
        I: Read + AsFd,
        O: Write + AsFd,
    {
        let info = self.daemon.session_info(&self.target)?;
        if !info.fully_attached() {
            info!(
                session = %self.target,
                stdin = info.stdin,
                stdout = info.stdout,
                stderr = info.stderr,
                "Not all standard streams are attached, nothing to relay"
            );
            return Ok(());
        }

        let channel = self.daemon.attach(&self.target)?;
        let stream = Stream::nonblocking(channel)?;
        let mut remote: Box<dyn RelayStream + '_> = if info.tty {
            Box::new(stream)
        } else {
            Box::new(Demuxer::new(stream))
        };
        self.advance(SessionState::Attached);
        debug!(session = %self.target, tty = info.tty, "Remote channel attached");

        let raw = terminal::should_be_raw(input.as_fd(), output.as_fd(), info.tty);
        let result = self.relay_attached(&mut *remote, raw, input, output);

        if self.state != SessionState::Closing {
            self.advance(SessionState::Closing);
        }
        remote.close();
        debug!(session = %self.target, "Remote channel closed");
        self.advance(SessionState::Closed);
        result
    }

    /// Everything between attach and remote close. Locals drop in reverse
    /// acquisition order: watcher, then raw mode, then the local streams,
    /// then the termination trap.
    fn relay_attached<I, O>(
        &mut self,
        remote: &mut dyn RelayStream,
        raw: bool,
        input: I,
        output: O,
    ) -> Result<()>
    where
        I: Read + AsFd,
        O: Write + AsFd,
    {
        let _termination = TerminationWatcher::install()?;
        let input_fd = input.as_fd().try_clone_to_owned()?;
        let output_fd = output.as_fd().try_clone_to_owned()?;
        let mut local_in = Stream::nonblocking(input)?;
        let mut local_out = Stream::nonblocking(output)?;

        let mut terminal = Terminal::new(input_fd);
        let raw_mode = if raw {
            Some(terminal.raw_mode()?)
        } else {
            None
        };

        let daemon = self.daemon;
        let target = self.target.clone();
        let mut watcher = ResizeWatcher::new(output_fd.as_fd());
        if raw {
            watcher.start(|size| resize_remote(daemon, &target, size))?;
        }

        self.advance(SessionState::Relaying);
        let result =
            EventLoop::new(remote, &mut local_in, &mut local_out, &mut watcher).run();
        self.advance(SessionState::Closing);

        watcher.stop();
        drop(raw_mode);
        result
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal session transition {} -> {next}",
            self.state
        );
        debug!(session = %self.target, from = %self.state, to = %next, "Session state changed");
        self.state = next;
    }
}

fn resize_remote<D: Daemon>(daemon: &D, target: &SessionTarget, size: WindowSize) {
    match daemon.resize(target, size) {
        Ok(()) => debug!(session = %target, rows = size.rows, cols = size.cols, "Resized remote pty"),
        Err(DaemonError::Unavailable(reason)) => {
            debug!(session = %target, %reason, "Remote session gone, resize ignored");
        }
        Err(e) => warn!(session = %target, error = %e, "Failed to resize remote pty"),
    }
}

/// Relay the local terminal to `target` until either side ends.
///
/// Returns `Ok(())` on clean termination, including when the remote session
/// does not have all three standard streams attached (nothing to relay).
/// Terminal mode and the window-change handler are restored before any
/// error is returned, including [`crate::RelayError::Interrupted`] when `SIGTERM`,
/// `SIGHUP` or `SIGINT` arrives mid-session.
///
/// There is no separate local error stream: remote stderr payloads are
/// written to `output` in the order they arrive, interleaved with stdout.
/// Callers that need the two apart decode the multiplexed stream
/// themselves with [`crate::FrameBuffer`].
pub fn relay<D, I, O>(daemon: &D, target: &SessionTarget, input: I, output: O) -> Result<()>
where
    D: Daemon,
    I: Read + AsFd,
    O: Write + AsFd,
{
    Session::new(daemon, target.clone()).run(input, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use SessionState::{Attached, Closed, Closing, Idle, Relaying};

        for (from, to) in [
            (Idle, Attached),
            (Idle, Closed),
            (Attached, Relaying),
            (Attached, Closing),
            (Relaying, Closing),
            (Closing, Closed),
        ] {
            assert!(from.can_advance_to(to), "{from} -> {to}");
        }
        for (from, to) in [
            (Idle, Relaying),
            (Relaying, Attached),
            (Relaying, Closed),
            (Closed, Idle),
            (Closing, Relaying),
        ] {
            assert!(!from.can_advance_to(to), "{from} -> {to}");
        }
    }
}
