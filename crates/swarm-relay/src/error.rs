//! Relay error types.

use std::io;

use thiserror::Error;

/// Result type alias using [`RelayError`].
pub type Result<T> = std::result::Result<T, RelayError>;

/// Description fragment of the secure-transport "try again" condition.
const INCOMPLETE_OPERATION: &str = "The operation did not complete";

/// Errors surfaced by a relay session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Write attempted on a stream that was already closed.
    #[error("Stream is closed")]
    ClosedStream,

    /// Multiplexed frame header carried an unknown stream tag.
    #[error("Malformed multiplexed frame: unknown stream tag {tag:#04x}")]
    ProtocolDecode { tag: u8 },

    /// The remote daemon refused or failed an operation.
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    /// I/O error on the remote channel or a local descriptor.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A termination signal ended the session.
    #[error("Relay interrupted by {0}")]
    Interrupted(nix::sys::signal::Signal),

    /// System call failure (termios, poll, fcntl, sigaction).
    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),
}

/// Errors reported by a [`crate::Daemon`] implementation.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The remote process (or the session itself) no longer exists.
    #[error("Remote session unavailable: {0}")]
    Unavailable(String),

    /// The daemon answered with a non-success status.
    #[error("Daemon API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The daemon could not be reached or the response was unreadable.
    #[error("Daemon transport error: {0}")]
    Transport(String),
}

/// Whether `err` is a retry condition that the event loop recovers from
/// locally instead of ending the session.
pub fn is_transient_interrupt(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    ) || err.to_string().contains(INCOMPLETE_OPERATION)
}

impl RelayError {
    /// Transient variant of [`is_transient_interrupt`] lifted to relay errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(err) => is_transient_interrupt(err),
            Self::Sys(errno) => matches!(errno, nix::Error::EINTR | nix::Error::EAGAIN),
            _ => false,
        }
    }
}
