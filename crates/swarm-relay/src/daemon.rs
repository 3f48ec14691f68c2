//! Interface to the remote control daemon.
//!
//! The relay only needs three things from the daemon: session metadata, a
//! raw attached channel, and pty resizing. Everything else (container
//! lifecycle, exec creation) lives with the callers.

use std::fmt;
use std::io::{Read, Write};
use std::os::fd::AsFd;

use crate::error::DaemonError;

/// A remote session the local terminal can be relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// An exec instance, by exec id.
    Exec(String),
    /// A running container's main process, by id or name.
    Container(String),
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec(id) => write!(f, "exec {id}"),
            Self::Container(id) => write!(f, "container {id}"),
        }
    }
}

/// Remote session metadata relevant to relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionInfo {
    /// A pseudo-terminal was allocated for the remote process.
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl SessionInfo {
    /// All three standard streams are attached.
    pub const fn fully_attached(&self) -> bool {
        self.stdin && self.stdout && self.stderr
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Remote daemon operations consumed by the relay.
pub trait Daemon {
    /// Socket-like handle of an attached session.
    type Channel: Read + Write + AsFd;

    /// Whether the session has a pty and which streams are attached.
    fn session_info(&self, target: &SessionTarget) -> Result<SessionInfo, DaemonError>;

    /// Open the attached byte stream. Multiplexed unless a pty was allocated.
    fn attach(&self, target: &SessionTarget) -> Result<Self::Channel, DaemonError>;

    /// Resize the remote pty. Fails with [`DaemonError::Unavailable`] once
    /// the remote process has exited.
    fn resize(&self, target: &SessionTarget, size: WindowSize) -> Result<(), DaemonError>;
}
