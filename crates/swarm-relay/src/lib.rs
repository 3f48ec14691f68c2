//! `swarm` relay core
//!
//! Lets the local terminal become the terminal of a remote, already-running
//! process reached through a remote daemon:
//! - [`Stream`]: buffered non-blocking byte channel for a readiness loop
//! - [`Demuxer`]: decodes the daemon's stdout/stderr framing on top of a `Stream`
//! - [`Terminal`]: scoped raw mode with guaranteed restoration
//! - [`ResizeWatcher`]: window-change notifications forwarded to the session
//! - [`TerminationWatcher`]: turns termination signals into an orderly close
//! - [`relay`]: the session orchestrator and half-duplex event loop

pub mod daemon;
pub mod demux;
pub mod error;
pub mod resize;
pub mod session;
pub mod stream;
pub mod terminal;
pub mod termination;

pub use daemon::{Daemon, SessionInfo, SessionTarget, WindowSize};
pub use demux::{Demuxer, Frame, FrameBuffer, StreamKind};
pub use error::{DaemonError, RelayError, Result, is_transient_interrupt};
pub use resize::ResizeWatcher;
pub use session::{Session, SessionState, relay};
pub use stream::{Chunk, RelayStream, Stream};
pub use terminal::Terminal;
pub use termination::TerminationWatcher;
