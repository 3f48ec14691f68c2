//! Buffered, non-blocking byte channel.
//!
//! `write` only queues; `flush_step` performs one send attempt so the caller
//! can interleave flushing with readiness checks. Reads perform exactly one
//! OS-level read and are meant to follow a readiness report.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tracing::{debug, trace};

use crate::error::{RelayError, Result};

/// Upper bound on bytes returned by a single read.
pub const READ_CHUNK: usize = 4096;

/// Outcome of one read attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Bytes read from the channel.
    Data(Vec<u8>),
    /// Nothing available yet (would block, or a partial frame is buffered).
    Pending,
    /// The peer closed the channel.
    Eof,
}

/// The interface the event loop drives, shared by [`Stream`] and
/// [`crate::Demuxer`].
pub trait RelayStream {
    /// One read attempt; call only after readiness was reported.
    fn read(&mut self) -> Result<Chunk>;

    /// Queue bytes for sending.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// One send attempt. Returns the number of bytes still queued.
    fn flush_step(&mut self) -> Result<usize>;

    /// Descriptor for readiness polling; `None` once closed.
    fn file_descriptor(&self) -> Option<BorrowedFd<'_>>;

    /// Close the channel. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Decoded input is already buffered and can be read without waiting for
    /// the descriptor to become readable again.
    fn has_buffered_input(&self) -> bool {
        false
    }
}

/// A channel handle plus its pending outbound bytes.
#[derive(Debug)]
pub struct Stream<C: AsFd> {
    channel: Option<C>,
    pending: Vec<u8>,
    /// File-status flags to put back on close, set when we changed them.
    restore_flags: Option<OFlag>,
}

impl<C: AsFd> Stream<C> {
    /// Wrap a channel handle. Blocking mode is left untouched.
    pub const fn new(channel: C) -> Self {
        Self {
            channel: Some(channel),
            pending: Vec::new(),
            restore_flags: None,
        }
    }

    /// Wrap a channel handle and switch it to non-blocking mode. The original
    /// flags are restored when the stream is closed.
    pub fn nonblocking(channel: C) -> Result<Self> {
        let mut stream = Self::new(channel);
        stream.set_nonblocking()?;
        Ok(stream)
    }

    fn set_nonblocking(&mut self) -> Result<()> {
        let Some(channel) = &self.channel else {
            return Err(RelayError::ClosedStream);
        };
        let fd = channel.as_fd();
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        if !flags.contains(OFlag::O_NONBLOCK) {
            fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
            self.restore_flags = Some(flags);
        }
        Ok(())
    }

    /// Queue bytes for sending.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.channel.is_none() {
            return Err(RelayError::ClosedStream);
        }
        self.pending.extend_from_slice(data);
        Ok(())
    }

    /// Bytes queued but not yet sent.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn file_descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.channel.as_ref().map(AsFd::as_fd)
    }

    pub const fn is_closed(&self) -> bool {
        self.channel.is_none()
    }

    /// Close the channel handle, restoring its file-status flags first.
    pub fn close(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if let Some(flags) = self.restore_flags.take()
            && let Err(e) = fcntl(channel.as_fd(), FcntlArg::F_SETFL(flags))
        {
            debug!(error = %e, "Failed to restore descriptor flags");
        }
        if !self.pending.is_empty() {
            debug!(dropped = self.pending.len(), "Closing stream with unsent bytes");
            self.pending.clear();
        }
        drop(channel);
    }
}

impl<C: Read + AsFd> Stream<C> {
    /// Perform one read. A closed stream reads as end-of-stream.
    pub fn read(&mut self) -> Result<Chunk> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(Chunk::Eof);
        };
        let mut buf = vec![0u8; READ_CHUNK];
        match channel.read(&mut buf) {
            Ok(0) => Ok(Chunk::Eof),
            Ok(n) => {
                buf.truncate(n);
                trace!(bytes = n, "Read from channel");
                Ok(Chunk::Data(buf))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(Chunk::Pending)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<C: Write + AsFd> Stream<C> {
    /// Try to send queued bytes once. Returns how many remain queued.
    pub fn flush_step(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(RelayError::ClosedStream);
        };
        match channel.write(&self.pending) {
            Ok(n) => {
                self.pending.drain(..n);
                trace!(bytes = n, remaining = self.pending.len(), "Flushed to channel");
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.pending.len())
    }
}

impl<C: Read + Write + AsFd> RelayStream for Stream<C> {
    fn read(&mut self) -> Result<Chunk> {
        Self::read(self)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        Self::write(self, data)
    }

    fn flush_step(&mut self) -> Result<usize> {
        Self::flush_step(self)
    }

    fn file_descriptor(&self) -> Option<BorrowedFd<'_>> {
        Self::file_descriptor(self)
    }

    fn close(&mut self) {
        Self::close(self);
    }

    fn is_closed(&self) -> bool {
        Self::is_closed(self)
    }
}

impl<C: AsFd> Drop for Stream<C> {
    fn drop(&mut self) {
        self.close();
    }
}
