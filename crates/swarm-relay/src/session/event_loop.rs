//! Half-duplex readiness loop.
//!
//! The remote channel alternates between two phases and is never watched
//! for readability and writability at the same time:
//!
//! - `Receive`: wait for remote bytes, copy them to local output, then
//!   switch to `Send`.
//! - `Send`: wait for the remote to accept data, forward one chunk of local
//!   input, then switch back to `Receive`.
//!
//! Local input readiness is latched so the loop never spins on an input
//! descriptor it is not ready to consume, and a `Send` phase with no input
//! waiting falls straight back to `Receive`.

use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::resize::ResizeWatcher;
use crate::stream::{Chunk, RelayStream, Stream};
use crate::termination;

/// Periodic wake so the loop notices external changes; carries no protocol
/// meaning.
const WAKE_INTERVAL_MS: u16 = 60_000;

const HANGUP: PollFlags = PollFlags::POLLHUP
    .union(PollFlags::POLLERR)
    .union(PollFlags::POLLNVAL);

/// Which readiness the remote channel is currently watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Receive,
    Send,
}

impl Phase {
    pub(crate) const fn remote_interest(self) -> PollFlags {
        match self {
            Self::Receive => PollFlags::POLLIN,
            Self::Send => PollFlags::POLLOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pumped {
    Delivered,
    Nothing,
    Closed,
}

/// Something with an outbound buffer that can be flushed in steps.
trait Outbound {
    fn flush_step(&mut self) -> Result<usize>;
    fn file_descriptor(&self) -> Option<BorrowedFd<'_>>;
}

impl<C: Write + AsFd> Outbound for Stream<C> {
    fn flush_step(&mut self) -> Result<usize> {
        Self::flush_step(self)
    }

    fn file_descriptor(&self) -> Option<BorrowedFd<'_>> {
        Self::file_descriptor(self)
    }
}

impl Outbound for dyn RelayStream + '_ {
    fn flush_step(&mut self) -> Result<usize> {
        RelayStream::flush_step(self)
    }

    fn file_descriptor(&self) -> Option<BorrowedFd<'_>> {
        RelayStream::file_descriptor(self)
    }
}

/// Flush until nothing is queued, waiting for writability between attempts.
fn drain<S: Outbound + ?Sized>(stream: &mut S) -> Result<()> {
    loop {
        if stream.flush_step()? == 0 {
            return Ok(());
        }
        let fd = stream.file_descriptor().ok_or(RelayError::ClosedStream)?;
        let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::from(WAKE_INTERVAL_MS)) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                if let Some(signal) = termination::requested() {
                    return Err(RelayError::Interrupted(signal));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// The relay loop over one remote channel and the local input/output.
pub(crate) struct EventLoop<'s, 'w, I: AsFd, O: AsFd> {
    remote: &'s mut dyn RelayStream,
    input: &'s mut Stream<I>,
    output: &'s mut Stream<O>,
    watcher: &'s mut ResizeWatcher<'w>,
    phase: Phase,
    input_ready: bool,
}

impl<'s, 'w, I: Read + AsFd, O: Write + AsFd> EventLoop<'s, 'w, I, O> {
    pub(crate) fn new(
        remote: &'s mut dyn RelayStream,
        input: &'s mut Stream<I>,
        output: &'s mut Stream<O>,
        watcher: &'s mut ResizeWatcher<'w>,
    ) -> Self {
        Self {
            remote,
            input,
            output,
            watcher,
            phase: Phase::Receive,
            input_ready: false,
        }
    }

    /// Pump until either side reaches end-of-stream, a non-transient
    /// failure occurs, or a termination signal is requested.
    pub(crate) fn run(&mut self) -> Result<()> {
        loop {
            if let Some(signal) = termination::requested() {
                info!(%signal, "Termination requested, closing session");
                return Err(RelayError::Interrupted(signal));
            }
            self.watcher.dispatch();
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return Ok(()),
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "Transient interrupt, waiting again");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Readiness to wait for: exactly one direction on the remote, and input
    /// readability unless input is already latched ready.
    fn interests(&self) -> (PollFlags, Option<PollFlags>) {
        (
            self.phase.remote_interest(),
            (!self.input_ready).then_some(PollFlags::POLLIN),
        )
    }

    fn step(&mut self) -> Result<Flow> {
        if self.phase == Phase::Receive && self.remote.has_buffered_input() {
            return self.receive();
        }

        let (remote_events, input_events) = {
            let Some(remote_fd) = self.remote.file_descriptor() else {
                return Ok(Flow::Done);
            };
            let Some(input_fd) = self.input.file_descriptor() else {
                return Ok(Flow::Done);
            };
            let (remote_interest, input_interest) = self.interests();
            let mut fds = Vec::with_capacity(2);
            fds.push(PollFd::new(remote_fd, remote_interest));
            if let Some(interest) = input_interest {
                fds.push(PollFd::new(input_fd, interest));
            }
            match poll(&mut fds, PollTimeout::from(WAKE_INTERVAL_MS)) {
                Ok(0) | Err(Errno::EINTR) => return Ok(Flow::Continue),
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
            let revents = |fd: Option<&PollFd<'_>>| {
                fd.and_then(PollFd::revents).unwrap_or_else(PollFlags::empty)
            };
            (revents(fds.first()), revents(fds.get(1)))
        };

        if input_events.intersects(PollFlags::POLLIN | HANGUP) {
            self.input_ready = true;
        }
        let remote_hangup = remote_events.intersects(HANGUP);

        match self.phase {
            Phase::Receive => {
                if remote_events.contains(PollFlags::POLLIN) || remote_hangup {
                    return self.receive();
                }
                if self.input_ready {
                    self.phase = Phase::Send;
                }
            }
            Phase::Send => {
                if remote_hangup {
                    // Let the next read observe the close.
                    self.phase = Phase::Receive;
                } else if remote_events.contains(PollFlags::POLLOUT) {
                    if self.input_ready {
                        self.input_ready = false;
                        if self.send()? == Flow::Done {
                            return Ok(Flow::Done);
                        }
                    }
                    self.phase = Phase::Receive;
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Remote is readable: copy everything decodable to local output.
    fn receive(&mut self) -> Result<Flow> {
        match self.pump_remote()? {
            Pumped::Closed => return Ok(Flow::Done),
            Pumped::Delivered => self.phase = Phase::Send,
            Pumped::Nothing if self.input_ready => self.phase = Phase::Send,
            Pumped::Nothing => {}
        }
        Ok(Flow::Continue)
    }

    fn pump_remote(&mut self) -> Result<Pumped> {
        let mut delivered = false;
        loop {
            match self.remote.read()? {
                Chunk::Data(bytes) => {
                    self.output.write(&bytes)?;
                    delivered = true;
                }
                Chunk::Pending => {}
                Chunk::Eof => {
                    info!("Remote channel closed");
                    self.remote.close();
                    drain(self.output)?;
                    return Ok(Pumped::Closed);
                }
            }
            if !self.remote.has_buffered_input() {
                break;
            }
        }
        if !delivered {
            return Ok(Pumped::Nothing);
        }
        drain(self.output)?;
        Ok(Pumped::Delivered)
    }

    /// Remote is writable and local input is ready: forward one chunk.
    fn send(&mut self) -> Result<Flow> {
        match self.input.read()? {
            Chunk::Eof => {
                info!("Local input closed");
                self.remote.close();
                Ok(Flow::Done)
            }
            Chunk::Pending => Ok(Flow::Continue),
            Chunk::Data(bytes) => {
                self.remote.write(&bytes)?;
                drain(&mut *self.remote)?;
                Ok(Flow::Continue)
            }
        }
    }
}
