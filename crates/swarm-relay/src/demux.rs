//! Decoder for the daemon's multiplexed attach stream.
//!
//! When the remote process has no pty, stdout and stderr share one socket
//! and every payload is prefixed by an 8-byte header:
//!
//! ```text
//! +------+---------+---------------------+
//! | tag  | 3 bytes | payload length (BE) |
//! +------+---------+---------------------+
//!   u8    reserved   u32
//! ```
//!
//! Only the inbound direction is framed; outbound bytes pass through.

use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use tracing::{trace, warn};

use crate::error::{RelayError, Result};
use crate::stream::{Chunk, RelayStream, Stream};

/// Length of a frame header.
pub const HEADER_LEN: usize = 8;

/// Logical stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Tag 0. The daemon documents it as written on stdout.
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Vec<u8>,
}

/// Accumulates raw bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a complete frame, or belong to frames
    /// not yet taken.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Whether [`FrameBuffer::next_frame`] would return a frame now.
    pub fn has_complete_frame(&self) -> bool {
        Self::payload_len(&self.buf).is_some_and(|len| self.buf.len() >= HEADER_LEN + len)
    }

    /// Remove and return the next complete frame, or `None` while the header
    /// or payload is still incomplete.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = self.buf[0];
        let kind = StreamKind::from_tag(tag).ok_or(RelayError::ProtocolDecode { tag })?;
        let Some(len) = Self::payload_len(&self.buf) else {
            return Ok(None);
        };
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(Frame { kind, payload }))
    }

    fn payload_len(buf: &[u8]) -> Option<usize> {
        let header: [u8; 4] = buf.get(4..HEADER_LEN)?.try_into().ok()?;
        usize::try_from(u32::from_be_bytes(header)).ok()
    }
}

/// A [`Stream`] whose inbound bytes are multiplexed frames.
///
/// Both stdout and stderr payloads are returned from `read` in arrival
/// order; the tag is not surfaced to callers.
#[derive(Debug)]
pub struct Demuxer<C: AsFd> {
    inner: Stream<C>,
    frames: FrameBuffer,
}

impl<C: AsFd> Demuxer<C> {
    pub const fn new(inner: Stream<C>) -> Self {
        Self {
            inner,
            frames: FrameBuffer::new(),
        }
    }
}

impl<C: Read + AsFd> Demuxer<C> {
    /// Return the next frame's payload, pulling at most one OS read from the
    /// wrapped stream when no complete frame is buffered.
    pub fn read(&mut self) -> Result<Chunk> {
        if !self.frames.has_complete_frame() {
            match self.inner.read()? {
                Chunk::Data(bytes) => self.frames.extend(&bytes),
                Chunk::Pending => {}
                Chunk::Eof => {
                    if self.frames.buffered_len() > 0 {
                        warn!(
                            buffered = self.frames.buffered_len(),
                            "Channel closed inside a multiplexed frame"
                        );
                        self.frames.clear();
                    }
                    return Ok(Chunk::Eof);
                }
            }
        }
        while let Some(frame) = self.frames.next_frame()? {
            if frame.payload.is_empty() {
                continue;
            }
            trace!(kind = ?frame.kind, bytes = frame.payload.len(), "Demuxed frame");
            return Ok(Chunk::Data(frame.payload));
        }
        Ok(Chunk::Pending)
    }
}

impl<C: Read + Write + AsFd> RelayStream for Demuxer<C> {
    fn read(&mut self) -> Result<Chunk> {
        Self::read(self)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write(data)
    }

    fn flush_step(&mut self) -> Result<usize> {
        self.inner.flush_step()
    }

    fn file_descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.inner.file_descriptor()
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn has_buffered_input(&self) -> bool {
        self.frames.has_complete_frame()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    use super::*;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag, 0, 0, 0];
        out.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn demuxer() -> (Demuxer<UnixStream>, UnixStream) {
        let (local, peer) = UnixStream::pair().unwrap();
        (Demuxer::new(Stream::nonblocking(local).unwrap()), peer)
    }

    /// Read until the demuxer reports pending with nothing left buffered.
    fn drain(demux: &mut Demuxer<UnixStream>, out: &mut Vec<u8>) {
        loop {
            match demux.read().unwrap() {
                Chunk::Data(bytes) => out.extend_from_slice(&bytes),
                Chunk::Pending if !demux.has_buffered_input() => return,
                Chunk::Pending => {}
                Chunk::Eof => panic!("unexpected EOF"),
            }
        }
    }

    #[test]
    fn stdout_then_stderr_frames_in_order() {
        let (mut demux, mut peer) = demuxer();
        let mut wire = vec![0x01, 0, 0, 0, 0, 0, 0, 5];
        wire.extend_from_slice(b"hello");
        wire.extend_from_slice(&[0x02, 0, 0, 0, 0, 0, 0, 3]);
        wire.extend_from_slice(b"err");
        peer.write_all(&wire).unwrap();

        assert_eq!(demux.read().unwrap(), Chunk::Data(b"hello".to_vec()));
        assert!(demux.has_buffered_input());
        assert_eq!(demux.read().unwrap(), Chunk::Data(b"err".to_vec()));
        assert!(!demux.has_buffered_input());
    }

    #[test]
    fn one_byte_at_a_time_reassembles_payloads() {
        let payloads: [(u8, &[u8]); 5] = [
            (1, b"first line\n"),
            (2, b""),
            (2, b"warning: x\n"),
            (1, &[0xff; 300]),
            (1, b"!"),
        ];
        let wire: Vec<u8> = payloads.iter().flat_map(|(t, p)| frame(*t, p)).collect();
        let expected: Vec<u8> = payloads.iter().flat_map(|(_, p)| p.to_vec()).collect();

        let (mut demux, mut peer) = demuxer();
        let mut out = Vec::new();
        for byte in &wire {
            peer.write_all(std::slice::from_ref(byte)).unwrap();
            drain(&mut demux, &mut out);
        }
        assert_eq!(out, expected);
    }

    #[test]
    fn uneven_chunks_reassemble_payloads() {
        let wire: Vec<u8> = [frame(1, b"alpha"), frame(2, b"beta"), frame(1, b"gamma")].concat();
        for chunk_len in [2, 3, 7, 9, 13] {
            let (mut demux, mut peer) = demuxer();
            let mut out = Vec::new();
            for chunk in wire.chunks(chunk_len) {
                peer.write_all(chunk).unwrap();
                drain(&mut demux, &mut out);
            }
            assert_eq!(out, b"alphabetagamma", "chunk_len = {chunk_len}");
        }
    }

    #[test]
    fn split_header_yields_nothing_until_complete() {
        let (mut demux, mut peer) = demuxer();
        let wire = frame(1, b"data");
        peer.write_all(&wire[..3]).unwrap();
        assert_eq!(demux.read().unwrap(), Chunk::Pending);
        peer.write_all(&wire[3..7]).unwrap();
        assert_eq!(demux.read().unwrap(), Chunk::Pending);
        peer.write_all(&wire[7..10]).unwrap();
        assert_eq!(demux.read().unwrap(), Chunk::Pending);
        peer.write_all(&wire[10..]).unwrap();
        assert_eq!(demux.read().unwrap(), Chunk::Data(b"data".to_vec()));
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let (mut demux, mut peer) = demuxer();
        peer.write_all(&frame(9, b"zz")).unwrap();
        assert!(matches!(
            demux.read(),
            Err(RelayError::ProtocolDecode { tag: 9 })
        ));
    }

    #[test]
    fn eof_inside_frame_reads_as_eof() {
        let (mut demux, mut peer) = demuxer();
        peer.write_all(&frame(1, b"truncated")[..10]).unwrap();
        assert_eq!(demux.read().unwrap(), Chunk::Pending);
        drop(peer);
        assert_eq!(demux.read().unwrap(), Chunk::Eof);
    }

    #[test]
    fn writes_pass_through_unframed() {
        let (mut demux, mut peer) = demuxer();
        RelayStream::write(&mut demux, b"ls\n").unwrap();
        assert_eq!(RelayStream::flush_step(&mut demux).unwrap(), 0);
        let mut buf = [0u8; 8];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ls\n");
    }

    #[test]
    fn frame_buffer_reports_kinds() {
        let mut frames = FrameBuffer::new();
        frames.extend(&[frame(1, b"o"), frame(2, b"e"), frame(0, b"i")].concat());
        let kinds: Vec<StreamKind> = std::iter::from_fn(|| frames.next_frame().unwrap())
            .map(|f| f.kind)
            .collect();
        assert_eq!(
            kinds,
            [StreamKind::Stdout, StreamKind::Stderr, StreamKind::Stdin]
        );
        assert_eq!(frames.buffered_len(), 0);
    }
}
