//! Whole relay sessions against an in-process daemon.
//!
//! The remote channel is one end of a `UnixStream::pair()`; the other end
//! plays the remote process. Local terminals are real pseudo-terminals.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::signal::{Signal, raise};
use nix::sys::termios::{Termios, tcgetattr};

use swarm_relay::{
    Daemon, DaemonError, RelayError, Session, SessionInfo, SessionState, SessionTarget,
    WindowSize, relay,
};

/// Signal handlers and the termination flag are process-wide, so sessions
/// run one at a time.
static SESSIONS: Mutex<()> = Mutex::new(());

const TIMEOUT: Duration = Duration::from_secs(5);

const TTY: SessionInfo = SessionInfo {
    tty: true,
    stdin: true,
    stdout: true,
    stderr: true,
};

const MULTIPLEXED: SessionInfo = SessionInfo { tty: false, ..TTY };

struct FakeDaemon<C> {
    info: SessionInfo,
    channel: Mutex<Option<C>>,
    attach_calls: AtomicUsize,
    resize_result: fn() -> Result<(), DaemonError>,
    resizes: Mutex<Sender<WindowSize>>,
}

impl<C> FakeDaemon<C> {
    fn new(info: SessionInfo, channel: C) -> (Self, Receiver<WindowSize>) {
        let (tx, rx) = mpsc::channel();
        let daemon = Self {
            info,
            channel: Mutex::new(Some(channel)),
            attach_calls: AtomicUsize::new(0),
            resize_result: || Ok(()),
            resizes: Mutex::new(tx),
        };
        (daemon, rx)
    }
}

impl<C: Read + Write + AsFd> Daemon for FakeDaemon<C> {
    type Channel = C;

    fn session_info(&self, _target: &SessionTarget) -> Result<SessionInfo, DaemonError> {
        Ok(self.info)
    }

    fn attach(&self, target: &SessionTarget) -> Result<C, DaemonError> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        self.channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DaemonError::Unavailable(target.to_string()))
    }

    fn resize(&self, _target: &SessionTarget, size: WindowSize) -> Result<(), DaemonError> {
        self.resizes.lock().unwrap().send(size).unwrap();
        (self.resize_result)()
    }
}

/// Channel whose first reads fail with `error`.
struct FlakyChannel {
    inner: UnixStream,
    failures: usize,
    error: fn() -> io::Error,
}

fn incomplete_operation() -> io::Error {
    io::Error::other("The operation did not complete (read) (_ssl.c:2633)")
}

impl Read for FlakyChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err((self.error)());
        }
        self.inner.read(buf)
    }
}

impl Write for FlakyChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl AsFd for FlakyChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

fn target() -> SessionTarget {
    SessionTarget::Exec("4f1c0ffee".to_owned())
}

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![tag, 0, 0, 0];
    out.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn pty(rows: u16, cols: u16) -> OpenptyResult {
    let ws = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    openpty(&ws, None).unwrap()
}

fn set_size(pty: &OpenptyResult, rows: u16, cols: u16) {
    let ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ reads one `winsize` from a struct we own.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::ioctl(pty.master.as_raw_fd(), libc::TIOCSWINSZ, &raw const ws) };
    assert_eq!(ret, 0);
}

fn slave_file(pty: &OpenptyResult) -> File {
    File::from(pty.slave.try_clone().unwrap())
}

fn same_mode(a: &Termios, b: &Termios) -> bool {
    a.input_flags == b.input_flags
        && a.output_flags == b.output_flags
        && a.control_flags == b.control_flags
        && a.local_flags == b.local_flags
}

fn is_nonblocking(fd: &impl AsFd) -> bool {
    OFlag::from_bits_truncate(fcntl(fd.as_fd(), FcntlArg::F_GETFL).unwrap())
        .contains(OFlag::O_NONBLOCK)
}

/// Resize handler that simulates `kill -TERM` arriving mid-session.
fn terminate() -> Result<(), DaemonError> {
    raise(Signal::SIGTERM).unwrap();
    Ok(())
}

/// Read from `master` until `expected` bytes have arrived.
fn read_exact_from(master: &mut File, expected: usize) -> Vec<u8> {
    let mut got = Vec::new();
    let mut buf = [0u8; 256];
    while got.len() < expected {
        let n = master.read(&mut buf).unwrap();
        assert!(n > 0, "pty closed after {got:?}");
        got.extend_from_slice(&buf[..n]);
    }
    got
}

#[test]
fn raw_pty_session_sizes_remote_and_relays_in_order() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let pty = pty(24, 80);
    let before = tcgetattr(&pty.slave).unwrap();
    let mut master = File::from(pty.master.try_clone().unwrap());

    let (remote, mut remote_peer) = UnixStream::pair().unwrap();
    let (daemon, resizes) = FakeDaemon::new(TTY, remote);
    let reply = b"ls\r\nbin  etc  usr\r\n";

    let server = thread::spawn(move || {
        let mut received = [0u8; 3];
        remote_peer.read_exact(&mut received).unwrap();
        remote_peer.write_all(reply).unwrap();
        received
    });

    thread::scope(|s| {
        let session = s.spawn(|| relay(&daemon, &target(), slave_file(&pty), slave_file(&pty)));

        assert_eq!(
            resizes.recv_timeout(TIMEOUT).unwrap(),
            WindowSize { rows: 24, cols: 80 },
            "remote is sized before any input"
        );

        set_size(&pty, 30, 100);
        raise(Signal::SIGWINCH).unwrap();
        master.write_all(b"ls\n").unwrap();

        assert_eq!(
            resizes.recv_timeout(TIMEOUT).unwrap(),
            WindowSize { rows: 30, cols: 100 }
        );
        assert_eq!(read_exact_from(&mut master, reply.len()), reply);
        session.join().unwrap().unwrap();
    });

    assert_eq!(&server.join().unwrap(), b"ls\n");
    assert!(
        same_mode(&before, &tcgetattr(&pty.slave).unwrap()),
        "terminal mode restored"
    );
}

#[test]
fn multiplexed_session_writes_payloads_in_order_without_resizing() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let (remote, mut remote_peer) = UnixStream::pair().unwrap();
    let (daemon, resizes) = FakeDaemon::new(MULTIPLEXED, remote);
    let (input, _input_peer) = UnixStream::pair().unwrap();
    let (output, mut output_peer) = UnixStream::pair().unwrap();

    let wire = [
        vec![0x01, 0, 0, 0, 0, 0, 0, 5],
        b"hello".to_vec(),
        vec![0x02, 0, 0, 0, 0, 0, 0, 3],
        b"err".to_vec(),
    ]
    .concat();
    remote_peer.write_all(&wire).unwrap();
    drop(remote_peer);

    relay(&daemon, &target(), input, output).unwrap();

    let mut relayed = Vec::new();
    output_peer.read_to_end(&mut relayed).unwrap();
    assert_eq!(relayed, b"helloerr");
    assert!(resizes.try_recv().is_err(), "no resize for a non-tty remote");
}

#[test]
fn echoed_reply_follows_forwarded_input() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let (remote, mut remote_peer) = UnixStream::pair().unwrap();
    let (daemon, resizes) = FakeDaemon::new(TTY, remote);
    let (input, mut input_peer) = UnixStream::pair().unwrap();
    let (output, mut output_peer) = UnixStream::pair().unwrap();

    let server = thread::spawn(move || {
        let mut received = [0u8; 3];
        remote_peer.read_exact(&mut received).unwrap();
        remote_peer.write_all(b"ls\r\nfile-a  file-b\r\n").unwrap();
        received
    });

    input_peer.write_all(b"ls\n").unwrap();
    relay(&daemon, &target(), input, output).unwrap();

    assert_eq!(&server.join().unwrap(), b"ls\n");
    let mut relayed = Vec::new();
    output_peer.read_to_end(&mut relayed).unwrap();
    assert_eq!(relayed, b"ls\r\nfile-a  file-b\r\n");
    assert!(
        resizes.try_recv().is_err(),
        "local output is not a terminal, so nothing to size"
    );
}

#[test]
fn local_eof_closes_remote_channel() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let (remote, mut remote_peer) = UnixStream::pair().unwrap();
    let (daemon, _resizes) = FakeDaemon::new(TTY, remote);
    let (input, input_peer) = UnixStream::pair().unwrap();
    let (output, _output_peer) = UnixStream::pair().unwrap();
    drop(input_peer);

    let mut session = Session::new(&daemon, target());
    session.run(input, output).unwrap();
    assert_eq!(session.state(), SessionState::Closed);

    remote_peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(remote_peer.read(&mut buf).unwrap(), 0, "remote sees EOF");
}

#[test]
fn partially_attached_session_is_a_noop() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let (remote, _remote_peer) = UnixStream::pair().unwrap();
    let info = SessionInfo {
        stdin: false,
        ..TTY
    };
    let (daemon, _resizes) = FakeDaemon::new(info, remote);
    let (input, _input_peer) = UnixStream::pair().unwrap();
    let (output, _output_peer) = UnixStream::pair().unwrap();

    let mut session = Session::new(&daemon, target());
    session.run(input, output).unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(daemon.attach_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn protocol_error_ends_session_and_closes_remote() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let (remote, mut remote_peer) = UnixStream::pair().unwrap();
    let (daemon, _resizes) = FakeDaemon::new(MULTIPLEXED, remote);
    let (input, _input_peer) = UnixStream::pair().unwrap();
    let (output, _output_peer) = UnixStream::pair().unwrap();
    remote_peer.write_all(&frame(9, b"zz")).unwrap();

    let mut session = Session::new(&daemon, target());
    let err = session.run(input, output).unwrap_err();
    assert!(matches!(err, RelayError::ProtocolDecode { tag: 9 }), "got {err:?}");
    assert_eq!(session.state(), SessionState::Closed);

    remote_peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(remote_peer.read(&mut buf).unwrap(), 0, "remote closed on error");
}

#[test]
fn remote_failure_still_restores_terminal() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let pty = pty(24, 80);
    let before = tcgetattr(&pty.slave).unwrap();

    let (inner, mut remote_peer) = UnixStream::pair().unwrap();
    let channel = FlakyChannel {
        inner,
        failures: 1,
        error: || io::Error::from(io::ErrorKind::ConnectionReset),
    };
    let (daemon, _resizes) = FakeDaemon::new(TTY, channel);
    remote_peer.write_all(b"x").unwrap();

    let mut session = Session::new(&daemon, target());
    let err = session
        .run(slave_file(&pty), slave_file(&pty))
        .unwrap_err();
    assert!(matches!(&err, RelayError::Io(e) if e.kind() == io::ErrorKind::ConnectionReset));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(same_mode(&before, &tcgetattr(&pty.slave).unwrap()));
}

#[test]
fn dead_remote_resize_is_swallowed() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let pty = pty(24, 80);
    let before = tcgetattr(&pty.slave).unwrap();

    let (remote, remote_peer) = UnixStream::pair().unwrap();
    let (mut daemon, resizes) = FakeDaemon::new(TTY, remote);
    daemon.resize_result = || Err(DaemonError::Unavailable("process exited".to_owned()));
    drop(remote_peer);

    relay(&daemon, &target(), slave_file(&pty), slave_file(&pty)).unwrap();

    assert_eq!(resizes.try_recv().unwrap(), WindowSize { rows: 24, cols: 80 });
    assert!(same_mode(&before, &tcgetattr(&pty.slave).unwrap()));
}

#[test]
fn transient_transport_interrupt_is_retried() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let (inner, mut remote_peer) = UnixStream::pair().unwrap();
    let channel = FlakyChannel {
        inner,
        failures: 2,
        error: incomplete_operation,
    };
    let (daemon, _resizes) = FakeDaemon::new(TTY, channel);
    let (input, _input_peer) = UnixStream::pair().unwrap();
    let (output, mut output_peer) = UnixStream::pair().unwrap();

    remote_peer.write_all(b"hi").unwrap();
    drop(remote_peer);

    relay(&daemon, &target(), input, output).unwrap();

    let mut relayed = Vec::new();
    output_peer.read_to_end(&mut relayed).unwrap();
    assert_eq!(relayed, b"hi");
}

#[test]
fn attach_failure_propagates() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let (remote, _remote_peer) = UnixStream::pair().unwrap();
    let (daemon, _resizes) = FakeDaemon::new(TTY, remote);
    daemon.channel.lock().unwrap().take();
    let (input, _input_peer) = UnixStream::pair().unwrap();
    let (output, _output_peer) = UnixStream::pair().unwrap();

    let mut session = Session::new(&daemon, target());
    let err = session.run(input, output).unwrap_err();
    assert!(
        matches!(err, RelayError::Daemon(DaemonError::Unavailable(_))),
        "got {err:?}"
    );
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn piped_input_to_terminal_output_stays_canonical() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let pty = pty(24, 80);
    let before = tcgetattr(&pty.slave).unwrap();

    let (remote, mut remote_peer) = UnixStream::pair().unwrap();
    let (daemon, resizes) = FakeDaemon::new(TTY, remote);
    let (input, input_peer) = UnixStream::pair().unwrap();
    drop(input_peer);

    let mut session = Session::new(&daemon, target());
    session.run(input, slave_file(&pty)).unwrap();
    assert_eq!(session.state(), SessionState::Closed);

    remote_peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(remote_peer.read(&mut buf).unwrap(), 0, "remote sees EOF");
    assert!(
        same_mode(&before, &tcgetattr(&pty.slave).unwrap()),
        "terminal mode untouched"
    );
    assert!(resizes.try_recv().is_err(), "no raw mode, no resize forwarding");
}

#[test]
fn termination_signal_closes_session_and_restores_terminal() {
    let _lock = SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let pty = pty(24, 80);
    let before = tcgetattr(&pty.slave).unwrap();

    let (remote, mut remote_peer) = UnixStream::pair().unwrap();
    let (mut daemon, resizes) = FakeDaemon::new(TTY, remote);
    daemon.resize_result = terminate;

    let mut session = Session::new(&daemon, target());
    let err = session
        .run(slave_file(&pty), slave_file(&pty))
        .unwrap_err();
    assert!(
        matches!(err, RelayError::Interrupted(Signal::SIGTERM)),
        "got {err:?}"
    );
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(resizes.try_recv().unwrap(), WindowSize { rows: 24, cols: 80 });

    assert!(
        same_mode(&before, &tcgetattr(&pty.slave).unwrap()),
        "terminal mode restored"
    );
    assert!(!is_nonblocking(&pty.slave), "blocking mode restored");
    remote_peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(remote_peer.read(&mut buf).unwrap(), 0, "remote closed");
}
