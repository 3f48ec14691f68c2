//! Raw-socket attach handshake.
//!
//! Attach endpoints answer with `101 Switching Protocols` (or a bare `200`
//! from older daemons) and then carry the session's bytes on the same TCP
//! connection. The response head is read one byte at a time so that no
//! session payload is consumed before the relay takes the socket over.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use swarm_core::Endpoint;
use swarm_relay::DaemonError;
use tracing::debug;

use super::client::{error_message, status_error};

/// Longest response head accepted before giving up.
const MAX_HEAD: usize = 16 * 1024;
/// Longest error body read after a refused upgrade.
const MAX_ERROR_BODY: usize = 64 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Send `POST path` asking for a raw stream and return the connected socket
/// once the daemon agrees.
pub(crate) fn open(
    endpoint: &Endpoint,
    path: &str,
    body: Option<&str>,
) -> Result<TcpStream, DaemonError> {
    let authority = endpoint.authority();
    let mut stream = TcpStream::connect(&authority)
        .map_err(|e| DaemonError::Transport(format!("Failed to connect to {endpoint}: {e}")))?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).map_err(transport)?;

    stream
        .write_all(request(&authority, path, body).as_bytes())
        .map_err(transport)?;

    let head = read_head(&mut stream)?;
    let status = parse_status(&head)
        .ok_or_else(|| DaemonError::Transport(format!("Malformed response from {endpoint}")))?;
    debug!(%path, status, "Attach handshake answered");

    match status {
        101 | 200 => {
            stream.set_read_timeout(None).map_err(transport)?;
            Ok(stream)
        }
        _ => {
            let body = read_body(&mut stream, content_length(&head).unwrap_or(0));
            Err(status_error(
                status,
                error_message(&body).unwrap_or_else(|| reason(&head)),
            ))
        }
    }
}

fn transport(e: std::io::Error) -> DaemonError {
    DaemonError::Transport(e.to_string())
}

pub(crate) fn request(authority: &str, path: &str, body: Option<&str>) -> String {
    let body = body.unwrap_or("");
    format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {authority}\r\n\
         User-Agent: swarm/{version}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {len}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: tcp\r\n\
         \r\n\
         {body}",
        version = env!("CARGO_PKG_VERSION"),
        len = body.len(),
    )
}

/// Read up to and including the blank line that ends the response head.
fn read_head<R: Read>(reader: &mut R) -> Result<String, DaemonError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(DaemonError::Transport("Response head too large".into()));
        }
        match reader.read(&mut byte) {
            Ok(0) => {
                return Err(DaemonError::Transport(
                    "Connection closed during attach handshake".into(),
                ));
            }
            Ok(_) => head.push(byte[0]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(transport(e)),
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn read_body<R: Read>(reader: &mut R, len: usize) -> String {
    let mut body = vec![0u8; len.min(MAX_ERROR_BODY)];
    match reader.read_exact(&mut body) {
        Ok(()) => String::from_utf8_lossy(&body).into_owned(),
        Err(e) => {
            debug!(error = %e, "Could not read error body");
            String::new()
        }
    }
}

/// Status code from the status line (`HTTP/1.1 101 UPGRADED`).
pub(crate) fn parse_status(head: &str) -> Option<u16> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn reason(head: &str) -> String {
    head.lines()
        .next()
        .and_then(|line| line.splitn(3, ' ').nth(2))
        .unwrap_or("Unknown")
        .to_string()
}

pub(crate) fn content_length(head: &str) -> Option<usize> {
    head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse().ok())
            .flatten()
    })
}
