// agent/src/sys/tunnel.rs
//
// HTTP CONNECT tunnelling for the broker transport. AMQP has no notion of a
// forward proxy, so the tunnel is opened here and the raw socket handed to
// the AMQP client afterwards.
//
// These are blocking calls: the AMQP client runs its connector on its own
// I/O thread.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

/// Bounds how long one failing relay or proxy can stall the strategy loop.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("cannot resolve '{0}'")]
    Resolve(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("proxy i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid status received from proxy: '{0}'")]
    InvalidStatus(String),
}

pub fn connect_request(target: &str) -> String {
    format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n")
}

/// Accepts any 2xx status line.
///
/// ```text
/// HTTP/1.0 200 Connection established
///          ^ byte 9
/// ```
pub fn check_status_line(line: &str) -> Result<(), TunnelError> {
    let printable = line.trim_end_matches(['\r', '\n']).to_string();
    if line.len() < 12 {
        return Err(TunnelError::InvalidStatus(printable));
    }
    if line.as_bytes()[9] != b'2' {
        return Err(TunnelError::InvalidStatus(printable));
    }
    Ok(())
}

fn head_complete(head: &[u8]) -> bool {
    // Bare LF line endings are accepted too (RFC 9112 §2.2).
    head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") || head.ends_with(b"\n\r\n")
}

/// Reads the proxy's response head up to and including the blank line, one
/// byte at a time so nothing belonging to the tunnelled stream is consumed.
pub fn read_response_head<R: Read>(reader: &mut R) -> Result<String, TunnelError> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while !head_complete(&head) {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TunnelError::InvalidStatus("response head too large".into()));
        }
        match reader.read(&mut byte)? {
            0 => break,
            _ => head.push(byte[0]),
        }
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn resolve(addr: &str) -> Result<SocketAddr, TunnelError> {
    addr.to_socket_addrs()
        .map_err(|_| TunnelError::Resolve(addr.to_string()))?
        .next()
        .ok_or_else(|| TunnelError::Resolve(addr.to_string()))
}

fn dial(addr: &str) -> Result<TcpStream, TunnelError> {
    let sockaddr = resolve(addr)?;
    TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT).map_err(|source| TunnelError::Connect {
        addr: addr.to_string(),
        source,
    })
}

pub fn dial_direct(target: &str) -> Result<TcpStream, TunnelError> {
    dial(target)
}

/// Opens a TCP connection to `proxy` and asks it to tunnel to `target`.
pub fn open_tunnel(proxy: &str, target: &str) -> Result<TcpStream, TunnelError> {
    let mut stream = dial(proxy)?;
    stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
    stream.write_all(connect_request(target).as_bytes())?;
    stream.flush()?;

    let head = read_response_head(&mut stream)?;
    let status = head.split_inclusive('\n').next().unwrap_or_default();
    check_status_line(status)?;

    stream.set_read_timeout(None)?;
    Ok(stream)
}
