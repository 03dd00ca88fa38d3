//! Client startup-packet handling: the supervisor's non-destructive peek used
//! for routing, and the worker's full read during the greeting of a
//! handed-off client.
//!
//! The wire format is fixed: a 4-byte big-endian length covering the whole
//! packet, a 4-byte big-endian protocol or request code, then NUL-terminated
//! key/value pairs closed by one extra NUL. A handful of request codes are
//! sentinels for sessions that must never reach a pooled worker.

#[cfg(test)]
pub(crate) mod test;

use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd},
};

use nix::libc;
use tracing::debug;

use crate::error::{Error, Result};

/// Protocol version 3.0, the only regular startup protocol in use.
pub const PROTOCOL_VERSION_3: u32 = 196_608;

/// Request code of a query-cancellation packet.
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Request code opening secure-channel (TLS) negotiation.
pub const TLS_REQUEST_CODE: u32 = 80_877_103;

/// Request code opening credential-transport negotiation.
pub const CREDENTIAL_REQUEST_CODE: u32 = 80_877_104;

/// Hard upper bound on the framed startup-packet length.
pub const MAX_STARTUP_PACKET: usize = 10_000;

const MIN_STARTUP_PACKET: usize = 8;

/// How much of the client's opening bytes the supervisor peeks for routing.
const PEEK_BYTES: usize = 1024;

/// A parsed regular startup packet.
#[derive(Clone, Debug)]
pub struct StartupPacket {
    /// The protocol version requested by the client.
    pub protocol: u32,
    /// The key/value startup options, in client order.
    pub options: Vec<(String, String)>,
}

impl StartupPacket {
    fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `database` option, if present.
    pub fn database(&self) -> Option<&str> {
        self.option("database")
    }

    /// The `user` option, if present.
    pub fn user(&self) -> Option<&str> {
        self.option("user")
    }

    /// The name used for pool routing: the requested database, or the user
    /// name when no database was named.
    pub fn routing_name(&self) -> Option<&str> {
        self.database().or_else(|| self.user())
    }

    /// Whether the client asked for a replication-style session. Presence of
    /// the option is enough to keep the session away from the pool.
    pub fn wants_replication(&self) -> bool {
        self.option("replication").is_some()
    }
}

/// One classified client opening.
#[derive(Clone, Debug)]
pub enum StartupRequest {
    /// Secure-channel (TLS) negotiation request.
    Tls,
    /// Credential-transport negotiation request.
    Credential,
    /// Query-cancellation request.
    Cancel,
    /// A regular startup packet.
    Startup(StartupPacket),
}

/// Reads and classifies one startup request from a connected client,
/// blocking until the whole framed packet has arrived.
pub fn read_startup_request(client: BorrowedFd<'_>) -> Result<StartupRequest> {
    let mut header = [0u8; 4];
    read_exact(client, &mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if !(MIN_STARTUP_PACKET..=MAX_STARTUP_PACKET).contains(&len) {
        return Err(Error::startup_malformed(format!(
            "invalid packet length {}",
            len
        )));
    }

    let mut rest = vec![0u8; len - 4];
    read_exact(client, &mut rest)?;
    let code = u32::from_be_bytes(rest[..4].try_into().expect("length checked"));
    match code {
        TLS_REQUEST_CODE => Ok(StartupRequest::Tls),
        CREDENTIAL_REQUEST_CODE => Ok(StartupRequest::Credential),
        CANCEL_REQUEST_CODE => Ok(StartupRequest::Cancel),
        protocol => {
            let options = parse_options(&rest[4..])?;
            Ok(StartupRequest::Startup(StartupPacket { protocol, options }))
        }
    }
}

/// Peeks the client's opening bytes without consuming them and extracts the
/// routing name, temporarily switching the socket to non-blocking I/O.
///
/// Returns `Ok(None)` for every client that must go to a fresh fork instead:
/// secure-channel, credential-transport, and cancel requests, replication
/// sessions, and clients whose opening bytes are not yet (or not fully)
/// available.
pub(crate) fn peek_routing_name(client: BorrowedFd<'_>) -> Result<Option<String>> {
    let _restore = NonblockingGuard::set(client)?;

    let mut buf = [0u8; PEEK_BYTES];
    let available = loop {
        let n = unsafe {
            libc::recv(
                client.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_PEEK,
            )
        };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            // Nothing buffered yet: not enough bytes to route on.
            io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err.into()),
        }
    };

    if available < MIN_STARTUP_PACKET {
        debug!(available, "startup peek: too few bytes to route");
        return Ok(None);
    }

    let len = u32::from_be_bytes(buf[..4].try_into().expect("length checked")) as usize;
    let code = u32::from_be_bytes(buf[4..8].try_into().expect("length checked"));
    if matches!(
        code,
        TLS_REQUEST_CODE | CREDENTIAL_REQUEST_CODE | CANCEL_REQUEST_CODE
    ) {
        debug!(code, "startup peek: negotiation or cancel request");
        return Ok(None);
    }
    if !(MIN_STARTUP_PACKET..=MAX_STARTUP_PACKET).contains(&len) {
        return Ok(None);
    }

    let body = &buf[MIN_STARTUP_PACKET..available.min(len)];
    let mut database = None;
    let mut user = None;
    for (key, value) in complete_pairs(body) {
        match key {
            "replication" => {
                debug!("startup peek: replication session");
                return Ok(None);
            }
            "database" if database.is_none() => database = Some(value.to_owned()),
            "user" if user.is_none() => user = Some(value.to_owned()),
            _ => {}
        }
    }
    Ok(database.or(user))
}

/// Strictly parses the key/value section of a regular startup packet.
fn parse_options(body: &[u8]) -> Result<Vec<(String, String)>> {
    let mut options = Vec::new();
    let mut rest = body;
    loop {
        let Some(key_end) = rest.iter().position(|b| *b == 0) else {
            return Err(Error::startup_malformed("missing option terminator"));
        };
        if key_end == 0 {
            // The terminator must be the final byte of the packet.
            if rest.len() != 1 {
                return Err(Error::startup_malformed("bytes after terminator"));
            }
            return Ok(options);
        }
        let key = str_from(&rest[..key_end])?;
        rest = &rest[key_end + 1..];

        let Some(value_end) = rest.iter().position(|b| *b == 0) else {
            return Err(Error::startup_malformed(format!(
                "option \"{}\" has no value",
                key
            )));
        };
        let value = str_from(&rest[..value_end])?;
        rest = &rest[value_end + 1..];
        options.push((key.to_owned(), value.to_owned()));
    }
}

/// Yields only the complete key/value pairs of a possibly truncated option
/// section, stopping at the terminator or at the first incomplete pair.
fn complete_pairs(body: &[u8]) -> impl Iterator<Item = (&str, &str)> + '_ {
    let mut rest = body;
    std::iter::from_fn(move || loop {
        let key_end = rest.iter().position(|b| *b == 0)?;
        if key_end == 0 {
            return None;
        }
        let key = std::str::from_utf8(&rest[..key_end]).ok();
        rest = &rest[key_end + 1..];
        let value_end = rest.iter().position(|b| *b == 0)?;
        let value = std::str::from_utf8(&rest[..value_end]).ok();
        rest = &rest[value_end + 1..];
        match (key, value) {
            (Some(key), Some(value)) => return Some((key, value)),
            // Skip pairs that are not valid UTF-8; they cannot match a
            // stored routing name.
            _ => continue,
        }
    })
}

fn str_from(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|_| Error::startup_malformed("option bytes are not valid UTF-8"))
}

fn read_exact(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
            )
        };
        if n == 0 {
            return Err(Error::startup_malformed(
                "connection closed mid startup packet",
            ));
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        filled += n as usize;
    }
    Ok(())
}

/// Puts a descriptor into non-blocking mode and restores the previous file
/// status flags on drop, on every exit path.
struct NonblockingGuard<'a> {
    fd: BorrowedFd<'a>,
    previous: libc::c_int,
}

impl<'a> NonblockingGuard<'a> {
    fn set(fd: BorrowedFd<'a>) -> Result<Self> {
        let previous = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        if previous < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let rc =
            unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, previous | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd, previous })
    }
}

impl Drop for NonblockingGuard<'_> {
    fn drop(&mut self) {
        let rc = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_SETFL, self.previous) };
        if rc < 0 {
            tracing::warn!("failed to restore file status flags after startup peek");
        }
    }
}
