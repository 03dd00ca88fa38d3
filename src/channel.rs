//! The control channel: a per-slot stream socket pair that carries one
//! client descriptor plus its peer address from the supervisor to a pooled
//! worker.
//!
//! Each message is a fixed-size peer-address record in the payload and
//! exactly one descriptor in the ancillary rights data. End-of-stream on the
//! worker end is a meaningful signal: the supervisor closed its end, either
//! while draining the pool for shutdown or while evicting the worker's
//! database, and the worker must exit.


use std::{
    io,
    mem,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
};

use nix::{
    libc,
    sys::socket::{socketpair, AddressFamily, SockFlag, SockType},
};

use crate::error::{Error, Result};

/// Size of the raw socket-address storage inside a [`PeerAddr`].
pub const PEER_ADDR_STORAGE: usize = mem::size_of::<libc::sockaddr_storage>();

/// Exact payload length of one handoff message: the address length prefix
/// plus the address storage. Constant across sender and receiver.
pub(crate) const HANDOFF_PAYLOAD: usize = 4 + PEER_ADDR_STORAGE;

/// Space for the single-descriptor rights message, in `u64` units so the
/// buffer satisfies `cmsghdr` alignment.
const CMSG_WORDS: usize = 8;

/// A send to a worker that died must surface as `EPIPE`, not kill the
/// supervisor with `SIGPIPE`. Targets without `MSG_NOSIGNAL` get the
/// per-socket `SO_NOSIGPIPE` applied in [`pair`] instead.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn disable_sigpipe(socket: &OwnedFd) -> Result<()> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// A client's peer address as captured by the supervisor at accept time and
/// reconstructed by the worker after the handoff.
#[derive(Clone)]
pub struct PeerAddr {
    len: u32,
    storage: [u8; PEER_ADDR_STORAGE],
}

impl PeerAddr {
    /// Captures the peer address of a connected socket.
    pub fn from_peer_of(socket: BorrowedFd<'_>) -> Result<Self> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = PEER_ADDR_STORAGE as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                socket.as_raw_fd(),
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut bytes = [0u8; PEER_ADDR_STORAGE];
        // SAFETY: sockaddr_storage is plain-old-data of exactly this size.
        bytes.copy_from_slice(unsafe {
            std::slice::from_raw_parts(
                &storage as *const libc::sockaddr_storage as *const u8,
                PEER_ADDR_STORAGE,
            )
        });
        Ok(Self {
            len: (len as usize).min(PEER_ADDR_STORAGE) as u32,
            storage: bytes,
        })
    }

    /// The address family of the stored address.
    pub fn family(&self) -> libc::sa_family_t {
        // SAFETY: storage always holds at least a sockaddr header.
        unsafe { (*(self.storage.as_ptr() as *const libc::sockaddr)).sa_family }
    }

    /// The meaningful prefix of the raw address bytes, for the server's
    /// host/port resolution.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.storage[..self.len as usize]
    }

    fn to_wire(&self, buf: &mut [u8; HANDOFF_PAYLOAD]) {
        buf[..4].copy_from_slice(&self.len.to_ne_bytes());
        buf[4..].copy_from_slice(&self.storage);
    }

    fn from_wire(buf: &[u8; HANDOFF_PAYLOAD]) -> Result<Self> {
        let len = u32::from_ne_bytes(buf[..4].try_into().expect("fixed prefix"));
        if len as usize > PEER_ADDR_STORAGE {
            return Err(Error::handoff_protocol(format!(
                "peer address length {} exceeds storage",
                len
            )));
        }
        let mut storage = [0u8; PEER_ADDR_STORAGE];
        storage.copy_from_slice(&buf[4..]);
        Ok(Self { len, storage })
    }
}

impl std::fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerAddr")
            .field("family", &self.family())
            .field("len", &self.len)
            .finish()
    }
}

/// The value transferred over the control channel for each new client: the
/// transferred descriptor plus the peer address it was accepted from.
#[derive(Debug)]
pub struct ClientHandoff {
    /// Peer address captured at accept time.
    pub peer: PeerAddr,
    /// The client socket. Receiving it transfers ownership of a fresh
    /// descriptor for the same underlying connection.
    pub client: OwnedFd,
}

/// The outcome of one receive on the worker end.
#[derive(Debug)]
pub enum Received {
    /// A client was handed off.
    Handoff(ClientHandoff),
    /// The supervisor closed its end; the worker must exit.
    EndOfStream,
}

/// Creates the stream socket pair for one slot, returning
/// `(supervisor_end, worker_end)`. Called at worker fork; the worker inherits
/// `worker_end`, the supervisor stores `supervisor_end` in the slot.
pub fn pair() -> Result<(OwnedFd, OwnedFd)> {
    let (supervisor_end, worker_end) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    // Only the supervisor end ever sends.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    disable_sigpipe(&supervisor_end)?;
    Ok((supervisor_end, worker_end))
}

/// Writes one handoff message: the fixed-size peer-address record as payload
/// and the client descriptor as the single ancillary rights slot.
///
/// Retries benign interruption; any other failure is surfaced unchanged. On
/// success the descriptor has been duplicated into the receiving process and
/// the caller completes the move by dropping the handoff.
pub fn send_handoff(end: BorrowedFd<'_>, handoff: &ClientHandoff) -> Result<()> {
    let mut payload = [0u8; HANDOFF_PAYLOAD];
    handoff.peer.to_wire(&mut payload);
    let fd = handoff.client.as_raw_fd();

    let mut cmsg_buf = [0u64; CMSG_WORDS];
    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as _) } as usize;
    debug_assert!(cmsg_space <= mem::size_of_val(&cmsg_buf));

    loop {
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;

        // SAFETY: msg_control points at a sufficiently large, aligned buffer.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as _) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
        }

        let sent = unsafe { libc::sendmsg(end.as_raw_fd(), &msg, SEND_FLAGS) };
        if sent < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if sent as usize != HANDOFF_PAYLOAD {
            return Err(Error::handoff_protocol(format!(
                "sent {} of {} payload bytes",
                sent, HANDOFF_PAYLOAD
            )));
        }
        return Ok(());
    }
}

/// Reads one handoff message from the worker end.
///
/// A clean end-of-stream (the supervisor closed its end) is reported as
/// [`Received::EndOfStream`]. Any deviation from the one-descriptor,
/// exact-payload contract is an error, never end-of-stream.
pub fn receive_handoff(end: BorrowedFd<'_>) -> Result<Received> {
    let mut payload = [0u8; HANDOFF_PAYLOAD];
    let mut cmsg_buf = [0u64; CMSG_WORDS];
    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as _) } as usize;

    loop {
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;

        let received = unsafe { libc::recvmsg(end.as_raw_fd(), &mut msg, 0) };
        if received < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }

        // Take ownership of every transferred descriptor first so that a
        // malformed message cannot leak them.
        let mut fds = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                        / mem::size_of::<libc::c_int>();
                    let data = libc::CMSG_DATA(cmsg);
                    for i in 0..count {
                        let fd = std::ptr::read_unaligned(
                            data.add(i * mem::size_of::<libc::c_int>()) as *const libc::c_int,
                        );
                        fds.push(OwnedFd::from_raw_fd(fd));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if received == 0 && fds.is_empty() {
            return Ok(Received::EndOfStream);
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(Error::handoff_protocol("ancillary data was truncated"));
        }
        if received as usize != HANDOFF_PAYLOAD {
            return Err(Error::handoff_protocol(format!(
                "received {} of {} payload bytes",
                received, HANDOFF_PAYLOAD
            )));
        }
        let client = match (fds.pop(), fds.is_empty()) {
            (Some(fd), true) => fd,
            (first, _) => {
                let count = fds.len() + usize::from(first.is_some());
                return Err(Error::handoff_protocol(format!(
                    "expected exactly one descriptor, got {}",
                    count
                )));
            }
        };
        let peer = PeerAddr::from_wire(&payload)?;
        return Ok(Received::Handoff(ClientHandoff { peer, client }));
    }
}
