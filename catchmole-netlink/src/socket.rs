//! Owned-fd netlink socket.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use crate::error::NetlinkError;
use crate::message::{MessageBuilder, MessageIter};

/// A bound netlink socket for one protocol family.
///
/// `groups` is the multicast bitmask passed at bind time; zero for plain
/// request/response sockets.
pub struct NetlinkSocket {
    fd: OwnedFd,
}

impl NetlinkSocket {
    pub fn connect(protocol: libc::c_int, groups: u32) -> Result<Self, NetlinkError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;

        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self { fd })
    }

    /// Enlarges the kernel receive buffer to at least `bytes`.
    ///
    /// Tries SO_RCVBUFFORCE first (the daemon holds CAP_NET_ADMIN anyway),
    /// then plain SO_RCVBUF, and verifies the effective size by reading the
    /// option back. The kernel reports the doubled bookkeeping value, so the
    /// readback is `>= bytes` exactly when the request was granted.
    pub fn set_recv_buffer(&self, bytes: usize) -> Result<(), NetlinkError> {
        let requested = bytes as libc::c_int;
        let forced = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUFFORCE,
                &requested as *const _ as *const libc::c_void,
                mem::size_of_val(&requested) as libc::socklen_t,
            )
        };
        if forced < 0 {
            let rc = unsafe {
                libc::setsockopt(
                    self.fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &requested as *const _ as *const libc::c_void,
                    mem::size_of_val(&requested) as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        let mut effective: libc::c_int = 0;
        let mut len = mem::size_of_val(&effective) as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &mut effective as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if (effective as usize) < bytes {
            return Err(NetlinkError::RecvBuffer {
                requested: bytes,
                effective: effective as usize,
            });
        }
        Ok(())
    }

    /// Applies a receive timeout so blocking reads wake up periodically.
    pub fn set_recv_timeout(&self, timeout: Duration) -> Result<(), NetlinkError> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                mem::size_of_val(&tv) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn send(&self, buf: &[u8]) -> Result<(), NetlinkError> {
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Blocking read into `buf`.
    ///
    /// Returns `Ok(None)` when the receive timeout elapses or the read is
    /// interrupted, so callers can check their shutdown flag and retry.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>, NetlinkError> {
        let rc = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(None),
                _ => Err(err.into()),
            };
        }
        Ok(Some(rc as usize))
    }
}

/// Runs one rtnetlink dump and returns the payload of every reply message
/// matching `reply_type`, in arrival order.
///
/// Used by the neighbor and address clients; each call opens a short-lived
/// NETLINK_ROUTE socket, which keeps those dumps independent of the
/// long-lived conntrack sockets.
pub(crate) fn route_dump(
    msg_type: u16,
    reply_type: u16,
    header_payload: &[u8],
) -> Result<Vec<Vec<u8>>, NetlinkError> {
    let sock = NetlinkSocket::connect(libc::NETLINK_ROUTE, 0)?;
    let flags = (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16;
    let request = MessageBuilder::new(msg_type, flags, 1)
        .append(header_payload)
        .finish();
    sock.send(&request)?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut payloads = Vec::new();
    loop {
        let len = match sock.recv(&mut buf)? {
            Some(len) => len,
            None => continue,
        };
        for msg in MessageIter::new(&buf[..len]) {
            if msg.is_done() {
                return Ok(payloads);
            }
            if let Some(err) = msg.kernel_error() {
                return Err(err);
            }
            if msg.msg_type == reply_type {
                payloads.push(msg.payload.to_vec());
            }
        }
    }
}
