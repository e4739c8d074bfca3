//! Datagram reads that also capture the sender's credentials.
//!
//! On Linux the kernel attaches an `SCM_CREDENTIALS` control message to every datagram once
//! `SO_PASSCRED` is enabled on the receiving socket. Other platforms still detect truncation
//! but get no credential, which degrades origin detection to an empty origin.
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

/// Identity of the process that sent a datagram, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credential {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Outcome of a single datagram read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    /// Bytes copied into the buffer.
    pub len: usize,
    /// The datagram was larger than the buffer and its tail was discarded by the kernel.
    pub truncated: bool,
    pub credential: Option<Credential>,
}

/// Sockets that can read one datagram along with its sender's credential.
pub trait ReadWithCredential {
    /// Reads one datagram into `buf` without blocking.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error, including [`io::ErrorKind::WouldBlock`] if no
    /// datagram is queued.
    fn read_with_credential(&self, buf: &mut [u8]) -> io::Result<Datagram>;
}

impl<T: AsFd> ReadWithCredential for T {
    fn read_with_credential(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        sys::recv_with_credential(self.as_fd(), buf)
    }
}

/// Asks the kernel to attach sender credentials to every received datagram.
pub(crate) fn enable_credential_passing(fd: BorrowedFd<'_>) -> io::Result<()> {
    sys::enable_credential_passing(fd)
}

/// Sets the socket receive buffer (`SO_RCVBUF`), the only place datagrams are dropped under
/// sustained back-pressure.
pub(crate) fn set_receive_buffer(fd: BorrowedFd<'_>, size: usize) -> io::Result<()> {
    let size = libc::c_int::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "receive buffer too large"))?;
    set_int_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size)
}

fn set_int_option(
    fd: BorrowedFd<'_>,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: `fd` is a valid open descriptor for the duration of the borrow and `value`
    // outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::os::fd::{AsRawFd, BorrowedFd};

    use super::{Credential, Datagram};

    /// Control message space; room for one `ucred` plus a few stray descriptors.
    #[repr(C, align(8))]
    struct ControlBuffer([u8; 128]);

    pub(super) fn enable_credential_passing(fd: BorrowedFd<'_>) -> io::Result<()> {
        super::set_int_option(fd, libc::SOL_SOCKET, libc::SO_PASSCRED, 1)
    }

    pub(super) fn recv_with_credential(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<Datagram> {
        let mut control = ControlBuffer([0u8; 128]);
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        // SAFETY: all-zero is a valid `msghdr`.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.0.as_mut_ptr().cast();
        msg.msg_controllen = control.0.len() as _;

        // SAFETY: `msg` points at `iov` and `control`, both alive for the whole call, and
        // `iov` describes exactly the writable area of `buf`.
        let n = unsafe {
            libc::recvmsg(
                fd.as_raw_fd(),
                &mut msg,
                libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut credential = None;
        // SAFETY: the kernel filled `msg_control`/`msg_controllen`, and the CMSG_* macros only
        // walk headers within that range.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let header = &*cmsg;
                if header.cmsg_level == libc::SOL_SOCKET {
                    if header.cmsg_type == libc::SCM_CREDENTIALS {
                        let ucred: libc::ucred =
                            std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast());
                        credential = Some(Credential {
                            pid: ucred.pid,
                            uid: ucred.uid,
                            gid: ucred.gid,
                        });
                    } else if header.cmsg_type == libc::SCM_RIGHTS {
                        close_passed_descriptors(cmsg);
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok(Datagram {
            len: n as usize,
            truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
            credential,
        })
    }

    /// Descriptors sent along with a metric are never used; close them so they do not leak.
    ///
    /// # Safety
    ///
    /// `cmsg` must point at a valid `SCM_RIGHTS` control message.
    unsafe fn close_passed_descriptors(cmsg: *const libc::cmsghdr) {
        unsafe {
            let header_len = libc::CMSG_LEN(0) as usize;
            let payload_len = ((*cmsg).cmsg_len as usize).saturating_sub(header_len);
            let count = payload_len / std::mem::size_of::<libc::c_int>();
            let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
            for i in 0..count {
                libc::close(std::ptr::read_unaligned(data.add(i)));
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::os::fd::{AsRawFd, BorrowedFd};

    use super::Datagram;

    pub(super) fn enable_credential_passing(_fd: BorrowedFd<'_>) -> io::Result<()> {
        log::debug!("Credential passing is not supported on this platform");
        Ok(())
    }

    pub(super) fn recv_with_credential(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<Datagram> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        // SAFETY: all-zero is a valid `msghdr`.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        // SAFETY: `msg` points at `iov`, which describes exactly the writable area of `buf`
        // and outlives the call.
        let n = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, libc::MSG_DONTWAIT) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Datagram {
            len: n as usize,
            truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
            credential: None,
        })
    }
}
