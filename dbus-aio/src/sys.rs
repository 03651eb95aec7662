//! The only module with unsafe code: raw socket calls the std library
//! does not cover (abstract socket addresses, MSG_PEEK, SCM_RIGHTS).

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::types::MAX_UNIX_FDS;

pub fn getuid() -> u32 {
    let x = unsafe { libc::getuid() };
    x as u32
}

pub fn connect_blocking(addr: &libc::sockaddr_un, len: libc::socklen_t) -> io::Result<UnixStream> {
    // We have to do this manually because rust std does not support abstract sockets.
    // https://github.com/rust-lang/rust/issues/42048
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr_ptr = addr as *const _ as *const libc::sockaddr;
    let r = unsafe { libc::connect(fd, addr_ptr, len) };
    if r != 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}

/// Receives into `buf` without consuming from the socket.
pub fn peek(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), libc::MSG_PEEK) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// One recvmsg; any SCM_RIGHTS descriptors seen ride out via `fds`.
pub fn recvmsg(fd: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    // Room for a full message's worth of descriptors (253) plus the
    // cmsg header. Heap allocated so the cmsghdr alignment holds.
    let mut cmsg_buf = vec![0u8; MAX_UNIX_FDS * std::mem::size_of::<libc::c_int>() + 64];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / std::mem::size_of::<libc::c_int>();
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(*data.add(i)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok(n as usize)
}

/// One sendmsg; `fds` go along as a single SCM_RIGHTS control message.
pub fn sendmsg(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    if fds.is_empty() {
        let n = unsafe {
            libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(n as usize);
    }

    let fd_bytes = fds.len() * std::mem::size_of::<libc::c_int>();
    let space = unsafe { libc::CMSG_SPACE(fd_bytes as libc::c_uint) } as usize;
    let mut cmsg_buf = vec![0u8; space];

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as libc::c_uint) as _;
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr() as *const u8,
            libc::CMSG_DATA(cmsg),
            fd_bytes,
        );
    }

    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Both directions; idempotent, errors ignored.
pub fn shutdown(fd: RawFd) {
    unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
}
