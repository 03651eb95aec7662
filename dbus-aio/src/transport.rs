//! Ownership of the stream socket: connect, the auth line exchange,
//! peeking, exact reads with ancillary fd collection, and writes with
//! ancillary fd attachment.

use crate::address;
use crate::error::Error;
use crate::sys;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// The transport is single-reader and single-writer: the multiplexer
/// owns the read side, sends are serialised above this layer.
#[derive(Debug)]
pub struct Transport {
    stream: UnixStream,
    open: AtomicBool,
}

impl Transport {
    /// Connects to the bus at a `unix:path=` or `unix:abstract=`
    /// address.
    ///
    /// Blocking: for the (brief) duration of the connect syscall.
    /// Must be called from within a tokio runtime.
    pub fn connect(addr: &str) -> Result<Transport, Error> {
        let (sockaddr, len) = address::to_sockaddr(addr)?;
        let stream = sys::connect_blocking(&sockaddr, len)?;
        Transport::from_std(stream)
    }

    /// Wraps an already-connected stream, e g one half of a
    /// socketpair for peer-to-peer use.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Result<Transport, Error> {
        stream.set_nonblocking(true)?;
        Ok(Transport {
            stream: UnixStream::from_std(stream)?,
            open: AtomicBool::new(true),
        })
    }

    pub fn connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Shuts the socket down in both directions, waking the read
    /// loop. Idempotent.
    pub fn disconnect(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            sys::shutdown(self.stream.as_raw_fd());
        }
    }

    async fn recv(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>, peek: bool) -> Result<usize, Error> {
        loop {
            self.stream.readable().await?;
            let r = self.stream.try_io(Interest::READABLE, || {
                let fd = self.stream.as_raw_fd();
                if peek {
                    sys::peek(fd, buf)
                } else {
                    sys::recvmsg(fd, buf, fds)
                }
            });
            match r {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receives into `buf` without consuming from the socket, to
    /// learn the next frame's size. Returns 0 when the remote closed.
    pub async fn peek(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.recv(buf, &mut Vec::new(), true).await
    }

    /// Reads exactly `buf.len()` bytes, collecting any SCM_RIGHTS
    /// descriptors seen along the way into `fds`. Returns 0 when the
    /// remote closed the socket.
    pub async fn read_exact(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<usize, Error> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.recv(&mut buf[total..], fds, false).await?;
            if n == 0 {
                return Ok(0);
            }
            total += n;
        }
        Ok(total)
    }

    /// Writes all of `data`; a non-empty `fds` rides along as a
    /// single SCM_RIGHTS control message on the first chunk. The
    /// local descriptor copies are closed once the kernel has taken
    /// them.
    pub async fn write_all(&self, data: &[u8], fds: Vec<OwnedFd>) -> Result<(), Error> {
        let mut pending_fds = fds;
        let mut written = 0;
        while written < data.len() {
            self.stream.writable().await?;
            let raw: Vec<_> = pending_fds.iter().map(|f| f.as_raw_fd()).collect();
            let r = self.stream.try_io(Interest::WRITABLE, || {
                sys::sendmsg(self.stream.as_raw_fd(), &data[written..], &raw)
            });
            match r {
                Ok(n) => {
                    written += n;
                    // Dropping the OwnedFds closes our copies exactly once.
                    pending_fds.clear();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Sends an auth line and, when a response is expected, reads up
    /// to and including the next `\n`. Reads go byte by byte so no
    /// binary frame data is ever pulled into the line buffer.
    ///
    /// An empty `line` turns this into a pure line read, which is
    /// what a server-side peer wants.
    pub async fn auth_exchange(&self, line: &[u8], expect_response: bool) -> Result<Vec<u8>, Error> {
        self.write_all(line, Vec::new()).await?;
        if !expect_response {
            return Ok(Vec::new());
        }
        let mut response = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            if self.recv(&mut byte, &mut Vec::new(), false).await? == 0 {
                return Err(Error::Protocol("connection closed during authentication".into()));
            }
            response.push(byte[0]);
            if byte[0] == b'\n' {
                return Ok(response);
            }
            if response.len() > 16384 {
                return Err(Error::Protocol("authentication line too long".into()));
            }
        }
    }
}
